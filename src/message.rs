//! Wire model for the board topic: sync messages, presence, snapshots.
//!
//! DESIGN
//! ======
//! Everything that crosses the transport is JSON. A `SyncMessage` carries one
//! `Mutation` plus the origin connection and its per-origin `sequence`. On the
//! wire the mutation is split into `kind` (`add|update|remove`) and a
//! kind-specific `payload`; `WireMessage` is the intermediate form and
//! decoding checks that the payload matches the kind.
//!
//! Layers inside payloads deserialize through `Layer`'s validating
//! constructor, so a malformed remote layer fails to decode rather than
//! entering the replica.

#[cfg(test)]
#[path = "message_test.rs"]
mod message_test;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::layer::{Edge, EdgeId, Layer, LayerId, LayerPatch};
use crate::presence::PresenceEntry;

// =============================================================================
// CONNECTION ID
// =============================================================================

/// Transport-assigned identity of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned when a frame or envelope cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} payload must carry exactly one of {expected}")]
    Ambiguous { kind: MessageKind, expected: &'static str },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// Wire-level kind of a sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Add,
    Update,
    Remove,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// One change to the board replica. Used both as a local intent and as the
/// content of a sync message.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddLayer(Layer),
    UpdateLayer { id: LayerId, patch: LayerPatch },
    RemoveLayer(LayerId),
    AddEdge(Edge),
    RemoveEdge(EdgeId),
}

impl Mutation {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AddLayer(_) | Self::AddEdge(_) => MessageKind::Add,
            Self::UpdateLayer { .. } => MessageKind::Update,
            Self::RemoveLayer(_) | Self::RemoveEdge(_) => MessageKind::Remove,
        }
    }

    /// Shorthand for an update intent.
    pub fn update(id: impl Into<LayerId>, patch: LayerPatch) -> Self {
        Self::UpdateLayer { id: id.into(), patch }
    }
}

// =============================================================================
// SYNC MESSAGE
// =============================================================================

/// One mutation as published on the board topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireMessage")]
pub struct SyncMessage {
    /// Connection that produced the mutation.
    pub origin: ConnectionId,
    /// Strictly increasing per origin, starting at 1.
    pub sequence: u64,
    pub mutation: Mutation,
}

impl SyncMessage {
    #[must_use]
    pub fn new(origin: ConnectionId, sequence: u64, mutation: Mutation) -> Self {
        Self { origin, sequence, mutation }
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.mutation.kind()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    kind: MessageKind,
    origin_connection_id: ConnectionId,
    sequence: u64,
    payload: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessageRef<'a> {
    kind: MessageKind,
    origin_connection_id: &'a ConnectionId,
    sequence: u64,
    payload: PayloadRef<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum PayloadRef<'a> {
    Layer { layer: &'a Layer },
    Edge { edge: &'a Edge },
    #[serde(rename_all = "camelCase")]
    Update { id: &'a LayerId, changes: &'a LayerPatch },
    #[serde(rename_all = "camelCase")]
    RemoveLayer { layer_id: &'a LayerId },
    #[serde(rename_all = "camelCase")]
    RemoveEdge { edge_id: &'a EdgeId },
}

#[derive(Deserialize)]
struct AddPayload {
    #[serde(default)]
    layer: Option<Layer>,
    #[serde(default)]
    edge: Option<Edge>,
}

#[derive(Deserialize)]
struct UpdatePayload {
    id: LayerId,
    changes: LayerPatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovePayload {
    #[serde(default)]
    layer_id: Option<LayerId>,
    #[serde(default)]
    edge_id: Option<EdgeId>,
}

impl Serialize for SyncMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = match &self.mutation {
            Mutation::AddLayer(layer) => PayloadRef::Layer { layer },
            Mutation::AddEdge(edge) => PayloadRef::Edge { edge },
            Mutation::UpdateLayer { id, patch } => PayloadRef::Update { id, changes: patch },
            Mutation::RemoveLayer(layer_id) => PayloadRef::RemoveLayer { layer_id },
            Mutation::RemoveEdge(edge_id) => PayloadRef::RemoveEdge { edge_id },
        };
        WireMessageRef {
            kind: self.kind(),
            origin_connection_id: &self.origin,
            sequence: self.sequence,
            payload,
        }
        .serialize(serializer)
    }
}

impl TryFrom<WireMessage> for SyncMessage {
    type Error = CodecError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        let payload_err = |source| CodecError::Payload { kind, source };

        let mutation = match kind {
            MessageKind::Add => {
                let add: AddPayload = serde_json::from_value(wire.payload).map_err(payload_err)?;
                match (add.layer, add.edge) {
                    (Some(layer), None) => Mutation::AddLayer(layer),
                    (None, Some(edge)) => Mutation::AddEdge(edge),
                    _ => return Err(CodecError::Ambiguous { kind, expected: "layer, edge" }),
                }
            }
            MessageKind::Update => {
                let update: UpdatePayload = serde_json::from_value(wire.payload).map_err(payload_err)?;
                Mutation::UpdateLayer { id: update.id, patch: update.changes }
            }
            MessageKind::Remove => {
                let remove: RemovePayload = serde_json::from_value(wire.payload).map_err(payload_err)?;
                match (remove.layer_id, remove.edge_id) {
                    (Some(id), None) => Mutation::RemoveLayer(id),
                    (None, Some(id)) => Mutation::RemoveEdge(id),
                    _ => return Err(CodecError::Ambiguous { kind, expected: "layerId, edgeId" }),
                }
            }
        };

        Ok(SyncMessage { origin: wire.origin_connection_id, sequence: wire.sequence, mutation })
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Full replica state retained on the topic for late joiners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    /// Connection that published the snapshot.
    pub origin: ConnectionId,
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Highest sequence per origin already folded into `layers`/`edges`.
    #[serde(default)]
    pub watermarks: BTreeMap<ConnectionId, u64>,
}

impl BoardSnapshot {
    /// Snapshot with no layers, e.g. a fresh board from the durable store.
    #[must_use]
    pub fn empty(origin: ConnectionId) -> Self {
        Self { origin, layers: Vec::new(), edges: Vec::new(), watermarks: BTreeMap::new() }
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Unit delivered to every subscriber of a board topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Sync(SyncMessage),
    Presence(PresenceEntry),
    Leave {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
}

impl Envelope {
    /// Connection this envelope speaks for.
    #[must_use]
    pub fn origin(&self) -> &ConnectionId {
        match self {
            Self::Sync(message) => &message.origin,
            Self::Presence(entry) => &entry.connection_id,
            Self::Leave { connection_id } => connection_id,
        }
    }

    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// # Errors
    ///
    /// Returns [`CodecError::Json`] for malformed JSON or invalid content.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}

// =============================================================================
// RELAY FRAMES
// =============================================================================

/// Frames a client sends to the relay over its socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Broadcast to every subscriber of the topic.
    Publish { envelope: Envelope },
    /// Replace the topic's retained snapshot. Not broadcast.
    Retain { snapshot: BoardSnapshot },
}

/// Frames the relay sends to a subscribed client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum ServerFrame {
    /// First frame on every socket: assigned identity plus rewind result.
    Welcome {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        #[serde(default)]
        snapshot: Option<BoardSnapshot>,
    },
    Deliver { envelope: Envelope },
}
