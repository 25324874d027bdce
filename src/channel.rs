//! Sync channel: one client's link to a board topic.
//!
//! DESIGN
//! ======
//! The channel wraps a [`Transport`] subscription and applies the two
//! inbound filters every consumer relies on:
//!
//! - echo suppression: nothing whose origin is the local connection is
//!   yielded, whatever its type;
//! - sequence filtering: a sync message whose sequence is not above the
//!   last one accepted from its origin is dropped, so duplicates and
//!   replays never reach the store.
//!
//! The per-origin watermarks can be seeded from a rewind snapshot so live
//! messages already folded into that snapshot are not applied twice. A
//! departed origin keeps its watermark: connection ids are never reused, so
//! anything still arriving from it is a redelivery.
//!
//! ERROR HANDLING
//! ==============
//! Publishing is fire-and-forget. Transport errors are returned to the
//! caller and never retried here. After `disconnect`, publishes fail with
//! [`TransportError::Closed`] and `recv` yields `None`.

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::{BoardSnapshot, ConnectionId, Envelope, SyncMessage};
use crate::presence::PresenceEntry;
use crate::transport::{Transport, TransportError, board_topic};

/// One accepted inbound item.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Sync(SyncMessage),
    Presence(PresenceEntry),
    /// The named connection left the topic.
    Left(ConnectionId),
}

pub struct SyncChannel {
    transport: Arc<dyn Transport>,
    topic: String,
    connection_id: ConnectionId,
    inbound: Option<mpsc::Receiver<Envelope>>,
    watermarks: HashMap<ConnectionId, u64>,
}

impl SyncChannel {
    /// Subscribe to the board's topic. Returns the channel and, when rewind
    /// was requested, the retained snapshot if the topic has one.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the subscription fails.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        board_id: &str,
        rewind: bool,
    ) -> Result<(Self, Option<BoardSnapshot>), TransportError> {
        let topic = board_topic(board_id);
        let subscription = transport.subscribe(&topic, rewind).await?;
        info!(
            %board_id,
            connection_id = %subscription.connection_id,
            rewound = subscription.snapshot.is_some(),
            "sync channel connected"
        );
        let channel = Self {
            transport,
            topic,
            connection_id: subscription.connection_id,
            inbound: Some(subscription.inbound),
            watermarks: HashMap::new(),
        };
        Ok((channel, subscription.snapshot))
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inbound.is_some()
    }

    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.transport.publish(&self.topic, &self.connection_id, envelope)
    }

    /// Publish a local mutation. Does not wait for delivery.
    ///
    /// # Errors
    ///
    /// Fails after `disconnect` or if the transport rejects the publish.
    pub fn publish(&self, message: SyncMessage) -> Result<(), TransportError> {
        debug!(topic = %self.topic, sequence = message.sequence, kind = %message.kind(), "sync channel: publish");
        self.send(Envelope::Sync(message))
    }

    /// # Errors
    ///
    /// Fails after `disconnect` or if the transport rejects the publish.
    pub fn publish_presence(&self, entry: PresenceEntry) -> Result<(), TransportError> {
        self.send(Envelope::Presence(entry))
    }

    /// Replace the topic's retained snapshot.
    ///
    /// # Errors
    ///
    /// Fails after `disconnect` or if the transport rejects the snapshot.
    pub fn retain_snapshot(&self, snapshot: BoardSnapshot) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.transport.retain(&self.topic, &self.connection_id, snapshot)
    }

    /// Raise per-origin watermarks. A watermark never moves backwards.
    pub fn seed_watermarks<I>(&mut self, marks: I)
    where
        I: IntoIterator<Item = (ConnectionId, u64)>,
    {
        for (origin, sequence) in marks {
            if origin == self.connection_id {
                continue;
            }
            let mark = self.watermarks.entry(origin).or_insert(0);
            *mark = (*mark).max(sequence);
        }
    }

    /// Highest accepted sequence per remote origin.
    #[must_use]
    pub fn watermarks(&self) -> BTreeMap<ConnectionId, u64> {
        self.watermarks.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Filter one envelope. `None` means it must not reach the client.
    pub fn accept(&mut self, envelope: Envelope) -> Option<Inbound> {
        if envelope.origin() == &self.connection_id {
            debug!(topic = %self.topic, "sync channel: dropped self-echo");
            return None;
        }
        match envelope {
            Envelope::Sync(message) => {
                let mark = self.watermarks.entry(message.origin.clone()).or_insert(0);
                if message.sequence <= *mark {
                    debug!(
                        topic = %self.topic,
                        origin = %message.origin,
                        sequence = message.sequence,
                        watermark = *mark,
                        "sync channel: dropped stale sequence"
                    );
                    return None;
                }
                *mark = message.sequence;
                Some(Inbound::Sync(message))
            }
            Envelope::Presence(entry) => Some(Inbound::Presence(entry)),
            Envelope::Leave { connection_id } => Some(Inbound::Left(connection_id)),
        }
    }

    /// Next accepted inbound item. `None` once disconnected or the
    /// transport has closed the subscription.
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            let envelope = self.inbound.as_mut()?.recv().await?;
            if let Some(item) = self.accept(envelope) {
                return Some(item);
            }
        }
    }

    /// Announce departure and unsubscribe. Idempotent.
    pub fn disconnect(&mut self) {
        if self.inbound.is_none() {
            return;
        }
        let leave = Envelope::Leave { connection_id: self.connection_id.clone() };
        if let Err(e) = self.transport.publish(&self.topic, &self.connection_id, leave) {
            warn!(topic = %self.topic, error = %e, "sync channel: leave not published");
        }
        self.transport.unsubscribe(&self.topic, &self.connection_id);
        self.inbound = None;
        info!(topic = %self.topic, connection_id = %self.connection_id, "sync channel disconnected");
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
