//! Publish/subscribe transport boundary.
//!
//! DESIGN
//! ======
//! A transport moves `Envelope`s between every subscriber of a named topic
//! and keeps at most one retained `BoardSnapshot` per topic for rewind.
//! Delivery is best-effort and at-most-once per subscriber; a subscriber's
//! own publishes are echoed back to it, and the sync channel filters them.
//!
//! Only `subscribe` suspends. Publishing and retaining hand the envelope to
//! the transport and return without waiting for any acknowledgement.
//!
//! Implementations:
//! - [`memory::MemoryHub`]: in-process hub, used by tests, embedders, and
//!   the relay server.
//! - `ws::WsTransport` (feature `ws`): WebSocket client for the relay.

pub mod memory;
#[cfg(feature = "ws")]
pub mod ws;

use tokio::sync::mpsc;

use crate::message::{BoardSnapshot, CodecError, ConnectionId, Envelope};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    #[error("connection {connection_id} is not subscribed to {topic}")]
    NotSubscribed { topic: String, connection_id: ConnectionId },
    #[error("envelope origin {origin} does not match publisher {publisher}")]
    OriginMismatch { origin: ConnectionId, publisher: ConnectionId },
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result of a successful subscribe.
#[derive(Debug)]
pub struct Subscription {
    /// Identity assigned to this connection by the transport.
    pub connection_id: ConnectionId,
    /// Retained snapshot, present only when rewind was requested and one exists.
    pub snapshot: Option<BoardSnapshot>,
    /// Every envelope published on the topic after subscribing, own echoes included.
    pub inbound: mpsc::Receiver<Envelope>,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Join `topic`, optionally receiving its retained snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unreachable`] if the transport cannot be
    /// reached. The caller decides whether to retry.
    async fn subscribe(&self, topic: &str, rewind: bool) -> Result<Subscription, TransportError>;

    /// Broadcast to every subscriber of `topic`. Does not wait for delivery.
    ///
    /// # Errors
    ///
    /// Fails if `from` is not subscribed or the link is closed.
    fn publish(&self, topic: &str, from: &ConnectionId, envelope: Envelope) -> Result<(), TransportError>;

    /// Replace the retained snapshot of `topic`. Not delivered live.
    ///
    /// # Errors
    ///
    /// Fails if `from` is not subscribed or the link is closed.
    fn retain(&self, topic: &str, from: &ConnectionId, snapshot: BoardSnapshot) -> Result<(), TransportError>;

    /// Leave `topic`. Idempotent.
    fn unsubscribe(&self, topic: &str, connection_id: &ConnectionId);
}

/// Topic name for a board.
#[must_use]
pub fn board_topic(board_id: &str) -> String {
    format!("board:{board_id}")
}
