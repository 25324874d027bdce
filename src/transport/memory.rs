//! In-process publish/subscribe hub.
//!
//! DESIGN
//! ======
//! Topics map connection ids to bounded per-subscriber queues. A publish
//! fans out with `try_send`: a full or closed queue drops that delivery for
//! that subscriber only, so one slow client never stalls the topic. The
//! retained snapshot outlives subscribers so a board that empties and is
//! rejoined later still rewinds.
//!
//! Each topic also keeps a short log of recent sync envelopes. A rewinding
//! subscriber gets them queued ahead of live traffic. The retained snapshot
//! may come from a peer that had not yet seen another peer's latest edit;
//! the log carries that edit, and the joiner's sequence watermarks drop
//! everything the snapshot already covers.
//!
//! The hub is cheap to clone; clones share state.

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Subscription, Transport, TransportError};
use crate::message::{BoardSnapshot, ConnectionId, Envelope};

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const REPLAY_LIMIT: usize = 64;

#[derive(Default)]
struct Topic {
    subscribers: HashMap<ConnectionId, mpsc::Sender<Envelope>>,
    retained: Option<BoardSnapshot>,
    recent: VecDeque<Envelope>,
}

struct HubInner {
    topics: HashMap<String, Topic>,
    reachable: bool,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
    queue_capacity: usize,
    replay_limit: usize,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl MemoryHub {
    /// Hub whose subscriber queues hold `queue_capacity` envelopes.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner { topics: HashMap::new(), reachable: true })),
            queue_capacity: queue_capacity.max(1),
            replay_limit: (queue_capacity / 2).min(REPLAY_LIMIT),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber with a fresh connection id.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unreachable`] while the hub is offline.
    pub fn join(&self, topic: &str, rewind: bool) -> Result<Subscription, TransportError> {
        let mut inner = self.lock();
        if !inner.reachable {
            return Err(TransportError::Unreachable(topic.to_owned()));
        }

        let connection_id = ConnectionId::new(Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let entry = inner.topics.entry(topic.to_owned()).or_default();
        let snapshot = if rewind {
            replay(topic, entry, &tx);
            entry.retained.clone()
        } else {
            None
        };
        entry.subscribers.insert(connection_id.clone(), tx);

        info!(
            %topic,
            %connection_id,
            rewind,
            rewound = snapshot.is_some(),
            subscribers = entry.subscribers.len(),
            "hub: subscriber joined"
        );
        Ok(Subscription { connection_id, snapshot, inbound: rx })
    }

    /// Deliver `envelope` to every subscriber of `topic`, `from` included.
    ///
    /// # Errors
    ///
    /// Fails while offline, if `from` is not subscribed, or if the envelope
    /// speaks for a different connection.
    pub fn broadcast(&self, topic: &str, from: &ConnectionId, envelope: Envelope) -> Result<(), TransportError> {
        if envelope.origin() != from {
            return Err(TransportError::OriginMismatch { origin: envelope.origin().clone(), publisher: from.clone() });
        }
        let mut inner = self.lock();
        if !inner.reachable {
            return Err(TransportError::Unreachable(topic.to_owned()));
        }
        let Some(entry) = inner.topics.get_mut(topic).filter(|t| t.subscribers.contains_key(from)) else {
            return Err(TransportError::NotSubscribed { topic: topic.to_owned(), connection_id: from.clone() });
        };
        fan_out(topic, entry, &envelope);
        if matches!(envelope, Envelope::Sync(_)) && self.replay_limit > 0 {
            if entry.recent.len() == self.replay_limit {
                entry.recent.pop_front();
            }
            entry.recent.push_back(envelope);
        }
        Ok(())
    }

    /// Replace the retained snapshot of `topic`.
    ///
    /// # Errors
    ///
    /// Fails while offline or if `from` is not subscribed.
    pub fn retain_snapshot(&self, topic: &str, from: &ConnectionId, snapshot: BoardSnapshot) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.reachable {
            return Err(TransportError::Unreachable(topic.to_owned()));
        }
        let Some(entry) = inner.topics.get_mut(topic).filter(|t| t.subscribers.contains_key(from)) else {
            return Err(TransportError::NotSubscribed { topic: topic.to_owned(), connection_id: from.clone() });
        };
        debug!(%topic, %from, layers = snapshot.layers.len(), "hub: snapshot retained");
        entry.retained = Some(snapshot);
        Ok(())
    }

    /// Remove a subscriber and tell the rest it left. Returns whether it was
    /// subscribed.
    pub fn leave(&self, topic: &str, connection_id: &ConnectionId) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.topics.get_mut(topic) else {
            return false;
        };
        if entry.subscribers.remove(connection_id).is_none() {
            return false;
        }
        info!(%topic, %connection_id, subscribers = entry.subscribers.len(), "hub: subscriber left");
        fan_out(topic, entry, &Envelope::Leave { connection_id: connection_id.clone() });
        true
    }

    /// Simulate the hub going offline. Existing queues stay open.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, |t| t.subscribers.len())
    }

    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<BoardSnapshot> {
        self.lock().topics.get(topic).and_then(|t| t.retained.clone())
    }
}

/// Queue the topic's recent sync envelopes for a rewinding subscriber.
fn replay(topic: &str, entry: &Topic, tx: &mpsc::Sender<Envelope>) {
    for envelope in &entry.recent {
        if tx.try_send(envelope.clone()).is_err() {
            warn!(%topic, "hub: replay truncated by queue capacity");
            return;
        }
    }
    if !entry.recent.is_empty() {
        debug!(%topic, replayed = entry.recent.len(), "hub: recent envelopes replayed");
    }
}

fn fan_out(topic: &str, entry: &Topic, envelope: &Envelope) {
    for (connection_id, tx) in &entry.subscribers {
        match tx.try_send(envelope.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%topic, %connection_id, "hub: subscriber queue full; dropping envelope");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%topic, %connection_id, "hub: subscriber queue closed");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryHub {
    async fn subscribe(&self, topic: &str, rewind: bool) -> Result<Subscription, TransportError> {
        self.join(topic, rewind)
    }

    fn publish(&self, topic: &str, from: &ConnectionId, envelope: Envelope) -> Result<(), TransportError> {
        self.broadcast(topic, from, envelope)
    }

    fn retain(&self, topic: &str, from: &ConnectionId, snapshot: BoardSnapshot) -> Result<(), TransportError> {
        self.retain_snapshot(topic, from, snapshot)
    }

    fn unsubscribe(&self, topic: &str, connection_id: &ConnectionId) {
        self.leave(topic, connection_id);
    }
}
