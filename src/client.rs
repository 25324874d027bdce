//! Board client: one user's live view of one board.
//!
//! DESIGN
//! ======
//! `BoardClient` composes the store, presence tracker, and sync channel and
//! is the single owner of all three. Every local intent goes store first
//! (optimistic), then the resulting messages are published; every inbound
//! item is routed to the store or the presence tracker. The client is not
//! shared: [`crate::session::BoardSession`] runs it on one task so local and
//! remote mutations are serialized.
//!
//! Catch-up on join: an optional durable seed is loaded first, then the
//! topic's retained snapshot (when rewind is on) replaces it and primes the
//! channel's sequence filter. Every local change re-retains the snapshot
//! before its messages are published. The snapshot's watermark already
//! covers those sequences, so a peer that joins in between rewinds to the
//! new state and drops the live duplicates.
//!
//! ERROR HANDLING
//! ==============
//! A local edit that validates is applied even if publishing it fails; the
//! transport error is returned so the caller can surface it. A failure to
//! apply one inbound message is logged and does not affect the next.

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::bounds::{self, Rect};
use crate::channel::{Inbound, SyncChannel};
use crate::config::SyncConfig;
use crate::layer::{Edge, Layer, LayerId, Point, ValidationError};
use crate::message::{BoardSnapshot, ConnectionId, Mutation};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::store::{LayerStore, RemoteOutcome};
use crate::transport::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("board session closed")]
    Closed,
}

/// What handling one inbound item did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Sync(RemoteOutcome),
    /// Whether the presence entry was stored (older updates are not).
    Presence(bool),
    /// Whether the departing connection had a live presence entry.
    Left(bool),
}

pub struct BoardClient {
    board_id: String,
    store: LayerStore,
    presence: PresenceTracker,
    channel: SyncChannel,
}

impl BoardClient {
    /// Join `board_id` over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] if subscribing or the initial
    /// presence announcement fails. The core does not retry.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        board_id: &str,
        display_name: &str,
        seed: Option<BoardSnapshot>,
        config: SyncConfig,
    ) -> Result<Self, SessionError> {
        let (mut channel, rewound) = SyncChannel::connect(transport, board_id, config.rewind).await?;
        let connection_id = channel.connection_id().clone();

        let mut store = LayerStore::new(connection_id.clone(), config.history_limit);
        if let Some(seed) = &seed {
            channel.seed_watermarks(store.load_snapshot(seed));
        }
        let has_rewind = rewound.is_some();
        if let Some(snapshot) = &rewound {
            channel.seed_watermarks(store.load_snapshot(snapshot));
        }

        let presence = PresenceTracker::new(connection_id.clone(), display_name, &config);
        let mut client = Self {
            board_id: board_id.to_owned(),
            store,
            presence,
            channel,
        };

        info!(
            %board_id,
            %connection_id,
            seeded = seed.is_some(),
            rewound = has_rewind,
            layers = client.store.len(),
            "board client connected"
        );

        // A seeded board nobody has retained yet becomes the topic's snapshot.
        if !has_rewind && !client.store.is_empty() {
            client.retain_snapshot()?;
        }
        client.tick()?;
        Ok(client)
    }

    #[must_use]
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.store.connection_id()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    // =========================================================================
    // LOCAL INTENTS
    // =========================================================================

    /// Apply and publish one local mutation.
    ///
    /// # Errors
    ///
    /// [`SessionError::Validation`] leaves everything unchanged.
    /// [`SessionError::Transport`] means the edit was applied locally but
    /// not published.
    pub fn apply(&mut self, mutation: Mutation) -> Result<Option<Layer>, SessionError> {
        let layer = self.store.apply_local(mutation)?;
        self.publish_outbound()?;
        Ok(layer)
    }

    /// Apply several mutations as one undoable step.
    ///
    /// # Errors
    ///
    /// As [`Self::apply`]; validation failure rolls back the whole batch.
    pub fn apply_batch(&mut self, mutations: Vec<Mutation>) -> Result<(), SessionError> {
        self.store.apply_local_batch(mutations)?;
        self.publish_outbound()?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a transport error if the undo's effects could not be published.
    pub fn undo(&mut self) -> Result<bool, SessionError> {
        let undone = self.store.undo();
        self.publish_outbound()?;
        Ok(undone)
    }

    /// # Errors
    ///
    /// Returns a transport error if the redo's effects could not be published.
    pub fn redo(&mut self) -> Result<bool, SessionError> {
        let redone = self.store.redo();
        self.publish_outbound()?;
        Ok(redone)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.store.history().can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.store.history().can_redo()
    }

    fn publish_outbound(&mut self) -> Result<(), TransportError> {
        let outbound = self.store.take_outbound();
        if outbound.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        if let Err(e) = self.retain_snapshot() {
            warn!(board_id = %self.board_id, error = %e, "board client: retain failed");
            first_error = Some(e);
        }
        for message in outbound {
            if let Mutation::RemoveLayer(id) = &message.mutation {
                self.presence.forget_layer(id);
            }
            if let Err(e) = self.channel.publish(message) {
                warn!(board_id = %self.board_id, error = %e, "board client: publish failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Retain the current replica on the topic for late joiners.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub fn retain_snapshot(&self) -> Result<(), TransportError> {
        let snapshot = self.store.board_snapshot(self.channel.watermarks());
        self.channel.retain_snapshot(snapshot)
    }

    // =========================================================================
    // PRESENCE
    // =========================================================================

    /// # Errors
    ///
    /// Returns a transport error if the presence broadcast fails.
    pub fn announce(&mut self, cursor: Option<Point>, active_layer_ids: BTreeSet<LayerId>) -> Result<(), SessionError> {
        if let Some(entry) = self.presence.announce(cursor, active_layer_ids) {
            self.channel.publish_presence(entry)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a transport error if the presence broadcast fails.
    pub fn hover(&mut self, layer: Option<LayerId>) -> Result<(), SessionError> {
        if let Some(entry) = self.presence.hover(layer) {
            self.channel.publish_presence(entry)?;
        }
        Ok(())
    }

    /// Flush held presence changes and heartbeats.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the presence broadcast fails.
    pub fn tick(&mut self) -> Result<(), TransportError> {
        self.tick_at(Instant::now())
    }

    /// # Errors
    ///
    /// Returns a transport error if the presence broadcast fails.
    pub fn tick_at(&mut self, now: Instant) -> Result<(), TransportError> {
        match self.presence.flush_at(now) {
            Some(entry) => self.channel.publish_presence(entry),
            None => Ok(()),
        }
    }

    /// Live remote peers, sorted by connection id.
    pub fn live_entries(&mut self) -> Vec<PresenceEntry> {
        self.presence.live_entries()
    }

    #[must_use]
    pub fn local_presence(&self) -> &PresenceEntry {
        self.presence.local()
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Next accepted inbound item; `None` once disconnected.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        self.channel.recv().await
    }

    /// Route one inbound item to the store or the presence tracker.
    pub fn handle_inbound(&mut self, item: Inbound) -> Handled {
        match item {
            Inbound::Sync(message) => match self.store.apply_remote(&message) {
                Ok(outcome) => {
                    if let (RemoteOutcome::Applied, Mutation::RemoveLayer(id)) = (outcome, &message.mutation) {
                        self.presence.forget_layer(id);
                    }
                    Handled::Sync(outcome)
                }
                Err(e) => {
                    warn!(
                        board_id = %self.board_id,
                        origin = %message.origin,
                        sequence = message.sequence,
                        error = %e,
                        "board client: remote mutation rejected"
                    );
                    Handled::Sync(RemoteOutcome::Ignored)
                }
            },
            Inbound::Presence(entry) => Handled::Presence(self.presence.on_remote_update(entry)),
            Inbound::Left(connection_id) => {
                info!(board_id = %self.board_id, %connection_id, "board client: peer left");
                Handled::Left(self.presence.on_disconnect(&connection_id))
            }
        }
    }

    /// Receive and handle one inbound item.
    pub async fn process_next(&mut self) -> Option<Handled> {
        let item = self.next_inbound().await?;
        Some(self.handle_inbound(item))
    }

    // =========================================================================
    // RENDERING BOUNDARY
    // =========================================================================

    /// Layers sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Layer> {
        self.store.snapshot()
    }

    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        self.store.edges()
    }

    #[must_use]
    pub fn layer(&self, id: &LayerId) -> Option<&Layer> {
        self.store.get(id)
    }

    /// Bounds of the local selection, falling back to the local hover.
    #[must_use]
    pub fn selection_bounds(&self) -> Option<Rect> {
        self.presence_bounds(self.presence.local())
    }

    /// Bounds of any peer's selection or hover, resolved against this replica.
    #[must_use]
    pub fn presence_bounds(&self, entry: &PresenceEntry) -> Option<Rect> {
        bounds::selection_bounds(
            |id| self.store.get(id),
            &entry.active_layer_ids,
            entry.hovered_layer_id.as_ref(),
        )
    }

    /// Leave the board. Idempotent; afterwards no inbound item is yielded.
    pub fn disconnect(&mut self) {
        self.channel.disconnect();
    }
}
