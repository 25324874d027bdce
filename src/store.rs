//! Layer store: the local board replica.
//!
//! DESIGN
//! ======
//! The store owns the id → layer and id → edge maps and is the only place
//! they change. There are two ways in:
//!
//! - The local path (`apply_local`, `apply_local_batch`, `undo`, `redo`)
//!   validates strictly, applies synchronously, and queues one outbound
//!   `SyncMessage` per applied mutation with the next local sequence.
//!   `apply_local*` also records a history entry.
//! - The remote path (`apply_remote`, `load_snapshot`) runs with history
//!   paused and is lenient: updates and removes of unknown ids are ignored,
//!   an add of an existing id overwrites it (last applied wins) unless it
//!   would change the layer's kind, which is ignored.
//!
//! Removing a layer removes every edge that touches it, on both paths.
//! Peers cascade on their own, so only the layer removal is published; the
//! recorded inverse restores the layer and its edges.
//!
//! ERROR HANDLING
//! ==============
//! Local mutations are all-or-nothing. If any mutation of a batch fails,
//! the ones already applied are rolled back through their inverses and
//! nothing is queued or recorded.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::history::{History, HistoryEntry};
use crate::layer::{Edge, EdgeId, Layer, LayerId, ValidationError};
use crate::message::{BoardSnapshot, ConnectionId, Mutation, SyncMessage};

/// What happened to a remote sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// The message originated from this store's own connection.
    SelfEcho,
    /// The target no longer exists, the edge would dangle, or an add would
    /// change an existing layer's kind; nothing changed.
    Ignored,
}

#[derive(Debug)]
pub struct LayerStore {
    connection_id: ConnectionId,
    layers: HashMap<LayerId, Layer>,
    edges: HashMap<EdgeId, Edge>,
    history: History,
    last_sequence: u64,
    outbound: Vec<SyncMessage>,
}

impl LayerStore {
    #[must_use]
    pub fn new(connection_id: ConnectionId, history_limit: usize) -> Self {
        Self {
            connection_id,
            layers: HashMap::new(),
            edges: HashMap::new(),
            history: History::new(history_limit),
            last_sequence: 0,
            outbound: Vec::new(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    // =========================================================================
    // READ
    // =========================================================================

    #[must_use]
    pub fn get(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &LayerId) -> bool {
        self.layers.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// All layers, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Layer> {
        let mut layers: Vec<Layer> = self.layers.values().cloned().collect();
        layers.sort_by(|a, b| a.id().cmp(b.id()));
        layers
    }

    /// All edges, sorted by id.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    /// Highest sequence assigned to a local mutation so far.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Full replica for retention. `watermarks` are the remote origins
    /// already folded in; the local origin is added.
    #[must_use]
    pub fn board_snapshot(&self, mut watermarks: BTreeMap<ConnectionId, u64>) -> BoardSnapshot {
        if self.last_sequence > 0 {
            watermarks.insert(self.connection_id.clone(), self.last_sequence);
        }
        BoardSnapshot { origin: self.connection_id.clone(), layers: self.snapshot(), edges: self.edges(), watermarks }
    }

    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    /// Drain queued outbound messages in sequence order.
    pub fn take_outbound(&mut self) -> Vec<SyncMessage> {
        std::mem::take(&mut self.outbound)
    }

    // =========================================================================
    // LOCAL PATH
    // =========================================================================

    /// Apply one local intent. Returns the added or updated layer.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for a malformed intent or one that does
    /// not fit the replica (duplicate id, unknown target, dangling edge).
    /// Nothing changes in that case.
    pub fn apply_local(&mut self, mutation: Mutation) -> Result<Option<Layer>, ValidationError> {
        let forward = vec![mutation];
        let (inverse, touched) = self.commit(&forward)?;
        self.history.record(HistoryEntry { forward, inverse });
        Ok(touched)
    }

    /// Apply several local intents as one undoable step.
    ///
    /// # Errors
    ///
    /// Returns the first failure; every mutation of the batch is rolled back.
    pub fn apply_local_batch(&mut self, mutations: Vec<Mutation>) -> Result<(), ValidationError> {
        if mutations.is_empty() {
            return Ok(());
        }
        let (inverse, _) = self.commit(&mutations)?;
        self.history.record(HistoryEntry { forward: mutations, inverse });
        Ok(())
    }

    /// Revert the newest local edit. Entries that no longer apply (a peer
    /// removed their target) are discarded and the next one is tried.
    /// Returns whether anything was undone.
    pub fn undo(&mut self) -> bool {
        while let Some(entry) = self.history.take_undo() {
            match self.commit(&entry.inverse) {
                Ok((redo, _)) => {
                    self.history.push_redo(HistoryEntry { forward: redo, inverse: entry.inverse });
                    return true;
                }
                Err(e) => {
                    debug!(connection_id = %self.connection_id, error = %e, "history: discarding stale undo entry");
                }
            }
        }
        false
    }

    /// Re-apply the newest undone edit. Returns whether anything was redone.
    pub fn redo(&mut self) -> bool {
        while let Some(entry) = self.history.take_redo() {
            match self.commit(&entry.forward) {
                Ok((inverse, _)) => {
                    self.history.push_undo(HistoryEntry { forward: entry.forward, inverse });
                    return true;
                }
                Err(e) => {
                    debug!(connection_id = %self.connection_id, error = %e, "history: discarding stale redo entry");
                }
            }
        }
        false
    }

    /// Apply `mutations` strictly and in order, queue them for publishing,
    /// and return the inverse list. All-or-nothing.
    fn commit(&mut self, mutations: &[Mutation]) -> Result<(Vec<Mutation>, Option<Layer>), ValidationError> {
        let mut groups: Vec<Vec<Mutation>> = Vec::with_capacity(mutations.len());
        let mut touched = None;

        for mutation in mutations {
            match self.apply_strict(mutation) {
                Ok((inverse, layer)) => {
                    groups.push(inverse);
                    touched = layer;
                }
                Err(e) => {
                    self.rollback(groups);
                    return Err(e);
                }
            }
        }

        for mutation in mutations {
            self.last_sequence += 1;
            self.outbound
                .push(SyncMessage::new(self.connection_id.clone(), self.last_sequence, mutation.clone()));
        }

        Ok((groups.into_iter().rev().flatten().collect(), touched))
    }

    fn rollback(&mut self, groups: Vec<Vec<Mutation>>) {
        for mutation in groups.into_iter().rev().flatten() {
            if let Err(e) = self.apply_strict(&mutation) {
                warn!(connection_id = %self.connection_id, error = %e, "store: rollback step failed");
            }
        }
    }

    /// Apply one mutation, returning its inverse group and the resulting layer.
    fn apply_strict(&mut self, mutation: &Mutation) -> Result<(Vec<Mutation>, Option<Layer>), ValidationError> {
        match mutation {
            Mutation::AddLayer(layer) => {
                if self.layers.contains_key(layer.id()) {
                    return Err(ValidationError::DuplicateLayer(layer.id().clone()));
                }
                self.layers.insert(layer.id().clone(), layer.clone());
                Ok((vec![Mutation::RemoveLayer(layer.id().clone())], Some(layer.clone())))
            }
            Mutation::UpdateLayer { id, patch } => {
                let current = self.layers.get(id).ok_or_else(|| ValidationError::UnknownLayer(id.clone()))?;
                let (next, inverse) = current.patched(patch)?;
                self.layers.insert(id.clone(), next.clone());
                Ok((vec![Mutation::UpdateLayer { id: id.clone(), patch: inverse }], Some(next)))
            }
            Mutation::RemoveLayer(id) => {
                let layer = self.layers.remove(id).ok_or_else(|| ValidationError::UnknownLayer(id.clone()))?;
                let mut inverse = vec![Mutation::AddLayer(layer)];
                inverse.extend(self.cascade(id).into_iter().map(Mutation::AddEdge));
                Ok((inverse, None))
            }
            Mutation::AddEdge(edge) => {
                if edge.id.as_str().is_empty() {
                    return Err(ValidationError::EmptyId);
                }
                if self.edges.contains_key(&edge.id) {
                    return Err(ValidationError::DuplicateEdge(edge.id.clone()));
                }
                if let Some(missing) = self.missing_endpoint(edge) {
                    return Err(ValidationError::DanglingEdge { edge: edge.id.clone(), layer: missing.clone() });
                }
                self.edges.insert(edge.id.clone(), edge.clone());
                Ok((vec![Mutation::RemoveEdge(edge.id.clone())], None))
            }
            Mutation::RemoveEdge(id) => {
                let edge = self.edges.remove(id).ok_or_else(|| ValidationError::UnknownEdge(id.clone()))?;
                Ok((vec![Mutation::AddEdge(edge)], None))
            }
        }
    }

    /// Remove and return every edge touching `layer`, sorted by id.
    fn cascade(&mut self, layer: &LayerId) -> Vec<Edge> {
        let mut ids: Vec<EdgeId> = self.edges.values().filter(|e| e.touches(layer)).map(|e| e.id.clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.edges.remove(id)).collect()
    }

    fn missing_endpoint<'a>(&self, edge: &'a Edge) -> Option<&'a LayerId> {
        [&edge.from_layer_id, &edge.to_layer_id]
            .into_iter()
            .find(|id| !self.layers.contains_key(*id))
    }

    // =========================================================================
    // REMOTE PATH
    // =========================================================================

    /// Apply a peer's mutation with history paused.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if an update does not fit the local copy
    /// of its target (e.g. resizing a path). Nothing changes in that case.
    pub fn apply_remote(&mut self, message: &SyncMessage) -> Result<RemoteOutcome, ValidationError> {
        if message.origin == self.connection_id {
            return Ok(RemoteOutcome::SelfEcho);
        }

        let prior = self.history.state();
        self.history.pause();
        let outcome = self.merge_remote(&message.mutation);
        self.history.set_state(prior);

        debug!(
            origin = %message.origin,
            sequence = message.sequence,
            kind = %message.kind(),
            ?outcome,
            "store: remote mutation"
        );
        outcome
    }

    fn merge_remote(&mut self, mutation: &Mutation) -> Result<RemoteOutcome, ValidationError> {
        let outcome = match mutation {
            Mutation::AddLayer(layer) => {
                if let Some(existing) = self.layers.get(layer.id()) {
                    if existing.kind() != layer.kind() {
                        debug!(
                            id = %layer.id(),
                            existing = ?existing.kind(),
                            incoming = ?layer.kind(),
                            "store: remote add would change layer kind; ignored"
                        );
                        return Ok(RemoteOutcome::Ignored);
                    }
                }
                self.layers.insert(layer.id().clone(), layer.clone());
                RemoteOutcome::Applied
            }
            Mutation::UpdateLayer { id, patch } => {
                let Some(current) = self.layers.get(id) else {
                    return Ok(RemoteOutcome::Ignored);
                };
                let (next, _) = current.patched(patch)?;
                self.layers.insert(id.clone(), next);
                RemoteOutcome::Applied
            }
            Mutation::RemoveLayer(id) => {
                if self.layers.remove(id).is_none() {
                    return Ok(RemoteOutcome::Ignored);
                }
                self.cascade(id);
                RemoteOutcome::Applied
            }
            Mutation::AddEdge(edge) => {
                if self.missing_endpoint(edge).is_some() {
                    return Ok(RemoteOutcome::Ignored);
                }
                self.edges.insert(edge.id.clone(), edge.clone());
                RemoteOutcome::Applied
            }
            Mutation::RemoveEdge(id) => {
                if self.edges.remove(id).is_none() {
                    return Ok(RemoteOutcome::Ignored);
                }
                RemoteOutcome::Applied
            }
        };
        Ok(outcome)
    }

    /// Replace the replica with `snapshot`. History is cleared since its
    /// entries described the replaced state. Returns the snapshot's
    /// watermarks for seeding the channel.
    pub fn load_snapshot(&mut self, snapshot: &BoardSnapshot) -> BTreeMap<ConnectionId, u64> {
        let prior = self.history.state();
        self.history.pause();

        self.layers = snapshot.layers.iter().map(|l| (l.id().clone(), l.clone())).collect();
        self.edges.clear();
        for edge in &snapshot.edges {
            if self.missing_endpoint(edge).is_some() {
                warn!(edge = %edge.id, "store: snapshot edge references missing layer; skipped");
                continue;
            }
            self.edges.insert(edge.id.clone(), edge.clone());
        }
        self.history.clear();

        self.history.set_state(prior);
        debug!(
            origin = %snapshot.origin,
            layers = self.layers.len(),
            edges = self.edges.len(),
            "store: snapshot loaded"
        );
        snapshot.watermarks.clone()
    }
}
