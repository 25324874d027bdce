//! Local undo/redo history.
//!
//! DESIGN
//! ======
//! Only local edits are recorded. While remote mutations are applied the
//! store pauses recording, so a peer's change can never land on this
//! client's undo stack. Each entry stores both directions of one local edit
//! as mutation lists; undo replays `inverse`, redo replays `forward`, both
//! through the store's local path so peers receive the effects.
//!
//! The undo stack is bounded; once full, the oldest entry is dropped.

#[cfg(test)]
#[path = "history_test.rs"]
mod history_test;

use std::collections::VecDeque;

use crate::message::Mutation;

/// Default number of undo entries kept.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Whether new local edits are being recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryState {
    #[default]
    Recording,
    Paused,
}

/// Invertible record of one local change.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Mutations that perform the change, in application order.
    pub forward: Vec<Mutation>,
    /// Mutations that revert the change, in application order.
    pub inverse: Vec<Mutation>,
}

#[derive(Debug)]
pub struct History {
    state: HistoryState,
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    limit: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl History {
    /// History keeping at most `limit` undo entries (minimum 1).
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { state: HistoryState::Recording, undo: VecDeque::new(), redo: Vec::new(), limit: limit.max(1) }
    }

    pub fn pause(&mut self) {
        self.state = HistoryState::Paused;
    }

    pub fn resume(&mut self) {
        self.state = HistoryState::Recording;
    }

    /// Restore a state captured earlier with [`History::state`].
    pub fn set_state(&mut self, state: HistoryState) {
        self.state = state;
    }

    #[must_use]
    pub fn state(&self) -> HistoryState {
        self.state
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state == HistoryState::Paused
    }

    /// Append a new local edit. Returns `false` (and records nothing) while
    /// paused. A recorded edit invalidates the redo stack.
    pub fn record(&mut self, entry: HistoryEntry) -> bool {
        if self.is_paused() {
            return false;
        }
        self.redo.clear();
        self.push_undo(entry);
        true
    }

    /// Pop the newest undoable entry.
    pub fn take_undo(&mut self) -> Option<HistoryEntry> {
        self.undo.pop_back()
    }

    /// Pop the newest redoable entry.
    pub fn take_redo(&mut self) -> Option<HistoryEntry> {
        self.redo.pop()
    }

    /// Move an undone entry onto the redo stack.
    pub fn push_redo(&mut self, entry: HistoryEntry) {
        self.redo.push(entry);
    }

    /// Push onto the undo stack without touching redo. Used by redo.
    pub fn push_undo(&mut self, entry: HistoryEntry) {
        if self.undo.len() == self.limit {
            self.undo.pop_front();
        }
        self.undo.push_back(entry);
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Drop both stacks. Used when the replica is replaced wholesale.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}
