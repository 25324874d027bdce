//! Presence tracker: ephemeral per-connection cursor, selection, and hover.
//!
//! DESIGN
//! ======
//! The tracker owns the local entry and a map of remote entries keyed by
//! connection id. Presence is lossy by nature: local changes are throttled
//! (the latest state wins, intermediate states are dropped) and remote
//! entries expire after a liveness window measured against local receive
//! time, so clock skew between peers never keeps a ghost cursor alive.
//!
//! Every time-dependent operation has an `_at(now)` form so the throttle,
//! heartbeat, and liveness logic can be tested without sleeping.

#[cfg(test)]
#[path = "presence_test.rs"]
mod presence_test;

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SyncConfig;
use crate::layer::{LayerId, Point, Rgb};
use crate::message::ConnectionId;

// =============================================================================
// TYPES
// =============================================================================

/// Presence of one connection as broadcast on the board topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub display_name: String,
    /// `None` while the pointer is off-canvas.
    pub cursor: Option<Point>,
    #[serde(default)]
    pub active_layer_ids: BTreeSet<LayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hovered_layer_id: Option<LayerId>,
    /// Sender wall clock, ms since the Unix epoch.
    pub last_seen_at: i64,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(connection_id: ConnectionId, display_name: impl Into<String>) -> Self {
        Self {
            connection_id,
            display_name: display_name.into(),
            cursor: None,
            active_layer_ids: BTreeSet::new(),
            hovered_layer_id: None,
            last_seen_at: now_ms(),
        }
    }
}

#[derive(Debug)]
struct RemotePresence {
    entry: PresenceEntry,
    received_at: Instant,
}

// =============================================================================
// TRACKER
// =============================================================================

#[derive(Debug)]
pub struct PresenceTracker {
    local: PresenceEntry,
    remote: HashMap<ConnectionId, RemotePresence>,
    throttle: Duration,
    heartbeat: Duration,
    liveness: Duration,
    last_broadcast: Option<Instant>,
    pending: bool,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(connection_id: ConnectionId, display_name: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            local: PresenceEntry::new(connection_id, display_name),
            remote: HashMap::new(),
            throttle: config.presence_throttle,
            heartbeat: config.presence_heartbeat,
            liveness: config.presence_liveness,
            last_broadcast: None,
            pending: false,
        }
    }

    /// The local entry as last stamped.
    #[must_use]
    pub fn local(&self) -> &PresenceEntry {
        &self.local
    }

    /// Update cursor and selection. Returns the entry to broadcast when the
    /// throttle allows it; otherwise the change is held for [`Self::flush`].
    pub fn announce(&mut self, cursor: Option<Point>, active_layer_ids: BTreeSet<LayerId>) -> Option<PresenceEntry> {
        self.announce_at(cursor, active_layer_ids, Instant::now())
    }

    pub fn announce_at(
        &mut self,
        cursor: Option<Point>,
        active_layer_ids: BTreeSet<LayerId>,
        now: Instant,
    ) -> Option<PresenceEntry> {
        self.local.cursor = cursor;
        self.local.active_layer_ids = active_layer_ids;
        self.broadcast_if_due(now)
    }

    /// Update the hovered layer, throttled like [`Self::announce`].
    pub fn hover(&mut self, layer: Option<LayerId>) -> Option<PresenceEntry> {
        self.hover_at(layer, Instant::now())
    }

    pub fn hover_at(&mut self, layer: Option<LayerId>, now: Instant) -> Option<PresenceEntry> {
        if self.local.hovered_layer_id == layer {
            return None;
        }
        self.local.hovered_layer_id = layer;
        self.broadcast_if_due(now)
    }

    /// Drop a removed layer from the local selection and hover. The change
    /// goes out on the next flush.
    pub fn forget_layer(&mut self, id: &LayerId) {
        let mut changed = self.local.active_layer_ids.remove(id);
        if self.local.hovered_layer_id.as_ref() == Some(id) {
            self.local.hovered_layer_id = None;
            changed = true;
        }
        if changed {
            self.pending = true;
        }
    }

    /// Periodic tick: emits a held change once the throttle has elapsed, or
    /// a heartbeat when nothing was sent for the heartbeat interval.
    pub fn flush(&mut self) -> Option<PresenceEntry> {
        self.flush_at(Instant::now())
    }

    pub fn flush_at(&mut self, now: Instant) -> Option<PresenceEntry> {
        let Some(last) = self.last_broadcast else {
            return Some(self.stamp(now));
        };
        let elapsed = now.saturating_duration_since(last);
        if (self.pending && elapsed >= self.throttle) || elapsed >= self.heartbeat {
            return Some(self.stamp(now));
        }
        None
    }

    fn broadcast_if_due(&mut self, now: Instant) -> Option<PresenceEntry> {
        let due = self
            .last_broadcast
            .is_none_or(|last| now.saturating_duration_since(last) >= self.throttle);
        if due {
            Some(self.stamp(now))
        } else {
            self.pending = true;
            None
        }
    }

    fn stamp(&mut self, now: Instant) -> PresenceEntry {
        self.local.last_seen_at = now_ms().max(self.local.last_seen_at);
        self.last_broadcast = Some(now);
        self.pending = false;
        self.local.clone()
    }

    /// Upsert a peer's entry. Returns `false` for the local connection's own
    /// entry and for updates older than the stored one.
    pub fn on_remote_update(&mut self, entry: PresenceEntry) -> bool {
        self.on_remote_update_at(entry, Instant::now())
    }

    pub fn on_remote_update_at(&mut self, entry: PresenceEntry, now: Instant) -> bool {
        if entry.connection_id == self.local.connection_id {
            return false;
        }
        if let Some(existing) = self.remote.get(&entry.connection_id) {
            if entry.last_seen_at < existing.entry.last_seen_at {
                debug!(
                    connection_id = %entry.connection_id,
                    stored = existing.entry.last_seen_at,
                    received = entry.last_seen_at,
                    "presence: ignoring out-of-order update"
                );
                return false;
            }
        }
        self.remote
            .insert(entry.connection_id.clone(), RemotePresence { entry, received_at: now });
        true
    }

    /// Remove a peer immediately. Returns whether it was known.
    pub fn on_disconnect(&mut self, connection_id: &ConnectionId) -> bool {
        self.remote.remove(connection_id).is_some()
    }

    /// Live peers sorted by connection id. Entries not refreshed within the
    /// liveness window are pruned.
    pub fn live_entries(&mut self) -> Vec<PresenceEntry> {
        self.live_entries_at(Instant::now())
    }

    pub fn live_entries_at(&mut self, now: Instant) -> Vec<PresenceEntry> {
        let liveness = self.liveness;
        self.remote.retain(|connection_id, presence| {
            let live = now.saturating_duration_since(presence.received_at) <= liveness;
            if !live {
                debug!(%connection_id, "presence: pruned stale entry");
            }
            live
        });
        let mut entries: Vec<PresenceEntry> = self.remote.values().map(|p| p.entry.clone()).collect();
        entries.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        entries
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Current wall clock in ms since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

const PALETTE: [Rgb; 12] = [
    Rgb::new(0xe5, 0x48, 0x4d),
    Rgb::new(0xf7, 0x6b, 0x15),
    Rgb::new(0xff, 0xc5, 0x3d),
    Rgb::new(0x46, 0xa7, 0x58),
    Rgb::new(0x12, 0xa5, 0x94),
    Rgb::new(0x00, 0x91, 0xff),
    Rgb::new(0x3e, 0x63, 0xdd),
    Rgb::new(0x6e, 0x56, 0xcf),
    Rgb::new(0x8e, 0x4e, 0xc6),
    Rgb::new(0xd6, 0x40, 0x9f),
    Rgb::new(0x97, 0x83, 0x65),
    Rgb::new(0x69, 0x6e, 0x77),
];

/// Stable color for a connection, used for its cursor and selection outline.
#[must_use]
pub fn presence_color(connection_id: &ConnectionId) -> Rgb {
    // FNV-1a
    let hash = connection_id
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |acc, byte| (acc ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3));
    let len = PALETTE.len() as u64;
    #[allow(clippy::cast_possible_truncation)]
    let index = (hash % len) as usize;
    PALETTE[index]
}
