//! Sync tuning knobs, loaded from environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::time::Duration;

use crate::history::DEFAULT_HISTORY_LIMIT;

const DEFAULT_PRESENCE_THROTTLE_MS: u64 = 50;
const DEFAULT_PRESENCE_HEARTBEAT_MS: u64 = 10_000;
const DEFAULT_PRESENCE_LIVENESS_MS: u64 = 30_000;
const DEFAULT_COMMAND_QUEUE: usize = 256;
const DEFAULT_REWIND: bool = true;

/// Per-client sync configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Minimum spacing between local presence broadcasts.
    pub presence_throttle: Duration,
    /// Re-announce interval for an idle client so peers keep it live.
    pub presence_heartbeat: Duration,
    /// Remote entries not refreshed within this window are pruned.
    pub presence_liveness: Duration,
    /// Maximum undo entries.
    pub history_limit: usize,
    /// Session command queue capacity.
    pub command_queue: usize,
    /// Request the retained snapshot on subscribe.
    pub rewind: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            presence_throttle: Duration::from_millis(DEFAULT_PRESENCE_THROTTLE_MS),
            presence_heartbeat: Duration::from_millis(DEFAULT_PRESENCE_HEARTBEAT_MS),
            presence_liveness: Duration::from_millis(DEFAULT_PRESENCE_LIVENESS_MS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            command_queue: DEFAULT_COMMAND_QUEUE,
            rewind: DEFAULT_REWIND,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).map_err(drop))
    }

    /// Build from an arbitrary key lookup. Missing or unparsable values fall
    /// back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Result<String, ()>,
    {
        let ms = |key: &str, default: u64| Duration::from_millis(env_parse(&lookup, key, default));
        Self {
            presence_throttle: ms("SYNC_PRESENCE_THROTTLE_MS", DEFAULT_PRESENCE_THROTTLE_MS),
            presence_heartbeat: ms("SYNC_PRESENCE_HEARTBEAT_MS", DEFAULT_PRESENCE_HEARTBEAT_MS),
            presence_liveness: ms("SYNC_PRESENCE_LIVENESS_MS", DEFAULT_PRESENCE_LIVENESS_MS),
            history_limit: env_parse(&lookup, "SYNC_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT),
            command_queue: env_parse(&lookup, "SYNC_COMMAND_QUEUE", DEFAULT_COMMAND_QUEUE).max(1),
            rewind: env_parse(&lookup, "SYNC_REWIND", DEFAULT_REWIND),
        }
    }
}

/// Parse `key` through `lookup`, falling back to `default` when missing or invalid.
pub fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, ()>,
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(()) => default,
    }
}
