//! Shared relay state.
//!
//! DESIGN
//! ======
//! `RelayState` is injected into Axum handlers via the `State` extractor.
//! It wraps one in-process hub; every socket is a subscriber on it, so the
//! hub owns topic membership, fan-out, and retained snapshots.

use boardsync::MemoryHub;
use boardsync::config::env_parse;

const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

#[derive(Clone, Default)]
pub struct RelayState {
    pub hub: MemoryHub,
}

impl RelayState {
    /// Reads `RELAY_SUBSCRIBER_QUEUE`, the per-socket delivery queue size.
    #[must_use]
    pub fn from_env() -> Self {
        let lookup = |key: &str| std::env::var(key).map_err(drop);
        let queue = env_parse(&lookup, "RELAY_SUBSCRIBER_QUEUE", DEFAULT_SUBSCRIBER_QUEUE);
        tracing::info!(queue, "relay: hub configured");
        Self { hub: MemoryHub::new(queue) }
    }
}
