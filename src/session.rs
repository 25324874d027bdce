//! Board session: runs one [`BoardClient`] on its own task.
//!
//! DESIGN
//! ======
//! The task owns the client and multiplexes three sources in one
//! `select!` loop:
//! - commands from [`BoardSession`] handles (local intents and queries)
//! - inbound items from the sync channel
//! - a presence ticker that flushes throttled changes and heartbeats
//!
//! Each command runs to completion before the next item is taken, so local
//! and remote mutations never interleave. Commands reply over oneshot
//! channels.
//!
//! LIFECYCLE
//! =========
//! 1. `connect` subscribes and catches up, then spawns the task
//! 2. Commands and inbound items are processed one at a time
//! 3. `disconnect` (or dropping the last handle) publishes a leave and
//!    stops the loop; queued inbound items are not processed

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bounds::Rect;
use crate::client::{BoardClient, SessionError};
use crate::config::SyncConfig;
use crate::layer::{Edge, Layer, LayerId, Point};
use crate::message::{BoardSnapshot, ConnectionId, Mutation};
use crate::presence::PresenceEntry;
use crate::transport::Transport;

const MIN_TICK: Duration = Duration::from_millis(1);

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Apply { mutation: Mutation, reply: Reply<Result<Option<Layer>, SessionError>> },
    ApplyBatch { mutations: Vec<Mutation>, reply: Reply<Result<(), SessionError>> },
    Undo { reply: Reply<Result<bool, SessionError>> },
    Redo { reply: Reply<Result<bool, SessionError>> },
    Announce { cursor: Option<Point>, active: BTreeSet<LayerId>, reply: Reply<Result<(), SessionError>> },
    Hover { layer: Option<LayerId>, reply: Reply<Result<(), SessionError>> },
    Snapshot { reply: Reply<Vec<Layer>> },
    Edges { reply: Reply<Vec<Edge>> },
    LiveEntries { reply: Reply<Vec<PresenceEntry>> },
    SelectionBounds { reply: Reply<Option<Rect>> },
    Disconnect { reply: Reply<()> },
}

/// Handle to a running board session.
pub struct BoardSession {
    commands: mpsc::Sender<Command>,
    connection_id: ConnectionId,
    task: JoinHandle<()>,
}

impl BoardSession {
    /// Connect a client and start its task.
    ///
    /// # Errors
    ///
    /// Returns the client's connect error; no task is started.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        board_id: &str,
        display_name: &str,
        seed: Option<BoardSnapshot>,
        config: SyncConfig,
    ) -> Result<Self, SessionError> {
        let client = BoardClient::connect(transport, board_id, display_name, seed, config).await?;
        Ok(Self::spawn(client, &config))
    }

    /// Run an already connected client on a new task.
    #[must_use]
    pub fn spawn(client: BoardClient, config: &SyncConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let connection_id = client.connection_id().clone();
        let tick = config.presence_throttle.max(MIN_TICK);
        let task = tokio::spawn(run_session(client, rx, tick));
        Self { commands: tx, connection_id, task }
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// # Errors
    ///
    /// Validation or transport failure, or [`SessionError::Closed`].
    pub async fn apply(&self, mutation: Mutation) -> Result<Option<Layer>, SessionError> {
        self.request(|reply| Command::Apply { mutation, reply }).await?
    }

    /// # Errors
    ///
    /// Validation or transport failure, or [`SessionError::Closed`].
    pub async fn apply_batch(&self, mutations: Vec<Mutation>) -> Result<(), SessionError> {
        self.request(|reply| Command::ApplyBatch { mutations, reply }).await?
    }

    /// # Errors
    ///
    /// Transport failure, or [`SessionError::Closed`].
    pub async fn undo(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Undo { reply }).await?
    }

    /// # Errors
    ///
    /// Transport failure, or [`SessionError::Closed`].
    pub async fn redo(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Redo { reply }).await?
    }

    /// # Errors
    ///
    /// Transport failure, or [`SessionError::Closed`].
    pub async fn announce(&self, cursor: Option<Point>, active: BTreeSet<LayerId>) -> Result<(), SessionError> {
        self.request(|reply| Command::Announce { cursor, active, reply }).await?
    }

    /// # Errors
    ///
    /// Transport failure, or [`SessionError::Closed`].
    pub async fn hover(&self, layer: Option<LayerId>) -> Result<(), SessionError> {
        self.request(|reply| Command::Hover { layer, reply }).await?
    }

    /// # Errors
    ///
    /// [`SessionError::Closed`] once the session has stopped.
    pub async fn snapshot(&self) -> Result<Vec<Layer>, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// # Errors
    ///
    /// [`SessionError::Closed`] once the session has stopped.
    pub async fn edges(&self) -> Result<Vec<Edge>, SessionError> {
        self.request(|reply| Command::Edges { reply }).await
    }

    /// # Errors
    ///
    /// [`SessionError::Closed`] once the session has stopped.
    pub async fn live_entries(&self) -> Result<Vec<PresenceEntry>, SessionError> {
        self.request(|reply| Command::LiveEntries { reply }).await
    }

    /// # Errors
    ///
    /// [`SessionError::Closed`] once the session has stopped.
    pub async fn selection_bounds(&self) -> Result<Option<Rect>, SessionError> {
        self.request(|reply| Command::SelectionBounds { reply }).await
    }

    /// Leave the board and wait for the task to finish. Safe to call on a
    /// session that has already stopped.
    pub async fn disconnect(self) {
        if let Err(e) = self.request(|reply| Command::Disconnect { reply }).await {
            debug!(connection_id = %self.connection_id, error = %e, "session already stopped");
        }
        if let Err(e) = self.task.await {
            warn!(connection_id = %self.connection_id, error = %e, "session task failed");
        }
    }
}

// =============================================================================
// TASK
// =============================================================================

async fn run_session(mut client: BoardClient, mut commands: mpsc::Receiver<Command>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    client.disconnect();
                    break;
                };
                if dispatch(&mut client, command).is_break() {
                    break;
                }
            }
            inbound = client.next_inbound(), if client.is_connected() => {
                if let Some(item) = inbound {
                    client.handle_inbound(item);
                } else {
                    info!(board_id = %client.board_id(), "session: transport closed the subscription");
                    client.disconnect();
                }
            }
            _ = ticker.tick() => {
                if client.is_connected() {
                    if let Err(e) = client.tick() {
                        warn!(board_id = %client.board_id(), error = %e, "session: presence flush failed");
                    }
                }
            }
        }
    }
    info!(board_id = %client.board_id(), connection_id = %client.connection_id(), "session stopped");
}

fn dispatch(client: &mut BoardClient, command: Command) -> ControlFlow<()> {
    match command {
        Command::Apply { mutation, reply } => respond(reply, client.apply(mutation)),
        Command::ApplyBatch { mutations, reply } => respond(reply, client.apply_batch(mutations)),
        Command::Undo { reply } => respond(reply, client.undo()),
        Command::Redo { reply } => respond(reply, client.redo()),
        Command::Announce { cursor, active, reply } => respond(reply, client.announce(cursor, active)),
        Command::Hover { layer, reply } => respond(reply, client.hover(layer)),
        Command::Snapshot { reply } => respond(reply, client.snapshot()),
        Command::Edges { reply } => respond(reply, client.edges()),
        Command::LiveEntries { reply } => respond(reply, client.live_entries()),
        Command::SelectionBounds { reply } => respond(reply, client.selection_bounds()),
        Command::Disconnect { reply } => {
            client.disconnect();
            respond(reply, ());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

fn respond<T>(reply: Reply<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("session: caller dropped the reply channel");
    }
}
