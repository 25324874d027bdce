//! Real-time sync core for the collaborative whiteboard.
//!
//! Keeps each client's replica of a board's layers consistent with its
//! peers over a publish/subscribe transport, tracks live presence (cursor,
//! selection, hover), and maintains a local undo/redo history that never
//! captures a peer's edits. Consistency is last-applied-wins per layer with
//! origin-based echo suppression and snapshot rewind for late joiners.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`layer`] | Layer, edge, and patch types with validation |
//! | [`bounds`] | Bounding boxes for selection outlines |
//! | [`history`] | Local undo/redo stacks with pause/resume |
//! | [`presence`] | Per-connection cursor/selection tracking |
//! | [`message`] | Wire types: sync messages, envelopes, snapshots, relay frames |
//! | [`transport`] | Transport trait, in-process hub, WebSocket client (`ws`) |
//! | [`channel`] | Echo suppression and per-origin sequence filtering |
//! | [`store`] | The board replica: local and remote apply paths |
//! | [`client`] | Composition of store, presence, and channel |
//! | [`session`] | Runs a client on one task behind a command queue |
//! | [`config`] | Environment-driven tuning |

pub mod bounds;
pub mod channel;
pub mod client;
pub mod config;
pub mod history;
pub mod layer;
pub mod message;
pub mod presence;
pub mod session;
pub mod store;
pub mod transport;

pub use client::{BoardClient, SessionError};
pub use config::SyncConfig;
pub use layer::{Edge, Layer, LayerId, LayerPatch, ValidationError};
pub use message::{BoardSnapshot, ConnectionId, Envelope, Mutation, SyncMessage};
pub use session::BoardSession;
pub use transport::memory::MemoryHub;
pub use transport::{Transport, TransportError};
