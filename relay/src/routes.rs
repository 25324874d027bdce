//! Router and WebSocket relay.
//!
//! DESIGN
//! ======
//! Each socket subscribes to exactly one topic, named in the path. The relay
//! never inspects board contents: it validates frame shape, hands publishes
//! and retains to the hub, and forwards whatever the hub delivers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → join the topic → send `welcome` with the connection id and,
//!    if `?rewind=true`, the retained snapshot
//! 2. `publish` frames → hub broadcast (the sender gets its own echo)
//! 3. `retain` frames → replace the topic's retained snapshot
//! 4. Close → hub leave, which broadcasts a leave envelope to the rest

#[cfg(test)]
#[path = "routes_test.rs"]
mod routes_test;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use boardsync::message::{ClientFrame, ConnectionId, ServerFrame};
use boardsync::transport::Subscription;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::RelayState;

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/topics/{topic}/ws", get(handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// UPGRADE
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    rewind: bool,
}

async fn handle_ws(
    State(state): State<RelayState>,
    Path(topic): Path<String>,
    Query(params): Query<SubscribeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state, topic, params.rewind))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: RelayState, topic: String, rewind: bool) {
    let Subscription { connection_id, snapshot, mut inbound } = match state.hub.join(&topic, rewind) {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(%topic, error = %e, "relay: join failed");
            return;
        }
    };

    let welcome = ServerFrame::Welcome { connection_id: connection_id.clone(), snapshot };
    if send_frame(&mut socket, &welcome).await.is_err() {
        state.hub.leave(&topic, &connection_id);
        return;
    }
    info!(%topic, %connection_id, "relay: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => dispatch_text(&state, &topic, &connection_id, text.as_str()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(envelope) = inbound.recv() => {
                if send_frame(&mut socket, &ServerFrame::Deliver { envelope }).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.leave(&topic, &connection_id);
    info!(%topic, %connection_id, "relay: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse one client frame and hand it to the hub. Bad frames are logged and
/// dropped; the socket stays open.
fn dispatch_text(state: &RelayState, topic: &str, connection_id: &ConnectionId, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%topic, %connection_id, error = %e, "relay: invalid client frame");
            return;
        }
    };

    let result = match frame {
        ClientFrame::Publish { envelope } => state.hub.broadcast(topic, connection_id, envelope),
        ClientFrame::Retain { snapshot } => state.hub.retain_snapshot(topic, connection_id, snapshot),
    };
    if let Err(e) = result {
        warn!(%topic, %connection_id, error = %e, "relay: frame rejected");
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "relay: failed to serialize frame");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|e| {
        debug!(error = %e, "relay: socket send failed");
    })
}
