use std::sync::Arc;
use std::time::Duration;

use boardsync::client::Handled;
use boardsync::transport::ws::WsTransport;
use boardsync::{BoardClient, Layer, LayerPatch, Mutation, SyncConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;

use super::*;

const BOARD: &str = "relay-board";

async fn spawn_relay() -> (String, RelayState) {
    let state = RelayState::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    (format!("ws://{addr}"), state)
}

fn config() -> SyncConfig {
    SyncConfig { presence_throttle: Duration::ZERO, ..SyncConfig::default() }
}

async fn join(base: &str, name: &str) -> BoardClient {
    let transport = Arc::new(WsTransport::new(base));
    BoardClient::connect(transport, BOARD, name, None, config())
        .await
        .expect("connect through relay")
}

async fn drain(client: &mut BoardClient) -> Vec<Handled> {
    let mut handled = Vec::new();
    while let Ok(Some(h)) = tokio::time::timeout(Duration::from_millis(200), client.process_next()).await {
        handled.push(h);
    }
    handled
}

fn rect(id: &str, x: f64) -> Layer {
    Layer::rectangle(id, x, 0.0, 10.0, 10.0).expect("valid rectangle")
}

async fn wait_for_subscribers(state: &RelayState, count: usize) {
    let topic = boardsync::transport::board_topic(BOARD);
    for _ in 0..100 {
        if state.hub.subscriber_count(&topic) == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.hub.subscriber_count(&topic), count, "subscriber count never settled");
}

// =============================================================
// Relay end to end
// =============================================================

#[tokio::test]
async fn edits_replicate_through_the_relay() {
    let (base, _state) = spawn_relay().await;
    let mut a = join(&base, "Ada").await;
    let mut b = join(&base, "Bob").await;

    a.apply(Mutation::AddLayer(rect("r1", 0.0))).expect("add");
    a.apply(Mutation::update("r1", LayerPatch::position(7.0, 7.0))).expect("move");
    drain(&mut b).await;
    assert_eq!(b.snapshot(), a.snapshot());

    b.apply(Mutation::RemoveLayer("r1".into())).expect("remove");
    drain(&mut a).await;
    assert!(a.snapshot().is_empty());
}

#[tokio::test]
async fn late_joiner_rewinds_from_retained_snapshot() {
    let (base, state) = spawn_relay().await;
    let mut a = join(&base, "Ada").await;
    a.apply(Mutation::AddLayer(rect("r1", 0.0))).expect("add r1");
    a.apply(Mutation::AddLayer(rect("r2", 30.0))).expect("add r2");

    let topic = boardsync::transport::board_topic(BOARD);
    for _ in 0..100 {
        if state.hub.retained(&topic).is_some_and(|s| s.layers.len() == 2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let late = join(&base, "Late").await;
    assert_eq!(late.snapshot(), a.snapshot());
}

#[tokio::test]
async fn disconnect_removes_subscriber_and_notifies_peers() {
    let (base, state) = spawn_relay().await;
    let mut a = join(&base, "Ada").await;
    let mut b = join(&base, "Bob").await;
    wait_for_subscribers(&state, 2).await;
    drain(&mut a).await;

    b.disconnect();
    wait_for_subscribers(&state, 1).await;
    let handled = drain(&mut a).await;
    assert!(handled.contains(&Handled::Left(true)));
    assert!(a.live_entries().is_empty());
}

// =============================================================
// Frames
// =============================================================

#[tokio::test]
async fn invalid_frames_are_dropped_without_closing_the_socket() {
    let (base, _state) = spawn_relay().await;
    let url = format!("{base}/topics/{}/ws", boardsync::transport::board_topic(BOARD));
    let (mut raw, _) = connect_async(url.as_str()).await.expect("raw connect");

    let welcome = raw.next().await.expect("welcome").expect("welcome frame");
    let tungstenite::Message::Text(text) = welcome else {
        panic!("welcome should be text");
    };
    let ServerFrame::Welcome { snapshot, .. } = serde_json::from_str(text.as_str()).expect("welcome json") else {
        panic!("first frame should be welcome");
    };
    assert!(snapshot.is_none());

    raw.send(tungstenite::Message::Text("not json".into())).await.expect("send garbage");

    let mut a = join(&base, "Ada").await;
    a.apply(Mutation::AddLayer(rect("r1", 0.0))).expect("add");

    let delivered = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let Some(Ok(tungstenite::Message::Text(text))) = raw.next().await else {
                panic!("socket closed");
            };
            if let Ok(ServerFrame::Deliver { envelope }) = serde_json::from_str(text.as_str()) {
                if envelope.origin() == a.connection_id() {
                    return envelope;
                }
            }
        }
    })
    .await
    .expect("delivery after garbage");
    assert_eq!(delivered.origin(), a.connection_id());
}

#[tokio::test]
async fn healthz_is_ok() {
    assert_eq!(healthz().await, StatusCode::OK);
}
