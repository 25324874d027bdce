use std::time::Duration;

use super::*;
use crate::layer::{LayerPatch, Rgb};
use crate::transport::memory::MemoryHub;

const BOARD: &str = "board-1";

fn config() -> SyncConfig {
    SyncConfig { presence_throttle: Duration::ZERO, ..SyncConfig::default() }
}

async fn join(hub: &MemoryHub, name: &str) -> BoardClient {
    join_seeded(hub, name, None).await
}

async fn join_seeded(hub: &MemoryHub, name: &str, seed: Option<BoardSnapshot>) -> BoardClient {
    BoardClient::connect(Arc::new(hub.clone()), BOARD, name, seed, config())
        .await
        .expect("connect")
}

/// Handle everything currently queued for `client`.
async fn drain(client: &mut BoardClient) -> Vec<Handled> {
    let mut handled = Vec::new();
    while let Ok(Some(h)) = tokio::time::timeout(Duration::from_millis(50), client.process_next()).await {
        handled.push(h);
    }
    handled
}

fn rect(id: &str, x: f64, y: f64) -> Layer {
    Layer::rectangle(id, x, y, 10.0, 10.0).expect("valid rectangle")
}

// =============================================================
// Replication
// =============================================================

#[tokio::test]
async fn peers_converge_on_add_update_remove() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let mut b = join(&hub, "Bob").await;

    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add r1");
    a.apply(Mutation::AddLayer(rect("r2", 50.0, 0.0).with_fill(Rgb::new(1, 2, 3))))
        .expect("add r2");
    a.apply(Mutation::update("r1", LayerPatch::position(5.0, 5.0))).expect("move r1");
    drain(&mut b).await;
    assert_eq!(b.snapshot(), a.snapshot());

    b.apply(Mutation::RemoveLayer("r2".into())).expect("remove r2");
    drain(&mut a).await;
    assert_eq!(a.snapshot(), b.snapshot());
    assert_eq!(a.snapshot().len(), 1);
}

#[tokio::test]
async fn remote_remove_cascades_edges_on_every_replica() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let mut b = join(&hub, "Bob").await;

    a.apply_batch(vec![
        Mutation::AddLayer(rect("x", 0.0, 0.0)),
        Mutation::AddLayer(rect("y", 30.0, 0.0)),
        Mutation::AddEdge(Edge::new("xy", "x", "y")),
    ])
    .expect("batch");
    drain(&mut b).await;
    assert_eq!(b.edges(), vec![Edge::new("xy", "x", "y")]);

    a.apply(Mutation::RemoveLayer("x".into())).expect("remove x");
    drain(&mut b).await;
    assert!(b.edges().is_empty());
    assert!(b.layer(&"x".into()).is_none());
}

#[tokio::test]
async fn undo_and_redo_propagate_to_peers() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let mut b = join(&hub, "Bob").await;

    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add");
    drain(&mut b).await;
    assert_eq!(b.snapshot().len(), 1);

    assert!(a.undo().expect("undo"));
    drain(&mut b).await;
    assert!(b.snapshot().is_empty());

    assert!(a.redo().expect("redo"));
    drain(&mut b).await;
    assert_eq!(b.snapshot(), a.snapshot());
}

#[tokio::test]
async fn remote_edits_are_not_undoable_locally() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let mut b = join(&hub, "Bob").await;

    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add");
    drain(&mut b).await;
    assert!(!b.can_undo());
    assert!(!b.undo().expect("undo"));
    assert_eq!(b.snapshot().len(), 1);
}

#[tokio::test]
async fn own_messages_are_never_handled() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add");
    assert!(drain(&mut a).await.is_empty());
}

// =============================================================
// Catch-up
// =============================================================

#[tokio::test]
async fn late_joiner_rewinds_then_follows_live() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add r1");
    a.apply(Mutation::AddLayer(rect("r2", 20.0, 0.0))).expect("add r2");

    let mut late = join(&hub, "Late").await;
    assert_eq!(late.snapshot(), a.snapshot());

    a.apply(Mutation::update("r2", LayerPatch::position(1.0, 1.0))).expect("move r2");
    drain(&mut late).await;
    assert_eq!(late.snapshot(), a.snapshot());
}

#[tokio::test]
async fn joiner_between_retain_and_publish_sees_the_edit_once() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;

    a.store.apply_local(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add");
    a.retain_snapshot().expect("retain");
    let mut b = join(&hub, "Bob").await;
    assert_eq!(b.snapshot(), a.snapshot());

    a.publish_outbound().expect("publish");
    let handled = drain(&mut b).await;
    assert!(!handled.iter().any(|h| matches!(h, Handled::Sync(_))));
    assert_eq!(b.snapshot(), a.snapshot());
}

#[tokio::test]
async fn joiner_recovers_edit_missing_from_lagging_snapshot() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let mut b = join(&hub, "Bob").await;

    // b retains before it has seen r1, so the retained snapshot lacks it.
    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add r1");
    b.apply(Mutation::AddLayer(rect("r2", 20.0, 0.0))).expect("add r2");
    let retained = hub.retained("board:board-1").expect("retained");
    assert_eq!(retained.layers.len(), 1);

    let mut late = join(&hub, "Late").await;
    drain(&mut late).await;
    drain(&mut a).await;
    drain(&mut b).await;

    let ids: Vec<String> = late.snapshot().iter().map(|l| l.id().to_string()).collect();
    assert_eq!(ids, vec!["r1", "r2"]);
    assert_eq!(a.snapshot(), late.snapshot());
    assert_eq!(b.snapshot(), late.snapshot());
}

#[tokio::test]
async fn seed_becomes_retained_snapshot_for_others() {
    let hub = MemoryHub::default();
    let mut seed = BoardSnapshot::empty(ConnectionId::from("durable"));
    seed.layers = vec![rect("persisted", 0.0, 0.0)];

    let a = join_seeded(&hub, "Ada", Some(seed)).await;
    assert_eq!(a.snapshot().len(), 1);

    let b = join(&hub, "Bob").await;
    assert_eq!(b.snapshot(), a.snapshot());
}

#[tokio::test]
async fn rewind_replaces_stale_seed() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    a.apply(Mutation::AddLayer(rect("live", 0.0, 0.0))).expect("add");

    let mut seed = BoardSnapshot::empty(ConnectionId::from("durable"));
    seed.layers = vec![rect("stale", 0.0, 0.0)];
    let b = join_seeded(&hub, "Bob", Some(seed)).await;
    let ids: Vec<String> = b.snapshot().iter().map(|l| l.id().to_string()).collect();
    assert_eq!(ids, vec!["live"]);
}

#[tokio::test]
async fn connect_fails_when_transport_is_unreachable() {
    let hub = MemoryHub::default();
    hub.set_reachable(false);
    let result = BoardClient::connect(Arc::new(hub), BOARD, "Ada", None, config()).await;
    assert!(matches!(result, Err(SessionError::Transport(TransportError::Unreachable(_)))));
}

// =============================================================
// Errors
// =============================================================

#[tokio::test]
async fn invalid_intent_is_a_validation_error() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let err = a
        .apply(Mutation::update("ghost", LayerPatch::position(1.0, 1.0)))
        .expect_err("unknown");
    assert!(matches!(err, SessionError::Validation(ValidationError::UnknownLayer(_))));
}

#[tokio::test]
async fn publish_failure_keeps_local_edit() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    hub.set_reachable(false);
    let err = a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect_err("offline");
    assert!(matches!(err, SessionError::Transport(_)));
    assert_eq!(a.snapshot().len(), 1);
    assert!(a.can_undo());
}

// =============================================================
// Presence
// =============================================================

#[tokio::test]
async fn presence_reaches_peers_and_clears_on_leave() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let mut b = join(&hub, "Bob").await;

    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add");
    drain(&mut b).await;

    let selection: BTreeSet<LayerId> = [LayerId::from("r1")].into_iter().collect();
    b.announce(Some(Point::new(3.0, 4.0)), selection).expect("announce");
    drain(&mut a).await;

    let live = a.live_entries();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].display_name, "Bob");
    assert_eq!(live[0].cursor, Some(Point::new(3.0, 4.0)));
    assert_eq!(a.presence_bounds(&live[0]), Some(Rect::new(0.0, 0.0, 10.0, 10.0)));

    b.disconnect();
    let handled = drain(&mut a).await;
    assert!(handled.contains(&Handled::Left(true)));
    assert!(a.live_entries().is_empty());
}

#[tokio::test]
async fn local_selection_bounds_follow_hover_and_selection() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add r1");
    a.apply(Mutation::AddLayer(rect("r2", 40.0, 40.0))).expect("add r2");
    assert_eq!(a.selection_bounds(), None);

    a.hover(Some("r2".into())).expect("hover");
    assert_eq!(a.selection_bounds(), Some(Rect::new(40.0, 40.0, 10.0, 10.0)));

    let both: BTreeSet<LayerId> = [LayerId::from("r1"), LayerId::from("r2")].into_iter().collect();
    a.announce(None, both).expect("select");
    assert_eq!(a.selection_bounds(), Some(Rect::new(0.0, 0.0, 50.0, 50.0)));
}

#[tokio::test]
async fn remote_removal_drops_layer_from_local_selection() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let mut b = join(&hub, "Bob").await;

    a.apply(Mutation::AddLayer(rect("r1", 0.0, 0.0))).expect("add");
    a.announce(None, [LayerId::from("r1")].into_iter().collect()).expect("select");
    drain(&mut b).await;

    b.apply(Mutation::RemoveLayer("r1".into())).expect("remove");
    drain(&mut a).await;
    assert!(a.local_presence().active_layer_ids.is_empty());
    assert_eq!(a.selection_bounds(), None);
}

// =============================================================
// Disconnect
// =============================================================

#[tokio::test]
async fn disconnect_stops_inbound() {
    let hub = MemoryHub::default();
    let mut a = join(&hub, "Ada").await;
    let b = join(&hub, "Bob").await;
    a.disconnect();
    a.disconnect();
    assert!(!a.is_connected());
    drop(b);
    assert_eq!(a.process_next().await, None);
}
