use std::time::Duration;

use super::*;
use crate::message::Mutation;
use crate::transport::memory::MemoryHub;

const BOARD: &str = "b1";

async fn pair(hub: &MemoryHub) -> (SyncChannel, SyncChannel) {
    let transport: Arc<dyn Transport> = Arc::new(hub.clone());
    let (a, _) = SyncChannel::connect(transport.clone(), BOARD, true).await.expect("connect a");
    let (b, _) = SyncChannel::connect(transport, BOARD, true).await.expect("connect b");
    (a, b)
}

fn message(origin: &ConnectionId, sequence: u64) -> SyncMessage {
    SyncMessage::new(origin.clone(), sequence, Mutation::RemoveLayer(format!("l{sequence}").into()))
}

async fn recv(channel: &mut SyncChannel) -> Option<Inbound> {
    tokio::time::timeout(Duration::from_secs(1), channel.recv())
        .await
        .expect("recv timed out")
}

// =============================================================
// Filtering
// =============================================================

#[tokio::test]
async fn duplicate_and_stale_sequences_are_dropped() {
    let hub = MemoryHub::default();
    let (mut channel, _) = SyncChannel::connect(Arc::new(hub), BOARD, false).await.expect("connect");
    let origin = ConnectionId::from("peer");

    let mut accepted = Vec::new();
    for sequence in [1, 2, 2, 1, 3] {
        if let Some(Inbound::Sync(m)) = channel.accept(Envelope::Sync(message(&origin, sequence))) {
            accepted.push(m.sequence);
        }
    }
    assert_eq!(accepted, vec![1, 2, 3]);
}

#[tokio::test]
async fn sequences_are_tracked_per_origin() {
    let hub = MemoryHub::default();
    let (mut a, _b) = pair(&hub).await;
    let x = ConnectionId::from("x");
    let y = ConnectionId::from("y");
    assert!(a.accept(Envelope::Sync(message(&x, 5))).is_some());
    assert!(a.accept(Envelope::Sync(message(&y, 1))).is_some());
    assert!(a.accept(Envelope::Sync(message(&x, 4))).is_none());
}

#[tokio::test]
async fn own_envelopes_of_every_type_are_suppressed() {
    let hub = MemoryHub::default();
    let (mut a, _b) = pair(&hub).await;
    let me = a.connection_id().clone();
    assert!(a.accept(Envelope::Sync(message(&me, 1))).is_none());
    assert!(a.accept(Envelope::Presence(PresenceEntry::new(me.clone(), "me"))).is_none());
    assert!(a.accept(Envelope::Leave { connection_id: me }).is_none());
}

#[tokio::test]
async fn seeded_watermarks_suppress_folded_messages() {
    let hub = MemoryHub::default();
    let (mut a, _b) = pair(&hub).await;
    let peer = ConnectionId::from("peer");
    a.seed_watermarks([(peer.clone(), 3)]);
    a.seed_watermarks([(peer.clone(), 1)]);
    assert_eq!(a.watermarks().get(&peer), Some(&3));
    assert!(a.accept(Envelope::Sync(message(&peer, 3))).is_none());
    assert!(a.accept(Envelope::Sync(message(&peer, 4))).is_some());
}

#[tokio::test]
async fn redelivery_after_leave_is_still_dropped() {
    let hub = MemoryHub::default();
    let (mut a, _b) = pair(&hub).await;
    let peer = ConnectionId::from("peer");
    assert!(a.accept(Envelope::Sync(message(&peer, 2))).is_some());

    assert_eq!(a.accept(Envelope::Leave { connection_id: peer.clone() }), Some(Inbound::Left(peer.clone())));
    assert_eq!(a.watermarks().get(&peer), Some(&2));
    assert!(a.accept(Envelope::Sync(message(&peer, 1))).is_none());
    assert!(a.accept(Envelope::Sync(message(&peer, 2))).is_none());
}

#[tokio::test]
async fn own_watermark_is_never_seeded() {
    let hub = MemoryHub::default();
    let (mut a, _b) = pair(&hub).await;
    let me = a.connection_id().clone();
    a.seed_watermarks([(me.clone(), 9)]);
    assert!(a.watermarks().get(&me).is_none());
}

// =============================================================
// Live delivery
// =============================================================

#[tokio::test]
async fn publish_reaches_peer_but_not_self() {
    let hub = MemoryHub::default();
    let (mut a, mut b) = pair(&hub).await;
    let sent = message(a.connection_id(), 1);
    a.publish(sent.clone()).expect("publish");

    assert_eq!(recv(&mut b).await, Some(Inbound::Sync(sent)));

    // a's own echo is filtered; the next thing it sees is b's presence.
    let presence = PresenceEntry::new(b.connection_id().clone(), "bee");
    b.publish_presence(presence.clone()).expect("presence");
    assert_eq!(recv(&mut a).await, Some(Inbound::Presence(presence)));
}

#[tokio::test]
async fn connect_returns_retained_snapshot() {
    let hub = MemoryHub::default();
    let (a, _b) = pair(&hub).await;
    a.retain_snapshot(BoardSnapshot::empty(a.connection_id().clone())).expect("retain");

    let (_c, snapshot) = SyncChannel::connect(Arc::new(hub.clone()), BOARD, true).await.expect("connect c");
    assert!(snapshot.is_some());
    let (_d, snapshot) = SyncChannel::connect(Arc::new(hub), BOARD, false).await.expect("connect d");
    assert!(snapshot.is_none());
}

#[tokio::test]
async fn connect_fails_when_unreachable() {
    let hub = MemoryHub::default();
    hub.set_reachable(false);
    let result = SyncChannel::connect(Arc::new(hub), BOARD, true).await;
    assert!(matches!(result, Err(TransportError::Unreachable(_))));
}

// =============================================================
// Disconnect
// =============================================================

#[tokio::test]
async fn disconnect_is_idempotent_and_silences_recv() {
    let hub = MemoryHub::default();
    let (mut a, mut b) = pair(&hub).await;
    let a_id = a.connection_id().clone();

    a.disconnect();
    a.disconnect();

    assert!(!a.is_connected());
    assert_eq!(a.recv().await, None);
    assert!(matches!(a.publish(message(&a_id, 1)), Err(TransportError::Closed)));
    assert_eq!(hub.subscriber_count("board:b1"), 1);
    assert_eq!(recv(&mut b).await, Some(Inbound::Left(a_id)));
}

#[tokio::test]
async fn messages_queued_before_disconnect_are_not_yielded() {
    let hub = MemoryHub::default();
    let (mut a, b) = pair(&hub).await;
    b.publish(message(b.connection_id(), 1)).expect("publish");
    a.disconnect();
    assert_eq!(a.recv().await, None);
}
