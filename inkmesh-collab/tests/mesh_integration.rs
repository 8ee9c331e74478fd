//! End-to-end mesh tests over the in-memory transport.
//!
//! Every participant runs a real node; assertions poll the nodes through
//! their handles until the mesh settles.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use inkmesh_collab::{
    EventForwarder, Identity, MemoryNetwork, MeshError, MeshEvent, MeshHandle, NodeConfig,
    PeerAddress, Role, RoomId,
};
use inkmesh_core::{Point, Stroke, StrokeId};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Duration, Instant};

type Events = UnboundedReceiver<MeshEvent>;

fn config() -> NodeConfig {
    NodeConfig {
        join_timeout: Duration::from_secs(2),
        cursor_interval: Duration::ZERO,
        ..NodeConfig::default()
    }
}

async fn host(net: &Arc<MemoryNetwork>, name: &str) -> (MeshHandle, Events) {
    let (listener, events) = EventForwarder::new();
    let handle = MeshHandle::create_room(net.clone(), config(), Identity::named(name), listener)
        .await
        .unwrap();
    (handle, events)
}

async fn guest(net: &Arc<MemoryNetwork>, name: &str, room: &RoomId) -> (MeshHandle, Events) {
    let (listener, events) = EventForwarder::new();
    let handle = MeshHandle::join_room(
        net.clone(),
        config(),
        Identity::named(name),
        room.clone(),
        listener,
    )
    .await
    .unwrap();
    (handle, events)
}

/// Poll `check` until it holds, failing after a few seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn peer_count_is(handle: &MeshHandle, expected: usize) -> bool {
    handle.peers().await.unwrap().len() == expected
}

async fn stroke_ids(handle: &MeshHandle) -> Vec<String> {
    handle
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id.as_str().to_string())
        .collect()
}

async fn has_strokes(handle: &MeshHandle, ids: &[&str]) -> bool {
    stroke_ids(handle).await == ids
}

async fn stroke_count_is(handle: &MeshHandle, expected: usize) -> bool {
    handle.snapshot().await.unwrap().len() == expected
}

async fn knows_peer_named(handle: &MeshHandle, username: &str) -> bool {
    handle
        .peers()
        .await
        .unwrap()
        .iter()
        .any(|p| p.username == username)
}

async fn cursor_count_is(handle: &MeshHandle, expected: usize) -> bool {
    handle.cursors().await.unwrap().len() == expected
}

async fn received_at_least(handle: &MeshHandle, count: u64) -> bool {
    handle.stats().await.unwrap().messages_received >= count
}

/// Next event matching `pred`, skipping others.
async fn next_matching(events: &mut Events, pred: impl Fn(&MeshEvent) -> bool) -> MeshEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("matching event within timeout")
}

/// Everything that arrives within `window`.
async fn drain_for(events: &mut Events, window: Duration) -> Vec<MeshEvent> {
    let mut out = Vec::new();
    let deadline = Instant::now() + window;
    while let Ok(Some(event)) = timeout(deadline.saturating_duration_since(Instant::now()), events.recv()).await {
        out.push(event);
    }
    out
}

/// P1 hosts, P2 then P3 join; returns once every node has two peers.
async fn three_peer_mesh(net: &Arc<MemoryNetwork>) -> [(MeshHandle, Events); 3] {
    let p1 = host(net, "P1").await;
    let room = p1.0.room_id().clone();
    let p2 = guest(net, "P2", &room).await;
    // P2's greeting and sync request handled before P3 shows up.
    eventually("P2 synced", || received_at_least(&p1.0, 2)).await;
    let p3 = guest(net, "P3", &room).await;

    for (handle, _) in [&p1, &p2, &p3] {
        eventually("full mesh", || peer_count_is(handle, 2)).await;
    }
    [p1, p2, p3]
}

fn line(id: &str, from: (f64, f64), to: (f64, f64)) -> Stroke {
    Stroke::with_id(id, vec![Point::new(from.0, from.1), Point::new(to.0, to.1)])
}

#[tokio::test]
async fn test_three_peers_form_full_mesh() {
    let net = Arc::new(MemoryNetwork::new());
    let [p1, p2, p3] = three_peer_mesh(&net).await;

    assert_eq!(p1.0.role(), Role::Host);
    assert_eq!(p2.0.role(), Role::Guest);
    assert_eq!(p3.0.role(), Role::Guest);

    // Direct links, not a star through P1.
    let addresses = |peers: Vec<inkmesh_collab::PeerSummary>| -> BTreeSet<PeerAddress> {
        peers.into_iter().map(|p| p.address).collect()
    };
    let p2_peers = addresses(p2.0.peers().await.unwrap());
    assert!(p2_peers.contains(p1.0.local_address()));
    assert!(p2_peers.contains(p3.0.local_address()));
    let p3_peers = addresses(p3.0.peers().await.unwrap());
    assert!(p3_peers.contains(p2.0.local_address()));

    let p1_stats = p1.0.stats().await.unwrap();
    assert_eq!(p1_stats.announces_sent, 1, "P3 announced to P2 only");
    assert_eq!(p2.0.stats().await.unwrap().dials_started, 1);
}

#[tokio::test]
async fn test_guest_learns_host_identity() {
    let net = Arc::new(MemoryNetwork::new());
    let (p1, _e1) = host(&net, "Hostess").await;
    let (p2, mut e2) = guest(&net, "Visitor", p1.room_id()).await;

    let p1_addr = p1.local_address().clone();
    let event = next_matching(&mut e2, |e| {
        matches!(e, MeshEvent::PeerConnected { identity, .. } if identity.username == "Hostess")
    })
    .await;
    match event {
        MeshEvent::PeerConnected { address, .. } => assert_eq!(address, p1_addr),
        other => panic!("unexpected {other:?}"),
    }

    eventually("host sees guest name", || knows_peer_named(&p1, "Visitor")).await;
    assert_eq!(p2.peers().await.unwrap()[0].username, "Hostess");
}

#[tokio::test]
async fn test_every_identity_message_reraises_connected() {
    let net = Arc::new(MemoryNetwork::new());
    let (p1, mut e1) = host(&net, "Hostess").await;
    let (p2, mut e2) = guest(&net, "Visitor", p1.room_id()).await;

    // The sync reply means the host has handled the greeting and the
    // sync request that follows it.
    next_matching(&mut e2, |e| matches!(e, MeshEvent::SyncData(_))).await;

    let guest_addr = p2.local_address().clone();
    let connects: Vec<Identity> = drain_for(&mut e1, Duration::from_millis(100))
        .await
        .into_iter()
        .filter_map(|e| match e {
            MeshEvent::PeerConnected { address, identity } if address == guest_addr => {
                Some(identity)
            }
            _ => None,
        })
        .collect();

    // Link open, then the identity greeting; the sync request is silent.
    assert_eq!(connects.len(), 2, "got {connects:?}");
    assert_eq!(connects[0], connects[1]);
    assert_eq!(connects[0].username, "Visitor");
}

#[tokio::test]
async fn test_newcomer_receives_existing_strokes() {
    let net = Arc::new(MemoryNetwork::new());
    let (p1, _e1) = host(&net, "P1").await;

    let a = line("s1", (0.0, 0.0), (10.0, 10.0));
    let b = line("s2", (5.0, 5.0), (15.0, 15.0));
    p1.send_stroke(a.clone()).await.unwrap();
    p1.send_stroke(b.clone()).await.unwrap();
    assert_eq!(p1.snapshot().await.unwrap().len(), 2);

    let (p2, mut e2) = guest(&net, "P2", p1.room_id()).await;
    match next_matching(&mut e2, |e| matches!(e, MeshEvent::SyncData(_))).await {
        MeshEvent::SyncData(strokes) => assert_eq!(strokes, vec![a.clone(), b.clone()]),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(p2.snapshot().await.unwrap(), vec![a, b]);
}

#[tokio::test]
async fn test_newcomer_inherits_tombstones() {
    let net = Arc::new(MemoryNetwork::new());
    let (p1, _e1) = host(&net, "P1").await;
    p1.send_stroke(line("gone", (0.0, 0.0), (1.0, 1.0))).await.unwrap();
    p1.send_erase(vec![StrokeId::from("gone")]).await.unwrap();
    p1.send_stroke(line("kept", (0.0, 0.0), (2.0, 2.0))).await.unwrap();
    assert_eq!(stroke_ids(&p1).await, vec!["kept"]);

    let (p2, _e2) = guest(&net, "P2", p1.room_id()).await;
    eventually("sync", || has_strokes(&p2, &["kept"])).await;

    // A stale copy of the erased stroke does not come back.
    let (p3, _e3) = guest(&net, "P3", p1.room_id()).await;
    eventually("P3 meshed", || peer_count_is(&p3, 2)).await;
    p3.send_stroke(line("gone", (0.0, 0.0), (1.0, 1.0))).await.unwrap();
    p3.send_stroke(line("late", (3.0, 3.0), (4.0, 4.0))).await.unwrap();
    eventually("late stroke at P2", || has_strokes(&p2, &["kept", "late"])).await;
    assert_eq!(stroke_ids(&p1).await, vec!["kept", "late"]);
}

#[tokio::test]
async fn test_strokes_and_erases_propagate() {
    let net = Arc::new(MemoryNetwork::new());
    let [p1, p2, p3] = three_peer_mesh(&net).await;

    p2.0.send_stroke(line("x1", (0.0, 0.0), (1.0, 1.0))).await.unwrap();
    for (handle, _) in [&p1, &p3] {
        eventually("stroke delivered", || has_strokes(handle, &["x1"])).await;
    }

    // Direct delivery plus one relayed copy: still one entry each.
    sleep(Duration::from_millis(50)).await;
    for (handle, _) in [&p1, &p2, &p3] {
        assert_eq!(stroke_ids(handle).await, vec!["x1"]);
    }
    // P1 and P3 each forward the original to the one neighbor besides P2.
    assert_eq!(p1.0.stats().await.unwrap().messages_relayed, 1);
    assert_eq!(p3.0.stats().await.unwrap().messages_relayed, 1);
    assert_eq!(p2.0.stats().await.unwrap().messages_relayed, 0);

    p3.0.send_erase(vec![StrokeId::from("x1")]).await.unwrap();
    for (handle, _) in [&p1, &p2, &p3] {
        eventually("erase delivered", || has_strokes(handle, &[])).await;
    }
}

#[tokio::test]
async fn test_listener_sees_each_remote_stroke_once() {
    let net = Arc::new(MemoryNetwork::new());
    let [p1, mut p2, _p3] = three_peer_mesh(&net).await;

    let stroke = line("once", (0.0, 0.0), (1.0, 1.0));
    p1.0.send_stroke(stroke.clone()).await.unwrap();

    let received: Vec<MeshEvent> = drain_for(&mut p2.1, Duration::from_millis(200))
        .await
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::StrokeReceived(_)))
        .collect();
    assert_eq!(received, vec![MeshEvent::StrokeReceived(stroke)]);
}

#[tokio::test]
async fn test_clear_all_propagates() {
    let net = Arc::new(MemoryNetwork::new());
    let [p1, mut p2, p3] = three_peer_mesh(&net).await;

    p1.0.send_stroke(line("a", (0.0, 0.0), (1.0, 1.0))).await.unwrap();
    p3.0.send_stroke(line("b", (0.0, 0.0), (2.0, 2.0))).await.unwrap();
    eventually("strokes at P2", || stroke_count_is(&p2.0, 2)).await;

    p3.0.send_clear_all().await.unwrap();
    for (handle, _) in [&p1, &p2, &p3] {
        eventually("cleared", || has_strokes(handle, &[])).await;
    }
    next_matching(&mut p2.1, |e| matches!(e, MeshEvent::ClearAll)).await;

    // Clearing does not block later strokes.
    p1.0.send_stroke(line("c", (0.0, 0.0), (3.0, 3.0))).await.unwrap();
    eventually("post-clear stroke", || has_strokes(&p2.0, &["c"])).await;
}

#[tokio::test]
async fn test_cursor_is_not_relayed() {
    let net = Arc::new(MemoryNetwork::new());
    let [p1, mut p2, mut p3] = three_peer_mesh(&net).await;
    sleep(Duration::from_millis(50)).await;

    let before2 = p2.0.stats().await.unwrap();
    let before3 = p3.0.stats().await.unwrap();
    let sent_before = p1.0.stats().await.unwrap().messages_sent;

    p1.0.send_cursor(12.5, -4.0).await.unwrap();

    let p1_addr = p1.0.local_address().clone();
    for events in [&mut p2.1, &mut p3.1] {
        match next_matching(events, |e| matches!(e, MeshEvent::CursorUpdate { .. })).await {
            MeshEvent::CursorUpdate {
                address,
                x,
                y,
                identity,
            } => {
                assert_eq!(address, p1_addr);
                assert_eq!((x, y), (12.5, -4.0));
                assert_eq!(identity.username, "P1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    sleep(Duration::from_millis(50)).await;

    let after2 = p2.0.stats().await.unwrap();
    let after3 = p3.0.stats().await.unwrap();
    assert_eq!(after2.messages_relayed, before2.messages_relayed);
    assert_eq!(after3.messages_relayed, before3.messages_relayed);
    assert_eq!(after2.messages_sent, before2.messages_sent);
    assert_eq!(after3.messages_sent, before3.messages_sent);
    assert_eq!(after2.messages_received, before2.messages_received + 1);
    assert_eq!(after3.messages_received, before3.messages_received + 1);
    assert_eq!(p1.0.stats().await.unwrap().messages_sent, sent_before + 2);
}

#[tokio::test]
async fn test_remote_cursors_tracked_until_idle() {
    let net = Arc::new(MemoryNetwork::new());
    let (p1, _e1) = host(&net, "P1").await;
    let (listener, _e2) = EventForwarder::new();
    let p2 = MeshHandle::join_room(
        net.clone(),
        NodeConfig {
            cursor_idle_timeout: Duration::from_millis(300),
            ..config()
        },
        Identity::named("P2"),
        p1.room_id().clone(),
        listener,
    )
    .await
    .unwrap();
    eventually("attached", || peer_count_is(&p1, 1)).await;

    p1.send_cursor(3.0, 4.0).await.unwrap();
    eventually("cursor stored", || cursor_count_is(&p2, 1)).await;
    let cursors = p2.cursors().await.unwrap();
    assert_eq!(&cursors[0].0, p1.local_address());
    assert_eq!(cursors[0].1.position, Point::new(3.0, 4.0));
    assert_eq!(cursors[0].1.identity.username, "P1");

    // No further movement: the pointer is swept away.
    eventually("idle cursor dropped", || cursor_count_is(&p2, 0)).await;
}

#[tokio::test]
async fn test_concurrent_joins_form_full_mesh() {
    let net = Arc::new(MemoryNetwork::new());
    let mut p1 = host(&net, "P1").await;
    let room = p1.0.room_id().clone();

    // Both guests sync at once, so each is announced to the other and
    // both may dial; the duplicate link must collapse to one.
    let (mut p2, mut p3) = tokio::join!(guest(&net, "P2", &room), guest(&net, "P3", &room));

    for (handle, _) in [&p1, &p2, &p3] {
        eventually("full mesh", || peer_count_is(handle, 2)).await;
    }
    sleep(Duration::from_millis(100)).await;
    for (handle, events) in [&mut p1, &mut p2, &mut p3] {
        let handle: &MeshHandle = handle;
        assert!(peer_count_is(handle, 2).await);
        let drops: Vec<MeshEvent> = drain_for(events, Duration::from_millis(50))
            .await
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::PeerDisconnected { .. }))
            .collect();
        assert!(drops.is_empty(), "spurious disconnects {drops:?}");
    }

    p2.0.send_stroke(line("dup", (0.0, 0.0), (1.0, 1.0))).await.unwrap();
    let received = next_matching(&mut p3.1, |e| matches!(e, MeshEvent::StrokeReceived(_))).await;
    assert_eq!(received, MeshEvent::StrokeReceived(line("dup", (0.0, 0.0), (1.0, 1.0))));
    eventually("stroke at P1", || has_strokes(&p1.0, &["dup"])).await;
}

#[tokio::test]
async fn test_disconnect_reported_exactly_once() {
    let net = Arc::new(MemoryNetwork::new());
    let [mut p1, mut p2, p3] = three_peer_mesh(&net).await;
    let p3_addr = p3.0.local_address().clone();
    p3.0.send_cursor(1.0, 1.0).await.unwrap();
    eventually("P3 cursor at P1", || cursor_count_is(&p1.0, 1)).await;

    p3.0.destroy().await;
    assert!(!net.is_registered(&p3_addr));
    eventually("P3 cursor forgotten", || cursor_count_is(&p1.0, 0)).await;

    for (handle, events) in [&mut p1, &mut p2] {
        let handle: &MeshHandle = handle;
        eventually("P3 removed", || peer_count_is(handle, 1)).await;
        let disconnects: Vec<MeshEvent> = drain_for(events, Duration::from_millis(150))
            .await
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::PeerDisconnected { .. }))
            .collect();
        assert_eq!(
            disconnects,
            vec![MeshEvent::PeerDisconnected {
                address: p3_addr.clone(),
                username: "P3".to_string()
            }]
        );
    }

    // The remaining pair keeps working.
    p2.0.send_stroke(line("after", (0.0, 0.0), (1.0, 1.0))).await.unwrap();
    eventually("stroke after drop", || has_strokes(&p1.0, &["after"])).await;
}

#[tokio::test]
async fn test_host_reregisters_after_rendezvous_loss() {
    let net = Arc::new(MemoryNetwork::new());
    let (p1, _e1) = host(&net, "P1").await;
    let address = p1.local_address().clone();

    assert!(net.drop_registration(&address));
    eventually("re-registration", || {
        let registered = net.is_registered(&address);
        async move { registered }
    })
    .await;

    let (p2, _e2) = guest(&net, "P2", p1.room_id()).await;
    eventually("guest attached", || peer_count_is(&p2, 1)).await;
}

#[tokio::test]
async fn test_rendezvous_reconnect_retries_in_background() {
    let net = Arc::new(MemoryNetwork::new());
    let (listener, mut events) = EventForwarder::new();
    let config = NodeConfig {
        reconnect_backoff: Duration::from_millis(200),
        ..config()
    };
    let p1 = MeshHandle::create_room(net.clone(), config, Identity::named("P1"), listener)
        .await
        .unwrap();
    let address = p1.local_address().clone();

    // Someone else holds the address for a moment, so the first attempt fails.
    net.blackhole(&address);
    assert!(net.drop_registration(&address));

    // The node keeps serving while the retry waits out its backoff.
    let stats = timeout(Duration::from_millis(100), p1.stats()).await;
    assert!(stats.is_ok(), "node stalled during reconnect");
    sleep(Duration::from_millis(50)).await;
    assert!(net.release_blackhole(&address));

    eventually("re-registration", || {
        let registered = net.is_registered(&address);
        async move { registered }
    })
    .await;
    let errors: Vec<MeshEvent> = drain_for(&mut events, Duration::from_millis(50))
        .await
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::Error(_)))
        .collect();
    assert!(errors.is_empty(), "unexpected {errors:?}");

    let (p2, _e2) = guest(&net, "P2", p1.room_id()).await;
    eventually("guest attached", || peer_count_is(&p2, 1)).await;
}

#[tokio::test]
async fn test_rendezvous_reconnect_gives_up_after_attempts() {
    let net = Arc::new(MemoryNetwork::new());
    let (listener, mut events) = EventForwarder::new();
    let config = NodeConfig {
        reconnect_attempts: 2,
        reconnect_backoff: Duration::from_millis(20),
        ..config()
    };
    let p1 = MeshHandle::create_room(net.clone(), config, Identity::named("P1"), listener)
        .await
        .unwrap();
    let address = p1.local_address().clone();

    net.blackhole(&address);
    assert!(net.drop_registration(&address));

    match next_matching(&mut events, |e| matches!(e, MeshEvent::Error(_))).await {
        MeshEvent::Error(message) => assert!(message.starts_with("Rendezvous reconnect failed")),
        other => panic!("unexpected {other:?}"),
    }
    // Losing the registration is not fatal.
    assert!(p1.is_running());
    assert!(p1.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_join_timeout_and_missing_room() {
    let net = Arc::new(MemoryNetwork::new());
    net.blackhole(&"ink-QUIET".into());
    let config = NodeConfig {
        join_timeout: Duration::from_millis(100),
        ..config()
    };

    let (listener, mut events) = EventForwarder::new();
    let err = MeshHandle::join_room(
        net.clone(),
        config.clone(),
        Identity::named("G"),
        RoomId::new("QUIET"),
        listener,
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err, MeshError::ConnectionTimeout);
    assert_eq!(
        events.recv().await,
        Some(MeshEvent::Error("Connection timeout".to_string()))
    );

    let (listener, _events) = EventForwarder::new();
    let err = MeshHandle::join_room(
        net.clone(),
        config,
        Identity::named("G"),
        RoomId::new("EMPTY"),
        listener,
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err, MeshError::RoomNotFound(RoomId::new("EMPTY")));
    assert_eq!(net.registered_count(), 0);
}

#[tokio::test]
async fn test_global_room() {
    let net = Arc::new(MemoryNetwork::new());
    let (l1, _e1) = EventForwarder::new();
    let (l2, _e2) = EventForwarder::new();
    let a = MeshHandle::connect_global(net.clone(), config(), Identity::named("A"), l1)
        .await
        .unwrap();
    let b = MeshHandle::connect_global(net.clone(), config(), Identity::named("B"), l2)
        .await
        .unwrap();

    assert_eq!(a.role(), Role::Host);
    assert_eq!(b.role(), Role::Guest);
    assert_eq!(b.room_id(), &RoomId::global());

    b.send_stroke(line("g", (0.0, 0.0), (1.0, 1.0))).await.unwrap();
    eventually("global stroke", || has_strokes(&a, &["g"])).await;
}

#[tokio::test]
async fn test_handle_after_destroy() {
    let net = Arc::new(MemoryNetwork::new());
    let (p1, _e1) = host(&net, "P1").await;
    let (p2, _e2) = guest(&net, "P2", p1.room_id()).await;
    eventually("attached", || peer_count_is(&p1, 1)).await;

    p1.destroy().await;
    eventually("host gone", || peer_count_is(&p2, 0)).await;
    assert!(p2.is_running());
    p2.destroy().await;
    assert_eq!(net.registered_count(), 0);
}
