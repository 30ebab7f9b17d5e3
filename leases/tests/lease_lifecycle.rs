use leases::{
    test_utils::{CallCounter, TestCluster},
    Direction, LeaseId,
};
use std::time::Duration;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_drop_without_cancel_notifies_peer() {
    let cluster = TestCluster::new(2).unwrap();
    let (holder, peer) = (cluster.node(0), cluster.node(1));
    let holder_aborts = CallCounter::new();
    let peer_aborts = CallCounter::new();

    let guard = holder.require_lease(cluster.peer(1), || "query 1".into(), holder_aborts.callback());
    let registration = holder.registration_for(&guard);
    let remote = assert_ok!(peer.require_lease_to_remote(
        registration.holder,
        registration.lease_id,
        || "snippet for query 1".into(),
        peer_aborts.callback(),
    ));
    assert_eq!(peer.lease_count(Direction::LeasedToRemote), 1);

    let id = guard.id();
    drop(guard);
    cluster.settle().await;

    // The holder's own notifier stays silent; the peer's side is aborted
    assert_eq!(holder_aborts.count(), 0);
    assert_eq!(peer_aborts.count(), 1);
    assert_eq!(holder.lease_count(Direction::LeasedFromRemote), 0);
    assert_eq!(peer.lease_count(Direction::LeasedToRemote), 0);
    assert!(!remote.is_active());

    let delivered = cluster.hub.delivered_aborts();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].to, cluster.server(1));
    assert_eq!(delivered[0].request.server, cluster.peer(0));
    assert!(delivered[0].request.leased_from.is_empty());
    assert_eq!(delivered[0].request.leased_to, vec![id]);

    // Releasing the already aborted remote guard sends nothing further
    drop(remote);
    cluster.settle().await;
    assert_eq!(cluster.hub.delivered_aborts().len(), 1);
}

#[tokio::test]
async fn test_cancel_sends_nothing() {
    let cluster = TestCluster::new(2).unwrap();
    let counter = CallCounter::new();

    let mut guard = cluster
        .node(0)
        .require_lease(cluster.peer(1), || "query".into(), counter.callback());
    guard.cancel();
    drop(guard);
    cluster.settle().await;

    assert_eq!(counter.count(), 0);
    assert_eq!(cluster.node(0).lease_count(Direction::LeasedFromRemote), 0);
    assert!(cluster.hub.delivered_aborts().is_empty());
}

#[tokio::test]
async fn test_dropping_remote_side_aborts_holder() {
    let cluster = TestCluster::new(2).unwrap();
    let (holder, peer) = (cluster.node(0), cluster.node(1));
    let holder_aborts = CallCounter::new();

    let guard = holder.require_lease(cluster.peer(1), || "query".into(), holder_aborts.callback());
    let remote = peer
        .require_lease_to_remote(cluster.peer(0), guard.id(), || "snippet".into(), || {})
        .unwrap();

    drop(remote);
    cluster.settle().await;

    assert_eq!(holder_aborts.count(), 1);
    assert!(!guard.is_active());
    let delivered = cluster.hub.delivered_aborts();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].request.leased_from, vec![guard.id()]);

    // Nothing left to tell the peer when the holder's guard goes away
    drop(guard);
    cluster.settle().await;
    assert_eq!(cluster.hub.delivered_aborts().len(), 1);
    assert_eq!(holder_aborts.count(), 1);
}

#[tokio::test]
async fn test_releases_to_one_peer_are_batched() {
    let cluster = TestCluster::with_batch_window(3, Duration::from_millis(30)).unwrap();
    let node = cluster.node(0);

    let to_second: Vec<_> = (0..3)
        .map(|i| node.require_lease(cluster.peer(1), move || format!("query {i}"), || {}))
        .collect();
    let to_third = node.require_lease(cluster.peer(2), || "other".into(), || {});

    let mut expected: Vec<LeaseId> = to_second.iter().map(|guard| guard.id()).collect();
    drop(to_second);
    drop(to_third);
    assert_eq!(node.pending_abort_peers(), 2);
    cluster.settle().await;

    let delivered = cluster.hub.delivered_aborts();
    assert_eq!(delivered.len(), 2);
    let batch = delivered
        .iter()
        .find(|abort| abort.to == cluster.server(1))
        .unwrap();
    let mut ids = batch.request.leased_to.clone();
    ids.sort();
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(node.pending_abort_peers(), 0);
}

#[tokio::test]
async fn test_unreachable_peer_is_not_an_error() {
    let cluster = TestCluster::new(2).unwrap();
    cluster.partition(0, 1);

    let guard = cluster
        .node(0)
        .require_lease(cluster.peer(1), || "query".into(), || {});
    drop(guard);
    cluster.settle().await;

    assert_eq!(cluster.node(0).lease_count(Direction::LeasedFromRemote), 0);
    assert!(cluster.hub.delivered_aborts().is_empty());

    cluster.heal(0, 1);
    let guard = cluster
        .node(0)
        .require_lease(cluster.peer(1), || "query".into(), || {});
    drop(guard);
    cluster.settle().await;
    assert_eq!(cluster.hub.delivered_aborts().len(), 1);
}

#[tokio::test]
async fn test_guard_outliving_its_manager_is_harmless() {
    let mut cluster = TestCluster::new(2).unwrap();
    let counter = CallCounter::new();
    let mut guard = cluster
        .node(0)
        .require_lease(cluster.peer(1), || "query".into(), counter.callback());

    cluster.remove(0);
    assert!(!guard.is_active());
    guard.cancel();
    drop(guard);
    cluster.settle().await;

    assert_eq!(counter.count(), 0);
    assert!(cluster.hub.delivered_aborts().is_empty());
}

#[tokio::test]
async fn test_slow_network_delivers_before_settle_returns() {
    let cluster = TestCluster::new(2).unwrap();
    let (holder, peer) = (cluster.node(0), cluster.node(1));
    let latency = Duration::from_millis(40);
    cluster.hub.set_latency(latency);

    let peer_aborts = CallCounter::new();
    let guard = holder.require_lease(cluster.peer(1), || "slow query".into(), || {});
    let registration = holder.registration_for(&guard);
    let _remote = assert_ok!(peer.require_lease_to_remote(
        registration.holder,
        registration.lease_id,
        || "slow snippet".into(),
        peer_aborts.callback(),
    ));

    let started = tokio::time::Instant::now();
    let report = assert_ok!(holder.collect_report_for_server(&cluster.server(1)).await);
    assert!(started.elapsed() >= latency);
    assert_eq!(report[&cluster.server(1)].lease_count(), 1);

    let started = tokio::time::Instant::now();
    drop(guard);
    cluster.settle().await;

    assert!(started.elapsed() >= latency);
    assert_eq!(peer_aborts.count(), 1);
    assert_eq!(cluster.hub.delivered_aborts().len(), 1);
    assert_eq!(peer.lease_count(Direction::LeasedToRemote), 0);
}
