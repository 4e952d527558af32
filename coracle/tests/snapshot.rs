mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coracle::message::InstallSnapshotRequest;
use coracle::Config;
use fixtures::RaftRouter;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

/// Cluster snapshot test.
///
/// - brings a single-node cluster online with a tiny snapshot threshold.
/// - writes enough command bytes to trip a snapshot; asserts the log prefix
///   was folded away.
/// - adds a fresh node, which must be brought up to speed through an
///   InstallSnapshot transfer followed by ordinary replication.
///
/// RUST_LOG=coracle,memstore,snapshot=trace cargo test -p coracle --test snapshot
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_then_catch_up_new_node() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .snapshot_threshold_bytes(300)
            .snapshot_chunk_size(64)
            .validate()
            .expect("failed to build config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(1).await?;
    router.submit_many(leader, "payload", 40).await;

    let metrics = router
        .wait_for_metrics(
            &leader,
            |m| m.snapshot_last_index > 0,
            Some(Duration::from_secs(10)),
            "snapshot captured",
        )
        .await?;
    let snapshot_index = metrics.snapshot_last_index;

    let leader_store = router.get_storage_handle(&leader).await?;
    let log = leader_store.get_log().await;
    assert!(
        !log.contains_key(&1),
        "the snapshotted prefix should have been discarded"
    );
    assert!(leader_store.read_snapshot().await.is_some());

    tracing::info!("--- adding node 1, which must catch up via snapshot");
    router.new_raft_node(1, btreeset! {}).await;
    let added = router.add_server(leader, 1).await.expect("add_server failed");
    assert!(added);

    let want = router.get_node(&leader).await?.status().last_log_index;
    router.wait_for_log(&btreeset! {1}, want, Some(Duration::from_secs(10)), "new node caught up").await?;

    let follower_store = router.get_storage_handle(&1).await?;
    let snap = follower_store.read_snapshot().await.expect("follower should have installed a snapshot");
    assert!(snap.meta.last_included.index >= snapshot_index);

    // State machines agree after restore + tail replication.
    let leader_sm = leader_store.get_state_machine().await;
    let follower_sm = follower_store.get_state_machine().await;
    assert_eq!(leader_sm.value, follower_sm.value);
    assert_eq!(leader_sm.last_applied, follower_sm.last_applied);

    Ok(())
}

/// A snapshot at or below the follower's commit index is acknowledged
/// without altering any state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_snapshot_is_ignored() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(3).await?;
    router.submit(leader, b"real state").await.expect("write failed");

    let follower = (0..3).find(|id| *id != leader).expect("a follower must exist");
    router
        .wait_for_metrics(&follower, |m| m.last_applied >= 2, Some(Duration::from_secs(5)), "follower applied")
        .await?;

    let node = router.get_node(&follower).await?;
    let status = node.status();
    let store = router.get_storage_handle(&follower).await?;
    let sm_before = store.get_state_machine().await;

    // A snapshot covering only entry 1 is behind the follower's commit point.
    let rpc = InstallSnapshotRequest {
        term: status.current_term,
        leader_id: leader,
        meta: coracle::message::SnapshotMeta {
            last_included: coracle::LogId::new(status.current_term, 1),
            configuration: status.configuration.clone(),
            snapshot_id: "stale-1".to_string(),
        },
        offset: 0,
        data: b"garbage that must never be restored".to_vec(),
        done: true,
    };
    let resp = node.install_snapshot(rpc).await.expect("rpc failed");
    assert_eq!(resp.term, status.current_term);

    let sm_after = store.get_state_machine().await;
    assert_eq!(sm_before, sm_after, "a stale snapshot must not touch the state machine");

    Ok(())
}
