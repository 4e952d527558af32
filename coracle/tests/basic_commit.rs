mod fixtures;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coracle::error::ClientError;
use coracle::message::AppendEntriesRequest;
use coracle::Config;
use fixtures::RaftRouter;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

/// Cluster basic_commit test.
///
/// - brings 3 nodes online and elects a leader.
/// - submits one command.
/// - asserts the reply carries the state machine's response and that every
///   node applied the command.
///
/// RUST_LOG=coracle,memstore,basic_commit=trace cargo test -p coracle --test basic_commit
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn basic_commit() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    let members: BTreeSet<u64> = btreeset! {0, 1, 2};

    let leader = router.new_cluster(3).await?;

    let reply = router.submit(leader, b"set x 1").await.expect("submit failed");
    assert_eq!(reply, b"set x 1".to_vec(), "reply should echo the applied command");

    // Entry 1 is the seed configuration, entry 2 the command.
    router.wait_for_log(&members, 2, Some(Duration::from_secs(5)), "command applied everywhere").await?;

    for id in members.iter() {
        let sm = router.get_storage_handle(id).await?.get_state_machine().await;
        assert_eq!(sm.value, b"set x 1".to_vec(), "node {} state machine diverges", id);
    }
    router.assert_logs_converged(&members).await;
    router.assert_stable_cluster(None, Some(2)).await;

    Ok(())
}

/// A single-node cluster commits every submission on local append alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn single_node_commit() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(1).await?;
    assert_eq!(leader, 0);

    for serial in 0..3u8 {
        let command = vec![serial];
        let reply = router.submit(leader, &command).await.expect("submit failed");
        assert_eq!(reply, command);
    }

    let metrics = router.wait_for_metrics(&0, |m| m.last_applied == 4, Some(Duration::from_secs(5)), "all applied").await?;
    assert_eq!(metrics.commit_index, metrics.last_applied);
    assert_eq!(metrics.last_log_index, metrics.last_applied);

    Ok(())
}

/// Commands apply strictly in log order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn applies_in_log_order() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    let members: BTreeSet<u64> = btreeset! {0, 1};

    let leader = router.new_cluster(2).await?;
    router.submit_many(leader, "ordered", 50).await;

    // 1 configuration entry + 50 commands.
    router.wait_for_log(&members, 51, Some(Duration::from_secs(10)), "all commands applied").await?;

    for id in members.iter() {
        let sm = router.get_storage_handle(id).await?.get_state_machine().await;
        let indices: Vec<u64> = sm.applied.iter().map(|(index, _)| *index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted, "node {} applied out of order", id);
        assert_eq!(sm.applied.len(), 50, "node {} missed commands", id);
    }

    Ok(())
}

/// A follower redirects writes with a leader hint.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_rejects_writes() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(3).await?;
    let follower = (0..3).find(|id| *id != leader).expect("a follower must exist");

    match router.submit(follower, b"nope").await {
        Err(ClientError::NotLeader { leader_hint }) => {
            assert_eq!(leader_hint, Some(leader), "follower should hint at the current leader");
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }
    Ok(())
}

/// Re-sending an already-appended prefix is a no-op: the follower answers
/// success without touching its log or re-applying anything.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resending_appended_prefix_is_noop() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));
    let members: BTreeSet<u64> = btreeset! {0, 1, 2};

    let leader = router.new_cluster(3).await?;
    router.submit(leader, b"once").await.expect("submit failed");
    router.wait_for_log(&members, 2, Some(Duration::from_secs(5)), "command applied").await?;

    let follower = (0..3).find(|id| *id != leader).expect("a follower must exist");
    let store = router.get_storage_handle(&follower).await?;
    let log_before = store.get_log().await;

    let status = router.get_node(&leader).await?.status();
    let entries: Vec<_> = router.get_storage_handle(&leader).await?.get_log().await.values().cloned().collect();
    let replay = AppendEntriesRequest {
        term: status.current_term,
        leader_id: leader,
        prev_log_index: 0,
        prev_log_term: 0,
        entries,
        leader_commit: status.commit_index,
    };

    let resp = router.get_node(&follower).await?.append_entries(replay).await?;
    assert!(resp.success, "replaying an appended prefix must succeed");
    assert_eq!(store.get_log().await, log_before, "the replay must not modify the log");
    assert_eq!(
        store.get_state_machine().await.applied.len(),
        1,
        "the replay must not re-apply commands"
    );

    Ok(())
}

/// A submission which cannot reach a quorum rejects with CommitTimeout at
/// its deadline.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_timeout_without_quorum() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(3).await?;
    for id in 0..3 {
        if id != leader {
            router.isolate_node(id).await;
        }
    }

    let node = router.get_node(&leader).await?;
    let res = node.submit_command(b"stranded".to_vec(), Duration::from_millis(500)).await;
    assert_eq!(res.unwrap_err(), ClientError::CommitTimeout);

    Ok(())
}
