mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coracle::error::ClientError;
use coracle::Config;
use fixtures::RaftRouter;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

/// Cluster linearizable_read test.
///
/// - brings 3 nodes online and elects a leader.
/// - writes a value and reads it back: the read must observe every write
///   committed before it was issued.
/// - asserts a follower refuses reads with a leader hint.
///
/// RUST_LOG=coracle,memstore,linearizable_read=trace cargo test -p coracle --test linearizable_read
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linearizable_read() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(3).await?;

    router.submit(leader, b"v:=10").await.expect("first write failed");
    let read = router.read(leader, b"v").await.expect("read failed");
    assert_eq!(read, b"v:=10".to_vec(), "read must observe the committed write");

    router.submit(leader, b"v:=11").await.expect("second write failed");
    let read = router.read(leader, b"v").await.expect("read failed");
    assert_eq!(read, b"v:=11".to_vec(), "read must never return the stale value");

    let follower = (0..3).find(|id| *id != leader).expect("a follower must exist");
    match router.read(follower, b"v").await {
        Err(ClientError::NotLeader { leader_hint }) => {
            assert_eq!(leader_hint, Some(leader));
        }
        other => panic!("expected NotLeader from follower read, got {:?}", other),
    }

    Ok(())
}

/// A partitioned leader cannot confirm its leadership and fails the read
/// instead of serving stale state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_leader_fails_reads() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let leader = router.new_cluster(3).await?;
    router.submit(leader, b"v:=10").await.expect("write failed");

    router.isolate_node(leader).await;
    let node = router.get_node(&leader).await?;
    let res = node.read_state(b"v".to_vec(), Duration::from_secs(2)).await;
    match res {
        Err(ClientError::ReadTimeout) | Err(ClientError::LeadershipLost { .. }) => {}
        other => panic!("expected the read to fail on a partitioned leader, got {:?}", other),
    }

    Ok(())
}
