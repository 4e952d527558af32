//! The registry binding pending client operations to log indices.
//!
//! When the leader appends a client command it registers the client's
//! response channel here under the entry's index. The operation is resolved
//! exactly once: fulfilled after the entry is applied, or rejected when
//! leadership is lost, the deadline expires, or the node shuts down.
//!
//! The waiter is owned by the leader role and touched only from the node's
//! actor task, so resolution order follows apply order: for indices `i < j`,
//! the operation at `i` resolves before the one at `j`. Delivery to the
//! awaiting client happens through a oneshot channel, which also makes the
//! exactly-once and nothing-fires-after-cancel guarantees structural: once a
//! channel is consumed by fulfillment or rejection it no longer exists.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::error::StateMachineError;
use crate::LogIndex;
use crate::Term;

/// The channel over which a pending operation resolves.
pub type OpResponseTx = oneshot::Sender<Result<Vec<u8>, ClientError>>;

struct PendingOp {
    tx: OpResponseTx,
    deadline: Instant,
}

/// The index → pending-operation registry.
#[derive(Default)]
pub struct CommitWaiter {
    pending: BTreeMap<LogIndex, Vec<PendingOp>>,
}

impl CommitWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending operation on `index`. Multiple operations may
    /// share one index; all of them observe the same outcome.
    pub fn register(&mut self, index: LogIndex, tx: OpResponseTx, deadline: Instant) {
        self.pending.entry(index).or_default().push(PendingOp { tx, deadline });
    }

    /// Resolve every operation registered on `index` after the entry there
    /// has been applied.
    ///
    /// `result_fn` produces the apply outcome for the index and is invoked
    /// at most once, and only if someone is actually waiting. An apply error
    /// rejects the waiters with `ApplicationFailed`.
    pub fn notify_committed_and_applied<F>(&mut self, index: LogIndex, result_fn: F)
    where
        F: FnOnce(LogIndex) -> Result<Vec<u8>, StateMachineError>,
    {
        let ops = match self.pending.remove(&index) {
            Some(ops) => ops,
            None => return,
        };
        let result = result_fn(index).map_err(|err| ClientError::ApplicationFailed {
            cause: err.to_string(),
        });
        for op in ops {
            let _ = op.tx.send(result.clone());
        }
    }

    /// Reject every pending operation: this node is no longer the leader.
    pub fn cancel_all_leadership_lost(&mut self, old_term: Term, new_term: Term) {
        self.cancel_all(ClientError::LeadershipLost { old_term, new_term });
    }

    /// Reject every pending operation with the given reason.
    pub fn cancel_all(&mut self, reason: ClientError) {
        let pending = std::mem::take(&mut self.pending);
        for (_, ops) in pending {
            for op in ops {
                let _ = op.tx.send(Err(reason.clone()));
            }
        }
    }

    /// Reject operations whose deadline has passed, returning how many were
    /// cancelled. The node drives this periodically from its housekeeping
    /// tick.
    pub fn cancel_timed_out(&mut self, now: Instant) -> usize {
        let mut cancelled = 0;
        let mut empty_indices = Vec::new();
        for (index, ops) in self.pending.iter_mut() {
            let mut kept = Vec::with_capacity(ops.len());
            for op in ops.drain(..) {
                if op.deadline <= now {
                    let _ = op.tx.send(Err(ClientError::CommitTimeout));
                    cancelled += 1;
                } else {
                    kept.push(op);
                }
            }
            *ops = kept;
            if ops.is_empty() {
                empty_indices.push(*index);
            }
        }
        for index in empty_indices {
            self.pending.remove(&index);
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tokio::time::Duration;

    fn op() -> (OpResponseTx, oneshot::Receiver<Result<Vec<u8>, ClientError>>) {
        oneshot::channel()
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn fulfills_every_registration_on_an_index_once() {
        let mut waiter = CommitWaiter::new();
        let (tx1, rx1) = op();
        let (tx2, rx2) = op();
        waiter.register(5, tx1, far());
        waiter.register(5, tx2, far());
        assert_eq!(waiter.pending_count(), 2);

        let mut calls = 0;
        waiter.notify_committed_and_applied(5, |_| {
            calls += 1;
            Ok(b"reply".to_vec())
        });
        assert_eq!(calls, 1);
        assert_eq!(rx1.await.unwrap().unwrap(), b"reply".to_vec());
        assert_eq!(rx2.await.unwrap().unwrap(), b"reply".to_vec());
        assert!(!waiter.has_pending());

        // A second notification for the same index finds nothing to do.
        waiter.notify_committed_and_applied(5, |_| panic!("no waiters remain"));
    }

    #[tokio::test]
    async fn apply_failure_rejects_with_application_failed() {
        let mut waiter = CommitWaiter::new();
        let (tx, rx) = op();
        waiter.register(1, tx, far());
        waiter.notify_committed_and_applied(1, |_| Err(StateMachineError(anyhow!("constraint violated"))));

        match rx.await.unwrap().unwrap_err() {
            ClientError::ApplicationFailed { cause } => assert!(cause.contains("constraint violated")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn leadership_loss_rejects_everything() {
        let mut waiter = CommitWaiter::new();
        let (tx1, rx1) = op();
        let (tx2, rx2) = op();
        waiter.register(1, tx1, far());
        waiter.register(2, tx2, far());

        waiter.cancel_all_leadership_lost(1, 2);
        assert_eq!(waiter.pending_count(), 0);
        assert_eq!(
            rx1.await.unwrap().unwrap_err(),
            ClientError::LeadershipLost { old_term: 1, new_term: 2 }
        );
        assert_eq!(
            rx2.await.unwrap().unwrap_err(),
            ClientError::LeadershipLost { old_term: 1, new_term: 2 }
        );
    }

    #[tokio::test]
    async fn no_resolution_after_cancel_returns() {
        let mut waiter = CommitWaiter::new();
        let (tx, mut rx) = op();
        waiter.register(3, tx, far());
        waiter.cancel_all(ClientError::ShuttingDown);

        // The rejection is the one and only resolution; a later notify is a no-op.
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), ClientError::ShuttingDown);
        waiter.notify_committed_and_applied(3, |_| panic!("cancelled op must not be applied"));
    }

    #[tokio::test]
    async fn timed_out_operations_are_scanned_out() {
        let mut waiter = CommitWaiter::new();
        let now = Instant::now();
        let (tx1, rx1) = op();
        let (tx2, rx2) = op();
        waiter.register(1, tx1, now - Duration::from_millis(1));
        waiter.register(2, tx2, now + Duration::from_secs(60));

        let cancelled = waiter.cancel_timed_out(now);
        assert_eq!(cancelled, 1);
        assert_eq!(waiter.pending_count(), 1);
        assert_eq!(rx1.await.unwrap().unwrap_err(), ClientError::CommitTimeout);

        // The survivor is still resolvable.
        waiter.notify_committed_and_applied(2, |_| Ok(vec![]));
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn resolution_follows_index_order() {
        let mut waiter = CommitWaiter::new();
        let (tx1, mut rx1) = op();
        let (tx2, mut rx2) = op();
        waiter.register(2, tx2, far());
        waiter.register(1, tx1, far());

        waiter.notify_committed_and_applied(1, |_| Ok(vec![1]));
        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().is_err());

        waiter.notify_committed_and_applied(2, |_| Ok(vec![2]));
        assert!(rx2.try_recv().unwrap().is_ok());
    }
}
