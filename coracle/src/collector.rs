//! Aggregation of peer-response futures for group operations.
//!
//! Heartbeat rounds, vote collection and read confirmation all fan one
//! request out to every peer and then care about a *set* of responses, not
//! any single one. A [`ResponseSet`] owns the in-flight futures and offers
//! the three group completions: majority, all-with-timeout, and cancel.

use std::fmt;
use std::future::Future;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::future::BoxFuture;
use futures::future::FutureExt;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::Duration;

use crate::network::TransportError;

/// The failure modes of a group collection.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CollectError {
    /// The future had not settled when the collection deadline expired.
    #[error("response not received before the collection deadline")]
    TimedOut,
    /// The collection was cancelled before the future settled.
    #[error("collection cancelled")]
    Cancelled,
    /// The underlying send failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The majority threshold was not reached before the deadline (or before
/// every future settled). Carries whatever successful responses did arrive,
/// so the caller can still act on them — a vote round uses this to detect a
/// higher term even when the election fails.
pub struct MajorityNotReached<R> {
    pub responses: Vec<R>,
}

impl<R> fmt::Debug for MajorityNotReached<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MajorityNotReached({} responses)", self.responses.len())
    }
}

impl<R> fmt::Display for MajorityNotReached<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "majority not reached ({} responses collected)", self.responses.len())
    }
}

/// A set of in-flight response futures for one logical group operation.
///
/// The constituent futures are polled only inside [`majority`] and
/// [`settle_all`]; after [`cancel`] returns (or either completion method
/// resolves) no constituent future is ever polled again, so no completion
/// side effect can fire late. This is the callback-safety-after-cancellation
/// property the consensus core relies on when it steps down mid-operation.
///
/// [`majority`]: Self::majority
/// [`settle_all`]: Self::settle_all
/// [`cancel`]: Self::cancel
pub struct ResponseSet<R> {
    pending: FuturesUnordered<Abortable<BoxFuture<'static, Result<R, TransportError>>>>,
    aborts: Vec<AbortHandle>,
}

impl<R: Send + 'static> ResponseSet<R> {
    /// Wrap the given response futures for collection.
    pub fn new<I, F>(futures: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<R, TransportError>> + Send + 'static,
    {
        let pending = FuturesUnordered::new();
        let mut aborts = Vec::new();
        for fut in futures {
            let (handle, reg) = AbortHandle::new_pair();
            pending.push(Abortable::new(fut.boxed(), reg));
            aborts.push(handle);
        }
        Self { pending, aborts }
    }

    /// The number of futures still pending.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resolve as soon as `needed` futures have produced successful
    /// responses, returning them in completion order. Fails once the
    /// deadline expires or too few futures remain to ever reach the
    /// threshold. Pending futures are cancelled on the way out.
    pub async fn majority(mut self, needed: usize, timeout: Duration) -> Result<Vec<R>, MajorityNotReached<R>> {
        let mut responses = Vec::new();
        if needed == 0 {
            self.cancel();
            return Ok(responses);
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                settled = self.pending.next() => match settled {
                    Some(Ok(Ok(res))) => {
                        responses.push(res);
                        if responses.len() >= needed {
                            self.cancel();
                            return Ok(responses);
                        }
                    }
                    Some(Ok(Err(err))) => {
                        tracing::debug!(error=%err, "group operation response failed");
                        if responses.len() + self.pending.len() < needed {
                            break;
                        }
                    }
                    Some(Err(_aborted)) => {}
                    None => break,
                },
            }
        }

        self.cancel();
        Err(MajorityNotReached { responses })
    }

    /// Wait until every future settles or the deadline expires. Each
    /// element is a response or an error; futures still pending at the
    /// deadline yield [`CollectError::TimedOut`].
    pub async fn settle_all(mut self, timeout: Duration) -> Vec<Result<R, CollectError>> {
        let mut settled = Vec::new();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let unsettled = self.pending.len();
                    self.cancel();
                    settled.extend((0..unsettled).map(|_| Err(CollectError::TimedOut)));
                    return settled;
                }
                next = self.pending.next() => match next {
                    Some(Ok(Ok(res))) => settled.push(Ok(res)),
                    Some(Ok(Err(err))) => settled.push(Err(CollectError::Transport(err))),
                    Some(Err(_aborted)) => settled.push(Err(CollectError::Cancelled)),
                    None => return settled,
                },
            }
        }
    }

    /// Cancel every future in the set and empty it. Safe to call on an
    /// empty or partially completed set.
    pub fn cancel(&mut self) {
        for handle in self.aborts.drain(..) {
            handle.abort();
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn ready_ok(v: u64) -> impl Future<Output = Result<u64, TransportError>> {
        async move { Ok(v) }
    }

    fn ready_err() -> impl Future<Output = Result<u64, TransportError>> {
        async { Err(TransportError::Unreachable) }
    }

    fn never() -> impl Future<Output = Result<u64, TransportError>> {
        async {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn majority_resolves_at_threshold() {
        let set = ResponseSet::new(vec![
            ready_ok(1).boxed(),
            ready_ok(2).boxed(),
            never().boxed(),
        ]);
        let got = set.majority(2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn majority_fails_on_timeout_with_partial_responses() {
        let set = ResponseSet::new(vec![ready_ok(1).boxed(), never().boxed(), never().boxed()]);
        let err = set.majority(2, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.responses, vec![1]);
    }

    #[tokio::test]
    async fn majority_fails_early_once_unreachable() {
        // Two failures leave only one potential success out of the needed two.
        let set = ResponseSet::new(vec![ready_err().boxed(), ready_err().boxed(), ready_ok(3).boxed()]);
        let err = set.majority(2, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.responses.len() <= 1);
    }

    #[tokio::test]
    async fn majority_of_zero_is_trivially_satisfied() {
        let set: ResponseSet<u64> = ResponseSet::new(Vec::<BoxFuture<'static, _>>::new());
        assert!(set.majority(0, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settle_all_tags_each_outcome() {
        let set = ResponseSet::new(vec![ready_ok(7).boxed(), ready_err().boxed(), never().boxed()]);
        let settled = set.settle_all(Duration::from_millis(20)).await;
        assert_eq!(settled.len(), 3);
        assert_eq!(settled.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(settled.iter().any(|r| matches!(r, Err(CollectError::Transport(_)))));
        assert!(settled.iter().any(|r| matches!(r, Err(CollectError::TimedOut))));
    }

    #[tokio::test]
    async fn cancel_prevents_any_later_completion() {
        let fired = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..4)
            .map(|_| {
                let fired = fired.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(0u64)
                }
                .boxed()
            })
            .collect();

        let mut set = ResponseSet::new(futures);
        set.cancel();
        assert!(set.is_empty());
        // Double cancel must be harmless.
        set.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn early_majority_cancels_stragglers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let slow = {
            let fired = fired.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(9u64)
            }
        };
        let set = ResponseSet::new(vec![ready_ok(1).boxed(), slow.boxed()]);
        let got = set.majority(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, vec![1]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
