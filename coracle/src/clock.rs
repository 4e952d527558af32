//! The time source driving elections, heartbeats, retries and deadlines.

use async_trait::async_trait;
use tokio::time::Duration;
use tokio::time::Instant;

/// A monotonic time source with scheduled wake-ups.
///
/// The consensus core never reads the wall clock; all timing flows through
/// this trait so that tests may substitute a controlled source (or simply
/// pause the tokio clock). Dropping the future returned by `sleep_until`
/// cancels the wake-up.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current instant on the monotonic clock.
    fn now(&self) -> Instant;

    /// Resolve once `deadline` has been reached.
    async fn sleep_until(&self, deadline: Instant);

    /// Resolve after `duration` has elapsed.
    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

/// The default clock, backed by the tokio runtime's timer wheel.
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}
