//! Classified RPC retries with exponential backoff, jitter and adaptive timeouts.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::sync::RwLock;

use rand::thread_rng;
use rand::Rng;
use tokio::time::Duration;

use crate::clock::Clock;
use crate::config::AdaptiveTimeoutConfig;
use crate::config::Config;
use crate::config::RetryPolicy;
use crate::error::ConfigError;
use crate::network::TransportError;

/// Well-known operation names, matching the per-class policies in [`Config`].
pub const OP_HEARTBEAT: &str = "heartbeat";
pub const OP_APPEND_ENTRIES: &str = "append_entries";
pub const OP_REQUEST_VOTE: &str = "request_vote";
pub const OP_INSTALL_SNAPSHOT: &str = "install_snapshot";

/// Executes fallible transport operations under named retry policies.
///
/// Failures are classified by kind: transient network errors are retried
/// with exponential backoff and jitter up to the policy's attempt cap, while
/// protocol-level failures return immediately. Protocol *responses* — a
/// denied vote, a higher term — never pass through here at all; they are
/// ordinary return values at the call sites.
///
/// Policy updates are rare and thread-safe; every execution reads the
/// current policy for its operation name.
pub struct RetryEngine {
    policies: RwLock<HashMap<String, RetryPolicy>>,
    adaptive: AdaptiveTimeout,
}

impl RetryEngine {
    /// Build an engine carrying the four per-RPC-class policies from `config`.
    pub fn new(config: &Config) -> Self {
        let mut policies = HashMap::new();
        policies.insert(OP_HEARTBEAT.to_string(), config.retry_heartbeat.clone());
        policies.insert(OP_APPEND_ENTRIES.to_string(), config.retry_append_entries.clone());
        policies.insert(OP_REQUEST_VOTE.to_string(), config.retry_request_vote.clone());
        policies.insert(OP_INSTALL_SNAPSHOT.to_string(), config.retry_install_snapshot.clone());
        Self {
            policies: RwLock::new(policies),
            adaptive: AdaptiveTimeout::new(config.adaptive_timeout.clone()),
        }
    }

    /// Get the policy registered under `operation`, if any.
    pub fn policy(&self, operation: &str) -> Option<RetryPolicy> {
        self.policies.read().expect("retry policy lock poisoned").get(operation).cloned()
    }

    /// Register or replace the policy for `operation`. The policy is
    /// validated first; other operations' policies are untouched.
    pub fn set_policy(&self, operation: &str, policy: RetryPolicy) -> Result<(), ConfigError> {
        policy.validate("retry_policy")?;
        self.policies.write().expect("retry policy lock poisoned").insert(operation.to_string(), policy);
        Ok(())
    }

    /// The timeout callers should apply to the next RPC, given the
    /// statically configured `default`.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.adaptive.effective_timeout(default)
    }

    /// Record a successful response latency into the adaptive window.
    pub fn record_sample(&self, latency: Duration) {
        self.adaptive.record(latency);
    }

    /// Run `operation` through its retry policy.
    ///
    /// `op` is invoked to produce each attempt's future. Successful response
    /// latencies are recorded into the adaptive window. A non-retryable
    /// failure, or exhaustion of `max_attempts`, yields the final error.
    #[tracing::instrument(level = "trace", skip(self, clock, op))]
    pub async fn execute<C, R, F, Fut>(&self, operation: &str, clock: &C, mut op: F) -> Result<R, TransportError>
    where
        C: Clock + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let policy = self.policy(operation).unwrap_or_else(RetryPolicy::append_entries);
        let mut attempt: u32 = 1;
        loop {
            let started = clock.now();
            match op().await {
                Ok(res) => {
                    self.record_sample(clock.now().saturating_duration_since(started));
                    return Ok(res);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = jittered(backoff_delay(&policy, attempt), policy.jitter_factor);
                    tracing::debug!(operation, attempt, ?delay, error=%err, "transient failure, backing off");
                    clock.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::debug!(operation, attempt, error=%err, "giving up");
                    return Err(err);
                }
            }
        }
    }
}

/// The backoff delay before retry number `attempt + 1`, without jitter.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = policy.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let delay = policy.initial_delay.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(policy.max_delay.as_secs_f64()))
}

/// Spread `delay` uniformly across `[delay × (1−jitter), delay × (1+jitter)]`.
fn jittered(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor == 0.0 {
        return delay;
    }
    let base = delay.as_secs_f64();
    let lo = base * (1.0 - jitter_factor);
    let hi = base * (1.0 + jitter_factor);
    Duration::from_secs_f64(thread_rng().gen_range(lo..=hi))
}

/// A sliding window of response latencies driving the effective RPC timeout.
struct AdaptiveTimeout {
    config: AdaptiveTimeoutConfig,
    samples: Mutex<VecDeque<Duration>>,
}

impl AdaptiveTimeout {
    fn new(config: AdaptiveTimeoutConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, latency: Duration) {
        if !self.config.enabled {
            return;
        }
        let mut samples = self.samples.lock().expect("adaptive sample lock poisoned");
        samples.push_back(latency);
        while samples.len() > self.config.sample_window_size {
            samples.pop_front();
        }
    }

    fn effective_timeout(&self, default: Duration) -> Duration {
        if !self.config.enabled {
            return default;
        }
        let min = Duration::from_millis(self.config.min_timeout);
        let samples = self.samples.lock().expect("adaptive sample lock poisoned");
        if samples.len() < self.config.sample_window_size {
            return min;
        }
        let total: Duration = samples.iter().sum();
        let avg = total / samples.len() as u32;
        let scaled = Duration::from_secs_f64(avg.as_secs_f64() * self.config.adaptation_factor);
        scaled.clamp(min, Duration::from_millis(self.config.max_timeout))
    }
}
