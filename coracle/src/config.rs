//! Runtime configuration of a consensus node.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Duration;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;

/// The parameters of one exponential-backoff retry schedule.
///
/// Attempt `n` (1-based) waits `min(initial_delay × multiplier^(n−1),
/// max_delay)` before retrying, spread by uniform jitter in
/// `[delay × (1−jitter), delay × (1+jitter)]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Validate the policy, naming `field` in any error produced.
    pub fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::new(field, "initial_delay must be positive"));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::new(field, "max_delay must be >= initial_delay"));
        }
        if self.backoff_multiplier <= 1.0 {
            return Err(ConfigError::new(field, "backoff_multiplier must be > 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::new(field, "jitter_factor must be within [0, 1]"));
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::new(field, "max_attempts must be >= 1"));
        }
        Ok(())
    }

    /// Default policy for heartbeats: give up fast, the next tick is coming anyway.
    pub fn heartbeat() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 2,
        }
    }

    /// Default policy for log replication.
    pub fn append_entries() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 4,
        }
    }

    /// Default policy for vote requests.
    pub fn request_vote() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 3,
        }
    }

    /// Default policy for snapshot transfers: the most patient of the four.
    pub fn install_snapshot() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            max_attempts: 8,
        }
    }
}

/// Adaptive RPC timeout knobs.
///
/// When enabled, the effective RPC timeout is
/// `clamp(avg_latency × adaptation_factor, min_timeout, max_timeout)`, where
/// the average is over a sliding window of the last `sample_window_size`
/// successful response latencies. Until the window fills the effective
/// timeout stays at `min_timeout`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveTimeoutConfig {
    pub enabled: bool,
    /// Milliseconds.
    pub min_timeout: u64,
    /// Milliseconds.
    pub max_timeout: u64,
    pub adaptation_factor: f64,
    pub sample_window_size: usize,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_timeout: 50,
            max_timeout: 5_000,
            adaptation_factor: 2.0,
            sample_window_size: 16,
        }
    }
}

impl AdaptiveTimeoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.min_timeout == 0 {
            return Err(ConfigError::new("adaptive_timeout.min_timeout", "must be positive"));
        }
        if self.max_timeout < self.min_timeout {
            return Err(ConfigError::new(
                "adaptive_timeout.max_timeout",
                "must be >= min_timeout",
            ));
        }
        if self.adaptation_factor <= 1.0 {
            return Err(ConfigError::new("adaptive_timeout.adaptation_factor", "must be > 1.0"));
        }
        if self.sample_window_size == 0 {
            return Err(ConfigError::new("adaptive_timeout.sample_window_size", "must be >= 1"));
        }
        Ok(())
    }
}

/// The runtime configuration of a consensus node. Validated at construction
/// and immutable afterwards; retry policies are the one exception, updatable
/// through the retry engine.
///
/// All raw durations are in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application-provided name of the cluster, for tracing output.
    pub cluster_name: String,
    /// The minimum election timeout.
    pub election_timeout_min: u64,
    /// The maximum election timeout.
    pub election_timeout_max: u64,
    /// The interval at which leaders send heartbeats.
    pub heartbeat_interval: u64,
    /// The baseline timeout for RPCs without a dedicated knob.
    pub rpc_timeout: u64,
    /// The per-request timeout for AppendEntries RPCs.
    pub append_entries_timeout: u64,
    /// The per-request timeout for RequestVote RPCs.
    pub request_vote_timeout: u64,
    /// The per-chunk timeout for InstallSnapshot RPCs.
    pub install_snapshot_timeout: u64,
    /// The maximum number of entries shipped per AppendEntries request.
    pub max_entries_per_append: u64,
    /// Applied command payload bytes accumulated before a snapshot is taken.
    pub snapshot_threshold_bytes: u64,
    /// The chunk size used when streaming a snapshot to a follower.
    pub snapshot_chunk_size: u64,
    /// Retry schedule for heartbeat rounds.
    pub retry_heartbeat: RetryPolicy,
    /// Retry schedule for log replication.
    pub retry_append_entries: RetryPolicy,
    /// Retry schedule for vote requests.
    pub retry_request_vote: RetryPolicy,
    /// Retry schedule for snapshot chunk transfers.
    pub retry_install_snapshot: RetryPolicy,
    /// Adaptive RPC timeout tracking.
    pub adaptive_timeout: AdaptiveTimeoutConfig,
}

impl Config {
    /// Start a builder seeded with defaults.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            rpc_timeout: None,
            append_entries_timeout: None,
            request_vote_timeout: None,
            install_snapshot_timeout: None,
            max_entries_per_append: None,
            snapshot_threshold_bytes: None,
            snapshot_chunk_size: None,
            retry_heartbeat: None,
            retry_append_entries: None,
            retry_request_vote: None,
            retry_install_snapshot: None,
            adaptive_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured range,
    /// in milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max)
    }
}

/// A builder for a validated [`Config`].
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    rpc_timeout: Option<u64>,
    append_entries_timeout: Option<u64>,
    request_vote_timeout: Option<u64>,
    install_snapshot_timeout: Option<u64>,
    max_entries_per_append: Option<u64>,
    snapshot_threshold_bytes: Option<u64>,
    snapshot_chunk_size: Option<u64>,
    retry_heartbeat: Option<RetryPolicy>,
    retry_append_entries: Option<RetryPolicy>,
    retry_request_vote: Option<RetryPolicy>,
    retry_install_snapshot: Option<RetryPolicy>,
    adaptive_timeout: Option<AdaptiveTimeoutConfig>,
}

impl ConfigBuilder {
    /// Set the minimum election timeout, in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout, in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat interval, in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the baseline RPC timeout, in milliseconds.
    pub fn rpc_timeout(mut self, val: u64) -> Self {
        self.rpc_timeout = Some(val);
        self
    }

    /// Set the AppendEntries request timeout, in milliseconds.
    pub fn append_entries_timeout(mut self, val: u64) -> Self {
        self.append_entries_timeout = Some(val);
        self
    }

    /// Set the RequestVote request timeout, in milliseconds.
    pub fn request_vote_timeout(mut self, val: u64) -> Self {
        self.request_vote_timeout = Some(val);
        self
    }

    /// Set the InstallSnapshot chunk timeout, in milliseconds.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the maximum number of entries per AppendEntries payload.
    pub fn max_entries_per_append(mut self, val: u64) -> Self {
        self.max_entries_per_append = Some(val);
        self
    }

    /// Set the snapshot threshold, in applied command payload bytes.
    pub fn snapshot_threshold_bytes(mut self, val: u64) -> Self {
        self.snapshot_threshold_bytes = Some(val);
        self
    }

    /// Set the snapshot streaming chunk size, in bytes.
    pub fn snapshot_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_chunk_size = Some(val);
        self
    }

    /// Override the heartbeat retry policy.
    pub fn retry_heartbeat(mut self, val: RetryPolicy) -> Self {
        self.retry_heartbeat = Some(val);
        self
    }

    /// Override the AppendEntries retry policy.
    pub fn retry_append_entries(mut self, val: RetryPolicy) -> Self {
        self.retry_append_entries = Some(val);
        self
    }

    /// Override the RequestVote retry policy.
    pub fn retry_request_vote(mut self, val: RetryPolicy) -> Self {
        self.retry_request_vote = Some(val);
        self
    }

    /// Override the InstallSnapshot retry policy.
    pub fn retry_install_snapshot(mut self, val: RetryPolicy) -> Self {
        self.retry_install_snapshot = Some(val);
        self
    }

    /// Configure adaptive RPC timeouts.
    pub fn adaptive_timeout(mut self, val: AdaptiveTimeoutConfig) -> Self {
        self.adaptive_timeout = Some(val);
        self
    }

    /// Validate the state of this builder and produce a `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = Config {
            cluster_name: self.cluster_name,
            election_timeout_min: self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN),
            election_timeout_max: self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            rpc_timeout: self.rpc_timeout.unwrap_or(100),
            append_entries_timeout: self.append_entries_timeout.unwrap_or(300),
            request_vote_timeout: self.request_vote_timeout.unwrap_or(300),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(1_000),
            max_entries_per_append: self.max_entries_per_append.unwrap_or(300),
            snapshot_threshold_bytes: self.snapshot_threshold_bytes.unwrap_or(4 * 1024 * 1024),
            snapshot_chunk_size: self.snapshot_chunk_size.unwrap_or(64 * 1024),
            retry_heartbeat: self.retry_heartbeat.unwrap_or_else(RetryPolicy::heartbeat),
            retry_append_entries: self.retry_append_entries.unwrap_or_else(RetryPolicy::append_entries),
            retry_request_vote: self.retry_request_vote.unwrap_or_else(RetryPolicy::request_vote),
            retry_install_snapshot: self.retry_install_snapshot.unwrap_or_else(RetryPolicy::install_snapshot),
            adaptive_timeout: self.adaptive_timeout.unwrap_or_default(),
        };

        if config.election_timeout_min == 0 {
            return Err(ConfigError::new("election_timeout_min", "must be positive"));
        }
        if config.election_timeout_max < config.election_timeout_min {
            return Err(ConfigError::new(
                "election_timeout_max",
                "must be >= election_timeout_min",
            ));
        }
        if config.heartbeat_interval == 0 {
            return Err(ConfigError::new("heartbeat_interval", "must be positive"));
        }
        if config.election_timeout_min < 3 * config.heartbeat_interval {
            return Err(ConfigError::new(
                "election_timeout_min",
                format!(
                    "must be >= 3x heartbeat_interval ({}ms), got {}ms",
                    config.heartbeat_interval, config.election_timeout_min
                ),
            ));
        }
        if config.max_entries_per_append == 0 {
            return Err(ConfigError::new("max_entries_per_append", "must be positive"));
        }
        if config.snapshot_threshold_bytes == 0 {
            return Err(ConfigError::new("snapshot_threshold_bytes", "must be positive"));
        }
        if config.snapshot_chunk_size == 0 {
            return Err(ConfigError::new("snapshot_chunk_size", "must be positive"));
        }
        if config.snapshot_chunk_size > config.snapshot_threshold_bytes {
            return Err(ConfigError::new(
                "snapshot_chunk_size",
                "must not exceed snapshot_threshold_bytes",
            ));
        }
        config.retry_heartbeat.validate("retry_policies.heartbeat")?;
        config.retry_append_entries.validate("retry_policies.append_entries")?;
        config.retry_request_vote.validate("retry_policies.request_vote")?;
        config.retry_install_snapshot.validate("retry_policies.install_snapshot")?;
        config.adaptive_timeout.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn default_retry_policies_are_ordered_by_rpc_class() {
        let config = Config::build("test".into()).validate().unwrap();
        let hb = &config.retry_heartbeat;
        let ae = &config.retry_append_entries;
        let rv = &config.retry_request_vote;
        let is = &config.retry_install_snapshot;

        // InstallSnapshot is the most patient policy; heartbeats the least.
        assert!(is.max_attempts >= ae.max_attempts);
        assert!(is.max_attempts >= rv.max_attempts);
        assert!(is.max_attempts >= hb.max_attempts);
        assert!(is.max_delay >= ae.max_delay);
        assert!(is.max_delay >= rv.max_delay);
        assert!(is.max_delay >= hb.max_delay);
        assert!(hb.max_attempts <= ae.max_attempts);
        assert!(hb.initial_delay <= ae.initial_delay);
    }

    #[test]
    fn election_range_must_be_ordered() {
        let err = Config::build("test".into())
            .election_timeout_min(300)
            .election_timeout_max(200)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "election_timeout_max");
    }

    #[test]
    fn election_min_must_cover_three_heartbeats() {
        let err = Config::build("test".into())
            .heartbeat_interval(200)
            .election_timeout_min(400)
            .election_timeout_max(500)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "election_timeout_min");
        assert!(err.reason.contains("heartbeat_interval"));
    }

    #[test]
    fn chunk_size_bounded_by_threshold() {
        let err = Config::build("test".into())
            .snapshot_threshold_bytes(1_000)
            .snapshot_chunk_size(2_000)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "snapshot_chunk_size");
    }

    #[test]
    fn retry_policy_validation_names_the_offending_field() {
        let bad = RetryPolicy {
            initial_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(5_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        };
        let err = Config::build("test".into()).retry_heartbeat(bad).validate().unwrap_err();
        assert_eq!(err.field, "retry_policies.heartbeat");
        assert!(err.reason.contains("initial_delay"));

        let inverted = RetryPolicy {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        };
        assert!(inverted.validate("p").is_err());

        let flat = RetryPolicy {
            backoff_multiplier: 1.0,
            ..RetryPolicy::append_entries()
        };
        assert!(flat.validate("p").is_err());

        let wild_jitter = RetryPolicy {
            jitter_factor: 1.5,
            ..RetryPolicy::append_entries()
        };
        assert!(wild_jitter.validate("p").is_err());

        let no_attempts = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::append_entries()
        };
        assert!(no_attempts.validate("p").is_err());
    }

    #[test]
    fn adaptive_timeout_invariants_only_checked_when_enabled() {
        let disabled = AdaptiveTimeoutConfig {
            enabled: false,
            min_timeout: 0,
            ..AdaptiveTimeoutConfig::default()
        };
        assert!(disabled.validate().is_ok());

        let inverted = AdaptiveTimeoutConfig {
            enabled: true,
            min_timeout: 1_000,
            max_timeout: 100,
            ..AdaptiveTimeoutConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn rand_election_timeout_stays_in_range() {
        let config = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = config.new_rand_election_timeout();
            assert!(t >= config.election_timeout_min && t <= config.election_timeout_max);
        }
    }
}
