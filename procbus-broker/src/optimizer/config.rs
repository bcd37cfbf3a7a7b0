//! Optimizer configuration with sensible defaults.

// Layer 1: Standard library imports
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

/// Default ingress queue capacity
pub const DEFAULT_BUFFER_CAP: usize = 1024;

/// Default number of pinned workers
pub const DEFAULT_NUM_WORKERS: usize = 2;

/// Default load-sampling interval
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Default wait bound for the `Timeout` offer policy
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Default worker batch size
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Default batch gather window
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5);

/// Default minimum spacing between adaptation passes
pub const DEFAULT_ADAPTATION_FREQ: Duration = Duration::from_secs(10);

/// Admission rule applied when the ingress queue is full.
///
/// # Example
///
/// ```rust
/// use procbus_broker::OfferPolicy;
///
/// assert_eq!(OfferPolicy::default(), OfferPolicy::Drop);
/// assert_eq!("drop_oldest".parse::<OfferPolicy>().unwrap(), OfferPolicy::DropOldest);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferPolicy {
    /// Drop the incoming message and count it (default)
    #[default]
    Drop,
    /// Suspend the caller until space appears or the optimizer stops
    Block,
    /// Wait at most `offer_timeout`, then drop and count
    Timeout,
    /// Evict exactly one oldest message, count it, enqueue the new one
    DropOldest,
    /// Refuse without touching the queue
    Reject,
}

impl fmt::Display for OfferPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Drop => "drop",
            Self::Block => "block",
            Self::Timeout => "timeout",
            Self::DropOldest => "drop_oldest",
            Self::Reject => "reject",
        };
        write!(f, "{name}")
    }
}

impl FromStr for OfferPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "block" => Ok(Self::Block),
            "timeout" => Ok(Self::Timeout),
            "drop_oldest" => Ok(Self::DropOldest),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown offer policy: {other}")),
        }
    }
}

/// Tuning knobs for the optimizer pipeline.
///
/// # Example
///
/// ```rust
/// use procbus_broker::{OfferPolicy, OptimizerConfig};
///
/// let config = OptimizerConfig::builder()
///     .with_buffer_cap(256)
///     .with_num_workers(4)
///     .with_offer_policy(OfferPolicy::DropOldest)
///     .build()
///     .unwrap();
/// assert_eq!(config.buffer_cap, 256);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Ingress queue capacity
    pub buffer_cap: usize,

    /// Workers started at launch
    pub num_workers: usize,

    /// Load-sampling interval for the system monitor
    pub stats_interval: Duration,

    /// Admission rule when the queue is full
    pub offer_policy: OfferPolicy,

    /// Wait bound for [`OfferPolicy::Timeout`]
    pub offer_timeout: Duration,

    /// Messages gathered per worker batch
    pub batch_size: usize,

    /// Maximum time spent gathering one batch
    pub flush_interval: Duration,

    /// Minimum spacing between adaptation passes
    pub adaptation_freq: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            buffer_cap: DEFAULT_BUFFER_CAP,
            num_workers: DEFAULT_NUM_WORKERS,
            stats_interval: DEFAULT_STATS_INTERVAL,
            offer_policy: OfferPolicy::default(),
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            adaptation_freq: DEFAULT_ADAPTATION_FREQ,
        }
    }
}

impl OptimizerConfig {
    /// Create a configuration builder.
    pub fn builder() -> OptimizerConfigBuilder {
        OptimizerConfigBuilder::default()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_cap == 0 {
            return Err("buffer_cap must be > 0".to_string());
        }
        if self.num_workers == 0 {
            return Err("num_workers must be > 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }
        if self.stats_interval.is_zero() {
            return Err("stats_interval must be > 0".to_string());
        }
        if self.adaptation_freq.is_zero() {
            return Err("adaptation_freq must be > 0".to_string());
        }
        Ok(())
    }
}

/// Builder for [`OptimizerConfig`] with a fluent API.
#[derive(Debug, Default)]
pub struct OptimizerConfigBuilder {
    config: OptimizerConfig,
}

impl OptimizerConfigBuilder {
    /// Set the ingress queue capacity.
    pub fn with_buffer_cap(mut self, buffer_cap: usize) -> Self {
        self.config.buffer_cap = buffer_cap;
        self
    }

    /// Set the initial worker count.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    /// Set the load-sampling interval.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    /// Set the queue-full admission rule.
    pub fn with_offer_policy(mut self, policy: OfferPolicy) -> Self {
        self.config.offer_policy = policy;
        self
    }

    /// Set the wait bound for the timeout policy.
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.config.offer_timeout = timeout;
        self
    }

    /// Set the worker batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set the batch gather window.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Set the minimum spacing between adaptation passes.
    pub fn with_adaptation_freq(mut self, freq: Duration) -> Self {
        self.config.adaptation_freq = freq;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<OptimizerConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
