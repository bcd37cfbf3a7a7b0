//! Broker configuration: defaults, builder, environment loading.

// Layer 1: Standard library imports
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// Layer 2: Third-party crate imports
use tracing::warn;

// Layer 3: Internal module imports
use crate::optimizer::{OfferPolicy, OptimizerConfig, ResolutionPolicy};
use crate::permits::RevocationThresholds;
use crate::supervisor::{HandleSlots, SupervisorConfig};
use procbus_wire::WireEncoding;

/// Default global permit pool size
pub const DEFAULT_TOTAL_PERMITS: u64 = 64;

/// Default per-child mailbox capacity
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Default correlation sweeper cadence
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Default deadline for broker-originated requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default shutdown grace before SIGKILL
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Every tuning knob of the broker core.
///
/// Values come from defaults, the builder, or `PROCBUS_*` environment
/// variables; the core only ever sees this struct.
///
/// # Example
///
/// ```rust
/// use procbus_broker::{BrokerConfig, OfferPolicy};
///
/// let config = BrokerConfig::builder()
///     .with_total_permits(10)
///     .with_offer_policy(OfferPolicy::Block)
///     .build()
///     .unwrap();
/// assert_eq!(config.total_permits, 10);
/// ```
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Where the broker writes its log, if any
    pub log_path: Option<PathBuf>,
    /// Descriptor slots wired into RPC children
    pub slots: HandleSlots,
    /// Per-child mailbox capacity
    pub mailbox_capacity: usize,
    /// Frame encoding on the RPC handles
    pub encoding: WireEncoding,
    /// Global permit pool size
    pub total_permits: u64,
    /// Shutdown grace before SIGKILL
    pub shutdown_grace: Duration,
    /// Correlation sweeper cadence
    pub sweep_interval: Duration,
    /// Deadline for broker-originated requests
    pub request_timeout: Duration,
    /// Optimizer pipeline knobs
    pub optimizer: OptimizerConfig,
    /// Revocation monitor thresholds
    pub revocation: RevocationThresholds,
    /// Attach the service-conflict resolver with this policy
    pub conflict_policy: Option<ResolutionPolicy>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            slots: HandleSlots::default(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            encoding: WireEncoding::default(),
            total_permits: DEFAULT_TOTAL_PERMITS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            optimizer: OptimizerConfig::default(),
            revocation: RevocationThresholds::default(),
            conflict_policy: None,
        }
    }
}

impl BrokerConfig {
    /// Create a configuration builder.
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::default()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        self.slots.validate().map_err(|e| e.to_string())?;
        if self.mailbox_capacity == 0 {
            return Err("mailbox_capacity must be > 0".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be > 0".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.revocation.revoke_pct) {
            return Err("revoke_pct must be within 0..=1".to_string());
        }
        self.optimizer.validate()
    }

    /// Load configuration from `PROCBUS_*` environment variables, starting
    /// from defaults. Unset variables keep their defaults; unparsable
    /// values are logged and skipped.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = std::env::var_os("PROCBUS_LOG_FILE") {
            config.log_path = Some(PathBuf::from(path));
        }
        if let Some(slot) = env_parse::<i32>("PROCBUS_CHILD_IN_SLOT") {
            config.slots.child_in = slot;
        }
        if let Some(slot) = env_parse::<i32>("PROCBUS_CHILD_OUT_SLOT") {
            config.slots.child_out = slot;
        }
        if let Some(capacity) = env_parse::<usize>("PROCBUS_MAILBOX_CAPACITY") {
            config.mailbox_capacity = capacity;
        }
        if let Some(encoding) = env_parse::<WireEncoding>("PROCBUS_WIRE_ENCODING") {
            config.encoding = encoding;
        }
        if let Some(total) = env_parse::<u64>("PROCBUS_TOTAL_PERMITS") {
            config.total_permits = total;
        }
        if let Some(ms) = env_parse::<u64>("PROCBUS_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        if let Some(cap) = env_parse::<usize>("PROCBUS_BUFFER_CAP") {
            config.optimizer.buffer_cap = cap;
        }
        if let Some(workers) = env_parse::<usize>("PROCBUS_NUM_WORKERS") {
            config.optimizer.num_workers = workers;
        }
        if let Some(policy) = env_parse::<OfferPolicy>("PROCBUS_OFFER_POLICY") {
            config.optimizer.offer_policy = policy;
        }
        if let Some(ms) = env_parse::<u64>("PROCBUS_OFFER_TIMEOUT_MS") {
            config.optimizer.offer_timeout = Duration::from_millis(ms);
        }
        if let Some(batch) = env_parse::<usize>("PROCBUS_BATCH_SIZE") {
            config.optimizer.batch_size = batch;
        }
        if let Some(ms) = env_parse::<u64>("PROCBUS_FLUSH_INTERVAL_MS") {
            config.optimizer.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PROCBUS_STATS_INTERVAL_MS") {
            config.optimizer.stats_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PROCBUS_ADAPTATION_FREQ_MS") {
            config.optimizer.adaptation_freq = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<f64>("PROCBUS_P99_LATENCY_MS") {
            config.revocation.p99_latency_ms = ms;
        }
        if let Some(pct) = env_parse::<f64>("PROCBUS_BUFFER_SATURATION") {
            config.revocation.buffer_saturation = pct;
        }
        if let Some(ms) = env_parse::<u64>("PROCBUS_CHECK_INTERVAL_MS") {
            config.revocation.check_interval = Duration::from_millis(ms);
        }
        if let Some(count) = env_parse::<u32>("PROCBUS_CONSECUTIVE_BREACHES") {
            config.revocation.consecutive_breaches = count;
        }
        if let Some(pct) = env_parse::<f64>("PROCBUS_REVOKE_PCT") {
            config.revocation.revoke_pct = pct;
        }

        if let Some(policy) = env_parse::<ResolutionPolicy>("PROCBUS_CONFLICT_POLICY") {
            config.conflict_policy = Some(policy);
        }

        config
    }

    /// The supervisor's slice of this configuration.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            slots: self.slots,
            mailbox_capacity: self.mailbox_capacity,
            shutdown_grace: self.shutdown_grace,
            encoding: self.encoding,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "unparsable environment value ignored");
            None
        }
    }
}

/// Builder for [`BrokerConfig`] with a fluent API.
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl BrokerConfigBuilder {
    /// Set the broker log file path.
    pub fn with_log_path(mut self, path: PathBuf) -> Self {
        self.config.log_path = Some(path);
        self
    }

    /// Set the child RPC handle slots.
    pub fn with_slots(mut self, slots: HandleSlots) -> Self {
        self.config.slots = slots;
        self
    }

    /// Set the per-child mailbox capacity.
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Set the wire encoding.
    pub fn with_encoding(mut self, encoding: WireEncoding) -> Self {
        self.config.encoding = encoding;
        self
    }

    /// Set the global permit pool size.
    pub fn with_total_permits(mut self, total: u64) -> Self {
        self.config.total_permits = total;
        self
    }

    /// Set the optimizer configuration wholesale.
    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.config.optimizer = optimizer;
        self
    }

    /// Set the queue-full admission rule.
    pub fn with_offer_policy(mut self, policy: OfferPolicy) -> Self {
        self.config.optimizer.offer_policy = policy;
        self
    }

    /// Set the revocation thresholds wholesale.
    pub fn with_revocation(mut self, revocation: RevocationThresholds) -> Self {
        self.config.revocation = revocation;
        self
    }

    /// Attach the service-conflict resolver with `policy`.
    pub fn with_conflict_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.config.conflict_policy = Some(policy);
        self
    }

    /// Set the correlation sweeper cadence.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the deadline for broker-originated requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<BrokerConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_round_trip() {
        let config = BrokerConfig::builder()
            .with_total_permits(10)
            .with_mailbox_capacity(32)
            .with_encoding(WireEncoding::Cbor)
            .with_conflict_policy(ResolutionPolicy::FairShare)
            .build()
            .unwrap();
        assert_eq!(config.total_permits, 10);
        assert_eq!(config.mailbox_capacity, 32);
        assert_eq!(config.encoding, WireEncoding::Cbor);
        assert_eq!(config.conflict_policy, Some(ResolutionPolicy::FairShare));
    }

    #[test]
    fn test_invalid_slots_rejected() {
        let result = BrokerConfig::builder()
            .with_slots(HandleSlots {
                child_in: 0,
                child_out: 4,
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_mailbox_rejected() {
        let result = BrokerConfig::builder().with_mailbox_capacity(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_env_reads_variables() {
        // Serialized env access; the vars are cleaned up before asserts.
        std::env::set_var("PROCBUS_TOTAL_PERMITS", "7");
        std::env::set_var("PROCBUS_OFFER_POLICY", "drop_oldest");
        std::env::set_var("PROCBUS_BATCH_SIZE", "not-a-number");

        let config = BrokerConfig::from_env();

        std::env::remove_var("PROCBUS_TOTAL_PERMITS");
        std::env::remove_var("PROCBUS_OFFER_POLICY");
        std::env::remove_var("PROCBUS_BATCH_SIZE");

        assert_eq!(config.total_permits, 7);
        assert_eq!(config.optimizer.offer_policy, OfferPolicy::DropOldest);
        // The unparsable value fell back to the default.
        assert_eq!(
            config.optimizer.batch_size,
            OptimizerConfig::default().batch_size
        );
    }
}
