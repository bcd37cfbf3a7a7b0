//! Child identity, lifecycle status, and restart policy.

// Layer 1: Standard library imports
use std::fmt;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one supervised child.
///
/// # State Transitions
///
/// ```text
/// Running → Exited   (exit code 0)
/// Running → Failed   (non-zero exit or signal)
/// Exited  → Running  (restart)
/// Failed  → Running  (restart)
/// ```
///
/// Once the restart budget is exhausted, `Exited` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// The child is alive
    Running,
    /// The child exited normally
    Exited,
    /// The child exited non-zero or was killed by a signal
    Failed,
}

impl ProcessStatus {
    /// Wire representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Failed => "failed",
        }
    }

    /// Returns `true` while the child is alive.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Restart policy for one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Restarts allowed before the child becomes terminal; -1 is unlimited
    pub max_restarts: i32,
    /// Wait before each restart attempt
    pub delay: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 0,
            delay: Duration::ZERO,
        }
    }
}

impl RestartConfig {
    /// Policy with a restart budget and delay.
    pub fn new(max_restarts: i32, delay: Duration) -> Self {
        Self {
            max_restarts,
            delay,
        }
    }

    /// Returns `true` if a child with `restart_count` prior restarts may
    /// restart again.
    pub fn allows_restart(&self, restart_count: u32) -> bool {
        self.max_restarts < 0 || (restart_count as i64) < self.max_restarts as i64
    }
}

/// Identity and state of one supervised child.
///
/// Created at spawn and mutated only by the supervisor; callers observe
/// cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// Caller-assigned unique id
    pub id: String,
    /// OS process id of the current incarnation
    pub pid: u32,
    /// Executable and arguments
    pub argv: Vec<String>,
    /// Lifecycle status
    pub status: ProcessStatus,
    /// Exit code of the last terminated incarnation
    pub exit_code: Option<i32>,
    /// Restart policy
    pub restart: RestartConfig,
    /// Restarts performed so far
    pub restart_count: u32,
    /// Whether RPC handles are wired
    pub rpc: bool,
    /// When the current incarnation started
    pub started_at: DateTime<Utc>,
}

impl ProcessDescriptor {
    /// Descriptor for a freshly spawned child.
    pub fn new(
        id: impl Into<String>,
        pid: u32,
        argv: Vec<String>,
        restart: RestartConfig,
        rpc: bool,
    ) -> Self {
        Self {
            id: id.into(),
            pid,
            argv,
            status: ProcessStatus::Running,
            exit_code: None,
            restart,
            restart_count: 0,
            rpc,
            started_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ProcessStatus::Running.as_str(), "running");
        assert_eq!(ProcessStatus::Exited.as_str(), "exited");
        assert_eq!(ProcessStatus::Failed.as_str(), "failed");
        assert!(ProcessStatus::Running.is_running());
        assert!(!ProcessStatus::Failed.is_running());
    }

    #[test]
    fn test_restart_budget() {
        let config = RestartConfig::new(2, Duration::ZERO);
        assert!(config.allows_restart(0));
        assert!(config.allows_restart(1));
        assert!(!config.allows_restart(2));
    }

    #[test]
    fn test_unlimited_restarts() {
        let config = RestartConfig::new(-1, Duration::ZERO);
        assert!(config.allows_restart(0));
        assert!(config.allows_restart(u32::MAX));
    }

    #[test]
    fn test_default_restart_config_never_restarts() {
        let config = RestartConfig::default();
        assert!(!config.allows_restart(0));
        assert_eq!(config.delay, Duration::ZERO);
    }

    #[test]
    fn test_descriptor_initial_state() {
        let descriptor = ProcessDescriptor::new(
            "w1",
            42,
            vec!["/bin/true".to_string()],
            RestartConfig::default(),
            true,
        );
        assert_eq!(descriptor.status, ProcessStatus::Running);
        assert_eq!(descriptor.exit_code, None);
        assert_eq!(descriptor.restart_count, 0);
        assert!(descriptor.rpc);
    }
}
