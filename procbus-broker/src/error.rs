//! Broker error types with context.
//!
//! One variant per failure kind the broker reports, from spawn-time
//! validation through routing, admission, permits, and shutdown. Handler
//! dispatch converts these into error messages delivered back to the
//! requesting child; they never escape a worker as a panic.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use procbus_wire::WireError;

/// All failure modes of the broker core.
///
/// # Example
///
/// ```rust
/// use procbus_broker::BrokerError;
///
/// let err = BrokerError::DuplicateId { id: "worker-1".into() };
/// assert!(err.to_string().contains("worker-1"));
/// assert_eq!(err.code(), "DuplicateID");
/// ```
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A spawn was requested without a child id
    #[error("process id must not be empty")]
    MissingId,

    /// A spawn reused an id that is already registered
    #[error("process id already registered: {id}")]
    DuplicateId {
        /// The contested child id
        id: String,
    },

    /// The OS refused to start the child
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailure {
        /// Executable that failed to start
        command: String,
        /// OS-level failure description
        reason: String,
    },

    /// A child found its inherited RPC handle slots invalid (exit code 254)
    #[error("child '{id}' reported invalid RPC handles (exit 254)")]
    InvalidRpcHandle {
        /// The child that failed its handle probe
        id: String,
    },

    /// No mailbox is registered for the message target
    #[error("no route to target: {target}")]
    NoRoute {
        /// The unreachable target id
        target: String,
    },

    /// The target mailbox was full; the message was not delivered
    #[error("mailbox full for target: {target}")]
    MailboxFull {
        /// The congested target id
        target: String,
    },

    /// The optimizer ingress queue rejected the message
    #[error("optimizer queue full (capacity {capacity})")]
    QueueFull {
        /// Configured ingress capacity
        capacity: usize,
    },

    /// The optimizer has stopped and accepts no further messages
    #[error("optimizer queue closed")]
    QueueClosed,

    /// A caller-supplied argument failed validation
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument
        reason: String,
    },

    /// The permit pool is exhausted
    #[error("no permits available")]
    NoPermits,

    /// A release or revocation referenced a provider with no ledger entry
    #[error("no permits allocated to provider: {provider_id}")]
    ProviderNotFound {
        /// The unknown provider id
        provider_id: String,
    },

    /// A pending correlation expired before its response arrived
    #[error("request timed out after {timeout:?}")]
    Timeout {
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The broker is shutting down; the operation was abandoned
    #[error("operation canceled by shutdown")]
    Canceled,

    /// Wire-level encode/decode failure
    #[error("encoding error: {0}")]
    Encoding(#[from] WireError),

    /// An unrecognized broker method or otherwise unclassified failure
    #[error("unknown: {reason}")]
    Unknown {
        /// Free-form failure description
        reason: String,
    },
}

impl BrokerError {
    /// Stable error code carried in error messages on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingId => "MissingID",
            Self::DuplicateId { .. } => "DuplicateID",
            Self::SpawnFailure { .. } => "SpawnFailure",
            Self::InvalidRpcHandle { .. } => "InvalidRPCHandle",
            Self::NoRoute { .. } => "NoRoute",
            Self::MailboxFull { .. } => "MailboxFull",
            Self::QueueFull { .. } => "QueueFull",
            Self::QueueClosed => "QueueClosed",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::NoPermits => "NoPermits",
            Self::ProviderNotFound { .. } => "ProviderNotFound",
            Self::Timeout { .. } => "Timeout",
            Self::Canceled => "Canceled",
            Self::Encoding(_) => "EncodingError",
            Self::Unknown { .. } => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_display() {
        let err = BrokerError::DuplicateId { id: "w1".into() };
        assert!(err.to_string().contains("w1"));
    }

    #[test]
    fn test_spawn_failure_display() {
        let err = BrokerError::SpawnFailure {
            command: "/bin/nothere".into(),
            reason: "No such file or directory".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/bin/nothere"));
        assert!(text.contains("No such file"));
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(BrokerError::MissingId.code(), "MissingID");
        assert_eq!(BrokerError::NoPermits.code(), "NoPermits");
        assert_eq!(BrokerError::QueueClosed.code(), "QueueClosed");
        assert_eq!(
            BrokerError::Timeout {
                timeout: Duration::from_millis(50)
            }
            .code(),
            "Timeout"
        );
        assert_eq!(BrokerError::Canceled.code(), "Canceled");
    }

    #[test]
    fn test_wire_error_conversion() {
        let wire = WireError::MalformedVarint;
        let err: BrokerError = wire.into();
        assert_eq!(err.code(), "EncodingError");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BrokerError>();
    }
}
