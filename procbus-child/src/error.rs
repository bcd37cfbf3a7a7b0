//! Child endpoint error types.

// Layer 1: Standard library imports
use std::io;
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use procbus_wire::WireError;

/// Failures on the child side of an RPC channel.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// An inherited descriptor slot is not a usable handle.
    ///
    /// The process invocation contract requires exiting with code 254
    /// when this is observed at startup.
    #[error("inherited RPC handle at slot {slot} is invalid")]
    InvalidHandle {
        /// The slot that failed its probe
        slot: i32,
    },

    /// The broker closed the channel.
    #[error("RPC channel closed by the broker")]
    Closed,

    /// No correlated response arrived in time.
    #[error("no response within {timeout:?}")]
    Timeout {
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Frame encode/decode failure.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Underlying descriptor I/O failure.
    #[error("endpoint I/O error: {0}")]
    Io(#[from] io::Error),
}
