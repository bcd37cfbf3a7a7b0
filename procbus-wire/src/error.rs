//! Wire-level error types.

// Layer 1: Standard library imports
use std::io;

// Layer 2: Third-party crate imports
use thiserror::Error;

/// Errors produced while framing, encoding, or decoding wire messages.
///
/// # Example
///
/// ```rust
/// use procbus_wire::WireError;
///
/// let err = WireError::FrameTooLarge { len: 20_000_000, max: 16_777_216 };
/// assert!(err.to_string().contains("frame length"));
/// ```
#[derive(Debug, Error)]
pub enum WireError {
    /// Message could not be encoded or decoded in the negotiated encoding.
    #[error("encoding error ({encoding}): {reason}")]
    Encoding {
        /// The encoding that was in effect ("json" or "cbor")
        encoding: &'static str,
        /// Underlying serializer/deserializer failure
        reason: String,
    },

    /// A frame header announced a length above the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced frame length
        len: u64,
        /// Configured maximum frame length
        max: usize,
    },

    /// The uvarint length prefix was malformed (more than 10 bytes).
    #[error("malformed uvarint length prefix")]
    MalformedVarint,

    /// Underlying byte-stream I/O failure.
    #[error("wire I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_error_display() {
        let err = WireError::Encoding {
            encoding: "json",
            reason: "unexpected end of input".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("json"));
        assert!(text.contains("unexpected end of input"));
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = WireError::FrameTooLarge { len: 100, max: 50 };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone");
        let err: WireError = io_err.into();
        assert!(matches!(err, WireError::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }
}
