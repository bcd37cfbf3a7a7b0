//! Length-prefixed frame codec with pluggable message encodings.
//!
//! Every RPC handle carries frames of the form `<uvarint length> <payload>`.
//! The payload encoding is negotiated by configuration: JSON is the default
//! and CBOR is the binary option. Both produce identical logical messages
//! after decode.

// Layer 1: Standard library imports
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

// Layer 3: Internal module imports
use crate::error::WireError;
use crate::message::Message;

/// Default maximum frame length (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest legal uvarint prefix for a u64.
const MAX_VARINT_LEN: usize = 10;

/// Wire payload encoding.
///
/// # Example
///
/// ```rust
/// use procbus_wire::WireEncoding;
///
/// assert_eq!(WireEncoding::default(), WireEncoding::Json);
/// assert_eq!("cbor".parse::<WireEncoding>().unwrap(), WireEncoding::Cbor);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireEncoding {
    /// Human-readable JSON (default)
    #[default]
    Json,
    /// Compact binary CBOR
    Cbor,
}

impl WireEncoding {
    /// Stable tag used in logs and metrics.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        }
    }

    /// Encode one message into its payload bytes.
    pub fn encode_message(&self, msg: &Message) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Json => serde_json::to_vec(msg).map_err(|e| WireError::Encoding {
                encoding: "json",
                reason: e.to_string(),
            }),
            Self::Cbor => serde_cbor::to_vec(msg).map_err(|e| WireError::Encoding {
                encoding: "cbor",
                reason: e.to_string(),
            }),
        }
    }

    /// Decode one message from payload bytes.
    pub fn decode_message(&self, bytes: &[u8]) -> Result<Message, WireError> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| WireError::Encoding {
                encoding: "json",
                reason: e.to_string(),
            }),
            Self::Cbor => serde_cbor::from_slice(bytes).map_err(|e| WireError::Encoding {
                encoding: "cbor",
                reason: e.to_string(),
            }),
        }
    }
}

impl fmt::Display for WireEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for WireEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(format!("unknown wire encoding: {other}")),
        }
    }
}

/// Frame and byte counters for one wire channel, tagged with its encoding.
///
/// Counters are lock-free; snapshots are per-field consistent.
#[derive(Debug)]
pub struct WireMetrics {
    encoding: WireEncoding,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl WireMetrics {
    /// Create zeroed metrics tagged with `encoding`.
    pub fn new(encoding: WireEncoding) -> Self {
        Self {
            encoding,
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// The encoding tag this channel negotiated.
    pub fn encoding(&self) -> WireEncoding {
        self.encoding
    }

    /// Frames decoded from the wire.
    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    /// Frames encoded onto the wire.
    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    /// Payload bytes decoded from the wire (length prefixes excluded).
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Payload bytes encoded onto the wire (length prefixes excluded).
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    fn record_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Frame codec for [`Message`] streams.
///
/// Implements [`tokio_util::codec::Encoder`] and
/// [`tokio_util::codec::Decoder`], so it plugs directly into `FramedRead` /
/// `FramedWrite` over the RPC handles.
///
/// # Example
///
/// ```rust
/// use bytes::BytesMut;
/// use procbus_wire::{Message, WireCodec, WireEncoding};
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = WireCodec::new(WireEncoding::Cbor);
/// let mut buf = BytesMut::new();
///
/// let msg = Message::event("e1", "broker", "w1", serde_json::json!({"n": 7}));
/// codec.encode(msg.clone(), &mut buf).unwrap();
///
/// let decoded = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(decoded.payload, msg.payload);
/// assert_eq!(codec.metrics().frames_in(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct WireCodec {
    encoding: WireEncoding,
    max_frame_len: usize,
    metrics: Arc<WireMetrics>,
}

impl WireCodec {
    /// Create a codec with the default maximum frame length.
    pub fn new(encoding: WireEncoding) -> Self {
        Self::with_max_frame_len(encoding, DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a codec enforcing a custom maximum frame length.
    pub fn with_max_frame_len(encoding: WireEncoding, max_frame_len: usize) -> Self {
        Self {
            encoding,
            max_frame_len,
            metrics: Arc::new(WireMetrics::new(encoding)),
        }
    }

    /// The negotiated encoding.
    pub fn encoding(&self) -> WireEncoding {
        self.encoding
    }

    /// Shared handle to this channel's wire metrics.
    pub fn metrics(&self) -> Arc<WireMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Encoder<Message> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = self.encoding.encode_message(&msg)?;
        if body.len() > self.max_frame_len {
            return Err(WireError::FrameTooLarge {
                len: body.len() as u64,
                max: self.max_frame_len,
            });
        }

        dst.reserve(MAX_VARINT_LEN + body.len());
        put_uvarint(dst, body.len() as u64);
        dst.put_slice(&body);
        self.metrics.record_out(body.len());
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, prefix_len)) = get_uvarint(src)? else {
            return Ok(None); // incomplete length prefix
        };

        if len > self.max_frame_len as u64 {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let len = len as usize;
        if src.len() < prefix_len + len {
            // Incomplete body; reserve what we still need and wait.
            src.reserve(prefix_len + len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let body = src.split_to(len);
        let msg = self.encoding.decode_message(&body)?;
        self.metrics.record_in(len);
        Ok(Some(msg))
    }
}

/// Append `value` as an unsigned LEB128 varint.
fn put_uvarint(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint without consuming `src`.
///
/// Returns `Ok(None)` if more bytes are needed, or the decoded value and
/// its encoded length.
fn get_uvarint(src: &[u8]) -> Result<Option<(u64, usize)>, WireError> {
    let mut value: u64 = 0;
    for (i, byte) in src.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(WireError::MalformedVarint);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(WireError::MalformedVarint);
    }
    Ok(None)
}
