//! # procbus-wire - ProcBus Wire Protocol
//!
//! Message model and framing shared by the broker daemon and its supervised
//! child processes. Every RPC handle carries a stream of length-prefixed
//! frames, each holding one encoded [`Message`].
//!
//! # Wire Format
//!
//! ```text
//! <uvarint length> <payload bytes>
//! ```
//!
//! The payload encoding is negotiated by configuration ([`WireEncoding`],
//! JSON by default, CBOR as the binary option). Both encodings decode to
//! identical logical messages.
//!
//! # Quick Start
//!
//! ```rust
//! use procbus_wire::{Message, WireCodec, WireEncoding};
//! use tokio_util::codec::{Decoder, Encoder};
//! use bytes::BytesMut;
//!
//! let msg = Message::request("req-1", "worker-1", "broker",
//!     serde_json::json!({"method": "RPCGetMessageCount"}));
//!
//! let mut codec = WireCodec::new(WireEncoding::Json);
//! let mut buf = BytesMut::new();
//! codec.encode(msg.clone(), &mut buf).unwrap();
//!
//! let decoded = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(decoded.id, msg.id);
//! ```
//!
//! # Module Organization
//!
//! - [`message`] - The immutable [`Message`] value and its constructors
//! - [`codec`] - Frame codec with pluggable encodings and wire metrics
//! - [`rpc`] - Broker-addressed method names and typed payloads
//! - [`error`] - Wire-level error types

pub mod codec;
pub mod error;
pub mod message;
pub mod rpc;

// Re-export commonly used types
pub use codec::{WireCodec, WireEncoding, WireMetrics};
pub use error::WireError;
pub use message::{Message, MessageKind, BROKER_TARGET};
pub use rpc::{KernelMetrics, INVALID_RPC_HANDLE_EXIT};
