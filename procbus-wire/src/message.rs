// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved target id addressing the broker daemon itself.
pub const BROKER_TARGET: &str = "broker";

/// Logical kind of a wire message.
///
/// The kind drives routing behavior: requests may register a pending
/// correlation, responses complete one, events are fire-and-forget, and
/// errors carry a failure back to the message source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Expects a correlated response
    Request,
    /// Completes a pending request via `correlation_id`
    Response,
    /// One-way notification, no correlation
    Event,
    /// Failure notification; `error` field is populated
    Error,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Event => write!(f, "event"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Immutable broker message.
///
/// A message is a value: once accepted by the routing pipeline it is never
/// mutated. Responses tie back to their originating request through
/// `correlation_id == request.id`. The payload is uninterpreted by the
/// routing layers; broker-addressed handlers deserialize it into the typed
/// structures in [`crate::rpc`].
///
/// # Invariants
///
/// - `id`, `source`, and `target` are non-empty
/// - `kind == Error` implies `error` is populated
/// - a response's `correlation_id` equals some earlier request's `id`
///
/// # Example
///
/// ```rust
/// use procbus_wire::{Message, MessageKind};
///
/// let req = Message::request("r1", "worker-1", "broker",
///     serde_json::json!({"method": "RPCGetMessageCount"}));
/// let resp = Message::response_to(&req, "broker", serde_json::json!({"count": 0}));
///
/// assert_eq!(resp.kind, MessageKind::Response);
/// assert_eq!(resp.correlation_id.as_deref(), Some("r1"));
/// assert_eq!(resp.target, "worker-1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind, serialized as `type` on the wire
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Sender-unique message id
    pub id: String,

    /// Originating child id, or `"broker"`
    pub source: String,

    /// Destination child id, or `"broker"`
    pub target: String,

    /// Set on responses and errors that answer a request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Method-specific payload, opaque to the routing layers
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Human-readable failure text, only for `kind == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a request message.
    pub fn request(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind: MessageKind::Request,
            id: id.into(),
            source: source.into(),
            target: target.into(),
            correlation_id: None,
            payload,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an event message.
    pub fn event(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind: MessageKind::Event,
            id: id.into(),
            source: source.into(),
            target: target.into(),
            correlation_id: None,
            payload,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a response answering `request`.
    ///
    /// The response is routed back to the request's source and carries
    /// `correlation_id == request.id`.
    pub fn response_to(request: &Message, responder: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            id: format!("{}-resp", request.id),
            source: responder.into(),
            target: request.source.clone(),
            correlation_id: Some(request.id.clone()),
            payload,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an error message answering `request`.
    ///
    /// Routing fields mirror [`Message::response_to`]; the failure text goes
    /// into the `error` field and the payload stays empty.
    pub fn error_to(
        request: &Message,
        responder: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Error,
            id: format!("{}-err", request.id),
            source: responder.into(),
            target: request.source.clone(),
            correlation_id: Some(request.id.clone()),
            payload: Value::Null,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Returns `true` if this message is addressed to the broker itself.
    pub fn is_broker_target(&self) -> bool {
        self.target == BROKER_TARGET
    }

    /// Validate the structural invariants of the message.
    ///
    /// Returns the offending field name on failure. Routing rejects invalid
    /// messages at ingress rather than deep in the pipeline.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.is_empty() {
            return Err("id");
        }
        if self.source.is_empty() {
            return Err("source");
        }
        if self.target.is_empty() {
            return Err("target");
        }
        if self.kind == MessageKind::Error && self.error.is_none() {
            return Err("error");
        }
        Ok(())
    }
}
