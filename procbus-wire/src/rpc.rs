//! Broker-addressed RPC methods and their typed payloads.
//!
//! Messages with `target == "broker"` carry a payload object whose `method`
//! field selects one of the methods below. The structs here are the typed
//! views the broker and children use to build and parse those payloads.

// Layer 1: Standard library imports
use std::collections::HashMap;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Layer 3: Internal module imports
use crate::error::WireError;

/// Exit code a child must use when an inherited RPC handle slot is invalid.
pub const INVALID_RPC_HANDLE_EXIT: i32 = 254;

/// Default inherited slot for the child's inbound (broker-to-child) handle.
pub const DEFAULT_CHILD_IN_SLOT: i32 = 3;

/// Default inherited slot for the child's outbound (child-to-broker) handle.
pub const DEFAULT_CHILD_OUT_SLOT: i32 = 4;

/// Broker method names.
pub mod method {
    /// Spawn a plain child process
    pub const SPAWN: &str = "RPCSpawn";
    /// Spawn a child with RPC handles wired
    pub const SPAWN_RPC: &str = "RPCSpawnRPC";
    /// Spawn a plain child with a restart budget
    pub const SPAWN_WITH_RESTART: &str = "RPCSpawnWithRestart";
    /// Spawn an RPC child with a restart budget
    pub const SPAWN_RPC_WITH_RESTART: &str = "RPCSpawnRPCWithRestart";
    /// Global and per-process message statistics
    pub const GET_MESSAGE_STATS: &str = "RPCGetMessageStats";
    /// Total routed message count
    pub const GET_MESSAGE_COUNT: &str = "RPCGetMessageCount";
    /// Request worker permits from the global pool
    pub const REQUEST_PERMITS: &str = "RPCRequestPermits";
    /// Release previously granted permits
    pub const RELEASE_PERMITS: &str = "RPCReleasePermits";
    /// Broker-originated quota revocation event
    pub const ON_QUOTA_UPDATE: &str = "RPCOnQuotaUpdate";
    /// Broker self-observed kernel metrics
    pub const GET_KERNEL_METRICS: &str = "RPCGetKernelMetrics";
}

/// Extract the method name from a broker-addressed payload.
pub fn method_of(payload: &Value) -> Option<&str> {
    payload.get("method").and_then(Value::as_str)
}

/// Build a broker call payload: `params` with `method` merged in.
///
/// # Example
///
/// ```rust
/// use procbus_wire::rpc::{self, method};
///
/// let payload = rpc::call(method::REQUEST_PERMITS, rpc::PermitParams {
///     provider_id: "etl-1".into(),
///     permit_count: 4,
/// }).unwrap();
///
/// assert_eq!(rpc::method_of(&payload), Some(method::REQUEST_PERMITS));
/// assert_eq!(payload["permit_count"], 4);
/// ```
pub fn call<P: Serialize>(method: &str, params: P) -> Result<Value, WireError> {
    let mut value = serde_json::to_value(params).map_err(|e| WireError::Encoding {
        encoding: "json",
        reason: e.to_string(),
    })?;
    if value.is_null() {
        value = Value::Object(serde_json::Map::new());
    }
    match value.as_object_mut() {
        Some(map) => {
            map.insert("method".to_string(), Value::String(method.to_string()));
            Ok(value)
        }
        None => Err(WireError::Encoding {
            encoding: "json",
            reason: "call params must serialize to an object".to_string(),
        }),
    }
}

/// Parameters for the four spawn methods.
///
/// `max_restarts` and `restart_delay_ms` are only meaningful for the
/// with-restart variants; the delay defaults to zero when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnParams {
    /// Caller-assigned child id
    pub id: String,
    /// Executable to run
    pub command: String,
    /// Arguments after the executable
    #[serde(default)]
    pub args: Vec<String>,
    /// Restart budget (-1 = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<i32>,
    /// Delay before each restart, milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_delay_ms: Option<u64>,
}

/// Response for the spawn methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnReply {
    /// The child id
    pub id: String,
    /// OS process id
    pub pid: u32,
    /// Lifecycle status string (`running`)
    pub status: String,
}

/// Parameters for RPCRequestPermits / RPCReleasePermits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitParams {
    /// Requesting provider id
    pub provider_id: String,
    /// Permits requested or released
    pub permit_count: u64,
}

/// Response for RPCRequestPermits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitGrantReply {
    /// Permits actually granted (partial grants are legal)
    pub granted: u64,
    /// Pool availability after the grant
    pub available: u64,
    /// Echoed provider id
    pub provider_id: String,
}

/// Response for RPCReleasePermits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitReleaseReply {
    /// Whether the release applied
    pub success: bool,
    /// Pool availability after the release
    pub available: u64,
    /// Echoed provider id
    pub provider_id: String,
}

/// Response for RPCGetMessageCount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCountReply {
    /// Total messages processed by the optimizer pipeline
    pub count: u64,
}

/// One statistics record, global or per-process. Timestamps are RFC3339.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsRecord {
    pub total_sent: u64,
    pub total_received: u64,
    pub request_count: u64,
    pub response_count: u64,
    pub event_count: u64,
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<String>,
}

/// Response for RPCGetMessageStats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatsReply {
    /// Aggregate over all traffic
    pub total: StatsRecord,
    /// Per-process records keyed by child id
    pub per_process: HashMap<String, StatsRecord>,
}

/// Broker self-observed metrics, returned by RPCGetKernelMetrics and
/// attached to quota-update events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelMetrics {
    /// 99th percentile routing latency, milliseconds
    pub p99_latency_ms: f64,
    /// Optimizer queue saturation, 0-100 %
    pub buffer_saturation: f64,
    /// Live optimizer workers
    pub active_workers: usize,
    /// Permit pool size
    pub total_permits: u64,
    /// Permits currently allocated
    pub allocated_permits: u64,
    /// Permits currently available
    pub available_permits: u64,
    /// Messages per second over the sliding window
    pub message_rate: f64,
    /// Errors per second over the sliding window
    pub error_rate: f64,
}

/// Payload of the RPCOnQuotaUpdate event broadcast to providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUpdate {
    /// Permits revoked from the receiving provider's pool view
    pub revoked_permits: u64,
    /// Human-readable breach description (thresholds and observed values)
    pub reason: String,
    /// Metrics snapshot that triggered the revocation
    pub kernel_metrics: KernelMetrics,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_merges_method_into_params() {
        let payload = call(
            method::SPAWN,
            SpawnParams {
                id: "w1".into(),
                command: "/bin/echo".into(),
                args: vec!["hi".into()],
                max_restarts: None,
                restart_delay_ms: None,
            },
        )
        .unwrap();

        assert_eq!(method_of(&payload), Some("RPCSpawn"));
        assert_eq!(payload["id"], "w1");
        assert_eq!(payload["command"], "/bin/echo");
        assert_eq!(payload["args"][0], "hi");
    }

    #[test]
    fn test_call_with_unit_params() {
        let payload = call(method::GET_KERNEL_METRICS, ()).unwrap();
        assert_eq!(method_of(&payload), Some("RPCGetKernelMetrics"));
    }

    #[test]
    fn test_call_rejects_non_object_params() {
        let result = call(method::SPAWN, 42u32);
        assert!(result.is_err());
    }

    #[test]
    fn test_method_of_missing() {
        assert_eq!(method_of(&serde_json::json!({})), None);
        assert_eq!(method_of(&serde_json::json!({"method": 3})), None);
    }

    #[test]
    fn test_spawn_params_optional_fields_default() {
        let params: SpawnParams =
            serde_json::from_value(serde_json::json!({"id": "w1", "command": "/bin/true"}))
                .unwrap();
        assert!(params.args.is_empty());
        assert_eq!(params.max_restarts, None);
        assert_eq!(params.restart_delay_ms, None);
    }

    #[test]
    fn test_quota_update_round_trip() {
        let update = QuotaUpdate {
            revoked_permits: 2,
            reason: "P99 latency 50.0ms over threshold 30.0ms".into(),
            kernel_metrics: KernelMetrics {
                p99_latency_ms: 50.0,
                buffer_saturation: 12.0,
                active_workers: 4,
                total_permits: 10,
                allocated_permits: 8,
                available_permits: 2,
                message_rate: 120.0,
                error_rate: 0.5,
            },
        };
        let value = serde_json::to_value(&update).unwrap();
        let back: QuotaUpdate = serde_json::from_value(value).unwrap();
        assert_eq!(back.revoked_permits, 2);
        assert_eq!(back.kernel_metrics, update.kernel_metrics);
    }
}
