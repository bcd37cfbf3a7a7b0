//! Broker self-observation: rolling latency window, queue gauges, and
//! sliding message/error rates.
//!
//! The collector feeds two consumers: `RPCGetKernelMetrics` responses and
//! the revocation monitor's breach detection. All operations are safe under
//! parallel callers; readers see per-field-consistent snapshots (cross-field
//! coherence is not promised).

pub mod collector;

pub use collector::{MetricsCollector, DEFAULT_LATENCY_WINDOW};
