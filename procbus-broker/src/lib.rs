//! # procbus-broker - Process-Supervising Message Broker Core
//!
//! Central daemon core that spawns and supervises a fleet of child
//! subprocesses, routes correlated request/response/event messages between
//! them over dedicated per-child descriptor channels, runs an adaptive
//! batching optimizer over a bounded ingress queue, and enforces a global
//! worker-permit quota that is revoked automatically when self-observed
//! kernel metrics breach their thresholds.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use procbus_broker::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BrokerError> {
//!     let broker = Broker::start(BrokerConfig::default())?;
//!
//!     // Spawn a supervised child with RPC handles wired at slots 3/4.
//!     let descriptor = broker.spawn_rpc("worker-1", "/usr/bin/worker", &[])?;
//!     println!("spawned pid {}", descriptor.pid);
//!
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! Data flows in one direction through four subsystems:
//!
//! ```text
//! child stdout-side handle
//!        │ framed Message
//!        ▼
//! Supervisor reader ──▶ Optimizer ingress queue ──▶ lane dispatcher
//!                                                        │ hash(target)
//!                                                        ▼
//!                                                 pinned worker batch
//!                                                        │
//!                         ┌──────────────────────────────┤
//!                         ▼                              ▼
//!                broker method dispatch          Router → per-target Mailbox
//!                         │                              │
//!                         ▼                              ▼
//!                response Message               Supervisor writer → child
//! ```
//!
//! The permit manager sits beside this path: providers request permits over
//! RPC, and the revocation monitor claws a share back whenever P99 routing
//! latency or queue saturation stays over threshold for consecutive checks.
//!
//! # Module Organization
//!
//! - [`router`] - Per-target mailboxes, wait-free route lookup, correlation
//! - [`supervisor`] - Child lifecycle, restart budgets, RPC handle wiring
//! - [`optimizer`] - Bounded ingress queue, admission policies, pinned
//!   batching workers, adaptive retuning, service-conflict resolution
//! - [`permits`] - Global permit ledger and the revocation monitor
//! - [`metrics`] - Rolling latency window, queue gauges, sliding rates
//! - [`stats`] - Global and per-process message statistics
//! - [`system`] - Broker facade, configuration, RPC method dispatch

pub mod error;
pub mod metrics;
pub mod optimizer;
pub mod permits;
pub mod prelude;
pub mod router;
pub mod stats;
pub mod supervisor;
pub mod system;

// Re-export commonly used types
pub use error::BrokerError;
pub use metrics::MetricsCollector;
pub use optimizer::{
    AnalysisOptimizer, BrokerHandler, OfferPolicy, Optimizer, OptimizerConfig, ResolutionPolicy,
    ServiceClass, ServicePriority,
};
pub use permits::{PermitManager, PermitStats, RevocationMonitor, RevocationThresholds};
pub use router::{CompleteResult, CorrelationOutcome, CorrelationTable, RouteOutcome, Router};
pub use stats::MessageStats;
pub use supervisor::{ProcessDescriptor, ProcessStatus, RestartConfig, Supervisor};
pub use system::{Broker, BrokerConfig};
