//! Prelude module for convenient imports.
//!
//! Re-exports the types most embedders touch when running a broker:
//!
//! ```rust
//! use procbus_broker::prelude::*;
//! ```
//!
//! # What's Included
//!
//! ## Facade
//! - [`Broker`] - the assembled daemon core
//! - [`BrokerConfig`] - every tuning knob
//! - [`BrokerError`] - all failure modes
//!
//! ## Pipeline
//! - [`Optimizer`] / [`OptimizerConfig`] / [`OfferPolicy`]
//! - [`AnalysisOptimizer`] / [`ResolutionPolicy`]
//!
//! ## Permits
//! - [`PermitManager`] / [`PermitStats`] / [`RevocationThresholds`]
//!
//! ## Supervision and routing
//! - [`Supervisor`] / [`ProcessDescriptor`] / [`ProcessStatus`]
//! - [`Router`] / [`RouteOutcome`]
//!
//! ## Wire model
//! - [`Message`] / [`MessageKind`] / [`KernelMetrics`]

pub use crate::error::BrokerError;
pub use crate::metrics::MetricsCollector;
pub use crate::optimizer::{
    AnalysisOptimizer, OfferPolicy, Optimizer, OptimizerConfig, ResolutionPolicy,
};
pub use crate::permits::{PermitManager, PermitStats, RevocationThresholds};
pub use crate::router::{RouteOutcome, Router};
pub use crate::stats::MessageStats;
pub use crate::supervisor::{ProcessDescriptor, ProcessStatus, Supervisor};
pub use crate::system::{Broker, BrokerConfig};

pub use procbus_wire::{KernelMetrics, Message, MessageKind, BROKER_TARGET};
