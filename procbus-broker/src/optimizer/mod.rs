//! The message optimizer pipeline - the broker's hottest path.
//!
//! Ingress readers offer every child-originated message into one bounded
//! FIFO queue governed by an admission policy. A dispatcher fans the
//! queue out to per-worker lanes selected by target hash, so messages for
//! one target always flow through one worker and keep their order at any
//! pool size. Each worker, pinned to its own OS thread and bound to a CPU
//! core best-effort, drains its lane in batches and dispatches each
//! message: broker-addressed messages go to the facade's method table,
//! everything else goes through the router to its target mailbox.
//!
//! A system-monitor task samples load every `stats_interval` and, at most
//! once per `adaptation_freq`, consults the adaptive tuner. Worker-count
//! increases, batch size, and flush interval apply live; buffer capacity
//! changes and worker-count decreases are advisory and only logged.
//!
//! # Components
//!
//! - [`OptimizerConfig`] / [`OfferPolicy`] - tuning knobs and admission rules
//! - [`IngressQueue`] - the bounded FIFO with five admission policies
//! - [`Optimizer`] - the pipeline facade: offer, metrics, stop, monitors
//! - [`AnalysisOptimizer`] - optional service-conflict resolver
//! - [`AdaptiveTuner`] - load-driven retuning proposals

pub mod adapt;
pub mod config;
pub mod conflict;
pub mod queue;
pub mod worker;

#[allow(clippy::module_inception)]
pub mod optimizer;

pub use adapt::{AdaptiveTuner, LoadSnapshot, TuningProposal};
pub use config::{OfferPolicy, OptimizerConfig};
pub use conflict::{
    AnalysisOptimizer, Conflict, ResolutionPolicy, ServiceClass, ServiceLimits, ServicePriority,
};
pub use optimizer::{Optimizer, OptimizerMetrics};
pub use queue::IngressQueue;
pub use worker::BrokerHandler;
