//! Global worker-permit pool and the revocation controller.
//!
//! Providers (children) request permits before consuming concurrency
//! capacity and release them on completion or when a quota-update event
//! tells them to. The revocation monitor watches the broker's kernel
//! metrics and, after consecutive threshold breaches, claws back a
//! proportional share of allocated permits and broadcasts the update to
//! every registered provider.
//!
//! # Components
//!
//! - [`PermitManager`] - the ledger: request, release, proportional revoke
//! - [`RevocationMonitor`] - breach detection with anti-flapping
//! - [`MetricsSource`] / [`QuotaNotifier`] - injection seams for metrics
//!   and the broadcast path

pub mod manager;
pub mod revocation;

pub use manager::{GrantOutcome, PermitManager, PermitStats, ReleaseOutcome};
pub use revocation::{
    MetricsSource, QuotaNotifier, RevocationMonitor, RevocationReport, RevocationThresholds,
};
