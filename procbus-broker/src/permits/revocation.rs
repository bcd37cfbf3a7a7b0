//! Kernel-metric breach detection and permit revocation.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

// Layer 3: Internal module imports
use super::manager::PermitManager;
use crate::error::BrokerError;
use procbus_wire::rpc::QuotaUpdate;
use procbus_wire::KernelMetrics;

/// Breach thresholds and cadence for the revocation monitor.
#[derive(Debug, Clone, Copy)]
pub struct RevocationThresholds {
    /// P99 routing latency ceiling, milliseconds
    pub p99_latency_ms: f64,
    /// Queue saturation ceiling, percent
    pub buffer_saturation: f64,
    /// Time between metric checks
    pub check_interval: Duration,
    /// Consecutive breaches required before acting
    pub consecutive_breaches: u32,
    /// Fraction of allocated permits revoked per action
    pub revoke_pct: f64,
}

impl Default for RevocationThresholds {
    fn default() -> Self {
        Self {
            p99_latency_ms: 30.0,
            buffer_saturation: 80.0,
            check_interval: Duration::from_secs(5),
            consecutive_breaches: 2,
            revoke_pct: 0.20,
        }
    }
}

/// Where the monitor reads kernel metrics from.
///
/// The broker facade implements this over its metrics collector; tests
/// inject scripted sources.
pub trait MetricsSource: Send + Sync {
    /// Current kernel-metrics snapshot.
    fn kernel_metrics(&self) -> KernelMetrics;
}

/// How quota-update events reach providers.
///
/// The broker facade implements this over the router. A failure to reach
/// one provider is logged and never aborts the broadcast.
#[async_trait]
pub trait QuotaNotifier: Send + Sync {
    /// Deliver one quota update to one provider.
    async fn notify_quota_update(
        &self,
        provider_id: &str,
        update: QuotaUpdate,
    ) -> Result<(), BrokerError>;
}

/// Outcome of one revocation action.
#[derive(Debug, Clone)]
pub struct RevocationReport {
    /// Permits removed per provider
    pub revoked: HashMap<String, u64>,
    /// Breach description broadcast with the event
    pub reason: String,
    /// Metrics snapshot that triggered the action
    pub metrics: KernelMetrics,
}

/// Periodic breach monitor with anti-flapping.
///
/// Requires `consecutive_breaches` back-to-back breach observations before
/// revoking `ceil(allocated * revoke_pct)` permits (minimum one when any
/// are allocated), then broadcasts one quota-update event to every
/// registered provider and resets the breach counter. A healthy tick also
/// resets the counter.
pub struct RevocationMonitor<S: MetricsSource, N: QuotaNotifier> {
    thresholds: RevocationThresholds,
    permits: Arc<PermitManager>,
    source: S,
    notifier: N,
    breach_streak: u32,
}

impl<S: MetricsSource, N: QuotaNotifier> RevocationMonitor<S, N> {
    /// Create a monitor over `permits`, reading from `source` and
    /// broadcasting through `notifier`.
    pub fn new(
        thresholds: RevocationThresholds,
        permits: Arc<PermitManager>,
        source: S,
        notifier: N,
    ) -> Self {
        Self {
            thresholds,
            permits,
            source,
            notifier,
            breach_streak: 0,
        }
    }

    /// Describe every threshold the snapshot breaches, or `None`.
    fn breach_reason(&self, metrics: &KernelMetrics) -> Option<String> {
        let mut parts = Vec::new();
        if metrics.p99_latency_ms > self.thresholds.p99_latency_ms {
            parts.push(format!(
                "P99 latency {:.1}ms over threshold {:.1}ms",
                metrics.p99_latency_ms, self.thresholds.p99_latency_ms
            ));
        }
        if metrics.buffer_saturation > self.thresholds.buffer_saturation {
            parts.push(format!(
                "buffer saturation {:.1}% over threshold {:.1}%",
                metrics.buffer_saturation, self.thresholds.buffer_saturation
            ));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }

    /// Observe one metrics snapshot and act when the streak is reached.
    ///
    /// Exposed for deterministic tests; the spawned loop calls this every
    /// `check_interval`.
    pub async fn tick(&mut self) -> Option<RevocationReport> {
        let metrics = self.source.kernel_metrics();

        let Some(reason) = self.breach_reason(&metrics) else {
            self.breach_streak = 0;
            return None;
        };

        self.breach_streak = self.breach_streak.saturating_add(1);
        warn!(streak = self.breach_streak, reason = %reason, "kernel metrics breach");
        if self.breach_streak < self.thresholds.consecutive_breaches {
            return None;
        }

        let allocated = self.permits.stats().allocated;
        if allocated == 0 {
            // Nothing to claw back yet; stay armed for when permits appear.
            return None;
        }

        let count = ((allocated as f64 * self.thresholds.revoke_pct).ceil() as u64).max(1);

        // Snapshot recipients before the ledger shrinks: fully revoked
        // providers still get the event.
        let recipients = self.permits.providers();
        let revoked = self.permits.revoke(count);
        self.breach_streak = 0;

        info!(count, reason = %reason, "permits revoked after sustained breach");
        for provider in &recipients {
            let update = QuotaUpdate {
                revoked_permits: revoked.get(provider).copied().unwrap_or(0),
                reason: reason.clone(),
                kernel_metrics: metrics.clone(),
            };
            if let Err(err) = self.notifier.notify_quota_update(provider, update).await {
                warn!(provider = %provider, error = %err, "quota update delivery failed");
            }
        }

        Some(RevocationReport {
            revoked,
            reason,
            metrics,
        })
    }

    /// Run the monitor until `shutdown` observes `true`.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()>
    where
        S: 'static,
        N: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.thresholds.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the initial
            // check happens one full interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
