//! The optimizer pipeline facade.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

// Layer 3: Internal module imports
use super::adapt::{AdaptiveTuner, LoadSnapshot, TuningProposal, TuningState};
use super::config::OptimizerConfig;
use super::conflict::AnalysisOptimizer;
use super::queue::IngressQueue;
use super::worker::{dispatch_loop, spawn_worker, BrokerHandler, PipelineShared, WorkerLane};
use crate::error::BrokerError;
use crate::metrics::MetricsCollector;
use crate::permits::{
    MetricsSource, PermitManager, PermitStats, QuotaNotifier, RevocationMonitor,
    RevocationThresholds,
};
use crate::router::Router;
use crate::stats::MessageStats;
use procbus_wire::{KernelMetrics, Message};

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerMetrics {
    /// Messages waiting in the ingress queue
    pub queue_len: usize,
    /// Ingress queue capacity
    pub queue_capacity: usize,
    /// Messages dropped by admission policies. Monotonic.
    pub dropped: u64,
    /// Messages refused by the reject policy. Monotonic.
    pub rejected: u64,
    /// Messages fully processed by workers
    pub processed: u64,
    /// Dispatch and routing failures
    pub routing_errors: u64,
    /// Live workers
    pub active_workers: usize,
    /// Batch size in effect
    pub batch_size: usize,
    /// Flush interval in effect
    pub flush_interval: Duration,
}

/// The optimizer: bounded ingress, target-hashed lane dispatch, pinned
/// batching workers, adaptive retuning, and the attachment points for the
/// broker's other subsystems.
///
/// Construction wires the queue and router; `start` captures the current
/// tokio runtime and launches the workers, the lane dispatcher, and the
/// system monitor. Subsystems (broker handler, metrics collector, permit
/// manager, conflict resolver) attach through setters before or after
/// `start`.
///
/// Implements cheap clone via an inner `Arc`; every clone drives the same
/// pipeline.
#[derive(Clone)]
pub struct Optimizer {
    inner: Arc<OptimizerInner>,
}

struct OptimizerInner {
    config: OptimizerConfig,
    shared: Arc<PipelineShared>,
    permits: RwLock<Option<Arc<PermitManager>>>,
    analysis: RwLock<Option<Arc<AnalysisOptimizer>>>,
    runtime: RwLock<Option<Handle>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    monitors: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    next_worker_id: AtomicUsize,
    lane_capacity: usize,
    lane_additions: mpsc::UnboundedSender<WorkerLane>,
    lane_intake: Mutex<Option<mpsc::UnboundedReceiver<WorkerLane>>>,
}

impl Optimizer {
    /// Create a stopped pipeline over `router`.
    pub fn new(config: OptimizerConfig, router: Arc<Router>) -> Result<Self, BrokerError> {
        config
            .validate()
            .map_err(|reason| BrokerError::InvalidArgument { reason })?;

        let collector = Arc::new(MetricsCollector::default());
        collector.set_queue_capacity(config.buffer_cap);

        let shared = Arc::new(PipelineShared {
            queue: Arc::new(IngressQueue::new(config.buffer_cap)),
            router,
            handler: RwLock::new(None),
            collector: RwLock::new(collector),
            stats: Arc::new(MessageStats::new()),
            tuning: TuningState::new(config.batch_size, config.flush_interval),
            processed: AtomicU64::new(0),
            routing_errors: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
        });

        let (shutdown, _) = watch::channel(false);
        let (lane_additions, lane_intake) = mpsc::unbounded_channel();
        let lane_capacity = (config.buffer_cap / config.num_workers).max(1);
        Ok(Self {
            inner: Arc::new(OptimizerInner {
                config,
                shared,
                permits: RwLock::new(None),
                analysis: RwLock::new(None),
                runtime: RwLock::new(None),
                workers: Mutex::new(Vec::new()),
                monitors: Mutex::new(Vec::new()),
                shutdown,
                next_worker_id: AtomicUsize::new(0),
                lane_capacity,
                lane_additions,
                lane_intake: Mutex::new(Some(lane_intake)),
            }),
        })
    }

    /// Attach the broker-method dispatch seam.
    pub fn set_broker_handler(&self, handler: Arc<dyn BrokerHandler>) {
        *self.inner.shared.handler.write() = Some(handler);
    }

    /// Swap in a shared metrics collector.
    pub fn set_metrics_collector(&self, collector: Arc<MetricsCollector>) {
        collector.set_queue_capacity(self.inner.config.buffer_cap);
        *self.inner.shared.collector.write() = collector;
    }

    /// Attach the permit manager used by kernel metrics and revocation.
    pub fn set_permit_manager(&self, permits: Arc<PermitManager>) {
        *self.inner.permits.write() = Some(permits);
    }

    /// Attach the service-conflict resolver.
    pub fn set_analysis_optimizer(&self, analysis: Arc<AnalysisOptimizer>) {
        *self.inner.analysis.write() = Some(analysis);
    }

    /// Launch workers, the lane dispatcher, and the system monitor on the
    /// current runtime.
    pub fn start(&self) -> Result<(), BrokerError> {
        let handle = Handle::try_current().map_err(|_| BrokerError::Unknown {
            reason: "optimizer must start inside a tokio runtime".to_string(),
        })?;
        *self.inner.runtime.write() = Some(handle);

        let Some(intake) = self.inner.lane_intake.lock().take() else {
            return Err(BrokerError::Unknown {
                reason: "optimizer already started".to_string(),
            });
        };

        let lanes = self.inner.spawn_workers(self.inner.config.num_workers);
        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner.shared),
            lanes,
            intake,
        ));
        self.inner.monitors.lock().push(dispatcher);

        self.spawn_system_monitor();
        info!(
            workers = self.inner.config.num_workers,
            buffer_cap = self.inner.config.buffer_cap,
            policy = %self.inner.config.offer_policy,
            "optimizer started"
        );
        Ok(())
    }

    /// Offer one message into the pipeline. Returns `true` if accepted.
    pub async fn offer(&self, msg: Message) -> bool {
        if let Err(field) = msg.validate() {
            warn!(field, "rejecting structurally invalid message at ingress");
            let collector = Arc::clone(&self.inner.shared.collector.read());
            collector.record_error();
            return false;
        }
        self.inner
            .shared
            .queue
            .offer(
                msg,
                self.inner.config.offer_policy,
                self.inner.config.offer_timeout,
            )
            .await
    }

    /// Current pipeline metrics.
    pub fn metrics(&self) -> OptimizerMetrics {
        let shared = &self.inner.shared;
        OptimizerMetrics {
            queue_len: shared.queue.len(),
            queue_capacity: shared.queue.capacity(),
            dropped: shared.queue.dropped(),
            rejected: shared.queue.rejected(),
            processed: shared.processed.load(Ordering::Relaxed),
            routing_errors: shared.routing_errors.load(Ordering::Relaxed),
            active_workers: self.active_workers(),
            batch_size: shared.tuning.batch_size(),
            flush_interval: shared.tuning.flush_interval(),
        }
    }

    /// Live worker count.
    pub fn active_workers(&self) -> usize {
        self.inner.shared.active_workers.load(Ordering::Relaxed)
    }

    /// The metrics collector currently attached.
    pub fn collector(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.inner.shared.collector.read())
    }

    /// The message statistics accumulator.
    pub fn stats(&self) -> Arc<MessageStats> {
        Arc::clone(&self.inner.shared.stats)
    }

    /// Start the conflict monitor if a resolver is attached.
    pub fn start_conflict_monitor(&self) -> bool {
        let Some(analysis) = self.inner.analysis.read().clone() else {
            warn!("conflict monitor requested with no analysis optimizer attached");
            return false;
        };
        let task = analysis.spawn_monitor(self.inner.shutdown.subscribe());
        self.inner.monitors.lock().push(task);
        true
    }

    /// Start the revocation monitor over the attached permit manager.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidArgument`] when no permit manager is
    /// attached.
    pub fn start_revocation_monitor<N>(
        &self,
        thresholds: RevocationThresholds,
        notifier: N,
    ) -> Result<(), BrokerError>
    where
        N: QuotaNotifier + 'static,
    {
        let Some(permits) = self.inner.permits.read().clone() else {
            return Err(BrokerError::InvalidArgument {
                reason: "revocation monitor requires a permit manager".to_string(),
            });
        };

        let source = PipelineMetricsSource {
            shared: Arc::clone(&self.inner.shared),
            permits: Arc::clone(&permits),
        };
        let monitor = RevocationMonitor::new(thresholds, permits, source, notifier);
        let task = monitor.spawn(self.inner.shutdown.subscribe());
        self.inner.monitors.lock().push(task);
        Ok(())
    }

    /// Stop the pipeline: close the queue, stop monitors, join workers.
    ///
    /// In-flight batches complete best-effort before worker threads exit.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.shared.queue.close();

        let monitors: Vec<_> = self.inner.monitors.lock().drain(..).collect();
        for task in monitors {
            let _ = task.await;
        }

        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
        info!("optimizer stopped");
    }

    fn spawn_system_monitor(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let stats_interval = self.inner.config.stats_interval;
        let adaptation_freq = self.inner.config.adaptation_freq;

        let task = tokio::spawn(async move {
            let tuner = AdaptiveTuner::new(num_cpus::get());
            let mut ticker = tokio::time::interval(stats_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_adapt = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = inner.sample();
                        if last_adapt.elapsed() >= adaptation_freq {
                            last_adapt = Instant::now();
                            let proposal = tuner.propose(&snapshot);
                            if !proposal.is_empty() {
                                inner.apply_proposal(proposal, &snapshot);
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.inner.monitors.lock().push(task);
    }
}

impl OptimizerInner {
    /// Start `count` worker threads and return their lanes.
    fn spawn_workers(&self, count: usize) -> Vec<WorkerLane> {
        let Some(handle) = self.runtime.read().clone() else {
            error!("cannot spawn workers before start");
            return Vec::new();
        };
        let mut workers = self.workers.lock();
        let mut lanes = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            match spawn_worker(id, self.lane_capacity, handle.clone(), Arc::clone(&self.shared)) {
                Ok((lane, join)) => {
                    workers.push(join);
                    lanes.push(lane);
                }
                Err(err) => error!(worker = id, error = %err, "failed to spawn worker thread"),
            }
        }
        lanes
    }

    /// Build the current load snapshot.
    fn sample(&self) -> LoadSnapshot {
        let collector = Arc::clone(&self.shared.collector.read());
        collector.update_buffer(self.shared.queue.len());

        let permit_stats = self
            .permits
            .read()
            .as_ref()
            .map(|p| p.stats())
            .unwrap_or(PermitStats {
                total: 0,
                allocated: 0,
                available: 0,
            });
        let active_workers = self.shared.active_workers.load(Ordering::Relaxed);
        let kernel = collector.kernel_metrics(
            active_workers,
            permit_stats.total,
            permit_stats.allocated,
            permit_stats.available,
        );

        LoadSnapshot {
            queue_len: self.shared.queue.len(),
            queue_capacity: self.shared.queue.capacity(),
            saturation: kernel.buffer_saturation,
            message_rate: kernel.message_rate,
            error_rate: kernel.error_rate,
            active_workers,
            batch_size: self.shared.tuning.batch_size(),
            flush_interval: self.shared.tuning.flush_interval(),
        }
    }

    /// Apply one tuning proposal under the live-change rules.
    fn apply_proposal(&self, proposal: TuningProposal, snapshot: &LoadSnapshot) {
        if let Some(workers) = proposal.num_workers {
            if workers > snapshot.active_workers {
                info!(from = snapshot.active_workers, to = workers, "scaling workers up");
                // New lanes reach the dispatcher, which folds them in
                // only once every existing lane is idle, so per-target
                // ordering survives the re-hash.
                for lane in self.spawn_workers(workers - snapshot.active_workers) {
                    if self.lane_additions.send(lane).is_err() {
                        warn!("dispatcher gone; new worker lane dropped");
                    }
                }
            } else if workers < snapshot.active_workers {
                // Workers are never torn down under load.
                info!(
                    from = snapshot.active_workers,
                    to = workers,
                    "worker decrease advisory only"
                );
            }
        }
        if let Some(batch_size) = proposal.batch_size {
            info!(from = snapshot.batch_size, to = batch_size, "batch size retuned");
            self.shared.tuning.set_batch_size(batch_size);
        }
        if let Some(flush) = proposal.flush_interval {
            info!(?flush, "flush interval retuned");
            self.shared.tuning.set_flush_interval(flush);
        }
        if let Some(buffer_cap) = proposal.buffer_cap {
            // The backing queue is not recreated; in-flight messages stay
            // where they are.
            info!(
                current = snapshot.queue_capacity,
                recommended = buffer_cap,
                "buffer capacity recommendation (advisory)"
            );
        }
    }
}

/// Kernel-metrics source backed by the live pipeline.
struct PipelineMetricsSource {
    shared: Arc<PipelineShared>,
    permits: Arc<PermitManager>,
}

impl MetricsSource for PipelineMetricsSource {
    fn kernel_metrics(&self) -> KernelMetrics {
        let collector = Arc::clone(&self.shared.collector.read());
        collector.update_buffer(self.shared.queue.len());
        let stats = self.permits.stats();
        collector.kernel_metrics(
            self.shared.active_workers.load(Ordering::Relaxed),
            stats.total,
            stats.allocated,
            stats.available,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::optimizer::config::OfferPolicy;
    use crate::router::mailbox;
    use serde_json::Value;

    fn test_config() -> OptimizerConfig {
        OptimizerConfig::builder()
            .with_buffer_cap(64)
            .with_num_workers(1)
            .with_batch_size(4)
            .with_flush_interval(Duration::from_millis(1))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_route_and_stop() {
        let router = Arc::new(Router::new());
        let (sender, mut mb) = mailbox("w2", 64);
        router.register_route("w2", sender).unwrap();

        let optimizer = Optimizer::new(test_config(), router).unwrap();
        optimizer.start().unwrap();

        assert!(optimizer.offer(Message::event("e1", "w1", "w2", Value::Null)).await);
        assert_eq!(mb.recv().await.unwrap().id, "e1");

        optimizer.stop().await;
        assert_eq!(optimizer.active_workers(), 0);
        // Post-stop offers are refused.
        assert!(!optimizer.offer(Message::event("e2", "w1", "w2", Value::Null)).await);
    }

    #[tokio::test]
    async fn test_invalid_message_rejected_at_ingress() {
        let router = Arc::new(Router::new());
        let optimizer = Optimizer::new(test_config(), router).unwrap();

        let mut msg = Message::event("e1", "w1", "w2", Value::Null);
        msg.source = String::new();
        assert!(!optimizer.offer(msg).await);
    }

    #[tokio::test]
    async fn test_metrics_reflect_configuration() {
        let router = Arc::new(Router::new());
        let optimizer = Optimizer::new(test_config(), router).unwrap();

        let metrics = optimizer.metrics();
        assert_eq!(metrics.queue_capacity, 64);
        assert_eq!(metrics.batch_size, 4);
        assert_eq!(metrics.processed, 0);
    }

    #[tokio::test]
    async fn test_drop_oldest_end_to_end() {
        let config = OptimizerConfig::builder()
            .with_buffer_cap(2)
            .with_num_workers(1)
            .with_offer_policy(OfferPolicy::DropOldest)
            .build()
            .unwrap();

        let router = Arc::new(Router::new());
        let (sender, mut mb) = mailbox("w2", 8);
        router.register_route("w2", sender).unwrap();

        let optimizer = Optimizer::new(config, router).unwrap();

        // Fill before workers exist, so the eviction is deterministic.
        assert!(optimizer.offer(Message::event("m1", "w1", "w2", Value::Null)).await);
        assert!(optimizer.offer(Message::event("m2", "w1", "w2", Value::Null)).await);
        assert!(optimizer.offer(Message::event("m3", "w1", "w2", Value::Null)).await);
        assert_eq!(optimizer.metrics().dropped, 1);

        optimizer.start().unwrap();
        assert_eq!(mb.recv().await.unwrap().id, "m2");
        assert_eq!(mb.recv().await.unwrap().id, "m3");
        optimizer.stop().await;
    }

    #[tokio::test]
    async fn test_revocation_monitor_requires_permits() {
        let router = Arc::new(Router::new());
        let optimizer = Optimizer::new(test_config(), router).unwrap();

        struct NullNotifier;
        #[async_trait::async_trait]
        impl QuotaNotifier for NullNotifier {
            async fn notify_quota_update(
                &self,
                _provider_id: &str,
                _update: procbus_wire::rpc::QuotaUpdate,
            ) -> Result<(), BrokerError> {
                Ok(())
            }
        }

        let err = optimizer
            .start_revocation_monitor(RevocationThresholds::default(), NullNotifier)
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument { .. }));
    }
}
