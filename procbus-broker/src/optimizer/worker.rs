//! Pinned worker threads, target-hashed lane dispatch, and per-message
//! processing.

// Layer 1: Standard library imports
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

// Layer 3: Internal module imports
use super::adapt::TuningState;
use super::queue::IngressQueue;
use crate::metrics::MetricsCollector;
use crate::router::Router;
use crate::stats::MessageStats;
use procbus_wire::{Message, BROKER_TARGET};

/// Dispatch seam for broker-addressed messages.
///
/// The broker facade implements this over its method table. Requests
/// return a response message that the worker hands back to the router;
/// events and completions return `None`.
#[async_trait]
pub trait BrokerHandler: Send + Sync {
    /// Handle one message addressed to the broker.
    async fn process_broker_message(&self, msg: Message) -> Option<Message>;
}

/// State shared between the optimizer facade and every worker thread.
pub(crate) struct PipelineShared {
    pub queue: Arc<IngressQueue>,
    pub router: Arc<Router>,
    pub handler: RwLock<Option<Arc<dyn BrokerHandler>>>,
    pub collector: RwLock<Arc<MetricsCollector>>,
    pub stats: Arc<MessageStats>,
    pub tuning: TuningState,
    pub processed: AtomicU64,
    pub routing_errors: AtomicU64,
    pub active_workers: AtomicUsize,
}

/// Sending side of one worker's feed.
///
/// Every target hashes onto exactly one lane and each lane is consumed by
/// exactly one worker, so messages for one target are processed in
/// dispatch order no matter how many workers run.
pub(crate) struct WorkerLane {
    sender: mpsc::Sender<Message>,
    depth: Arc<AtomicUsize>,
}

impl WorkerLane {
    /// Returns `true` when nothing dispatched to this lane is still
    /// queued or being processed.
    fn is_idle(&self) -> bool {
        self.depth.load(Ordering::Acquire) == 0
    }
}

/// Pick the lane for `target`.
fn lane_for(target: &str, lane_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    (hasher.finish() % lane_count as u64) as usize
}

/// Fan the ingress queue out to worker lanes by target hash.
///
/// The dispatcher is the queue's only consumer, so ingress order is kept
/// per target all the way into a lane. Lanes added by worker scale-ups
/// are applied only while every existing lane is idle: re-hashing with
/// messages still in flight could move a target to another worker and
/// reorder it.
pub(crate) async fn dispatch_loop(
    shared: Arc<PipelineShared>,
    mut lanes: Vec<WorkerLane>,
    mut additions: mpsc::UnboundedReceiver<WorkerLane>,
) {
    let mut pending: Vec<WorkerLane> = Vec::new();
    debug!(lanes = lanes.len(), "dispatcher started");

    loop {
        while let Ok(lane) = additions.try_recv() {
            pending.push(lane);
        }
        if !pending.is_empty() && lanes.iter().all(WorkerLane::is_idle) {
            debug!(
                from = lanes.len(),
                to = lanes.len() + pending.len(),
                "worker lane set grown"
            );
            lanes.append(&mut pending);
        }

        let Some(msg) = shared.queue.pop().await else {
            break;
        };

        if lanes.is_empty() {
            lanes.append(&mut pending);
        }
        if lanes.is_empty() {
            warn!("no worker lanes available; message dropped");
            shared.routing_errors.fetch_add(1, Ordering::Relaxed);
            let collector = Arc::clone(&shared.collector.read());
            collector.record_error();
            continue;
        }

        let lane = &lanes[lane_for(&msg.target, lanes.len())];
        lane.depth.fetch_add(1, Ordering::Relaxed);
        if lane.sender.send(msg).await.is_err() {
            // The worker thread died; its lane drains nowhere.
            lane.depth.fetch_sub(1, Ordering::Release);
            shared.routing_errors.fetch_add(1, Ordering::Relaxed);
            let collector = Arc::clone(&shared.collector.read());
            collector.record_error();
        }
    }

    debug!("dispatcher stopped");
    // Dropping the lanes closes every worker's receiver.
}

/// Start one worker on its own OS thread, returning its lane.
///
/// The thread pins itself to core `worker_id mod num_cores` and requests
/// real-time I/O priority, both best-effort; it then drives the async
/// worker loop on the captured runtime handle.
pub(crate) fn spawn_worker(
    worker_id: usize,
    lane_capacity: usize,
    handle: Handle,
    shared: Arc<PipelineShared>,
) -> io::Result<(WorkerLane, std::thread::JoinHandle<()>)> {
    let (sender, receiver) = mpsc::channel(lane_capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));
    let lane = WorkerLane {
        sender,
        depth: Arc::clone(&depth),
    };

    let join = std::thread::Builder::new()
        .name(format!("procbus-worker-{worker_id}"))
        .spawn(move || {
            pin_to_core(worker_id);
            request_rt_io_priority();
            shared.active_workers.fetch_add(1, Ordering::Relaxed);
            handle.block_on(worker_loop(worker_id, Arc::clone(&shared), receiver, depth));
            shared.active_workers.fetch_sub(1, Ordering::Relaxed);
        })?;
    Ok((lane, join))
}

/// Bind the current thread to one core, chosen by worker id.
fn pin_to_core(worker_id: usize) {
    static PIN_UNAVAILABLE: Once = Once::new();
    match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => {
            let core = cores[worker_id % cores.len()];
            if !core_affinity::set_for_current(core) {
                PIN_UNAVAILABLE
                    .call_once(|| warn!("CPU pinning unavailable; workers run unpinned"));
            }
        }
        _ => {
            PIN_UNAVAILABLE.call_once(|| warn!("no core ids reported; workers run unpinned"));
        }
    }
}

/// Request the real-time I/O scheduling class for this thread.
#[cfg(target_os = "linux")]
fn request_rt_io_priority() {
    static IOPRIO_UNAVAILABLE: Once = Once::new();
    const IOPRIO_WHO_PROCESS: libc::c_int = 1;
    const IOPRIO_CLASS_RT: libc::c_int = 1;
    const IOPRIO_CLASS_SHIFT: u32 = 13;

    let ioprio = IOPRIO_CLASS_RT << IOPRIO_CLASS_SHIFT;
    // SAFETY: value-only syscall; no pointers cross the boundary.
    let rc = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio) };
    if rc < 0 {
        IOPRIO_UNAVAILABLE
            .call_once(|| warn!("real-time I/O priority unavailable; continuing without it"));
    }
}

#[cfg(not(target_os = "linux"))]
fn request_rt_io_priority() {}

/// One worker's drain loop: receive from its lane, gather a batch,
/// process in order.
async fn worker_loop(
    worker_id: usize,
    shared: Arc<PipelineShared>,
    mut lane: mpsc::Receiver<Message>,
    depth: Arc<AtomicUsize>,
) {
    debug!(worker = worker_id, "worker started");
    loop {
        let Some(first) = lane.recv().await else {
            break;
        };

        let batch_size = shared.tuning.batch_size();
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);

        if batch_size > 1 {
            // Gather until the batch fills, the lane empties, or the
            // flush window closes - whichever comes first.
            let deadline = Instant::now() + shared.tuning.flush_interval();
            while batch.len() < batch_size && Instant::now() < deadline {
                match lane.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }
        }

        for msg in batch {
            process_message(worker_id, &shared, msg).await;
            depth.fetch_sub(1, Ordering::Release);
        }

        let collector = Arc::clone(&shared.collector.read());
        collector.update_buffer(shared.queue.len());
    }
    debug!(worker = worker_id, "worker stopped");
}

/// Dispatch one message and record its metrics.
async fn process_message(worker_id: usize, shared: &Arc<PipelineShared>, msg: Message) {
    let latency = (Utc::now() - msg.timestamp).to_std().unwrap_or_default();
    let collector = Arc::clone(&shared.collector.read());
    let source = msg.source.clone();

    shared.stats.record(&msg);

    if msg.is_broker_target() {
        let handler = shared.handler.read().clone();
        match handler {
            Some(handler) => {
                let dispatch = AssertUnwindSafe(handler.process_broker_message(msg)).catch_unwind();
                match dispatch.await {
                    Ok(Some(reply)) => {
                        // Hand the reply back toward the requester; a dead
                        // or congested requester costs a counter, not the
                        // worker.
                        shared.stats.record(&reply);
                        if shared.router.route(reply, BROKER_TARGET).is_delivered() {
                            collector.record_message();
                        } else {
                            shared.routing_errors.fetch_add(1, Ordering::Relaxed);
                            collector.record_error();
                        }
                    }
                    Ok(None) => collector.record_message(),
                    Err(_) => {
                        error!(worker = worker_id, source = %source, "broker handler panicked");
                        shared.routing_errors.fetch_add(1, Ordering::Relaxed);
                        collector.record_error();
                    }
                }
            }
            None => {
                warn!(source = %source, "broker message dropped: no handler attached");
                shared.routing_errors.fetch_add(1, Ordering::Relaxed);
                collector.record_error();
            }
        }
    } else if shared.router.route(msg, &source).is_delivered() {
        collector.record_message();
    } else {
        shared.routing_errors.fetch_add(1, Ordering::Relaxed);
        collector.record_error();
    }

    collector.record_latency(latency);
    shared.processed.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::optimizer::config::OfferPolicy;
    use crate::router::mailbox;
    use serde_json::Value;
    use std::time::Duration;

    fn shared_fixture(queue_cap: usize, batch: usize) -> Arc<PipelineShared> {
        Arc::new(PipelineShared {
            queue: Arc::new(IngressQueue::new(queue_cap)),
            router: Arc::new(Router::new()),
            handler: RwLock::new(None),
            collector: RwLock::new(Arc::new(MetricsCollector::default())),
            stats: Arc::new(MessageStats::new()),
            tuning: TuningState::new(batch, Duration::from_millis(2)),
            processed: AtomicU64::new(0),
            routing_errors: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
        })
    }

    /// Boot `count` workers plus the dispatcher over `shared`.
    fn start_pipeline(
        shared: &Arc<PipelineShared>,
        count: usize,
    ) -> (Vec<std::thread::JoinHandle<()>>, tokio::task::JoinHandle<()>) {
        let mut joins = Vec::new();
        let mut lanes = Vec::new();
        for id in 0..count {
            let (lane, join) =
                spawn_worker(id, 64, Handle::current(), Arc::clone(shared)).unwrap();
            lanes.push(lane);
            joins.push(join);
        }
        let (_additions, intake) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(shared), lanes, intake));
        (joins, dispatcher)
    }

    async fn stop_pipeline(
        shared: &Arc<PipelineShared>,
        workers: Vec<std::thread::JoinHandle<()>>,
        dispatcher: tokio::task::JoinHandle<()>,
    ) {
        shared.queue.close();
        dispatcher.await.unwrap();
        for worker in workers {
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .unwrap()
                .unwrap();
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl BrokerHandler for EchoHandler {
        async fn process_broker_message(&self, msg: Message) -> Option<Message> {
            Some(Message::response_to(&msg, BROKER_TARGET, Value::Null))
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl BrokerHandler for PanicHandler {
        async fn process_broker_message(&self, _msg: Message) -> Option<Message> {
            panic!("handler exploded");
        }
    }

    #[test]
    fn test_lane_assignment_stable_per_target() {
        for lane_count in [1usize, 2, 4, 8] {
            let first = lane_for("worker-1", lane_count);
            assert!(first < lane_count);
            // The same target always lands on the same lane.
            assert_eq!(lane_for("worker-1", lane_count), first);
        }
        assert_eq!(lane_for("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_routes_non_broker_messages() {
        let shared = shared_fixture(8, 1);
        let (sender, mut mb) = mailbox("w2", 8);
        shared.router.register_route("w2", sender).unwrap();

        process_message(0, &shared, Message::event("e1", "w1", "w2", Value::Null)).await;

        assert_eq!(mb.recv().await.unwrap().id, "e1");
        assert_eq!(shared.processed.load(Ordering::Relaxed), 1);
        assert_eq!(shared.routing_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_missing_route_counts_error() {
        let shared = shared_fixture(8, 1);
        process_message(0, &shared, Message::event("e1", "w1", "ghost", Value::Null)).await;
        assert_eq!(shared.routing_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_broker_reply_reenters_router() {
        let shared = shared_fixture(8, 1);
        *shared.handler.write() = Some(Arc::new(EchoHandler));
        let (sender, mut mb) = mailbox("w1", 8);
        shared.router.register_route("w1", sender).unwrap();

        let request = Message::request("r1", "w1", BROKER_TARGET, Value::Null);
        process_message(0, &shared, request).await;

        let reply = mb.recv().await.unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let shared = shared_fixture(8, 1);
        *shared.handler.write() = Some(Arc::new(PanicHandler));

        let request = Message::request("r1", "w1", BROKER_TARGET, Value::Null);
        process_message(0, &shared, request).await;

        assert_eq!(shared.routing_errors.load(Ordering::Relaxed), 1);
        assert_eq!(shared.processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_worker_thread_drains_and_exits_on_close() {
        let shared = shared_fixture(64, 4);
        let (sender, mut mb) = mailbox("w2", 64);
        shared.router.register_route("w2", sender).unwrap();

        for i in 0..20 {
            assert!(
                shared
                    .queue
                    .offer(
                        Message::event(format!("m{i}"), "w1", "w2", Value::Null),
                        OfferPolicy::Drop,
                        Duration::ZERO,
                    )
                    .await
            );
        }

        let (workers, dispatcher) = start_pipeline(&shared, 1);

        let mut received = Vec::new();
        while received.len() < 20 {
            received.push(mb.recv().await.unwrap().id);
        }
        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(received, expected);

        stop_pipeline(&shared, workers, dispatcher).await;
        assert_eq!(shared.active_workers.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_per_target_fifo_with_multiple_workers() {
        let shared = shared_fixture(2048, 4);
        let targets = ["sink-a", "sink-b", "sink-c", "sink-d"];
        let mut mailboxes = Vec::new();
        for target in targets {
            let (sender, mb) = mailbox(target, 512);
            shared.router.register_route(target, sender).unwrap();
            mailboxes.push(mb);
        }

        // Queue a full interleaved burst before any worker runs, so all
        // four workers contend for it at once.
        for i in 0..400 {
            let target = targets[i % targets.len()];
            let msg = Message::event(
                format!("{target}-{}", i / targets.len()),
                "src",
                target,
                Value::Null,
            );
            assert!(shared.queue.offer(msg, OfferPolicy::Drop, Duration::ZERO).await);
        }

        let (workers, dispatcher) = start_pipeline(&shared, 4);

        for (target, mut mb) in targets.iter().zip(mailboxes) {
            for n in 0..100 {
                let got = mb.recv().await.unwrap();
                assert_eq!(
                    got.id,
                    format!("{target}-{n}"),
                    "per-target FIFO violated on {target}"
                );
            }
        }

        stop_pipeline(&shared, workers, dispatcher).await;
        assert_eq!(shared.processed.load(Ordering::Relaxed), 400);
    }
}
