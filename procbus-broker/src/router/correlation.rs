//! Correlation-id generation and pending-request tracking.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

// Layer 3: Internal module imports
use procbus_wire::Message;

/// Terminal signal delivered to a pending request's sink.
#[derive(Debug)]
pub enum CorrelationOutcome {
    /// The correlated response arrived before the deadline
    Response(Message),
    /// The deadline elapsed first
    Timeout,
    /// The broker shut down while the request was pending
    Canceled,
}

/// Result of a completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteResult {
    /// The sink was signaled with the response
    Completed,
    /// No pending entry for the id (never registered, or already completed)
    Unknown,
    /// The entry's deadline had already elapsed; the sink got `Timeout`
    Expired,
}

struct PendingEntry {
    requester: String,
    deadline: Instant,
    sink: oneshot::Sender<CorrelationOutcome>,
}

/// Pending-request table with deadline sweeping.
///
/// Correlation ids combine a per-process random seed with a monotonic
/// counter, so concurrent generators never collide for the broker's
/// lifetime. Delivery to a sink is single-shot: completing the same id
/// twice returns [`CompleteResult::Unknown`] the second time and the sink
/// is not re-signaled.
///
/// # Example
///
/// ```rust
/// use procbus_broker::router::CorrelationTable;
///
/// let table = CorrelationTable::new();
/// let a = table.next_correlation_id();
/// let b = table.next_correlation_id();
/// assert_ne!(a, b);
/// ```
pub struct CorrelationTable {
    seed: u64,
    counter: AtomicU64,
    pending: DashMap<String, PendingEntry>,
}

impl CorrelationTable {
    /// Create an empty table with a fresh process seed.
    pub fn new() -> Self {
        Self {
            seed: rand::random::<u64>(),
            counter: AtomicU64::new(0),
            pending: DashMap::new(),
        }
    }

    /// Generate the next correlation id.
    ///
    /// Unique across all concurrent callers for this broker's lifetime.
    pub fn next_correlation_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("c-{:016x}-{n}", self.seed)
    }

    /// Register a pending request and obtain its completion sink.
    ///
    /// The returned receiver resolves exactly once: with the response, a
    /// `Timeout` after `deadline`, or `Canceled` at shutdown.
    pub fn register_pending(
        &self,
        correlation_id: impl Into<String>,
        requester: impl Into<String>,
        deadline: Instant,
    ) -> oneshot::Receiver<CorrelationOutcome> {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        trace!(correlation_id = %correlation_id, "pending registered");
        self.pending.insert(
            correlation_id,
            PendingEntry {
                requester: requester.into(),
                deadline,
                sink: tx,
            },
        );
        rx
    }

    /// Complete a pending request with its response.
    ///
    /// Idempotent: the first call signals the sink, later calls return
    /// [`CompleteResult::Unknown`]. A completion racing past the deadline
    /// signals `Timeout` instead and reports [`CompleteResult::Expired`].
    pub fn complete(&self, correlation_id: &str, response: Message) -> CompleteResult {
        let Some((_, entry)) = self.pending.remove(correlation_id) else {
            return CompleteResult::Unknown;
        };

        if Instant::now() > entry.deadline {
            let _ = entry.sink.send(CorrelationOutcome::Timeout);
            return CompleteResult::Expired;
        }

        trace!(correlation_id = %correlation_id, requester = %entry.requester, "pending completed");
        let _ = entry.sink.send(CorrelationOutcome::Response(response));
        CompleteResult::Completed
    }

    /// Expire every entry whose deadline has passed, signaling `Timeout`.
    ///
    /// Returns the number of entries expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut expired = 0;
        for key in overdue {
            // Re-check under removal; a completion may have won the race.
            if let Some((_, entry)) = self
                .pending
                .remove_if(&key, |_, entry| entry.deadline <= now)
            {
                debug!(correlation_id = %key, requester = %entry.requester, "pending timed out");
                let _ = entry.sink.send(CorrelationOutcome::Timeout);
                expired += 1;
            }
        }
        expired
    }

    /// Drop one pending entry without signaling its sink.
    ///
    /// Used when the request never left the broker (routing failed), so
    /// there is nothing for the sink to learn.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.pending.remove(correlation_id).is_some()
    }

    /// Signal `Canceled` to every outstanding sink. Used at shutdown.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut canceled = 0;
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                let _ = entry.sink.send(CorrelationOutcome::Canceled);
                canceled += 1;
            }
        }
        canceled
    }

    /// Outstanding pending entries.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Spawn the background sweeper.
    ///
    /// Runs until `shutdown` observes `true`, expiring overdue entries
    /// every `interval`.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let table = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        table.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            table.cancel_all();
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use procbus_wire::BROKER_TARGET;
    use serde_json::Value;
    use std::collections::HashSet;

    fn response(cid: &str) -> Message {
        let mut msg = Message::event("resp", BROKER_TARGET, "w1", Value::Null);
        msg.correlation_id = Some(cid.to_string());
        msg
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let table = Arc::new(CorrelationTable::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                (0..1000)
                    .map(|_| table.next_correlation_id())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate correlation id");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[tokio::test]
    async fn test_complete_signals_sink_once() {
        let table = CorrelationTable::new();
        let cid = table.next_correlation_id();
        let rx = table.register_pending(cid.as_str(), "w1", Instant::now() + Duration::from_secs(5));

        assert_eq!(table.complete(&cid, response(&cid)), CompleteResult::Completed);
        assert_eq!(table.complete(&cid, response(&cid)), CompleteResult::Unknown);

        match rx.await.unwrap() {
            CorrelationOutcome::Response(msg) => {
                assert_eq!(msg.correlation_id.as_deref(), Some(cid.as_str()));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_times_out_overdue_entries() {
        let table = CorrelationTable::new();
        let rx = table.register_pending("c1", "w1", Instant::now() - Duration::from_millis(1));

        assert_eq!(table.sweep(), 1);
        assert!(matches!(rx.await.unwrap(), CorrelationOutcome::Timeout));

        // A late completion finds nothing.
        assert_eq!(table.complete("c1", response("c1")), CompleteResult::Unknown);
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_entries() {
        let table = CorrelationTable::new();
        let _rx = table.register_pending("c1", "w1", Instant::now() + Duration::from_secs(10));
        assert_eq!(table.sweep(), 0);
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_late_completion_reports_expired() {
        let table = CorrelationTable::new();
        let rx = table.register_pending("c1", "w1", Instant::now() - Duration::from_millis(1));

        // Completion arrives after the deadline but before the sweeper.
        assert_eq!(table.complete("c1", response("c1")), CompleteResult::Expired);
        assert!(matches!(rx.await.unwrap(), CorrelationOutcome::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_all_signals_canceled() {
        let table = CorrelationTable::new();
        let rx1 = table.register_pending("c1", "w1", Instant::now() + Duration::from_secs(10));
        let rx2 = table.register_pending("c2", "w2", Instant::now() + Duration::from_secs(10));

        assert_eq!(table.cancel_all(), 2);
        assert!(matches!(rx1.await.unwrap(), CorrelationOutcome::Canceled));
        assert!(matches!(rx2.await.unwrap(), CorrelationOutcome::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_expires_in_background() {
        let table = Arc::new(CorrelationTable::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::clone(&table).spawn_sweeper(Duration::from_millis(10), shutdown_rx);

        let rx = table.register_pending("c1", "w1", Instant::now() + Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(rx.await.unwrap(), CorrelationOutcome::Timeout));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
