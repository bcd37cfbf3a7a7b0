//! Load snapshots and adaptive retuning.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

// Layer 2: Third-party crate imports
use serde::Serialize;

/// Smallest batch the tuner will propose.
const MIN_BATCH_SIZE: usize = 1;

/// Largest batch the tuner will propose.
const MAX_BATCH_SIZE: usize = 256;

/// Shortest flush interval the tuner will propose.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Saturation above which the pipeline is considered overloaded.
const HIGH_WATER_PCT: f64 = 75.0;

/// Saturation above which batching alone is grown.
const MID_WATER_PCT: f64 = 50.0;

/// Saturation below which batching is shrunk back.
const LOW_WATER_PCT: f64 = 5.0;

/// Live-tunable worker parameters, shared with every worker thread.
///
/// Batch size and flush interval apply on the next batch a worker gathers;
/// no worker is interrupted mid-batch.
#[derive(Debug)]
pub struct TuningState {
    batch_size: AtomicUsize,
    flush_interval_us: AtomicU64,
}

impl TuningState {
    /// Create tuning state from the configured initial values.
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size: AtomicUsize::new(batch_size.max(1)),
            flush_interval_us: AtomicU64::new(flush_interval.as_micros() as u64),
        }
    }

    /// Current batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Apply a new batch size.
    pub fn set_batch_size(&self, batch_size: usize) {
        self.batch_size.store(batch_size.max(1), Ordering::Relaxed);
    }

    /// Current batch gather window.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_micros(self.flush_interval_us.load(Ordering::Relaxed))
    }

    /// Apply a new gather window.
    pub fn set_flush_interval(&self, interval: Duration) {
        self.flush_interval_us
            .store(interval.as_micros() as u64, Ordering::Relaxed);
    }
}

/// One load sample from the system monitor.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSnapshot {
    /// Messages waiting in the ingress queue
    pub queue_len: usize,
    /// Ingress queue capacity
    pub queue_capacity: usize,
    /// Queue saturation, percent
    pub saturation: f64,
    /// Messages per second over the sliding window
    pub message_rate: f64,
    /// Errors per second over the sliding window
    pub error_rate: f64,
    /// Live workers
    pub active_workers: usize,
    /// Batch size in effect
    pub batch_size: usize,
    /// Flush interval in effect
    pub flush_interval: Duration,
}

/// Parameter changes proposed by one adaptation pass.
///
/// Worker-count increases, batch size, and flush interval are applied
/// live; worker-count decreases and buffer capacity are advisory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuningProposal {
    /// Desired worker count
    pub num_workers: Option<usize>,
    /// Desired batch size
    pub batch_size: Option<usize>,
    /// Desired flush interval
    pub flush_interval: Option<Duration>,
    /// Recommended queue capacity (advisory; the queue is not recreated)
    pub buffer_cap: Option<usize>,
}

impl TuningProposal {
    /// Returns `true` when the pass proposed nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Threshold-driven tuner consulted at most once per `adaptation_freq`.
///
/// Sustained high saturation grows the worker pool and batch sizes;
/// sustained idleness shrinks batching back toward low latency. The tuner
/// is deliberately monotonic per pass so repeated passes converge instead
/// of oscillating.
#[derive(Debug)]
pub struct AdaptiveTuner {
    max_workers: usize,
}

impl AdaptiveTuner {
    /// Create a tuner that will not grow the pool past `max_workers`.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    /// Propose parameter changes for the observed load.
    pub fn propose(&self, snapshot: &LoadSnapshot) -> TuningProposal {
        let mut proposal = TuningProposal::default();

        if snapshot.saturation > HIGH_WATER_PCT {
            if snapshot.active_workers < self.max_workers {
                proposal.num_workers = Some(snapshot.active_workers + 1);
            }
            let grown = (snapshot.batch_size * 2).min(MAX_BATCH_SIZE);
            if grown != snapshot.batch_size {
                proposal.batch_size = Some(grown);
            }
            proposal.buffer_cap = Some(snapshot.queue_capacity * 2);
            return proposal;
        }

        if snapshot.saturation > MID_WATER_PCT {
            let grown = (snapshot.batch_size * 2).min(MAX_BATCH_SIZE);
            if grown != snapshot.batch_size {
                proposal.batch_size = Some(grown);
            }
            return proposal;
        }

        if snapshot.saturation < LOW_WATER_PCT && snapshot.batch_size > MIN_BATCH_SIZE {
            proposal.batch_size = Some((snapshot.batch_size / 2).max(MIN_BATCH_SIZE));
            let shortened = (snapshot.flush_interval / 2).max(MIN_FLUSH_INTERVAL);
            if shortened != snapshot.flush_interval {
                proposal.flush_interval = Some(shortened);
            }
            if snapshot.active_workers > 1 {
                // Advisory only: workers are never torn down under load.
                proposal.num_workers = Some(snapshot.active_workers - 1);
            }
        }

        proposal
    }
}
