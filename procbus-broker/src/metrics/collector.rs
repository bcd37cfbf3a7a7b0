// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// Layer 2: Third-party crate imports
use parking_lot::{Mutex, RwLock};

// Layer 3: Internal module imports
use procbus_wire::KernelMetrics;

/// Default number of per-message latencies retained.
pub const DEFAULT_LATENCY_WINDOW: usize = 1000;

/// Sliding-rate window length.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Circular buffer of recent routing latencies, in milliseconds.
struct LatencyRing {
    slots: Vec<f64>,
    next: usize,
    filled: usize,
}

impl LatencyRing {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0.0; capacity.max(1)],
            next: 0,
            filled: 0,
        }
    }

    fn push(&mut self, latency_ms: f64) {
        self.slots[self.next] = latency_ms;
        self.next = (self.next + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    /// P99 over the filled portion of the ring; 0 when empty.
    ///
    /// Insertion sort over at most the window size, then index
    /// `floor(0.99 * len)` clamped to `len - 1`.
    fn p99(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        let mut sample: Vec<f64> = if self.filled == self.slots.len() {
            self.slots.clone()
        } else {
            self.slots[..self.filled].to_vec()
        };

        for i in 1..sample.len() {
            let mut j = i;
            while j > 0 && sample[j - 1] > sample[j] {
                sample.swap(j - 1, j);
                j -= 1;
            }
        }

        let idx = ((sample.len() as f64 * 0.99) as usize).min(sample.len() - 1);
        sample[idx]
    }
}

/// Counters for the 1-second sliding rate window.
struct RateWindow {
    messages: AtomicU64,
    errors: AtomicU64,
    started: Mutex<Instant>,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
        }
    }

    /// Reset the window if a full second has elapsed since the last reset.
    fn maybe_reset(&self) {
        let mut started = self.started.lock();
        if started.elapsed() >= RATE_WINDOW {
            self.messages.store(0, Ordering::Relaxed);
            self.errors.store(0, Ordering::Relaxed);
            *started = Instant::now();
        }
    }

    fn rates(&self) -> (f64, f64) {
        let elapsed = self.started.lock().elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return (0.0, 0.0);
        }
        (
            self.messages.load(Ordering::Relaxed) as f64 / elapsed,
            self.errors.load(Ordering::Relaxed) as f64 / elapsed,
        )
    }
}

/// Rolling metrics state for the broker's hot path.
///
/// Latency recording happens off the routing fast path (workers record
/// after dispatch), so the ring's write lock sees acceptable contention.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use procbus_broker::MetricsCollector;
///
/// let collector = MetricsCollector::new(100);
/// collector.set_queue_capacity(10);
/// collector.update_buffer(8);
/// collector.record_latency(Duration::from_millis(12));
///
/// let metrics = collector.kernel_metrics(4, 10, 6, 4);
/// assert_eq!(metrics.buffer_saturation, 80.0);
/// assert_eq!(metrics.p99_latency_ms, 12.0);
/// ```
pub struct MetricsCollector {
    latencies: RwLock<LatencyRing>,
    queue_len: AtomicUsize,
    queue_capacity: AtomicUsize,
    window: RateWindow,
}

impl MetricsCollector {
    /// Create a collector retaining `latency_window` samples.
    pub fn new(latency_window: usize) -> Self {
        Self {
            latencies: RwLock::new(LatencyRing::new(latency_window)),
            queue_len: AtomicUsize::new(0),
            queue_capacity: AtomicUsize::new(0),
            window: RateWindow::new(),
        }
    }

    /// Record one per-message routing latency.
    pub fn record_latency(&self, latency: Duration) {
        self.latencies.write().push(latency.as_secs_f64() * 1000.0);
    }

    /// Count one routed message in the sliding window.
    pub fn record_message(&self) {
        self.window.maybe_reset();
        self.window.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one routing error in the sliding window.
    pub fn record_error(&self) {
        self.window.maybe_reset();
        self.window.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the optimizer queue length gauge.
    pub fn update_buffer(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    /// Set the optimizer queue capacity used for saturation.
    pub fn set_queue_capacity(&self, capacity: usize) {
        self.queue_capacity.store(capacity, Ordering::Relaxed);
    }

    /// 99th percentile routing latency in milliseconds; 0 when no samples.
    pub fn p99_latency_ms(&self) -> f64 {
        self.latencies.read().p99()
    }

    /// Queue saturation in percent; 0 when capacity is unset.
    pub fn buffer_saturation(&self) -> f64 {
        let capacity = self.queue_capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            return 0.0;
        }
        100.0 * self.queue_len.load(Ordering::Relaxed) as f64 / capacity as f64
    }

    /// Assemble the full kernel-metrics snapshot.
    pub fn kernel_metrics(
        &self,
        active_workers: usize,
        total_permits: u64,
        allocated_permits: u64,
        available_permits: u64,
    ) -> KernelMetrics {
        let (message_rate, error_rate) = self.window.rates();
        KernelMetrics {
            p99_latency_ms: self.p99_latency_ms(),
            buffer_saturation: self.buffer_saturation(),
            active_workers,
            total_permits,
            allocated_permits,
            available_permits,
            message_rate,
            error_rate,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_p99_empty_is_zero() {
        let collector = MetricsCollector::new(10);
        assert_eq!(collector.p99_latency_ms(), 0.0);
    }

    #[test]
    fn test_p99_single_sample() {
        let collector = MetricsCollector::new(10);
        collector.record_latency(Duration::from_millis(7));
        assert_eq!(collector.p99_latency_ms(), 7.0);
    }

    #[test]
    fn test_p99_picks_tail_of_distribution() {
        let collector = MetricsCollector::new(100);
        for i in 1..=100u64 {
            collector.record_latency(Duration::from_millis(i));
        }
        // floor(0.99 * 100) = 99 -> the 100th sample after sorting
        assert_eq!(collector.p99_latency_ms(), 100.0);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let collector = MetricsCollector::new(4);
        for _ in 0..4 {
            collector.record_latency(Duration::from_millis(1));
        }
        // These four displace the 1ms samples entirely.
        for _ in 0..4 {
            collector.record_latency(Duration::from_millis(9));
        }
        assert_eq!(collector.p99_latency_ms(), 9.0);
    }

    #[test]
    fn test_unfilled_slots_excluded() {
        let collector = MetricsCollector::new(1000);
        collector.record_latency(Duration::from_millis(50));
        collector.record_latency(Duration::from_millis(60));
        // Zero-initialized slots must not drag the percentile down.
        assert_eq!(collector.p99_latency_ms(), 60.0);
    }

    #[test]
    fn test_saturation_zero_capacity() {
        let collector = MetricsCollector::new(10);
        collector.update_buffer(5);
        assert_eq!(collector.buffer_saturation(), 0.0);
    }

    #[test]
    fn test_saturation_percent() {
        let collector = MetricsCollector::new(10);
        collector.set_queue_capacity(200);
        collector.update_buffer(50);
        assert_eq!(collector.buffer_saturation(), 25.0);
    }

    #[test]
    fn test_rates_count_over_elapsed() {
        let collector = MetricsCollector::new(10);
        for _ in 0..10 {
            collector.record_message();
        }
        collector.record_error();

        let metrics = collector.kernel_metrics(1, 0, 0, 0);
        // Window just opened, so the rate is large but both are positive.
        assert!(metrics.message_rate > 0.0);
        assert!(metrics.error_rate > 0.0);
        assert!(metrics.message_rate > metrics.error_rate);
    }

    #[test]
    fn test_window_resets_after_a_second() {
        let collector = MetricsCollector::new(10);
        collector.record_message();

        // Force the window back in time past the reset boundary.
        *collector.window.started.lock() = Instant::now() - Duration::from_secs(2);
        collector.record_message();

        // The reset zeroed the old count before the increment.
        assert_eq!(collector.window.messages.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_kernel_metrics_carries_permit_fields() {
        let collector = MetricsCollector::new(10);
        let metrics = collector.kernel_metrics(3, 10, 7, 3);
        assert_eq!(metrics.active_workers, 3);
        assert_eq!(metrics.total_permits, 10);
        assert_eq!(metrics.allocated_permits, 7);
        assert_eq!(metrics.available_permits, 3);
    }
}
