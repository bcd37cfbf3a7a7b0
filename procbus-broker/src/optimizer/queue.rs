//! Bounded ingress queue with admission policies.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

// Layer 2: Third-party crate imports
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};

// Layer 3: Internal module imports
use super::config::OfferPolicy;
use procbus_wire::Message;

struct QueueInner {
    buf: VecDeque<Message>,
    closed: bool,
}

/// Single bounded FIFO feeding the optimizer's lane dispatcher.
///
/// Admission on a full queue follows the configured [`OfferPolicy`]. The
/// queue supports concurrent producers and consumers; a popped message is
/// owned by exactly one consumer, so accepted messages are processed
/// exactly once.
///
/// Backed by a deque under a short mutex rather than a channel: the
/// `DropOldest` policy must evict the head, which channel endpoints cannot
/// express.
///
/// # Example
///
/// ```rust
/// use procbus_broker::optimizer::{IngressQueue, OfferPolicy};
/// use procbus_wire::Message;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let queue = IngressQueue::new(2);
/// let msg = |id: &str| Message::event(id, "w1", "w2", serde_json::Value::Null);
///
/// assert!(queue.offer(msg("a"), OfferPolicy::DropOldest, Duration::ZERO).await);
/// assert!(queue.offer(msg("b"), OfferPolicy::DropOldest, Duration::ZERO).await);
/// assert!(queue.offer(msg("c"), OfferPolicy::DropOldest, Duration::ZERO).await);
///
/// assert_eq!(queue.dropped(), 1);
/// assert_eq!(queue.pop().await.unwrap().id, "b");
/// # });
/// ```
pub struct IngressQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl IngressQueue {
    /// Create a queue of `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buf: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Offer a message under `policy`. Returns `true` if accepted.
    ///
    /// Only `Block` and `Timeout` may suspend; the other policies resolve
    /// immediately.
    pub async fn offer(&self, msg: Message, policy: OfferPolicy, offer_timeout: Duration) -> bool {
        match policy {
            OfferPolicy::Drop => match self.try_push(msg) {
                PushResult::Pushed => true,
                PushResult::Full(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
                PushResult::Closed => false,
            },
            OfferPolicy::Reject => match self.try_push(msg) {
                PushResult::Pushed => true,
                PushResult::Full(_) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
                PushResult::Closed => false,
            },
            OfferPolicy::DropOldest => self.push_evicting(msg),
            OfferPolicy::Block => self.push_waiting(msg, None).await,
            OfferPolicy::Timeout => {
                let deadline = Instant::now() + offer_timeout;
                let accepted = self.push_waiting(msg, Some(deadline)).await;
                if !accepted {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                accepted
            }
        }
    }

    fn try_push(&self, msg: Message) -> PushResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return PushResult::Closed;
        }
        if inner.buf.len() >= self.capacity {
            return PushResult::Full(msg);
        }
        inner.buf.push_back(msg);
        drop(inner);
        self.not_empty.notify_one();
        PushResult::Pushed
    }

    /// Evict exactly one oldest message when full, then enqueue.
    fn push_evicting(&self, msg: Message) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        if inner.buf.len() >= self.capacity {
            inner.buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.buf.push_back(msg);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Wait for space, bounded by `deadline` when given.
    async fn push_waiting(&self, msg: Message, deadline: Option<Instant>) -> bool {
        let mut msg = msg;
        loop {
            // Register for the wakeup before checking, so a pop between
            // the check and the await cannot be lost.
            let notified = self.not_full.notified();
            msg = match self.try_push(msg) {
                PushResult::Pushed => return true,
                PushResult::Closed => return false,
                PushResult::Full(msg) => msg,
            };

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Await the next message. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(msg) = inner.buf.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next message without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        let msg = self.inner.lock().buf.pop_front();
        if msg.is_some() {
            self.not_full.notify_one();
        }
        msg
    }

    /// Close the queue: pending and future offers fail, pops drain what
    /// remains, waiters wake.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Returns `true` once [`IngressQueue::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages dropped by the `Drop`, `Timeout`, and `DropOldest`
    /// policies. Monotonic.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages refused by the `Reject` policy. Monotonic.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

enum PushResult {
    Pushed,
    Full(Message),
    Closed,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;

    fn msg(id: &str) -> Message {
        Message::event(id, "w1", "w2", Value::Null)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = IngressQueue::new(4);
        for id in ["a", "b", "c"] {
            assert!(queue.offer(msg(id), OfferPolicy::Drop, Duration::ZERO).await);
        }
        assert_eq!(queue.pop().await.unwrap().id, "a");
        assert_eq!(queue.pop().await.unwrap().id, "b");
        assert_eq!(queue.pop().await.unwrap().id, "c");
    }

    #[tokio::test]
    async fn test_drop_policy_counts_and_refuses() {
        let queue = IngressQueue::new(1);
        assert!(queue.offer(msg("a"), OfferPolicy::Drop, Duration::ZERO).await);
        assert!(!queue.offer(msg("b"), OfferPolicy::Drop, Duration::ZERO).await);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_policy_leaves_queue_untouched() {
        let queue = IngressQueue::new(1);
        assert!(queue.offer(msg("a"), OfferPolicy::Reject, Duration::ZERO).await);
        assert!(!queue.offer(msg("b"), OfferPolicy::Reject, Duration::ZERO).await);
        assert_eq!(queue.rejected(), 1);
        assert_eq!(queue.dropped(), 0);
        assert_eq!(queue.pop().await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_exactly_one() {
        let queue = IngressQueue::new(2);
        assert!(queue.offer(msg("m1"), OfferPolicy::DropOldest, Duration::ZERO).await);
        assert!(queue.offer(msg("m2"), OfferPolicy::DropOldest, Duration::ZERO).await);
        assert!(queue.offer(msg("m3"), OfferPolicy::DropOldest, Duration::ZERO).await);

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await.unwrap().id, "m2");
        assert_eq!(queue.pop().await.unwrap().id, "m3");
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let queue = Arc::new(IngressQueue::new(1));
        assert!(queue.offer(msg("a"), OfferPolicy::Block, Duration::ZERO).await);

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.offer(msg("b"), OfferPolicy::Block, Duration::ZERO).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.pop().await.unwrap().id, "a");
        assert!(blocked.await.unwrap());
        assert_eq!(queue.pop().await.unwrap().id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_policy_drops_on_expiry() {
        let queue = IngressQueue::new(1);
        assert!(queue.offer(msg("a"), OfferPolicy::Timeout, Duration::from_millis(10)).await);
        assert!(!queue.offer(msg("b"), OfferPolicy::Timeout, Duration::from_millis(10)).await);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_offer() {
        let queue = Arc::new(IngressQueue::new(1));
        assert!(queue.offer(msg("a"), OfferPolicy::Block, Duration::ZERO).await);

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.offer(msg("b"), OfferPolicy::Block, Duration::ZERO).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(!blocked.await.unwrap());
    }

    #[tokio::test]
    async fn test_pop_drains_after_close() {
        let queue = IngressQueue::new(4);
        assert!(queue.offer(msg("a"), OfferPolicy::Drop, Duration::ZERO).await);
        queue.close();

        assert_eq!(queue.pop().await.unwrap().id, "a");
        assert!(queue.pop().await.is_none());
        assert!(!queue.offer(msg("b"), OfferPolicy::Drop, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_see_each_message_once() {
        let queue = Arc::new(IngressQueue::new(1024));
        for i in 0..1000 {
            assert!(queue
                .offer(msg(&format!("m{i}")), OfferPolicy::Drop, Duration::ZERO)
                .await);
        }
        queue.close();

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(msg) = queue.pop().await {
                    ids.push(msg.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
