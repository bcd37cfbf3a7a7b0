//! Global and per-process message statistics.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

// Layer 3: Internal module imports
use procbus_wire::rpc::{MessageStatsReply, StatsRecord};
use procbus_wire::{Message, MessageKind};

/// Counter block for one key (the global aggregate or one process).
///
/// Counters are lock-free atomics; the first/last timestamps share a short
/// lock so the pair stays coherent.
#[derive(Debug, Default)]
struct CounterBlock {
    sent: AtomicU64,
    received: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    events: AtomicU64,
    errors: AtomicU64,
    times: Mutex<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

impl CounterBlock {
    fn touch(&self, at: DateTime<Utc>) {
        let mut times = self.times.lock();
        if times.0.is_none() {
            times.0 = Some(at);
        }
        times.1 = Some(at);
    }

    fn count_kind(&self, kind: MessageKind) {
        let counter = match kind {
            MessageKind::Request => &self.requests,
            MessageKind::Response => &self.responses,
            MessageKind::Event => &self.events,
            MessageKind::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsRecord {
        let times = *self.times.lock();
        StatsRecord {
            total_sent: self.sent.load(Ordering::Relaxed),
            total_received: self.received.load(Ordering::Relaxed),
            request_count: self.requests.load(Ordering::Relaxed),
            response_count: self.responses.load(Ordering::Relaxed),
            event_count: self.events.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            first_message_time: times
                .0
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
            last_message_time: times
                .1
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }
}

/// Message statistics keyed globally and by process.
///
/// Each routed message counts once as sent (against its source) and once
/// as received (against its target); kind counters accrue to the sender.
///
/// # Example
///
/// ```rust
/// use procbus_broker::MessageStats;
/// use procbus_wire::Message;
///
/// let stats = MessageStats::new();
/// stats.record(&Message::request("m1", "w1", "w2", serde_json::Value::Null));
///
/// let reply = stats.snapshot();
/// assert_eq!(reply.total.total_sent, 1);
/// assert_eq!(reply.per_process["w1"].request_count, 1);
/// assert_eq!(reply.per_process["w2"].total_received, 1);
/// ```
#[derive(Debug, Default)]
pub struct MessageStats {
    total: CounterBlock,
    per_process: DashMap<String, Arc<CounterBlock>>,
}

impl MessageStats {
    /// Create empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<CounterBlock> {
        if let Some(existing) = self.per_process.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.per_process
                .entry(key.to_string())
                .or_default()
                .value(),
        )
    }

    /// Record one routed message.
    pub fn record(&self, msg: &Message) {
        let now = Utc::now();

        self.total.sent.fetch_add(1, Ordering::Relaxed);
        self.total.received.fetch_add(1, Ordering::Relaxed);
        self.total.count_kind(msg.kind);
        self.total.touch(now);

        let source = self.entry(&msg.source);
        source.sent.fetch_add(1, Ordering::Relaxed);
        source.count_kind(msg.kind);
        source.touch(now);

        let target = self.entry(&msg.target);
        target.received.fetch_add(1, Ordering::Relaxed);
        target.touch(now);
    }

    /// Total messages recorded.
    pub fn message_count(&self) -> u64 {
        self.total.sent.load(Ordering::Relaxed)
    }

    /// Snapshot of every key, internally consistent per key.
    pub fn snapshot(&self) -> MessageStatsReply {
        let mut per_process = HashMap::with_capacity(self.per_process.len());
        for entry in self.per_process.iter() {
            per_process.insert(entry.key().clone(), entry.value().snapshot());
        }
        MessageStatsReply {
            total: self.total.snapshot(),
            per_process,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_record_counts_source_and_target() {
        let stats = MessageStats::new();
        stats.record(&Message::request("m1", "w1", "w2", Value::Null));
        stats.record(&Message::event("m2", "w1", "w2", Value::Null));

        let reply = stats.snapshot();
        assert_eq!(reply.total.total_sent, 2);
        assert_eq!(reply.total.total_received, 2);
        assert_eq!(reply.per_process["w1"].total_sent, 2);
        assert_eq!(reply.per_process["w1"].total_received, 0);
        assert_eq!(reply.per_process["w2"].total_received, 2);
        assert_eq!(reply.per_process["w1"].request_count, 1);
        assert_eq!(reply.per_process["w1"].event_count, 1);
    }

    #[test]
    fn test_kind_counters_global() {
        let stats = MessageStats::new();
        stats.record(&Message::request("m1", "a", "b", Value::Null));
        let req = Message::request("m2", "b", "a", Value::Null);
        stats.record(&Message::response_to(&req, "a", Value::Null));
        stats.record(&Message::error_to(&req, "a", "boom"));
        stats.record(&Message::event("m3", "a", "b", Value::Null));

        let total = stats.snapshot().total;
        assert_eq!(total.request_count, 1);
        assert_eq!(total.response_count, 1);
        assert_eq!(total.error_count, 1);
        assert_eq!(total.event_count, 1);
    }

    #[test]
    fn test_message_count_tracks_all_records() {
        let stats = MessageStats::new();
        for i in 0..5 {
            stats.record(&Message::event(format!("m{i}"), "a", "b", Value::Null));
        }
        assert_eq!(stats.message_count(), 5);
    }

    #[test]
    fn test_timestamps_rfc3339_and_ordered() {
        let stats = MessageStats::new();
        stats.record(&Message::event("m1", "a", "b", Value::Null));
        stats.record(&Message::event("m2", "a", "b", Value::Null));

        let record = stats.snapshot().total;
        let first = record.first_message_time.unwrap();
        let last = record.last_message_time.unwrap();
        assert!(DateTime::parse_from_rfc3339(&first).is_ok());
        assert!(DateTime::parse_from_rfc3339(&last).is_ok());
        assert!(first <= last);
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(MessageStats::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let stats = Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    stats.record(&Message::event(
                        format!("m{t}-{i}"),
                        format!("src-{t}"),
                        "sink",
                        Value::Null,
                    ));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let reply = stats.snapshot();
        assert_eq!(reply.total.total_sent, 1000);
        assert_eq!(reply.per_process["sink"].total_received, 1000);
    }
}
