//! Bounded ingress queue with priority-aware draining. Backed
//! by three lanes so that under stress the dispatcher can drain HIGH before
//! NORMAL before LOW, while under normal load a sequence counter lets it
//! fall back to approximate FIFO across all three lanes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{AgentError, Result};
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug)]
struct Lane {
    items: VecDeque<(u64, Record)>,
}

impl Lane {
    fn new() -> Self {
        Lane { items: VecDeque::new() }
    }
}

pub enum PushOutcome {
    Accepted,
    /// Returned when utilization is between high and critical watermarks
    /// and the record is LOW priority; caller decides whether to spill or admit.
    SpillRecommended(Record),
    /// Returned when the queue stayed at/above the critical watermark for
    /// the full `enqueue_timeout`; caller spills or fails the source.
    TimedOut(Record),
}

#[derive(Debug)]
pub struct IngressQueue {
    capacity: usize,
    high_watermark: f64,
    critical_watermark: f64,
    high: Mutex<Lane>,
    normal: Mutex<Lane>,
    low: Mutex<Lane>,
    len: AtomicUsize,
    seq: AtomicU64,
    notify: Notify,
}

impl IngressQueue {
    pub fn new(capacity: usize, high_watermark: f64, critical_watermark: f64) -> Self {
        IngressQueue {
            capacity,
            high_watermark,
            critical_watermark,
            high: Mutex::new(Lane::new()),
            normal: Mutex::new(Lane::new()),
            low: Mutex::new(Lane::new()),
            len: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity.max(1) as f64
    }

    fn lane(&self, priority: Priority) -> &Mutex<Lane> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    fn push_immediate(&self, record: Record, priority: Priority) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lane(priority).lock().items.push_back((seq, record));
        self.len.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Admission rule: below the high watermark, accept unconditionally;
    /// between high and critical, recommend spilling LOW-priority records;
    /// at or above critical, block up to `enqueue_timeout` waiting for
    /// room.
    pub async fn push(&self, record: Record, priority: Priority, enqueue_timeout: Duration) -> Result<PushOutcome> {
        if self.len() >= self.capacity {
            return self.push_at_critical(record, priority, enqueue_timeout).await;
        }

        let utilization = self.utilization();
        if utilization < self.high_watermark {
            self.push_immediate(record, priority);
            return Ok(PushOutcome::Accepted);
        }
        if utilization < self.critical_watermark {
            if priority == Priority::Low {
                return Ok(PushOutcome::SpillRecommended(record));
            }
            self.push_immediate(record, priority);
            return Ok(PushOutcome::Accepted);
        }
        self.push_at_critical(record, priority, enqueue_timeout).await
    }

    async fn push_at_critical(&self, record: Record, priority: Priority, enqueue_timeout: Duration) -> Result<PushOutcome> {
        let wait = async {
            loop {
                if self.len() < self.capacity {
                    return;
                }
                self.notify.notified().await;
            }
        };
        match tokio::time::timeout(enqueue_timeout, wait).await {
            Ok(()) => {
                self.push_immediate(record, priority);
                Ok(PushOutcome::Accepted)
            }
            Err(_) => Ok(PushOutcome::TimedOut(record)),
        }
    }

    fn pop_lane(&self, priority: Priority) -> Option<(u64, Record)> {
        self.lane(priority).lock().items.pop_front()
    }

    fn peek_seq(&self, priority: Priority) -> Option<u64> {
        self.lane(priority).lock().items.front().map(|(seq, _)| *seq)
    }

    /// Non-blocking dequeue. Above the high watermark, drains strictly
    /// HIGH > NORMAL > LOW; otherwise picks whichever lane holds the
    /// globally oldest sequence number, giving approximate FIFO across
    /// classes under normal load.
    pub fn try_pop(&self) -> Option<Record> {
        let item = if self.utilization() > self.high_watermark {
            self.pop_lane(Priority::High)
                .or_else(|| self.pop_lane(Priority::Normal))
                .or_else(|| self.pop_lane(Priority::Low))
        } else {
            let candidates = [
                (Priority::High, self.peek_seq(Priority::High)),
                (Priority::Normal, self.peek_seq(Priority::Normal)),
                (Priority::Low, self.peek_seq(Priority::Low)),
            ];
            let oldest = candidates.into_iter().filter_map(|(p, s)| s.map(|s| (p, s))).min_by_key(|(_, s)| *s);
            oldest.and_then(|(priority, _)| self.pop_lane(priority))
        };

        if let Some((_, record)) = item {
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.notify.notify_waiters();
            Some(record)
        } else {
            None
        }
    }

    /// Blocking dequeue for the worker loop; resolves as soon as `try_pop`
    /// would succeed or is cancelled by the caller's `select!`.
    pub async fn pop(&self) -> Record {
        loop {
            if let Some(record) = self.try_pop() {
                return record;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_push_unconditional(&self, record: Record, priority: Priority) -> Result<()> {
        if self.len() >= self.capacity {
            return Err(AgentError::QueueFull { capacity: self.capacity });
        }
        self.push_immediate(record, priority);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    fn record(n: u64) -> Record {
        Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: n }, b"line", chrono::Utc::now())
    }

    #[tokio::test]
    async fn below_high_watermark_accepts_immediately() {
        let queue = IngressQueue::new(100, 0.8, 0.95);
        let outcome = queue.push(record(1), Priority::Normal, Duration::from_millis(10)).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Accepted));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn between_high_and_critical_recommends_spill_for_low_priority() {
        let queue = IngressQueue::new(10, 0.5, 0.95);
        for i in 0..6 {
            queue.try_push_unconditional(record(i), Priority::Normal).unwrap();
        }
        let outcome = queue.push(record(99), Priority::Low, Duration::from_millis(10)).await.unwrap();
        assert!(matches!(outcome, PushOutcome::SpillRecommended(_)));
    }

    #[tokio::test]
    async fn at_capacity_times_out_when_no_room_freed() {
        let queue = IngressQueue::new(1, 0.8, 0.95);
        queue.try_push_unconditional(record(0), Priority::Normal).unwrap();
        let outcome = queue.push(record(1), Priority::Normal, Duration::from_millis(20)).await.unwrap();
        assert!(matches!(outcome, PushOutcome::TimedOut(_)));
    }

    #[tokio::test]
    async fn high_priority_drains_before_normal_under_stress() {
        let queue = IngressQueue::new(10, 0.1, 0.95);
        queue.try_push_unconditional(record(1), Priority::Normal).unwrap();
        queue.try_push_unconditional(record(2), Priority::High).unwrap();
        let first = queue.try_pop().unwrap();
        assert_eq!(first.cursor, Cursor::File { inode: 1, byte_offset: 2 });
    }

    #[tokio::test]
    async fn fifo_across_classes_under_normal_load() {
        let queue = IngressQueue::new(100, 0.9, 0.95);
        queue.try_push_unconditional(record(1), Priority::Low).unwrap();
        queue.try_push_unconditional(record(2), Priority::High).unwrap();
        let first = queue.try_pop().unwrap();
        assert_eq!(first.cursor, Cursor::File { inode: 1, byte_offset: 1 });
    }
}
