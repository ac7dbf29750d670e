//! One adaptive batcher per sink. Accumulates records until a
//! size or time threshold fires, then adapts its target batch size toward
//! `target_latency` using the most recently observed send latency.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::record::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub min_batch: usize,
    pub max_batch: usize,
    pub target_batch: usize,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub target_latency: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig {
            min_batch: 1,
            max_batch: 1000,
            target_batch: 100,
            max_wait: Duration::from_millis(500),
            target_latency: Duration::from_millis(200),
        }
    }
}

/// Per-sink accumulator. `push` is called from worker tasks as records are
/// fanned out; `take_if_ready` is polled by the sink's send loop.
#[derive(Debug)]
pub struct AdaptiveBatcher {
    config: BatcherConfig,
    pending: Mutex<Vec<Arc<Record>>>,
    deadline: Mutex<Option<Instant>>,
    current_target: AtomicUsize,
}

impl AdaptiveBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        let current_target = config.target_batch;
        AdaptiveBatcher {
            config,
            pending: Mutex::new(Vec::new()),
            deadline: Mutex::new(None),
            current_target: AtomicUsize::new(current_target),
        }
    }

    pub fn push(&self, record: Arc<Record>) {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            *self.deadline.lock() = Some(Instant::now() + self.config.max_wait);
        }
        pending.push(record);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size threshold check: fires at the adapted target (or `max_batch`,
    /// whichever is smaller) without waiting for the timer.
    pub fn ready_by_size(&self) -> bool {
        self.len() >= self.current_target.load(Ordering::Relaxed).min(self.config.max_batch)
    }

    pub fn ready_by_time(&self) -> bool {
        match *self.deadline.lock() {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Drains the batch when either threshold is reached, or when `force`
    /// is set (used on shutdown flush). Never returns fewer than
    /// `min_batch` unless forced or the deadline elapsed.
    pub fn take_if_ready(&self, force: bool) -> Option<Vec<Arc<Record>>> {
        let should_take = force
            || self.ready_by_size()
            || (self.ready_by_time() && self.len() >= self.config.min_batch)
            || (self.ready_by_time() && !self.pending.lock().is_empty());
        if !should_take {
            return None;
        }
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return None;
        }
        *self.deadline.lock() = None;
        Some(std::mem::take(&mut *pending))
    }

    /// Widens or narrows the target batch size toward `target_latency`
    /// using the most recent observed send latency.
    pub fn record_send_latency(&self, observed: Duration) {
        let current = self.current_target.load(Ordering::Relaxed);
        let target = self.config.target_latency;
        let next = if observed < target {
            (current + current / 10 + 1).min(self.config.max_batch)
        } else if observed > target {
            (current.saturating_sub(current / 10 + 1)).max(self.config.min_batch)
        } else {
            current
        };
        self.current_target.store(next, Ordering::Relaxed);
    }

    pub fn current_target(&self) -> usize {
        self.current_target.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    fn record() -> Arc<Record> {
        Arc::new(Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, b"line", chrono::Utc::now()))
    }

    #[test]
    fn ready_by_size_fires_at_target() {
        let batcher = AdaptiveBatcher::new(BatcherConfig { target_batch: 2, max_batch: 10, min_batch: 1, ..Default::default() });
        batcher.push(record());
        assert!(!batcher.ready_by_size());
        batcher.push(record());
        assert!(batcher.ready_by_size());
        let batch = batcher.take_if_ready(false).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn low_latency_increases_target_batch_size() {
        let batcher = AdaptiveBatcher::new(BatcherConfig {
            target_batch: 10,
            max_batch: 1000,
            min_batch: 1,
            max_wait: Duration::from_secs(1),
            target_latency: Duration::from_millis(100),
        });
        let before = batcher.current_target();
        batcher.record_send_latency(Duration::from_millis(10));
        assert!(batcher.current_target() > before);
    }

    #[test]
    fn high_latency_decreases_target_batch_size() {
        let batcher = AdaptiveBatcher::new(BatcherConfig {
            target_batch: 10,
            max_batch: 1000,
            min_batch: 1,
            max_wait: Duration::from_secs(1),
            target_latency: Duration::from_millis(100),
        });
        let before = batcher.current_target();
        batcher.record_send_latency(Duration::from_millis(500));
        assert!(batcher.current_target() < before);
    }

    #[test]
    fn force_drains_partial_batch() {
        let batcher = AdaptiveBatcher::new(BatcherConfig::default());
        batcher.push(record());
        assert!(batcher.take_if_ready(false).is_none());
        let batch = batcher.take_if_ready(true).unwrap();
        assert_eq!(batch.len(), 1);
    }
}
