//! Centralized retry scheduler: one bounded slice plus a
//! single ticker, rather than a goroutine/task per retry, so sustained
//! failure produces backlog instead of unbounded task growth.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::Registry;
use crate::record::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub max_pending: usize,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            max_pending: 10_000,
            tick_interval: Duration::from_millis(100),
        }
    }
}

struct PendingRetry {
    record: Record,
    sink: String,
    ready_at: Instant,
}

/// Outcome of offering a failed record to the scheduler: either it was
/// accepted for a future retry, or it should go straight to the DLQ
/// (exhausted retries, or the retry slice itself is full).
pub enum RetryOutcome {
    Scheduled,
    DeadLetter { record: Record, sink: String, reason: &'static str },
}

#[derive(Debug)]
pub struct RetryScheduler {
    config: RetryConfig,
    pending: Mutex<VecDeque<PendingRetry>>,
    metrics: Arc<Registry>,
}

impl std::fmt::Debug for PendingRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRetry").field("sink", &self.sink).finish()
    }
}

impl RetryScheduler {
    pub fn new(config: RetryConfig, metrics: Arc<Registry>) -> Self {
        RetryScheduler { config, pending: Mutex::new(VecDeque::new()), metrics }
    }

    /// For each record: retries += 1; if retries < max_retries, enqueue
    /// `{record, ready_at}`; otherwise send to the DLQ. If the retry slice
    /// is full, send directly to the DLQ.
    pub fn offer(&self, mut record: Record, sink: String) -> RetryOutcome {
        record.retry_count += 1;
        if record.retry_count >= self.config.max_retries {
            return RetryOutcome::DeadLetter { record, sink, reason: "max_retries_exceeded" };
        }

        let mut pending = self.pending.lock();
        if pending.len() >= self.config.max_pending {
            self.metrics.inc_retry_drops();
            drop(pending);
            return RetryOutcome::DeadLetter { record, sink, reason: "retry_slice_full" };
        }

        let delay = self.config.retry_delay * record.retry_count;
        pending.push_back(PendingRetry { record, sink, ready_at: Instant::now() + delay });
        self.metrics.set_retry_queue_size(pending.len() as u64);
        RetryOutcome::Scheduled
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Called by the ticker (spec: "one ticker (100ms) goroutine"). Removes
    /// every entry whose `ready_at` has passed and hands them back to the
    /// caller, which re-injects into the main queue or, on queue-full,
    /// routes straight to the DLQ to avoid head-of-line blocking.
    pub fn drain_ready(&self) -> Vec<(Record, String)> {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(pending.len());
        while let Some(item) = pending.pop_front() {
            if item.ready_at <= now {
                ready.push((item.record, item.sink));
            } else {
                remaining.push_back(item);
            }
        }
        *pending = remaining;
        self.metrics.set_retry_queue_size(pending.len() as u64);
        ready
    }
}

/// Spawns the ticker loop; `reinject` is called with each ready
/// `(record, sink)` pair and returns `Ok(())` if re-enqueued or an error if
/// the main queue was full, in which case the caller routes to DLQ.
pub async fn run_ticker<F, Fut>(scheduler: Arc<RetryScheduler>, shutdown: CancellationToken, mut reinject: F)
where
    F: FnMut(Record, String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(scheduler.config.tick_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                for (record, sink) in scheduler.drain_ready() {
                    reinject(record, sink).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    fn record() -> Record {
        Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, b"line", chrono::Utc::now())
    }

    #[test]
    fn exhausted_retries_go_to_dlq() {
        let metrics = Arc::new(Registry::new());
        let scheduler = RetryScheduler::new(RetryConfig { max_retries: 1, ..Default::default() }, metrics);
        let outcome = scheduler.offer(record(), "sink-a".into());
        assert!(matches!(outcome, RetryOutcome::DeadLetter { reason: "max_retries_exceeded", .. }));
    }

    #[test]
    fn full_slice_routes_to_dlq_without_waiting_for_retries_exhaustion() {
        let metrics = Arc::new(Registry::new());
        let scheduler = RetryScheduler::new(RetryConfig { max_retries: 10, max_pending: 1, ..Default::default() }, metrics);
        assert!(matches!(scheduler.offer(record(), "sink-a".into()), RetryOutcome::Scheduled));
        let outcome = scheduler.offer(record(), "sink-a".into());
        assert!(matches!(outcome, RetryOutcome::DeadLetter { reason: "retry_slice_full", .. }));
    }

    #[tokio::test]
    async fn drain_ready_returns_only_elapsed_entries() {
        let metrics = Arc::new(Registry::new());
        let scheduler =
            RetryScheduler::new(RetryConfig { max_retries: 10, retry_delay: Duration::from_millis(20), ..Default::default() }, metrics);
        scheduler.offer(record(), "sink-a".into());
        assert!(scheduler.drain_ready().is_empty());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(scheduler.drain_ready().len(), 1);
    }
}
