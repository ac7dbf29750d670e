//! Worker loop (dequeue → dedup → pipeline → fan-out) and the per-sink
//! sender loop (batch flush → send → retry/DLQ routing). Split from
//! `Dispatcher` itself so each loop can be unit-exercised without standing
//! up the whole wiring.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

use crate::dedup::DedupCache;
use crate::dispatcher::batcher::AdaptiveBatcher;
use crate::dispatcher::dlq::{DeadLetterQueue, DlqEntry};
use crate::dispatcher::queue::{IngressQueue, Priority};
use crate::dispatcher::retry::{RetryOutcome, RetryScheduler};
use crate::metrics::Registry;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::record::Record;
use crate::sink::{DiskBuffer, Sink};

/// One worker: dequeues, deduplicates, runs the pipeline, then hands the
/// processed record to every sink's batcher. Workers are not per-sink;
/// fan-out happens here.
pub async fn run_worker(
    id: usize,
    queue: Arc<IngressQueue>,
    dedup: Option<Arc<DedupCache>>,
    pipeline: Arc<ArcSwap<Pipeline>>,
    batchers: Vec<(String, Arc<AdaptiveBatcher>)>,
    metrics: Arc<Registry>,
    dlq: Arc<DeadLetterQueue>,
    safe_mode: bool,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = queue.pop() => record,
        };

        if let Some(cache) = &dedup {
            let fp = record.fingerprint_key();
            if cache.check_and_insert(&fp) {
                metrics.inc_dedup_dropped();
                continue;
            }
        }

        let source_id = record.source_id.clone();
        // Kept so a panicking step doesn't lose the record: `record` itself
        // is moved into the `catch_unwind` closure and unrecoverable if it
        // unwinds.
        let record_on_panic = record.clone();
        let active_pipeline = pipeline.load_full();
        // Invariant violations are caught here by panic recovery at the
        // worker boundary; the record goes to the DLQ with reason=internal-error.
        let pipeline_ref = active_pipeline.as_ref();
        let metrics_ref = &metrics;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| pipeline_ref.run(record, metrics_ref)));

        let processed = match outcome {
            Ok(Ok(PipelineOutcome::Delivered(record))) => record,
            Ok(Ok(PipelineOutcome::Dropped)) => continue,
            Ok(Ok(PipelineOutcome::Rejected { record, reason })) => {
                let _ = dlq.append(DlqEntry {
                    record,
                    failure_reason: reason.to_string(),
                    failed_sink: "pipeline".into(),
                    retry_count: 0,
                    context: Default::default(),
                    failed_at: chrono::Utc::now(),
                });
                metrics.set_dlq_size(dlq.len());
                continue;
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = id, error = %e, "pipeline step failed");
                continue;
            }
            Err(_) => {
                tracing::error!(worker = id, source = %source_id, "pipeline step panicked");
                let _ = dlq.append(DlqEntry {
                    record: record_on_panic,
                    failure_reason: "internal-error".into(),
                    failed_sink: "pipeline".into(),
                    retry_count: 0,
                    context: Default::default(),
                    failed_at: chrono::Utc::now(),
                });
                metrics.set_dlq_size(dlq.len());
                continue;
            }
        };

        metrics.inc_records_processed(&processed.source_type.as_str().to_string(), "default");

        let shared = Arc::new(processed);
        for (_name, batcher) in &batchers {
            if safe_mode {
                batcher.push(Arc::new(shared.deep_clone()));
            } else {
                batcher.push(shared.clone());
            }
        }
    }
}

/// Periodically drains the disk-overflow buffer back into the ingress
/// queue once utilization falls back below the high watermark. Without
/// this, a spilled record is stranded on disk forever.
pub async fn run_buffer_drain(
    buffer: Arc<DiskBuffer>,
    queue: Arc<IngressQueue>,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<Registry>,
    high_watermark: f64,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        if buffer.is_empty() || queue.utilization() >= high_watermark {
            continue;
        }

        let room = queue.capacity().saturating_sub(queue.len());
        if room == 0 {
            continue;
        }

        let drained = match buffer.drain(room) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "failed to drain overflow buffer");
                continue;
            }
        };

        for record in drained {
            if queue.try_push_unconditional(record.clone(), Priority::Normal).is_err() {
                if buffer.push(&record).is_err() {
                    tracing::error!(source = %record.source_id, "dropping spilled record: queue full and re-spill failed");
                    let _ = dlq.append(DlqEntry {
                        record,
                        failure_reason: "buffer_drain_requeue_failed".into(),
                        failed_sink: "buffer".into(),
                        retry_count: 0,
                        context: Default::default(),
                        failed_at: chrono::Utc::now(),
                    });
                    metrics.set_dlq_size(dlq.len());
                }
            }
        }
    }
}

/// Per-sink sender: periodically flushes the batcher, sends via the
/// (breaker-guarded) sink under a bounded timeout, and routes failures to
/// the retry scheduler or DLQ.
pub async fn run_sink_sender(
    sink_name: String,
    sink: Arc<dyn Sink>,
    batcher: Arc<AdaptiveBatcher>,
    retry: Arc<RetryScheduler>,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<Registry>,
    send_timeout: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            match batcher.take_if_ready(true) {
                Some(batch) => {
                    send_batch(&sink_name, &sink, batch, &retry, &dlq, &metrics, send_timeout, &batcher).await;
                    continue;
                }
                None => break,
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => continue,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        if let Some(batch) = batcher.take_if_ready(false) {
            send_batch(&sink_name, &sink, batch, &retry, &dlq, &metrics, send_timeout, &batcher).await;
        }
    }
}

async fn send_batch(
    sink_name: &str,
    sink: &Arc<dyn Sink>,
    batch: Vec<Arc<Record>>,
    retry: &Arc<RetryScheduler>,
    dlq: &Arc<DeadLetterQueue>,
    metrics: &Arc<Registry>,
    send_timeout: Duration,
    batcher: &Arc<AdaptiveBatcher>,
) {
    metrics.set_batch_size(sink_name, batch.len());
    let started = Instant::now();
    let result = tokio::time::timeout(send_timeout, sink.send(&batch)).await;
    let elapsed = started.elapsed();
    metrics.observe_send_latency(sink_name, elapsed.as_secs_f64());
    batcher.record_send_latency(elapsed);

    match result {
        Ok(Ok(())) => {
            metrics.inc_records_sent(sink_name, batch.len() as u64);
        }
        Ok(Err(e)) => {
            handle_failure(sink_name, batch, e.to_string(), e.is_retryable(), retry, dlq, metrics);
        }
        Err(_) => {
            handle_failure(sink_name, batch, "send_timeout".into(), true, retry, dlq, metrics);
        }
    }
}

fn handle_failure(
    sink_name: &str,
    batch: Vec<Arc<Record>>,
    reason: String,
    retryable: bool,
    retry: &Arc<RetryScheduler>,
    dlq: &Arc<DeadLetterQueue>,
    metrics: &Arc<Registry>,
) {
    for record in batch {
        metrics.inc_records_failed(sink_name, &reason);
        let record = Arc::try_unwrap(record).unwrap_or_else(|arc| (*arc).clone());
        if retryable {
            match retry.offer(record, sink_name.to_string()) {
                RetryOutcome::Scheduled => {}
                RetryOutcome::DeadLetter { record, sink, reason: dlq_reason } => {
                    let _ = dlq.append(DlqEntry {
                        record,
                        failure_reason: dlq_reason.to_string(),
                        failed_sink: sink,
                        retry_count: 0,
                        context: Default::default(),
                        failed_at: chrono::Utc::now(),
                    });
                    metrics.set_dlq_size(dlq.len());
                }
            }
        } else {
            let _ = dlq.append(DlqEntry {
                record,
                failure_reason: reason.clone(),
                failed_sink: sink_name.to_string(),
                retry_count: 0,
                context: Default::default(),
                failed_at: chrono::Utc::now(),
            });
            metrics.set_dlq_size(dlq.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::dlq::ReprocessFilter;
    use crate::pipeline::{Step, StepOutcome, TimestampAction, TimestampConfig, TimestampStep};
    use crate::record::{Cursor, SourceType};

    #[derive(Debug)]
    struct PanicStep;

    impl Step for PanicStep {
        fn name(&self) -> &'static str {
            "panic_step"
        }

        fn apply(&self, _record: Record, _metrics: &Registry) -> crate::error::Result<StepOutcome> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panicking_step_preserves_the_record_in_the_dlq() {
        let queue = Arc::new(IngressQueue::new(10, 0.8, 0.95));
        let pipeline = Arc::new(ArcSwap::new(Arc::new(Pipeline::new(vec![Box::new(PanicStep)]))));
        let metrics = Arc::new(Registry::new());
        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(DeadLetterQueue::open(dir.path().join("dlq")).unwrap());
        let shutdown = CancellationToken::new();

        let record =
            Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, b"important-payload", chrono::Utc::now());
        queue.try_push_unconditional(record, Priority::Normal).unwrap();

        let handle = tokio::spawn(run_worker(0, queue.clone(), None, pipeline, Vec::new(), metrics, dlq.clone(), false, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert_eq!(dlq.len(), 1);
        let entries = dlq.reprocess(&ReprocessFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.payload.as_str(), "important-payload");
        assert_eq!(entries[0].failure_reason, "internal-error");
    }

    #[tokio::test]
    async fn rejected_timestamp_routes_the_record_to_the_dlq() {
        let queue = Arc::new(IngressQueue::new(10, 0.8, 0.95));
        let step = TimestampStep::new(TimestampConfig {
            field: "ts".into(),
            max_past_age: Duration::from_secs(1),
            max_future_age: Duration::from_secs(1),
            action: TimestampAction::Reject,
        });
        let pipeline = Arc::new(ArcSwap::new(Arc::new(Pipeline::new(vec![Box::new(step)]))));
        let metrics = Arc::new(Registry::new());
        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(DeadLetterQueue::open(dir.path().join("dlq")).unwrap());
        let shutdown = CancellationToken::new();

        let mut record = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, b"line", chrono::Utc::now());
        let ancient = (chrono::Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
        record.fields.set("ts", ancient);
        queue.try_push_unconditional(record, Priority::Normal).unwrap();

        let handle = tokio::spawn(run_worker(0, queue.clone(), None, pipeline, Vec::new(), metrics, dlq.clone(), false, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert_eq!(dlq.len(), 1);
    }

    #[tokio::test]
    async fn buffer_drain_requeues_spilled_records_once_room_opens_up() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(DiskBuffer::open(dir.path().join("buffer")).unwrap());
        let queue = Arc::new(IngressQueue::new(10, 0.8, 0.95));
        let dlq = Arc::new(DeadLetterQueue::open(dir.path().join("dlq")).unwrap());
        let metrics = Arc::new(Registry::new());

        for i in 0u64..3 {
            let record = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: i }, b"spilled", chrono::Utc::now());
            buffer.push(&record).unwrap();
        }
        assert_eq!(buffer.len(), 3);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_buffer_drain(
            buffer.clone(),
            queue.clone(),
            dlq,
            metrics,
            0.8,
            Duration::from_millis(5),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert!(buffer.is_empty());
        assert_eq!(queue.len(), 3);
    }
}
