//! Bounded queue + worker pool; owns the batcher, retry scheduler, and DLQ
//! handoff. This is the centerpiece component: it is the only thing
//! monitors and sinks both ultimately talk to.
//!
//! Priority classification is resolved here as
//! label/config-rule only, never by sink health: sink health already
//! drives the circuit breaker, and feeding it into priority too would
//! create a second feedback loop reacting to the same signal.

pub mod batcher;
pub mod dlq;
pub mod priority;
pub mod queue;
pub mod retry;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dedup::DedupCache;
use crate::error::{AgentError, Result};
use crate::metrics::Registry;
use crate::pipeline::Pipeline;
use crate::position::PositionStore;
use crate::record::Record;
use crate::sink::{DiskBuffer, Sink};

pub use batcher::{AdaptiveBatcher, BatcherConfig};
pub use dlq::{DeadLetterQueue, DlqEntry, ReprocessFilter};
pub use priority::{PriorityClassifier, PriorityLevel, PriorityRuleConfig};
pub use queue::{IngressQueue, Priority, PushOutcome};
pub use retry::{RetryConfig, RetryScheduler};

/// The queue/worker/batching knobs for the `dispatcher` config section,
/// deserialized straight off the YAML document by `logagent-config`, then
/// handed to [`Dispatcher::new`] unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub high_watermark: f64,
    pub critical_watermark: f64,
    #[serde(with = "humantime_serde")]
    pub enqueue_timeout: Duration,
    pub worker_count: usize,
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub sink_poll_interval: Duration,
    pub dedup_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub dedup_ttl: Duration,
    pub safe_mode: bool,
    pub spill_enabled: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            queue_capacity: 50_000,
            high_watermark: 0.8,
            critical_watermark: 0.95,
            enqueue_timeout: Duration::from_secs(1),
            worker_count: num_cpus(),
            send_timeout: Duration::from_secs(120),
            sink_poll_interval: Duration::from_millis(50),
            dedup_enabled: true,
            dedup_ttl: Duration::from_secs(300),
            safe_mode: false,
            spill_enabled: true,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

pub enum EnqueueOutcome {
    Accepted,
    Spilled,
    Rejected(AgentError),
}

/// Ties together the ingress queue, pipeline, per-sink batchers, retry
/// scheduler, DLQ, and disk-overflow buffer. Constructed once at startup
/// (and rebuilt, excluding the queue/buffer, on a config reload that
/// changes sink/pipeline definitions — see `logagent-server`'s admin
/// surface).
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<IngressQueue>,
    dedup: Option<Arc<DedupCache>>,
    pipeline: Arc<ArcSwap<Pipeline>>,
    classifier: Arc<PriorityClassifier>,
    sinks: Vec<(String, Arc<dyn Sink>)>,
    batchers: HashMap<String, Arc<AdaptiveBatcher>>,
    retry: Arc<RetryScheduler>,
    dlq: Arc<DeadLetterQueue>,
    buffer: Arc<DiskBuffer>,
    positions: Arc<PositionStore>,
    metrics: Arc<Registry>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        pipeline: Pipeline,
        classifier: PriorityClassifier,
        sinks: Vec<(String, Arc<dyn Sink>, BatcherConfig)>,
        retry_config: RetryConfig,
        dlq: Arc<DeadLetterQueue>,
        buffer: Arc<DiskBuffer>,
        positions: Arc<PositionStore>,
        metrics: Arc<Registry>,
    ) -> Self {
        let queue = Arc::new(IngressQueue::new(config.queue_capacity, config.high_watermark, config.critical_watermark));
        let dedup = config.dedup_enabled.then(|| Arc::new(DedupCache::new(config.dedup_ttl)));
        let retry = Arc::new(RetryScheduler::new(retry_config, metrics.clone()));

        let mut batchers = HashMap::new();
        let mut sink_handles = Vec::new();
        for (name, sink, batcher_config) in sinks {
            let batcher = Arc::new(AdaptiveBatcher::new(batcher_config));
            batchers.insert(name.clone(), batcher);
            sink_handles.push((name, sink));
        }

        Dispatcher {
            config,
            queue,
            dedup,
            pipeline: Arc::new(ArcSwap::new(Arc::new(pipeline))),
            classifier: Arc::new(classifier),
            sinks: sink_handles,
            batchers,
            retry,
            dlq,
            buffer,
            positions,
            metrics,
        }
    }

    pub fn queue(&self) -> Arc<IngressQueue> {
        self.queue.clone()
    }

    pub fn positions(&self) -> Arc<PositionStore> {
        self.positions.clone()
    }

    pub fn metrics(&self) -> Arc<Registry> {
        self.metrics.clone()
    }

    pub fn dlq(&self) -> Arc<DeadLetterQueue> {
        self.dlq.clone()
    }

    pub fn buffer(&self) -> Arc<DiskBuffer> {
        self.buffer.clone()
    }

    /// Per-sink health as reported by each sink's own `is_healthy` (which,
    /// for a [`crate::sink::BreakerGuardedSink`], folds in breaker state).
    /// Backs the admin `/health` and `/stats` endpoints.
    pub fn sink_health(&self) -> Vec<(String, bool)> {
        self.sinks.iter().map(|(name, sink)| (name.clone(), sink.is_healthy())).collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Atomically swaps the active pipeline.
    pub fn reload_pipeline(&self, pipeline: Pipeline) {
        self.pipeline.store(Arc::new(pipeline));
    }

    /// Entry point for monitors. On `Accepted` or `Spilled`, the caller's position may be
    /// advanced; on `Rejected`, the caller must not advance its position
    /// and should apply its own backpressure.
    pub async fn enqueue(&self, record: Record) -> EnqueueOutcome {
        self.metrics.set_queue_depth(self.queue.len() as u64, self.queue.capacity() as u64);
        let priority = self.classifier.classify(&record);

        match self.queue.push(record, priority, self.config.enqueue_timeout).await {
            Ok(PushOutcome::Accepted) => EnqueueOutcome::Accepted,
            Ok(PushOutcome::SpillRecommended(record)) | Ok(PushOutcome::TimedOut(record)) => {
                if self.config.spill_enabled {
                    match self.buffer.push(&record) {
                        Ok(()) => EnqueueOutcome::Spilled,
                        Err(e) => EnqueueOutcome::Rejected(e),
                    }
                } else {
                    EnqueueOutcome::Rejected(AgentError::QueueFull { capacity: self.queue.capacity() })
                }
            }
            Err(e) => EnqueueOutcome::Rejected(e),
        }
    }

    /// Spawns the worker pool and per-sink sender loops; returns their join
    /// handles so the caller can await drain on shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let sink_batchers: Vec<(String, Arc<AdaptiveBatcher>)> =
            self.batchers.iter().map(|(name, batcher)| (name.clone(), batcher.clone())).collect();

        for id in 0..self.config.worker_count {
            let queue = self.queue.clone();
            let dedup = self.dedup.clone();
            let pipeline = self.pipeline.clone();
            let batchers = sink_batchers.clone();
            let metrics = self.metrics.clone();
            let dlq = self.dlq.clone();
            let safe_mode = self.config.safe_mode;
            let token = shutdown.clone();
            handles.push(tokio::spawn(worker::run_worker(id, queue, dedup, pipeline, batchers, metrics, dlq, safe_mode, token)));
        }

        for (name, sink) in &self.sinks {
            let batcher = self.batchers.get(name).expect("batcher registered per sink").clone();
            let retry = self.retry.clone();
            let dlq = self.dlq.clone();
            let metrics = self.metrics.clone();
            let send_timeout = self.config.send_timeout;
            let poll_interval = self.config.sink_poll_interval;
            let token = shutdown.clone();
            handles.push(tokio::spawn(worker::run_sink_sender(
                name.clone(),
                sink.clone(),
                batcher,
                retry,
                dlq,
                metrics,
                send_timeout,
                poll_interval,
                token,
            )));
        }

        handles.push(tokio::spawn(worker::run_buffer_drain(
            self.buffer.clone(),
            self.queue.clone(),
            self.dlq.clone(),
            self.metrics.clone(),
            self.config.high_watermark,
            self.config.sink_poll_interval,
            shutdown.clone(),
        )));

        let retry_scheduler = self.retry.clone();
        let queue = self.queue.clone();
        let dlq = self.dlq.clone();
        let metrics = self.metrics.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            retry::run_ticker(retry_scheduler, token, move |record, sink| {
                let queue = queue.clone();
                let dlq = dlq.clone();
                let metrics = metrics.clone();
                async move {
                    if queue.try_push_unconditional(record.clone(), Priority::Normal).is_err() {
                        let _ = dlq.append(DlqEntry {
                            record,
                            failure_reason: "main_queue_full_on_reinject".into(),
                            failed_sink: sink,
                            retry_count: 0,
                            context: Default::default(),
                            failed_at: chrono::Utc::now(),
                        });
                        metrics.set_dlq_size(dlq.len());
                    }
                }
            })
            .await;
        }));

        handles
    }

    /// Reprocesses DLQ entries matching `filter` by re-enqueueing them.
    pub async fn reprocess_dlq(&self, filter: ReprocessFilter) -> Result<usize> {
        let entries = self.dlq.reprocess(&filter)?;
        let count = entries.len();
        for entry in entries {
            let _ = self.enqueue(entry.record).await;
        }
        self.metrics.set_dlq_size(self.dlq.len());
        Ok(count)
    }
}
