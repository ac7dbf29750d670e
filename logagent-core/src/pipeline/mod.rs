//! Ordered sequence of transformers applied per record before batching
//!. Each step is pure with respect to external state and runs
//! synchronously in the worker that dequeued the record.

mod enrich;
mod filter;
mod parse;
mod redact;
mod timestamp;

pub use enrich::{EnrichConfig, EnrichStep};
pub use filter::{FilterConfig, FilterStep};
pub use parse::{ParseConfig, ParseKind, ParseStep};
pub use redact::{RedactConfig, RedactStep};
pub use timestamp::{TimestampAction, TimestampConfig, TimestampStep};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics::Registry;
use crate::record::Record;

/// Outcome of a single pipeline step: the record continues, is dropped
/// silently, or is rejected and must be routed to the DLQ instead of just
/// discarded (the worker, not the pipeline, owns the DLQ handle, so the
/// record travels back out with the outcome rather than being appended here).
pub enum StepOutcome {
    Continue(Record),
    Drop { reason: &'static str },
    Reject { record: Record, reason: &'static str },
}

pub trait Step: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, record: Record, metrics: &Registry) -> Result<StepOutcome>;
}

/// Declarative step configuration as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Parse(parse::ParseConfig),
    Enrich(enrich::EnrichConfig),
    Filter(filter::FilterConfig),
    Timestamp(timestamp::TimestampConfig),
    Redact(redact::RedactConfig),
}

impl StepConfig {
    pub fn build(&self) -> Result<Box<dyn Step>> {
        Ok(match self {
            StepConfig::Parse(c) => Box::new(ParseStep::new(c.clone())?),
            StepConfig::Enrich(c) => Box::new(EnrichStep::new(c.clone())),
            StepConfig::Filter(c) => Box::new(FilterStep::new(c.clone())?),
            StepConfig::Timestamp(c) => Box::new(TimestampStep::new(c.clone())),
            StepConfig::Redact(c) => Box::new(RedactStep::new(c.clone())?),
        })
    }
}

/// Outcome of running a record through every step.
pub enum PipelineOutcome {
    Delivered(Record),
    Dropped,
    Rejected { record: Record, reason: &'static str },
}

/// Ordered, pre-built pipeline. Constructed once at startup (or on config
/// reload) and shared read-only across workers.
#[derive(Debug)]
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Pipeline { steps }
    }

    pub fn from_config(configs: &[StepConfig]) -> Result<Self> {
        let steps = configs.iter().map(StepConfig::build).collect::<Result<Vec<_>>>()?;
        Ok(Pipeline::new(steps))
    }

    /// Step names in execution order, for introspection (the admin `/stats`
    /// endpoint and tests) without exposing the steps themselves.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs every step in order; a `Drop` or `Reject` from any step
    /// short-circuits the remaining steps.
    pub fn run(&self, mut record: Record, metrics: &Registry) -> Result<PipelineOutcome> {
        for step in &self.steps {
            match step.apply(record, metrics)? {
                StepOutcome::Continue(r) => record = r,
                StepOutcome::Drop { reason } => {
                    tracing::debug!(step = step.name(), reason, "pipeline dropped record");
                    return Ok(PipelineOutcome::Dropped);
                }
                StepOutcome::Reject { record, reason } => {
                    tracing::debug!(step = step.name(), reason, "pipeline rejected record to dlq");
                    return Ok(PipelineOutcome::Rejected { record, reason });
                }
            }
        }
        record.processed_timestamp = Some(chrono::Utc::now());
        Ok(PipelineOutcome::Delivered(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, Record, SourceType};

    fn sample_record(payload: &str) -> Record {
        Record::new(
            SourceType::File,
            "a.log",
            Cursor::File { inode: 1, byte_offset: 0 },
            payload.as_bytes(),
            chrono::Utc::now(),
        )
    }

    #[test]
    fn empty_pipeline_passes_record_through_and_stamps_processed_timestamp() {
        let pipeline = Pipeline::new(vec![]);
        let metrics = Registry::new();
        let record = sample_record("hello world");
        let PipelineOutcome::Delivered(out) = pipeline.run(record, &metrics).unwrap() else {
            panic!("expected delivered");
        };
        assert!(out.processed_timestamp.is_some());
    }
}
