//! Drops records matching a predicate.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Step, StepOutcome};
use crate::error::{AgentError, Result};
use crate::metrics::Registry;
use crate::record::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Records whose payload matches this pattern are dropped, unless
    /// `negate` is set, in which case non-matching records are dropped.
    pub pattern: String,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug)]
pub struct FilterStep {
    config: FilterConfig,
    regex: Regex,
}

impl FilterStep {
    pub fn new(config: FilterConfig) -> Result<Self> {
        let regex = Regex::new(&config.pattern)
            .map_err(|e| AgentError::Config(format!("invalid filter pattern: {e}")))?;
        Ok(FilterStep { config, regex })
    }
}

impl Step for FilterStep {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn apply(&self, record: Record, _metrics: &Registry) -> Result<StepOutcome> {
        let matches = self.regex.is_match(record.payload.as_str());
        let drop = matches != self.config.negate;
        if drop {
            Ok(StepOutcome::Drop { reason: "filter_matched" })
        } else {
            Ok(StepOutcome::Continue(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    fn record(payload: &str) -> Record {
        Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, payload.as_bytes(), chrono::Utc::now())
    }

    #[test]
    fn matching_record_is_dropped() {
        let step = FilterStep::new(FilterConfig { pattern: "DEBUG".into(), negate: false }).unwrap();
        let metrics = Registry::new();
        let outcome = step.apply(record("DEBUG noisy line"), &metrics).unwrap();
        assert!(matches!(outcome, StepOutcome::Drop { .. }));
    }

    #[test]
    fn non_matching_record_continues() {
        let step = FilterStep::new(FilterConfig { pattern: "DEBUG".into(), negate: false }).unwrap();
        let metrics = Registry::new();
        let outcome = step.apply(record("INFO fine"), &metrics).unwrap();
        assert!(matches!(outcome, StepOutcome::Continue(_)));
    }
}
