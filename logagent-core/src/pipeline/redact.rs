//! Limits payload length and redacts matched patterns.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Step, StepOutcome};
use crate::error::{AgentError, Result};
use crate::metrics::Registry;
use crate::record::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactConfig {
    #[serde(default)]
    pub max_payload_len: Option<usize>,
    /// Patterns whose matches are replaced with `***` before delivery,
    /// e.g. credit-card-like digit runs or API key shapes.
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug)]
pub struct RedactStep {
    config: RedactConfig,
    regexes: Vec<Regex>,
}

impl RedactStep {
    pub fn new(config: RedactConfig) -> Result<Self> {
        let regexes = config
            .patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| AgentError::Config(format!("invalid redact pattern: {e}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(RedactStep { config, regexes })
    }
}

impl Step for RedactStep {
    fn name(&self) -> &'static str {
        "redact"
    }

    fn apply(&self, mut record: Record, _metrics: &Registry) -> Result<StepOutcome> {
        if !self.regexes.is_empty() {
            let mut text = record.payload.as_str().to_string();
            for re in &self.regexes {
                text = re.replace_all(&text, "***").into_owned();
            }
            record.payload = crate::record::Payload::from_bytes(text.as_bytes()).0;
        }
        if let Some(max_len) = self.config.max_payload_len {
            if record.payload.truncate(max_len) {
                record.truncated = true;
            }
        }
        Ok(StepOutcome::Continue(record))
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
    fn line_exactly_at_max_length_is_preserved() {
        let step = RedactStep::new(RedactConfig { max_payload_len: Some(11), patterns: vec![] }).unwrap();
        let metrics = Registry::new();
        let StepOutcome::Continue(out) = step.apply(record("hello world"), &metrics).unwrap() else {
            panic!("expected continue");
        };
        assert_eq!(out.payload.as_str(), "hello world");
        assert!(!out.truncated);
    }

    #[test]
    fn line_one_byte_over_max_is_truncated_and_flagged() {
        let step = RedactStep::new(RedactConfig { max_payload_len: Some(11), patterns: vec![] }).unwrap();
        let metrics = Registry::new();
        let StepOutcome::Continue(out) = step.apply(record("hello world!"), &metrics).unwrap() else {
            panic!("expected continue");
        };
        assert_eq!(out.payload.len(), 11);
        assert!(out.truncated);
    }

    #[test]
    fn pattern_match_is_redacted() {
        let step = RedactStep::new(RedactConfig { max_payload_len: None, patterns: vec![r"\d{4}-\d{4}-\d{4}-\d{4}".into()] }).unwrap();
        let metrics = Registry::new();
        let StepOutcome::Continue(out) =
            step.apply(record("card 1234-5678-9012-3456 charged"), &metrics).unwrap()
        else {
            panic!("expected continue");
        };
        assert_eq!(out.payload.as_str(), "card *** charged");
    }
}
