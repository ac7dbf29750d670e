//! Extracts structured fields from the raw payload into `Record::fields`.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Step, StepOutcome};
use crate::error::{AgentError, Result};
use crate::metrics::Registry;
use crate::record::Record;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseKind {
    Regex,
    Json,
    KeyValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseConfig {
    pub kind: ParseKind,
    /// Required when `kind == Regex`; named capture groups become fields.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Separator for key-value parsing, default `=`.
    #[serde(default = "default_kv_separator")]
    pub kv_separator: String,
}

fn default_kv_separator() -> String {
    "=".to_string()
}

#[derive(Debug)]
pub struct ParseStep {
    config: ParseConfig,
    regex: Option<Regex>,
}

impl ParseStep {
    pub fn new(config: ParseConfig) -> Result<Self> {
        let regex = match (config.kind, &config.pattern) {
            (ParseKind::Regex, Some(pattern)) => Some(
                Regex::new(pattern)
                    .map_err(|e| AgentError::Config(format!("invalid parse pattern: {e}")))?,
            ),
            (ParseKind::Regex, None) => {
                return Err(AgentError::Config("parse step of kind regex requires a pattern".into()));
            }
            _ => None,
        };
        Ok(ParseStep { config, regex })
    }
}

impl Step for ParseStep {
    fn name(&self) -> &'static str {
        "parse"
    }

    fn apply(&self, mut record: Record, _metrics: &Registry) -> Result<StepOutcome> {
        match self.config.kind {
            ParseKind::Regex => {
                if let Some(re) = &self.regex {
                    if let Some(caps) = re.captures(record.payload.as_str()) {
                        for name in re.capture_names().flatten() {
                            if let Some(m) = caps.name(name) {
                                record.fields.set(name, m.as_str());
                            }
                        }
                    }
                }
            }
            ParseKind::Json => {
                if let Ok(serde_json::Value::Object(map)) =
                    serde_json::from_str::<serde_json::Value>(record.payload.as_str())
                {
                    for (k, v) in map {
                        let rendered = match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        record.fields.set(k, rendered);
                    }
                }
            }
            ParseKind::KeyValue => {
                for pair in record.payload.as_str().split_whitespace() {
                    if let Some((k, v)) = pair.split_once(self.config.kv_separator.as_str()) {
                        if !k.is_empty() {
                            record.fields.set(k, v);
                        }
                    }
                }
            }
        }
        Ok(StepOutcome::Continue(record))
    }
}
