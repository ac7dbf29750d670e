//! Parses a field into the event timestamp and applies the configurable
//! drift policy. This is the step that produces the
//! `TimestampAdjustment` audit entries and the `timestamp_adjustments_total`
//! metric exercised by seed scenario 5.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Step, StepOutcome};
use crate::error::Result;
use crate::metrics::Registry;
use crate::record::{Record, TimestampAdjustment};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampAction {
    Clamp,
    Reject,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// Field (previously extracted by a parse step) holding the candidate
    /// timestamp, RFC3339-formatted.
    pub field: String,
    #[serde(with = "humantime_serde", default = "default_max_past_age")]
    pub max_past_age: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_max_future_age")]
    pub max_future_age: std::time::Duration,
    #[serde(default = "default_action")]
    pub action: TimestampAction,
}

fn default_max_past_age() -> std::time::Duration {
    std::time::Duration::from_secs(6 * 3600)
}

fn default_max_future_age() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}

fn default_action() -> TimestampAction {
    TimestampAction::Clamp
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            field: String::new(),
            max_past_age: default_max_past_age(),
            max_future_age: default_max_future_age(),
            action: default_action(),
        }
    }
}

#[derive(Debug)]
pub struct TimestampStep {
    config: TimestampConfig,
}

impl TimestampStep {
    pub fn new(config: TimestampConfig) -> Self {
        TimestampStep { config }
    }
}

impl Step for TimestampStep {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn apply(&self, mut record: Record, metrics: &Registry) -> Result<StepOutcome> {
        let Some(raw) = record.fields.get(&self.config.field) else {
            return Ok(StepOutcome::Continue(record));
        };

        let parsed: Option<DateTime<Utc>> =
            DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc));

        let Some(parsed) = parsed else {
            // Parse failure retains the ingestion timestamp rather than dropping the record.
            return Ok(StepOutcome::Continue(record));
        };

        let now = Utc::now();
        let age = now.signed_duration_since(parsed);
        let max_past = chrono::Duration::from_std(self.config.max_past_age).unwrap_or(chrono::Duration::zero());
        let max_future = chrono::Duration::from_std(self.config.max_future_age).unwrap_or(chrono::Duration::zero());

        let drift = if age > max_past {
            Some("past_drift")
        } else if -age > max_future {
            Some("future_drift")
        } else {
            None
        };

        match drift {
            None => {
                record.timestamp = parsed;
                Ok(StepOutcome::Continue(record))
            }
            Some(reason) => match self.config.action {
                TimestampAction::Clamp => {
                    record.original_timestamp = Some(parsed);
                    record.timestamp_adjustments.push(TimestampAdjustment {
                        from: parsed,
                        to: now,
                        reason: reason.to_string(),
                    });
                    record.timestamp = now;
                    metrics.inc_timestamp_adjustment(reason);
                    Ok(StepOutcome::Continue(record))
                }
                TimestampAction::Reject => {
                    metrics.inc_timestamp_adjustment(reason);
                    Ok(StepOutcome::Reject { record, reason: "timestamp_rejected" })
                }
                TimestampAction::Warn => {
                    record.timestamp = parsed;
                    metrics.inc_timestamp_adjustment(reason);
                    Ok(StepOutcome::Continue(record))
                }
            },
        }
    }
}
