//! Adds labels from metadata (container name, file path, hostname) that the
//! monitor itself doesn't stamp.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Step, StepOutcome};
use crate::error::Result;
use crate::metrics::Registry;
use crate::record::Record;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Static label set to add to every record passing through this step,
    /// e.g. `{"hostname": "${HOSTNAME}"}` already expanded by the config
    /// loader before reaching here.
    #[serde(default)]
    pub static_labels: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct EnrichStep {
    config: EnrichConfig,
}

impl EnrichStep {
    pub fn new(config: EnrichConfig) -> Self {
        EnrichStep { config }
    }
}

impl Step for EnrichStep {
    fn name(&self) -> &'static str {
        "enrich"
    }

    fn apply(&self, mut record: Record, _metrics: &Registry) -> Result<StepOutcome> {
        for (k, v) in &self.config.static_labels {
            if record.labels.get(k).is_none() {
                record.labels.set(k, v);
            }
        }
        Ok(StepOutcome::Continue(record))
    }
}
