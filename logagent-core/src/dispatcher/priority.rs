//! Priority classification. A record's priority is decided once, at enqueue time,
//! from its labels.

use serde::{Deserialize, Serialize};

use crate::dispatcher::queue::Priority;
use crate::record::Record;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PriorityRuleConfig {
    /// `label -> value -> priority`; first matching label wins, in
    /// insertion order. Unmatched records get `default_priority`.
    #[serde(default)]
    pub rules: Vec<PriorityRuleEntry>,
    #[serde(default = "default_priority")]
    pub default_priority: PriorityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRuleEntry {
    pub label: String,
    pub value: String,
    pub priority: PriorityLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    High,
    #[default]
    Normal,
    Low,
}

fn default_priority() -> PriorityLevel {
    PriorityLevel::Normal
}

impl From<PriorityLevel> for Priority {
    fn from(level: PriorityLevel) -> Self {
        match level {
            PriorityLevel::High => Priority::High,
            PriorityLevel::Normal => Priority::Normal,
            PriorityLevel::Low => Priority::Low,
        }
    }
}

#[derive(Debug)]
pub struct PriorityClassifier {
    config: PriorityRuleConfig,
}

impl PriorityClassifier {
    pub fn new(config: PriorityRuleConfig) -> Self {
        PriorityClassifier { config }
    }

    pub fn classify(&self, record: &Record) -> Priority {
        for rule in &self.config.rules {
            if record.labels.get(&rule.label) == Some(rule.value.as_str()) {
                return rule.priority.into();
            }
        }
        self.config.default_priority.into()
    }
}
