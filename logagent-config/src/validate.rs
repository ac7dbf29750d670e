//! Startup validation. Composed from small per-concern validator
//! functions rather than one monolithic check — each function owns one
//! rule and returns a plain `String` on failure, so adding a rule never
//! touches the others.
//!
//! Hard failures abort startup. Warnings are surfaced but never block.

use crate::model::Config;

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn validate(config: &Config) -> ValidationReport {
    let checks: &[fn(&Config) -> Result<(), String>] = &[
        validate_at_least_one_source,
        validate_at_least_one_enabled_sink,
        validate_sink_names_unique,
        validate_watermarks,
        validate_queue_capacity,
        validate_timestamp_field_present,
    ];
    let errors = checks.iter().filter_map(|check| check(config).err()).collect();

    let warn_checks: &[fn(&Config) -> Option<String>] = &[warn_unauthenticated_non_loopback, warn_no_processing_steps];
    let warnings = warn_checks.iter().filter_map(|check| check(config)).collect();

    ValidationReport { errors, warnings }
}

fn validate_at_least_one_source(config: &Config) -> Result<(), String> {
    if config.sources.file_monitor.is_some() || config.sources.container_monitor.is_some() {
        Ok(())
    } else {
        Err("sources: at least one of file_monitor or container_monitor must be configured".to_string())
    }
}

fn validate_at_least_one_enabled_sink(config: &Config) -> Result<(), String> {
    if config.sinks.iter().any(|s| s.enabled) {
        Ok(())
    } else {
        Err("sinks: at least one sink must be enabled".to_string())
    }
}

fn validate_sink_names_unique(config: &Config) -> Result<(), String> {
    let mut names: Vec<&str> = config.sinks.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    if names.windows(2).any(|pair| pair[0] == pair[1]) {
        Err("sinks: names must be unique".to_string())
    } else {
        Ok(())
    }
}

fn validate_watermarks(config: &Config) -> Result<(), String> {
    let queue = &config.dispatcher.queue;
    if !(0.0..=1.0).contains(&queue.high_watermark) || !(0.0..=1.0).contains(&queue.critical_watermark) {
        return Err("dispatcher: high_watermark and critical_watermark must be within [0.0, 1.0]".to_string());
    }
    if queue.high_watermark >= queue.critical_watermark {
        return Err("dispatcher: high_watermark must be lower than critical_watermark".to_string());
    }
    Ok(())
}

fn validate_queue_capacity(config: &Config) -> Result<(), String> {
    if config.dispatcher.queue.queue_capacity == 0 {
        Err("dispatcher: queue_capacity must be greater than zero".to_string())
    } else {
        Ok(())
    }
}

fn validate_timestamp_field_present(config: &Config) -> Result<(), String> {
    match &config.timestamp_validation {
        Some(ts) if ts.field.trim().is_empty() => {
            Err("timestamp_validation: field must name a non-empty parsed field".to_string())
        }
        _ => Ok(()),
    }
}

fn warn_unauthenticated_non_loopback(config: &Config) -> Option<String> {
    let is_loopback = config.server.admin_bind_addr.ip().is_loopback();
    if !config.security.bind_loopback_only && !is_loopback && config.security.admin_auth_token.is_none() {
        Some("security: admin surface bound to a non-loopback address with no auth token configured".to_string())
    } else {
        None
    }
}

fn warn_no_processing_steps(config: &Config) -> Option<String> {
    if config.processing.is_empty() {
        Some("processing: no pipeline steps configured; records pass through unmodified".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logagent_core::monitor::{FileMonitorConfig, StartFrom};
    use logagent_core::sink::{FileSinkConfig, FsyncPolicy};

    fn file_monitor() -> FileMonitorConfig {
        FileMonitorConfig {
            include: vec!["/var/log/**/*.log".to_string()],
            exclude: vec![],
            rescan_interval: std::time::Duration::from_secs(30),
            read_chunk_bytes: 65_536,
            line_timeout: std::time::Duration::from_secs(5),
            max_line_length: 1_048_576,
            start_from: StartFrom::End,
            multiline: None,
            rotation_ttl: std::time::Duration::from_secs(86_400),
        }
    }

    fn file_sink_entry(name: &str) -> crate::model::SinkEntry {
        crate::model::SinkEntry {
            name: name.to_string(),
            enabled: true,
            kind: crate::model::SinkKind::File(FileSinkConfig {
                output_dir: "out".into(),
                filename_template: "{source}.log".into(),
                max_open_files: 10,
                fsync_policy: FsyncPolicy::PerBatch,
            }),
            batcher: Default::default(),
            circuit_breaker: Default::default(),
        }
    }

    #[test]
    fn default_config_fails_for_missing_source_and_sink() {
        let report = validate(&Config::default());
        assert!(!report.is_ok());
        assert!(report.errors.iter().any(|e| e.contains("sources")));
        assert!(report.errors.iter().any(|e| e.contains("sinks")));
    }

    #[test]
    fn adding_a_source_and_enabled_sink_clears_those_errors() {
        let mut config = Config::default();
        config.sources.file_monitor = Some(file_monitor());
        config.sinks.push(file_sink_entry("local"));
        let report = validate(&config);
        assert!(!report.errors.iter().any(|e| e.contains("sources")));
        assert!(!report.errors.iter().any(|e| e.contains("sinks")));
    }

    #[test]
    fn inverted_watermarks_are_rejected() {
        let mut config = Config::default();
        config.dispatcher.queue.high_watermark = 0.9;
        config.dispatcher.queue.critical_watermark = 0.5;
        let report = validate(&config);
        assert!(report.errors.iter().any(|e| e.contains("watermark")));
    }

    #[test]
    fn duplicate_sink_names_are_rejected() {
        let mut config = Config::default();
        config.sinks.push(file_sink_entry("dup"));
        config.sinks.push(file_sink_entry("dup"));
        let report = validate(&config);
        assert!(report.errors.iter().any(|e| e.contains("unique")));
    }
}
