//! Translates a loaded [`Config`] into live `logagent-core` components.
//! Shared between startup and `/config/reload` so both paths assemble a
//! pipeline, and startup alone assembles sinks/monitors.

use std::sync::Arc;

use logagent_config::model::{Config, SinkKind};
use logagent_core::dispatcher::BatcherConfig;
use logagent_core::pipeline::{Pipeline, Step, TimestampStep};
use logagent_core::sink::{BreakerGuardedSink, CircuitBreaker, FileSink, RemoteIndexSink, Sink};
use logagent_core::{AgentError, Result};

#[cfg(feature = "message-bus-sink")]
use logagent_core::sink::MessageBusSink;

/// Prepends the top-level `timestamp_validation` step (if configured) ahead
/// of the user's `processing.steps`, so drift clamping always runs before
/// any step that depends on `record.timestamp` being trustworthy.
pub fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let mut steps: Vec<Box<dyn Step>> = Vec::new();
    if let Some(ts) = &config.timestamp_validation {
        steps.push(Box::new(TimestampStep::new(ts.clone())));
    }
    for step_config in &config.processing {
        steps.push(step_config.build()?);
    }
    Ok(Pipeline::new(steps))
}

/// Builds every enabled sink, each wrapped in its own [`CircuitBreaker`]
/// per the entry's `circuit_breaker` settings.
pub async fn build_sinks(config: &Config) -> anyhow::Result<Vec<(String, Arc<dyn Sink>, BatcherConfig)>> {
    let mut built = Vec::new();
    for entry in &config.sinks {
        if !entry.enabled {
            continue;
        }
        let breaker =
            CircuitBreaker::new(entry.circuit_breaker.failure_threshold, entry.circuit_breaker.window, entry.circuit_breaker.open_timeout);

        let sink: Arc<dyn Sink> = match &entry.kind {
            SinkKind::File(cfg) => {
                Arc::new(BreakerGuardedSink::new(FileSink::new(entry.name.clone(), cfg.clone())?, breaker))
            }
            SinkKind::RemoteIndex(cfg) => {
                // Each remote-index entry may pin its own client cert / CA,
                // so its `reqwest::Client` is built per-entry rather than shared.
                let client = RemoteIndexSink::build_client(cfg)?;
                Arc::new(BreakerGuardedSink::new(RemoteIndexSink::new(entry.name.clone(), cfg.clone(), client), breaker))
            }
            #[cfg(feature = "message-bus-sink")]
            SinkKind::MessageBus(cfg) => {
                Arc::new(BreakerGuardedSink::new(MessageBusSink::connect(entry.name.clone(), cfg.clone()).await?, breaker))
            }
        };
        built.push((entry.name.clone(), sink, entry.batcher.clone()));
    }
    if built.is_empty() {
        return Err(AgentError::Config("no enabled sinks after filtering".into()).into());
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logagent_config::model::{CircuitBreakerConfig, SinkEntry};
    use logagent_core::sink::{FileSinkConfig, FsyncPolicy};
    use std::path::PathBuf;

    fn file_sink_config(dir: PathBuf) -> FileSinkConfig {
        FileSinkConfig {
            output_dir: dir,
            filename_template: "{source}-{date}.log".to_string(),
            max_open_files: 16,
            fsync_policy: FsyncPolicy::Periodic,
        }
    }

    fn sink_entry(name: &str, enabled: bool, dir: PathBuf) -> SinkEntry {
        SinkEntry {
            name: name.to_string(),
            enabled,
            kind: SinkKind::File(file_sink_config(dir)),
            batcher: Default::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    #[test]
    fn pipeline_prepends_timestamp_step_ahead_of_processing() {
        let mut config = Config::default();
        config.timestamp_validation = Some(Default::default());
        let pipeline = build_pipeline(&config).unwrap();
        assert_eq!(pipeline.step_names().first(), Some(&"timestamp"));
    }

    #[test]
    fn pipeline_has_no_timestamp_step_when_unconfigured() {
        let config = Config::default();
        let pipeline = build_pipeline(&config).unwrap();
        assert!(!pipeline.step_names().contains(&"timestamp"));
    }

    #[tokio::test]
    async fn no_enabled_sinks_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.sinks = vec![sink_entry("disabled", false, dir.path().to_path_buf())];
        let result = build_sinks(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn enabled_sink_is_built_and_disabled_sink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.sinks = vec![sink_entry("active", true, dir.path().to_path_buf()), sink_entry("inactive", false, dir.path().to_path_buf())];
        let built = build_sinks(&config).await.unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].0, "active");
    }
}
