//! Typed configuration tree. Each section either is, or wraps,
//! the same config struct the matching `logagent_core` component already
//! accepts, so this crate never maintains a second definition of a type
//! `logagent_core` owns.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use logagent_core::dispatcher::{BatcherConfig, DispatcherConfig, PriorityRuleConfig, RetryConfig};
use logagent_core::monitor::{ContainerMonitorConfig, FileMonitorConfig};
use logagent_core::pipeline::{StepConfig, TimestampConfig};
use logagent_core::sink::{FileSinkConfig, RemoteIndexConfig};

#[cfg(feature = "message-bus-sink")]
use logagent_core::sink::MessageBusConfig;

/// Top-level document. Every section has a `Default`, so a config file may
/// omit any section it doesn't need to override; [`validate`](crate::validate::validate)
/// is what catches the combinations that are structurally valid YAML but
/// operationally useless (e.g. zero enabled sinks).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub sources: SourcesConfig,
    pub sinks: Vec<SinkEntry>,
    pub dispatcher: DispatcherSection,
    pub processing: Vec<StepConfig>,
    pub positions: PositionsConfig,
    pub dlq: DlqConfig,
    pub buffer: BufferConfig,
    pub timestamp_validation: Option<TimestampConfig>,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig { name: "logagent".to_string(), environment: "development".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub admin_bind_addr: SocketAddr,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            admin_bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9080),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

/// At most one enabled monitor of each kind — modeled as an `Option` per
/// kind rather than a `Vec`, so the constraint holds by construction
/// instead of needing a runtime cardinality check.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SourcesConfig {
    pub file_monitor: Option<FileMonitorConfig>,
    pub container_monitor: Option<ContainerMonitorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkKind {
    File(FileSinkConfig),
    RemoteIndex(RemoteIndexConfig),
    #[cfg(feature = "message-bus-sink")]
    MessageBus(MessageBusConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: SinkKind,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_true() -> bool {
    true
}

/// Per-sink breaker thresholds, passed straight to
/// [`logagent_core::sink::CircuitBreaker::new`] when `logagent-server`
/// wraps each built sink in a [`logagent_core::sink::BreakerGuardedSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// The `dispatcher` tunables plus the retry scheduler and priority
/// classifier, which are independently-configured collaborators rather than
/// fields of `DispatcherConfig` itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DispatcherSection {
    #[serde(flatten)]
    pub queue: DispatcherConfig,
    pub retry: RetryConfig,
    pub priority: PriorityRuleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    pub path: PathBuf,
    pub max_resident: usize,
    #[serde(with = "humantime_serde")]
    pub eviction_ttl: Duration,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        PositionsConfig {
            path: PathBuf::from("positions/positions.json"),
            max_resident: 10_000,
            eviction_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub dir: PathBuf,
}

impl Default for DlqConfig {
    fn default() -> Self {
        DlqConfig { dir: PathBuf::from("dlq") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub dir: PathBuf,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig { dir: PathBuf::from("buffer") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Bearer token required on admin endpoints other than `/health`; no
    /// token means the admin surface is unauthenticated (acceptable only
    /// when `bind_loopback_only` holds — `validate` warns otherwise).
    pub admin_auth_token: Option<String>,
    pub bind_loopback_only: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig { admin_auth_token: None, bind_loopback_only: true }
    }
}
