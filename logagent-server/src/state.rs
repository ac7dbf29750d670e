//! Shared application state handed to every admin HTTP handler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use logagent_config::{Config, ConfigSource};
use logagent_core::dispatcher::Dispatcher;
use logagent_core::metrics::Registry;
use logagent_core::position::PositionStore;
use logagent_core::shutdown::ShutdownCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<Config>>,
    pub config_path: PathBuf,
    pub default_config_path: PathBuf,
    pub config_source: Arc<ArcSwap<ConfigSource>>,
    pub dispatcher: Arc<Dispatcher>,
    pub positions: Arc<PositionStore>,
    pub metrics: Arc<Registry>,
    pub shutdown: ShutdownCoordinator,
    pub admin_auth_token: Option<String>,
    pub started_at: Instant,
    /// Cursor sequence source for records pushed through `/api/v1/logs`,
    /// which have no upstream offset of their own.
    pub http_sequence: Arc<AtomicU64>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn next_http_sequence(&self) -> u64 {
        self.http_sequence.fetch_add(1, Ordering::Relaxed)
    }
}
