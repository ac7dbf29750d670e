//! Core ingestion, dispatch, and delivery engine for the log aggregation
//! agent. `logagent-server` wires this crate's [`dispatcher::Dispatcher`],
//! [`monitor`] sources, and [`sink`] destinations together behind a CLI and
//! admin HTTP surface; `logagent-config` supplies the YAML-driven
//! configuration structs that construct them.

pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod position;
pub mod record;
pub mod shutdown;
pub mod sink;

pub use error::{AgentError, Result};
pub use record::Record;
