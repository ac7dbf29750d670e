//! Configuration loading, validation, and CLI argument parsing for the log
//! aggregation agent. Reuses `logagent_core`'s config structs directly
//! (`FileMonitorConfig`, `DispatcherConfig`, `StepConfig`, ...) rather than
//! redefining a parallel schema, and layers on top: `${VAR}` environment
//! expansion, a `ConfigSource` provenance enum, and a hard-failure/soft-warning
//! validation split.

pub mod cli;
pub mod env_expand;
pub mod model;
pub mod source;
pub mod validate;

pub use cli::Cli;
pub use model::Config;
pub use source::{load, ConfigSource};
pub use validate::{validate, ValidationReport};
