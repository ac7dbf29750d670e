//! Source monitors: discover sources, tail them, and
//! push [`Record`](crate::record::Record)s into the dispatcher, blocking
//! their own read loop when the dispatcher pushes back rather than
//! dropping at the source.

mod container_monitor;
mod docker_client;
mod file_monitor;

pub use container_monitor::{ContainerInfo, ContainerLogLine, ContainerMonitor, ContainerMonitorConfig, ContainerRuntimeClient};
pub use docker_client::DockerEngineClient;
pub use file_monitor::{FileMonitor, FileMonitorConfig, MultilineConfig, StartFrom};

#[cfg(any(test, feature = "test-util"))]
pub use container_monitor::MockContainerRuntimeClient;
