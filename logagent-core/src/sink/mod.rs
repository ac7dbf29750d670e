//! Delivery destinations. A sink receives already-pipelined,
//! already-batched records as shared pointers and must treat them as
//! immutable; it reports health so the dispatcher's batcher and the admin
//! `/health` endpoint can react to degradation.

mod buffer;
mod circuit_breaker;
mod file_sink;
mod remote_index;

#[cfg(feature = "message-bus-sink")]
mod message_bus;

pub use buffer::DiskBuffer;
pub use circuit_breaker::{Admission, BreakerState, CircuitBreaker};
pub use file_sink::{FileSink, FileSinkConfig, FsyncPolicy};
pub use remote_index::{CompressionKind, RemoteIndexConfig, RemoteIndexSink};

#[cfg(feature = "message-bus-sink")]
pub use message_bus::{MessageBusConfig, MessageBusSink};

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-util"))]
use mockall::automock;

use crate::error::Result;
use crate::record::Record;

/// Contract every delivery destination implements. Must be safe
/// for concurrent calls and honor the caller's timeout via the surrounding
/// `tokio::time::timeout`, not internally.
#[cfg_attr(any(test, feature = "test-util"), automock)]
#[async_trait]
pub trait Sink: std::fmt::Debug + Send + Sync {
    async fn send(&self, records: &[Arc<Record>]) -> Result<()>;
    fn is_healthy(&self) -> bool;
    fn name(&self) -> &str;
}

/// Wraps any `Sink` with its circuit breaker, satisfying the "breaker
/// mutex must not be held while the underlying call executes" rule by
/// calling `admit()`/`record_success`/`record_failure` strictly outside the
/// `send` future.
#[derive(Debug)]
pub struct BreakerGuardedSink<S: Sink> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S: Sink> BreakerGuardedSink<S> {
    pub fn new(inner: S, breaker: CircuitBreaker) -> Self {
        BreakerGuardedSink { inner, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Sink> Sink for BreakerGuardedSink<S> {
    async fn send(&self, records: &[Arc<Record>]) -> Result<()> {
        let admission = self.breaker.admit();
        let was_probe = match admission {
            Admission::Reject => {
                return Err(crate::error::AgentError::BreakerOpen { sink: self.inner.name().to_string() });
            }
            Admission::ProceedAsProbe => true,
            Admission::Proceed => false,
        };

        let result = self.inner.send(records).await;
        match &result {
            Ok(()) => self.breaker.record_success(was_probe),
            Err(_) => self.breaker.record_failure(was_probe),
        }
        result
    }

    fn is_healthy(&self) -> bool {
        self.breaker.state() != BreakerState::Open && self.inner.is_healthy()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
