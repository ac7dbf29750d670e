//! Hierarchical cancellation built on [`tokio_util::sync::CancellationToken`], whose
//! parent/child relationship gives us exactly that fan-out for free instead
//! of threading a `watch` channel through every constructor.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Ordered shutdown: monitors, then dispatcher, then sinks, then the
/// position flusher, then DLQ/buffer close. Each stage gets its own child
/// token so a coordinator can cancel monitors first and wait for their
/// drain before cancelling the dispatcher.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
    monitors: CancellationToken,
    dispatcher: CancellationToken,
    sinks: CancellationToken,
    leaf: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let monitors = root.child_token();
        let dispatcher = root.child_token();
        let sinks = root.child_token();
        let leaf = root.child_token();
        ShutdownCoordinator { root, monitors, dispatcher, sinks, leaf }
    }

    pub fn monitors_token(&self) -> CancellationToken {
        self.monitors.clone()
    }

    pub fn dispatcher_token(&self) -> CancellationToken {
        self.dispatcher.clone()
    }

    pub fn sinks_token(&self) -> CancellationToken {
        self.sinks.clone()
    }

    pub fn leaf_token(&self) -> CancellationToken {
        self.leaf.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancels every stage immediately; callers that need ordered drain
    /// should cancel `monitors_token()` directly first and await drain
    /// before calling this.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn cancel_monitors(&self) {
        self.monitors.cancel();
    }

    pub fn cancel_dispatcher(&self) {
        self.dispatcher.cancel();
    }

    pub fn cancel_sinks(&self) {
        self.sinks.cancel();
    }

    pub fn cancel_leaf(&self) {
        self.leaf.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for `fut` to complete or for `deadline` to elapse, whichever first;
/// used for the queue-drain deadline (default 30s) and the sink `Send`
/// timeout (default 120s).
pub async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(deadline, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelling_monitors_does_not_cancel_dispatcher() {
        let coord = ShutdownCoordinator::new();
        coord.cancel_monitors();
        assert!(coord.monitors_token().is_cancelled());
        assert!(!coord.dispatcher_token().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_child() {
        let coord = ShutdownCoordinator::new();
        coord.cancel_all();
        assert!(coord.monitors_token().is_cancelled());
        assert!(coord.dispatcher_token().is_cancelled());
        assert!(coord.sinks_token().is_cancelled());
        assert!(coord.leaf_token().is_cancelled());
    }
}
