//! Per-sink circuit breaker state machine. The breaker state transition
//! and the sink `Send` call are never held under the same lock: every
//! public method that crosses into the underlying sink takes the state
//! transition as a short, separate critical section and releases the lock
//! before the caller invokes `Send`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding matches `Registry::set_circuit_breaker_state`.
    pub fn as_metric_value(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
}

/// What the caller should do, decided strictly under the lock; the actual
/// `Send` call happens after this function returns, never while held.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    ProceedAsProbe,
    Reject,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    window: Duration,
    open_timeout: Duration,
    /// Guards HalfOpen admission so only one probe is in flight at a time,
    /// resolved by compare-and-swap rather than holding the main mutex
    /// across the probe call.
    probe_in_flight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, window: Duration, open_timeout: Duration) -> Self {
        CircuitBreaker {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                window_start: Instant::now(),
                opened_at: None,
            }),
            failure_threshold,
            window,
            open_timeout,
            probe_in_flight: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Call before attempting a `Send`. Transitions Open → HalfOpen when
    /// `open_timeout` has elapsed; admits at most one concurrent probe in
    /// HalfOpen.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Proceed,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    drop(inner);
                    if self.probe_in_flight.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                        Admission::ProceedAsProbe
                    } else {
                        Admission::Reject
                    }
                } else {
                    Admission::Reject
                }
            }
            BreakerState::HalfOpen => {
                drop(inner);
                if self.probe_in_flight.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                    Admission::ProceedAsProbe
                } else {
                    Admission::Reject
                }
            }
        }
    }

    /// Call after `Send` returns, outside any lock the caller might hold.
    pub fn record_success(&self, was_probe: bool) {
        if was_probe {
            self.probe_in_flight.store(0, Ordering::SeqCst);
        }
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.window_start = Instant::now();
        inner.opened_at = None;
    }

    pub fn record_failure(&self, was_probe: bool) {
        if was_probe {
            self.probe_in_flight.store(0, Ordering::SeqCst);
        }
        let mut inner = self.inner.lock();
        if was_probe {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }
        if inner.window_start.elapsed() > self.window {
            inner.failure_count = 0;
            inner.window_start = Instant::now();
        }
        inner.failure_count += 1;
        if inner.failure_count >= self.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60), Duration::from_millis(50));
        for _ in 0..3 {
            assert_eq!(breaker.admit(), Admission::Proceed);
            breaker.record_failure(false);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.admit(), Admission::Reject);
    }

    #[test]
    fn half_open_probe_succeeds_closes_breaker() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60), Duration::from_millis(10));
        breaker.admit();
        breaker.record_failure(false);
        assert_eq!(breaker.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.admit(), Admission::ProceedAsProbe);
        breaker.record_success(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn only_one_probe_admitted_at_a_time() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60), Duration::from_millis(10));
        breaker.admit();
        breaker.record_failure(false);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.admit(), Admission::ProceedAsProbe);
        assert_eq!(breaker.admit(), Admission::Reject);
    }
}
