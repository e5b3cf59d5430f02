//! Runtime handle threaded through every component
//!
//! Carries the clock, the metrics sink and the cancellation token so that
//! components never reach for global state. Long-running loops (deadlock
//! detector, sweepers, snapshot streaming, recovery) check the token at
//! each iteration.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricsSink, NullMetrics};

/// Time source abstraction so tests can pin the clock
pub trait Clock: Send + Sync {
    /// Wall-clock time
    fn now(&self) -> DateTime<Utc>;
    /// Monotonic instant for durations
    fn monotonic(&self) -> Instant;
}

/// Clock backed by the operating system
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Shared runtime context passed to component constructors
#[derive(Clone)]
pub struct RuntimeHandle {
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSink>,
    pub shutdown: CancellationToken,
}

impl RuntimeHandle {
    /// Handle with the system clock and the given metrics sink
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Handle that drops all metrics; used by tests and simple embedders
    pub fn detached() -> Self {
        Self::new(Arc::new(NullMetrics))
    }

    /// Replace the clock (tests)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Child handle whose token is cancelled with the parent
    pub fn child(&self) -> Self {
        Self {
            clock: Arc::clone(&self.clock),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.child_token(),
        }
    }

    /// True once shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonicity() {
        let clock = SystemClock;
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }

    #[test]
    fn test_child_token_follows_parent() {
        let handle = RuntimeHandle::detached();
        let child = handle.child();
        assert!(!child.is_shutting_down());
        handle.shutdown.cancel();
        assert!(child.is_shutting_down());
    }
}
