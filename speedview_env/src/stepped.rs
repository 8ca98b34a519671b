//! Virtual clock for reproducible latency measurements.

use crate::FrameContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Context whose time only moves when told to.
///
/// Every `now()` call returns the current virtual time and then advances it
/// by `tick`, so a submit/reply pair measures exactly one tick.
#[derive(Debug, Default)]
pub struct SteppedContext {
    virtual_time_ns: AtomicU64,
    tick_ns: u64,
}

impl SteppedContext {
    /// A clock frozen at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that advances by `tick` after each reading.
    pub fn with_tick(tick: Duration) -> Self {
        Self {
            virtual_time_ns: AtomicU64::new(0),
            tick_ns: tick.as_nanos() as u64,
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Advances virtual time by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl FrameContext for SteppedContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.virtual_time_ns.fetch_add(self.tick_ns, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frozen_clock_moves_only_on_advance() {
        let ctx = SteppedContext::new();
        assert_eq!(ctx.now(), Duration::ZERO);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance(Duration::from_millis(1500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_tick_per_reading() {
        let ctx = SteppedContext::with_tick(Duration::from_millis(5));
        assert_eq!(ctx.now(), Duration::ZERO);
        assert_eq!(ctx.now(), Duration::from_millis(5));
        ctx.advance(Duration::from_millis(100));
        assert_eq!(ctx.now(), Duration::from_millis(110));
    }
}
