//! Clock abstraction used by the frame driver.

use std::time::Duration;

/// The driver's view of time.
///
/// Latency is measured against this clock, so the frame loop can run on the
/// real clock in production and on a stepped one in tests.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - monotonic `Instant` since creation
/// - **Testing**: `SteppedContext` - virtual time advanced explicitly
pub trait FrameContext: Send + Sync + 'static {
    /// Monotonic time since context creation.
    ///
    /// Used to measure per-frame latency.
    fn now(&self) -> Duration;
}
