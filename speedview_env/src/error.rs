//! Error types for the SpeedView execution environment.

use speedview_core::EngineError;
use thiserror::Error;

/// Errors that can occur between a caller and a background session.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The session rejected the request (bad calibration edit, stale timestamp, ...)
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The worker task has stopped; no further requests can be served
    #[error("Engine worker closed")]
    WorkerClosed,

    /// A frame was already in flight, so this one was dropped
    #[error("Frame at t={0} dropped: worker busy")]
    FrameDropped(f64),

    /// The detection source failed
    #[error("Detection source error: {0}")]
    SourceError(String),
}

impl EnvError {
    /// Creates a source error.
    pub fn source(msg: impl Into<String>) -> Self {
        Self::SourceError(msg.into())
    }

    /// True if the session itself rejected the request and the worker is still usable.
    pub fn is_engine(&self) -> bool {
        matches!(self, EnvError::Engine(_))
    }
}
