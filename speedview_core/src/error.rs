//! Error taxonomy shared by every SpeedView engine.
//!
//! All variants are recoverable. Engines report them as typed results and
//! never install partial state when returning one.

use thiserror::Error;

/// Errors produced by the calibration, tracking, speed and heatmap engines.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A fifth calibration point was added to a full zone.
    #[error("Calibration zone already holds {max} points")]
    CapacityExceeded { max: usize },

    /// A dimension or configuration value is not strictly positive / in range.
    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),

    /// The four points are collinear, self-intersecting or ill-conditioned.
    #[error("Degenerate calibration geometry: {0}")]
    DegenerateGeometry(String),

    /// No valid homography is installed.
    #[error("Calibration is not valid")]
    Uncalibrated,

    /// A timestamp did not advance past its predecessor.
    #[error("Non-monotonic time: {current} does not follow {previous}")]
    NonMonotonicTime { previous: f64, current: f64 },

    /// A detection failed validation (non-finite or inverted box, bad confidence).
    #[error("Malformed detection: {0}")]
    MalformedDetection(String),

    /// The pixel lies on the zone's vanishing line and has no finite metric image.
    #[error("Point ({x}, {y}) projects to infinity")]
    PointAtInfinity { x: f64, y: f64 },

    /// A calibration point index outside the points currently held.
    #[error("Calibration point index {index} out of range (have {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

impl EngineError {
    /// Creates an invalid-dimension error.
    pub fn invalid_dimension(msg: impl Into<String>) -> Self {
        Self::InvalidDimension(msg.into())
    }

    /// Creates a degenerate-geometry error.
    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateGeometry(msg.into())
    }

    /// Creates a malformed-detection error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedDetection(msg.into())
    }
}
