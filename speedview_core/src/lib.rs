//! SpeedView Core - Calibrated Vehicle Tracking, Speed and Density
//!
//! Turns a stream of per-frame object detections into three derived artifacts:
//! 1. **Calibration**: a planar homography from four pixel corners and a metric
//!    rectangle, mapping pixels to metres on the road plane
//! 2. **Tracks with speed**: persistent identities across frames, each with an
//!    exponentially smoothed ground speed
//! 3. **Heatmap**: a decaying detection density grid, renderable as an RGBA image
//!
//! ```text
//! detections ─► Tracker ─► SpeedEstimator ◄─ CalibrationEngine
//!      │
//!      └──────► HeatmapEngine (record + decay)
//! ```
//!
//! Everything here is synchronous and free of I/O. A [`Session`] bundles the
//! engines for one camera; `speedview_env` runs sessions off-thread.

pub mod config;
pub mod detection;
pub mod error;
pub mod session;
pub mod speedview_calibration;
pub mod speedview_heatmap;
pub mod speedview_speed;
pub mod speedview_tracking;

// Re-export key types for convenience
pub use config::EngineConfig;
pub use detection::{BoundingBox, Detection, FrameBatch, PixelPoint};
pub use error::EngineError;
pub use session::{CalibrationEdit, FrameSnapshot, Session, SessionId, TrackSnapshot};
pub use speedview_calibration::{
    CalibrationEngine, CalibrationPoint, CalibrationSnapshot, CalibrationStatus, Homography,
    MetricPoint,
};
pub use speedview_heatmap::{HeatmapConfig, HeatmapEngine, HeatmapStats};
pub use speedview_speed::{SpeedConfig, SpeedEstimator, SpeedReading, UnavailableReason, MPS_TO_KMH};
pub use speedview_tracking::{Track, TrackSample, TrackState, Tracker, TrackerConfig, TrackerOutput};
