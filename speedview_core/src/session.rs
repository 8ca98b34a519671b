//! Session - Orchestrates the SpeedView engines for one camera.
//!
//! A `Session` owns every piece of long-lived state for a single video stream
//! and advances it one frame at a time. Nothing is shared by reference: each
//! call to [`Session::process_frame`] consumes a borrowed batch and returns an
//! owned [`FrameSnapshot`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Session                              │
//! │                                                               │
//! │   FrameBatch ──► TRACKER ──► SPEED (Confirmed tracks) ─┐      │
//! │        │            ▲            ▲                     │      │
//! │        │            │      CALIBRATION (read-only)     ├─► FrameSnapshot
//! │        │            │                                  │      │
//! │        └──────► HEATMAP (record, then decay) ──────────┘      │
//! │                                                               │
//! │   CalibrationEdit ──► CALIBRATION (between frames only)       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use speedview_core::{CalibrationEdit, EngineConfig, FrameBatch, PixelPoint, Session};
//!
//! let mut session = Session::new(EngineConfig::default(), 640, 480).unwrap();
//! for (x, y) in [(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)] {
//!     session.apply_calibration_edit(CalibrationEdit::AddPoint(PixelPoint::new(x, y))).unwrap();
//! }
//! session
//!     .apply_calibration_edit(CalibrationEdit::SetDimensions { length: 20.0, width: 10.0 })
//!     .unwrap();
//!
//! let snapshot = session.process_frame(&FrameBatch::new(0.0, vec![])).unwrap();
//! assert_eq!(snapshot.frame_index, 1);
//! ```

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::detection::{FrameBatch, PixelPoint};
use crate::error::EngineError;
use crate::speedview_calibration::{
    CalibrationEngine, CalibrationPoint, CalibrationSnapshot, CalibrationStatus, MetricPoint,
};
use crate::speedview_heatmap::{HeatmapEngine, HeatmapStats};
use crate::speedview_speed::{SpeedEstimator, SpeedReading};
use crate::speedview_tracking::{TrackState, Tracker};

/// Unique identifier for a camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A user-driven change to the calibration zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CalibrationEdit {
    AddPoint(CalibrationPoint),
    SetPoint { index: usize, point: CalibrationPoint },
    SetDimensions { length: f64, width: f64 },
    Reset,
}

/// One active track as reported to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: u64,
    pub label: String,
    pub position: PixelPoint,
    /// Ground-plane position, when the zone is valid and the point is finite
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_position: Option<MetricPoint>,
    pub state: TrackState,
    pub speed: SpeedReading,
    pub confidence: f64,
}

/// Owned result of one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub session_id: SessionId,
    /// 1-based count of frames processed by the session
    pub frame_index: u64,
    pub timestamp: f64,
    /// Confirmed ∪ Lost tracks ordered by id
    pub tracks: Vec<TrackSnapshot>,
    pub confirmed_ids: Vec<u64>,
    pub removed_ids: Vec<u64>,
    pub calibration: CalibrationStatus,
    pub heatmap_stats: HeatmapStats,
    pub malformed_detections: usize,
}

/// All engine state for one camera.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    config: EngineConfig,
    frame_width: u32,
    frame_height: u32,
    calibration: CalibrationEngine,
    tracker: Tracker,
    speed: SpeedEstimator,
    heatmap: HeatmapEngine,
    frame_index: u64,
}

impl Session {
    /// Creates a session for frames of the given pixel size.
    pub fn new(config: EngineConfig, frame_width: u32, frame_height: u32) -> Result<Self, EngineError> {
        Self::with_id(SessionId::new(), config, frame_width, frame_height)
    }

    pub fn with_id(
        id: SessionId,
        config: EngineConfig,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let tracker = Tracker::new(config.tracker.clone(), frame_width, frame_height)?;
        let speed = SpeedEstimator::new(config.speed.clone())?;
        let heatmap = HeatmapEngine::new(config.heatmap.clone(), frame_width, frame_height)?;

        tracing::info!(
            session = %id,
            frame_width,
            frame_height,
            gate_px = tracker.gate(),
            "session created"
        );

        Ok(Self {
            id,
            config,
            frame_width,
            frame_height,
            calibration: CalibrationEngine::new(),
            tracker,
            speed,
            heatmap,
            frame_index: 0,
        })
    }

    /// Restore a persisted calibration zone.
    pub fn restore_calibration(&mut self, snapshot: &CalibrationSnapshot) -> Result<CalibrationStatus, EngineError> {
        self.calibration = CalibrationEngine::from_snapshot(snapshot)?;
        self.clear_speeds();
        Ok(self.calibration.status())
    }

    /// Run the full per-frame pipeline.
    ///
    /// On error (a timestamp that does not advance) no engine state changes.
    pub fn process_frame(&mut self, batch: &FrameBatch) -> Result<FrameSnapshot, EngineError> {
        let output = self.tracker.update(&batch.detections, batch.timestamp)?;

        for track in self.tracker.tracks_mut() {
            if track.state != TrackState::Confirmed {
                continue;
            }
            if let Err(e) = self.speed.estimate(track, &self.calibration) {
                tracing::warn!(session = %self.id, track_id = track.id, "speed estimate failed: {}", e);
                SpeedEstimator::clear(track);
            }
        }

        self.heatmap.record_detections(&batch.detections);
        self.heatmap.apply_decay();
        self.frame_index += 1;

        tracing::trace!(
            session = %self.id,
            frame = self.frame_index,
            active = output.active_ids.len(),
            "frame processed"
        );

        Ok(FrameSnapshot {
            session_id: self.id,
            frame_index: self.frame_index,
            timestamp: batch.timestamp,
            tracks: self.track_snapshots(),
            confirmed_ids: output.confirmed_ids,
            removed_ids: output.removed_ids,
            calibration: self.calibration.status(),
            heatmap_stats: self.heatmap.stats(),
            malformed_detections: output.malformed,
        })
    }

    /// Apply a calibration edit between frames.
    ///
    /// A successful edit restarts speed smoothing for every track, since the
    /// metric scale may have changed. `Reset` also removes every track.
    pub fn apply_calibration_edit(&mut self, edit: CalibrationEdit) -> Result<CalibrationStatus, EngineError> {
        let status = match edit {
            CalibrationEdit::AddPoint(p) => self.calibration.add_point(p)?,
            CalibrationEdit::SetPoint { index, point } => self.calibration.set_point(index, point)?,
            CalibrationEdit::SetDimensions { length, width } => {
                self.calibration.set_dimensions(length, width)?
            }
            CalibrationEdit::Reset => {
                self.calibration.reset();
                let removed = self.tracker.reset();
                tracing::info!(session = %self.id, removed = removed.len(), "calibration reset");
                return Ok(self.calibration.status());
            }
        };
        self.clear_speeds();
        tracing::debug!(session = %self.id, status = status.name(), "calibration edited");
        Ok(status)
    }

    /// Remove every track and clear the heatmap. Calibration is kept.
    pub fn reset(&mut self) {
        let removed = self.tracker.reset();
        self.heatmap.clear();
        tracing::info!(session = %self.id, removed = removed.len(), "session reset");
    }

    pub fn render_heatmap(&self, opacity: f32) -> RgbaImage {
        self.heatmap.render(opacity)
    }

    /// Active tracks with their current speed and metric position.
    pub fn track_snapshots(&self) -> Vec<TrackSnapshot> {
        self.tracker
            .active_tracks()
            .map(|track| {
                let position = track.position();
                TrackSnapshot {
                    id: track.id,
                    label: track.label.clone(),
                    position,
                    metric_position: self.calibration.pixel_to_metric(&position).ok(),
                    state: track.state,
                    speed: SpeedEstimator::reading(track, &self.calibration),
                    confidence: track.confidence,
                }
            })
            .collect()
    }

    fn clear_speeds(&mut self) {
        for track in self.tracker.tracks_mut() {
            SpeedEstimator::clear(track);
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.frame_width, self.frame_height)
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn calibration(&self) -> &CalibrationEngine {
        &self.calibration
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.calibration.status()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn heatmap(&self) -> &HeatmapEngine {
        &self.heatmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Detection};
    use crate::speedview_speed::UnavailableReason;
    use approx::assert_relative_eq;

    fn car(x: f64, y: f64) -> Detection {
        Detection::new(BoundingBox::centered(PixelPoint::new(x, y), 10.0, 6.0), "car", 1.0)
    }

    /// 100×50 px rectangle calibrated as 20 m × 10 m: 5 px per metre.
    fn calibrated_session() -> Session {
        let mut session = Session::new(EngineConfig::default(), 640, 480).unwrap();
        for (x, y) in [(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)] {
            session
                .apply_calibration_edit(CalibrationEdit::AddPoint(PixelPoint::new(x, y)))
                .unwrap();
        }
        let status = session
            .apply_calibration_edit(CalibrationEdit::SetDimensions { length: 20.0, width: 10.0 })
            .unwrap();
        assert!(status.is_valid());
        session
    }

    #[test]
    fn test_end_to_end_rectangle_center() {
        let mut session = calibrated_session();
        let mut snapshot = None;
        for i in 0..3 {
            snapshot = Some(session.process_frame(&FrameBatch::new(i as f64 * 0.1, vec![car(50.0, 25.0)])).unwrap());
        }
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.frame_index, 3);
        assert_eq!(snapshot.tracks.len(), 1);

        let track = &snapshot.tracks[0];
        assert_eq!(track.state, TrackState::Confirmed);
        let metric = track.metric_position.unwrap();
        assert_relative_eq!(metric.x, 10.0, epsilon = 1e-9);
        assert_relative_eq!(metric.y, 5.0, epsilon = 1e-9);
        // Stationary
        assert_relative_eq!(track.speed.mps().unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_speed_through_pipeline() {
        let mut session = calibrated_session();
        // 5 px per 0.1 s = 1 m per 0.1 s = 10 m/s
        let mut last = None;
        for i in 0..15 {
            let x = 10.0 + 5.0 * i as f64;
            last = Some(session.process_frame(&FrameBatch::new(i as f64 * 0.1, vec![car(x, 25.0)])).unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.tracks.len(), 1);
        assert_relative_eq!(last.tracks[0].speed.mps().unwrap(), 10.0, epsilon = 1e-6);
        assert_relative_eq!(last.tracks[0].speed.as_kmh().unwrap(), 36.0, epsilon = 1e-6);
    }

    #[test]
    fn test_uncalibrated_speed_unavailable() {
        let mut session = Session::new(EngineConfig::default(), 640, 480).unwrap();
        let mut last = None;
        for i in 0..4 {
            last = Some(session.process_frame(&FrameBatch::new(i as f64, vec![car(50.0 + i as f64, 25.0)])).unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.calibration, CalibrationStatus::Empty);
        assert_eq!(last.tracks[0].speed, SpeedReading::Unavailable(UnavailableReason::Uncalibrated));
        assert!(last.tracks[0].metric_position.is_none());
    }

    #[test]
    fn test_non_monotonic_frame_leaves_state_untouched() {
        let mut session = calibrated_session();
        session.process_frame(&FrameBatch::new(1.0, vec![car(50.0, 25.0)])).unwrap();
        let stats = session.heatmap().stats();

        let err = session
            .process_frame(&FrameBatch::new(1.0, vec![car(50.0, 25.0)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::NonMonotonicTime { .. }));
        assert_eq!(session.frame_index(), 1);
        assert_eq!(session.heatmap().stats(), stats);
        assert_eq!(session.tracker().track_count(), 1);
    }

    #[test]
    fn test_heatmap_records_then_decays_each_frame() {
        let mut session = calibrated_session();
        let snap = session.process_frame(&FrameBatch::new(0.0, vec![car(55.0, 25.0)])).unwrap();
        assert_eq!(snap.heatmap_stats.total_detections, 1);
        assert_relative_eq!(snap.heatmap_stats.peak_intensity, 0.95);

        let snap = session.process_frame(&FrameBatch::new(0.1, vec![])).unwrap();
        assert_relative_eq!(snap.heatmap_stats.peak_intensity, 0.95 * 0.95);
    }

    #[test]
    fn test_malformed_counted_not_fatal() {
        let mut session = calibrated_session();
        let bad = Detection::new(BoundingBox::new(10.0, 10.0, 5.0, 20.0), "car", 0.9);
        let snap = session
            .process_frame(&FrameBatch::new(0.0, vec![bad, car(50.0, 25.0)]))
            .unwrap();
        assert_eq!(snap.malformed_detections, 1);
        assert_eq!(snap.heatmap_stats.total_detections, 1);
        assert_eq!(session.tracker().track_count(), 1);
    }

    #[test]
    fn test_calibration_reset_removes_tracks() {
        let mut session = calibrated_session();
        for i in 0..3 {
            session.process_frame(&FrameBatch::new(i as f64, vec![car(50.0, 25.0)])).unwrap();
        }
        assert_eq!(session.track_snapshots().len(), 1);

        let status = session.apply_calibration_edit(CalibrationEdit::Reset).unwrap();
        assert_eq!(status, CalibrationStatus::Empty);
        assert_eq!(session.tracker().track_count(), 0);

        // Ids keep increasing after the reset.
        session.process_frame(&FrameBatch::new(10.0, vec![car(50.0, 25.0)])).unwrap();
        assert_eq!(session.tracker().tracks().next().unwrap().id, 2);
    }

    #[test]
    fn test_degenerate_drag_keeps_valid_zone() {
        let mut session = calibrated_session();
        let err = session
            .apply_calibration_edit(CalibrationEdit::SetPoint {
                index: 2,
                point: PixelPoint::new(50.0, 0.0),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::DegenerateGeometry(_)));
        assert!(session.calibration_status().is_valid());
    }

    #[test]
    fn test_recalibration_restarts_smoothing() {
        let mut session = calibrated_session();
        for i in 0..6 {
            let x = 10.0 + 5.0 * i as f64;
            session.process_frame(&FrameBatch::new(i as f64 * 0.1, vec![car(x, 25.0)])).unwrap();
        }
        assert!(session.track_snapshots()[0].speed.is_available());

        // Halving the metric length halves every speed from now on.
        session
            .apply_calibration_edit(CalibrationEdit::SetDimensions { length: 10.0, width: 10.0 })
            .unwrap();
        assert_eq!(
            session.track_snapshots()[0].speed,
            SpeedReading::Unavailable(UnavailableReason::InsufficientHistory)
        );

        let snap = session.process_frame(&FrameBatch::new(0.6, vec![car(40.0, 25.0)])).unwrap();
        assert_relative_eq!(snap.tracks[0].speed.mps().unwrap(), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_restore_calibration_from_snapshot() {
        let source = calibrated_session();
        let persisted = source.calibration().snapshot();

        let mut session = Session::new(EngineConfig::default(), 640, 480).unwrap();
        let status = session.restore_calibration(&persisted).unwrap();
        assert!(status.is_valid());
        assert_ne!(session.id(), source.id());
    }

    #[test]
    fn test_session_reset_clears_heatmap_keeps_calibration() {
        let mut session = calibrated_session();
        session.process_frame(&FrameBatch::new(0.0, vec![car(50.0, 25.0)])).unwrap();
        session.reset();
        assert_eq!(session.tracker().track_count(), 0);
        assert_eq!(session.heatmap().stats().peak_intensity, 0.0);
        assert!(session.calibration_status().is_valid());
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut session = Session::with_id(SessionId::from_seed(7), EngineConfig::default(), 640, 480).unwrap();
        let snap = session.process_frame(&FrameBatch::new(0.0, vec![car(50.0, 25.0)])).unwrap();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["frame_index"], 1);
        assert_eq!(json["calibration"]["status"], "empty");

        let edit: CalibrationEdit =
            serde_json::from_str(r#"{"op": "set_dimensions", "length": 20.0, "width": 3.0}"#).unwrap();
        assert_eq!(edit, CalibrationEdit::SetDimensions { length: 20.0, width: 3.0 });
    }

    #[test]
    fn test_session_id_from_seed_is_stable() {
        assert_eq!(SessionId::from_seed(42), SessionId::from_seed(42));
        assert_ne!(SessionId::from_seed(1), SessionId::from_seed(2));
        assert_eq!(SessionId::from_seed(42).to_string().len(), 8);
    }
}
