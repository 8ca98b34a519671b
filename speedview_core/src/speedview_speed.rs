//! The "SPEED" Engine - Metric Speed from Track History
//!
//! Projects the two newest history samples of a track through the calibration
//! homography, divides the metric displacement by the elapsed time and folds
//! the result into an exponential moving average:
//!
//! ```text
//! smoothed = α · instant + (1 − α) · previous
//! ```

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::speedview_calibration::CalibrationEngine;
use crate::speedview_tracking::Track;

/// m/s → km/h
pub const MPS_TO_KMH: f64 = 3.6;

/// Configuration for the SpeedEstimator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// Smoothing factor α in (0, 1] (default: 0.3)
    pub alpha: f64,

    /// Smallest elapsed time between samples in seconds (default: 1e-6)
    pub min_elapsed: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            min_elapsed: 1e-6,
        }
    }
}

impl SpeedConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.alpha.is_finite() && self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(EngineError::invalid_dimension(format!(
                "alpha must be in (0, 1], got {}",
                self.alpha
            )));
        }
        if !(self.min_elapsed.is_finite() && self.min_elapsed > 0.0) {
            return Err(EngineError::invalid_dimension(format!(
                "min_elapsed must be > 0, got {}",
                self.min_elapsed
            )));
        }
        Ok(())
    }
}

/// Why no speed could be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// The calibration zone is not valid
    Uncalibrated,
    /// Fewer than two history samples
    InsufficientHistory,
    /// A sample lies on the zone's vanishing line
    OutOfPlane,
}

/// Speed reported for a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SpeedReading {
    /// Smoothed speed in metres per second
    Available(f64),
    Unavailable(UnavailableReason),
}

impl SpeedReading {
    pub fn mps(&self) -> Option<f64> {
        match self {
            SpeedReading::Available(v) => Some(*v),
            SpeedReading::Unavailable(_) => None,
        }
    }

    pub fn as_kmh(&self) -> Option<f64> {
        self.mps().map(|v| v * MPS_TO_KMH)
    }

    pub fn is_available(&self) -> bool {
        matches!(self, SpeedReading::Available(_))
    }
}

/// Stateless apart from its configuration; per-track state lives on `Track`.
#[derive(Debug, Clone, Default)]
pub struct SpeedEstimator {
    config: SpeedConfig,
}

impl SpeedEstimator {
    pub fn new(config: SpeedConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SpeedConfig {
        &self.config
    }

    /// Instantaneous metric speed between the track's two newest samples.
    pub fn instantaneous(
        &self,
        track: &Track,
        calibration: &CalibrationEngine,
    ) -> Result<SpeedReading, EngineError> {
        if !calibration.is_valid() {
            return Ok(SpeedReading::Unavailable(UnavailableReason::Uncalibrated));
        }
        let Some((older, newer)) = track.last_two_samples() else {
            return Ok(SpeedReading::Unavailable(UnavailableReason::InsufficientHistory));
        };

        let elapsed = newer.timestamp - older.timestamp;
        if !(elapsed >= self.config.min_elapsed) {
            return Err(EngineError::NonMonotonicTime {
                previous: older.timestamp,
                current: newer.timestamp,
            });
        }

        let a = calibration.pixel_to_metric(&older.position);
        let b = calibration.pixel_to_metric(&newer.position);
        match (a, b) {
            (Ok(a), Ok(b)) => Ok(SpeedReading::Available(a.distance_to(&b) / elapsed)),
            (Err(EngineError::PointAtInfinity { .. }), _)
            | (_, Err(EngineError::PointAtInfinity { .. })) => {
                Ok(SpeedReading::Unavailable(UnavailableReason::OutOfPlane))
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    /// Update and return the track's smoothed speed.
    ///
    /// A sample pair is folded in at most once: if no new sample arrived since
    /// the last call (e.g. the track is Lost), the previous value is returned.
    pub fn estimate(
        &self,
        track: &mut Track,
        calibration: &CalibrationEngine,
    ) -> Result<SpeedReading, EngineError> {
        let newest = track.history.back().map(|s| s.timestamp);
        if let (Some(prev), Some(t)) = (track.smoothed_speed, track.speed_sample_time) {
            if calibration.is_valid() && newest == Some(t) {
                return Ok(SpeedReading::Available(prev));
            }
        }

        let instant = match self.instantaneous(track, calibration)? {
            SpeedReading::Available(v) => v,
            unavailable => return Ok(unavailable),
        };

        let smoothed = match track.smoothed_speed {
            Some(prev) => self.config.alpha * instant + (1.0 - self.config.alpha) * prev,
            None => instant,
        };
        track.smoothed_speed = Some(smoothed);
        track.speed_sample_time = newest;
        Ok(SpeedReading::Available(smoothed))
    }

    /// The track's current smoothed speed without updating it.
    pub fn reading(track: &Track, calibration: &CalibrationEngine) -> SpeedReading {
        if !calibration.is_valid() {
            return SpeedReading::Unavailable(UnavailableReason::Uncalibrated);
        }
        match track.smoothed_speed {
            Some(v) => SpeedReading::Available(v),
            None => SpeedReading::Unavailable(UnavailableReason::InsufficientHistory),
        }
    }

    /// Forget a track's smoothing state (e.g. after recalibration).
    pub fn clear(track: &mut Track) {
        track.smoothed_speed = None;
        track.speed_sample_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Detection, PixelPoint};
    use crate::speedview_tracking::{Tracker, TrackerConfig};
    use approx::assert_relative_eq;

    /// 200×30 px rectangle calibrated as 20 m × 3 m: 10 px per metre.
    fn calibration() -> CalibrationEngine {
        let mut c = CalibrationEngine::new();
        for (x, y) in [(0.0, 0.0), (200.0, 0.0), (200.0, 30.0), (0.0, 30.0)] {
            c.add_point(PixelPoint::new(x, y)).unwrap();
        }
        c.set_dimensions(20.0, 3.0).unwrap();
        c
    }

    fn det_at(x: f64) -> Detection {
        Detection::new(BoundingBox::centered(PixelPoint::new(x, 15.0), 10.0, 6.0), "car", 0.9)
    }

    fn tracker() -> Tracker {
        Tracker::new(
            TrackerConfig {
                max_distance: Some(50.0),
                ..Default::default()
            },
            400,
            100,
        )
        .unwrap()
    }

    #[test]
    fn test_converges_to_ten_metres_per_second() {
        // One rectangle length (20 m = 200 px) in 2 s, sampled at 10 Hz.
        let cal = calibration();
        let est = SpeedEstimator::default();
        let mut tracker = tracker();

        let mut last = SpeedReading::Unavailable(UnavailableReason::InsufficientHistory);
        for i in 0..=20 {
            let t = i as f64 * 0.1;
            tracker.update(&[det_at(i as f64 * 10.0)], t).unwrap();
            let track = tracker.get_track_mut(1).unwrap();
            last = est.estimate(track, &cal).unwrap();
        }
        assert_relative_eq!(last.mps().unwrap(), 10.0, epsilon = 1e-6);
        assert_relative_eq!(last.as_kmh().unwrap(), 36.0, epsilon = 1e-5);
    }

    #[test]
    fn test_smoothing_suppresses_jitter() {
        // 10 m/s at 40 Hz is 2.5 px per frame; ±0.5 px alternating box noise
        // makes the instantaneous speed swing between 6 and 14 m/s.
        let cal = calibration();
        let est = SpeedEstimator::default();
        let mut tracker = tracker();

        let mut readings = Vec::new();
        for i in 0..70 {
            let noise = if i % 2 == 0 { 0.5 } else { -0.5 };
            tracker.update(&[det_at(5.0 + i as f64 * 2.5 + noise)], i as f64 * 0.025).unwrap();
            let reading = est.estimate(tracker.get_track_mut(1).unwrap(), &cal).unwrap();
            if let Some(v) = reading.mps() {
                readings.push(v);
            }
        }
        for v in &readings[readings.len() - 10..] {
            assert!((v - 10.0).abs() < 1.0, "smoothed speed {} not near 10", v);
        }
    }

    #[test]
    fn test_first_estimate_equals_instantaneous() {
        let cal = calibration();
        let est = SpeedEstimator::default();
        let mut tracker = tracker();
        tracker.update(&[det_at(10.0)], 0.0).unwrap();
        tracker.update(&[det_at(30.0)], 0.5).unwrap();
        let track = tracker.get_track_mut(1).unwrap();

        // 20 px = 2 m over 0.5 s
        let reading = est.estimate(track, &cal).unwrap();
        assert_relative_eq!(reading.mps().unwrap(), 4.0, epsilon = 1e-9);
        assert_eq!(track.smoothed_speed, Some(reading.mps().unwrap()));
    }

    #[test]
    fn test_exponential_smoothing() {
        let cal = calibration();
        let est = SpeedEstimator::default();
        let mut tracker = tracker();
        tracker.update(&[det_at(10.0)], 0.0).unwrap();
        tracker.update(&[det_at(20.0)], 1.0).unwrap(); // 1 m/s
        est.estimate(tracker.get_track_mut(1).unwrap(), &cal).unwrap();
        tracker.update(&[det_at(50.0)], 2.0).unwrap(); // 3 m/s
        let reading = est.estimate(tracker.get_track_mut(1).unwrap(), &cal).unwrap();
        assert_relative_eq!(reading.mps().unwrap(), 0.3 * 3.0 + 0.7 * 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_no_new_sample_keeps_value() {
        let cal = calibration();
        let est = SpeedEstimator::default();
        let mut tracker = tracker();
        tracker.update(&[det_at(10.0)], 0.0).unwrap();
        tracker.update(&[det_at(30.0)], 1.0).unwrap();
        let track = tracker.get_track_mut(1).unwrap();
        let first = est.estimate(track, &cal).unwrap();
        let second = est.estimate(track, &cal).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unavailable_without_calibration_or_history() {
        let est = SpeedEstimator::default();
        let mut tracker = tracker();
        tracker.update(&[det_at(10.0)], 0.0).unwrap();

        let cal = calibration();
        let reading = est.estimate(tracker.get_track_mut(1).unwrap(), &cal).unwrap();
        assert_eq!(reading, SpeedReading::Unavailable(UnavailableReason::InsufficientHistory));

        tracker.update(&[det_at(20.0)], 1.0).unwrap();
        let uncalibrated = CalibrationEngine::new();
        let reading = est
            .estimate(tracker.get_track_mut(1).unwrap(), &uncalibrated)
            .unwrap();
        assert_eq!(reading, SpeedReading::Unavailable(UnavailableReason::Uncalibrated));
        assert_eq!(reading.as_kmh(), None);
    }

    #[test]
    fn test_non_monotonic_history_fails() {
        let cal = calibration();
        let est = SpeedEstimator::default();
        let mut tracker = tracker();
        tracker.update(&[det_at(10.0)], 0.0).unwrap();
        tracker.update(&[det_at(20.0)], 1.0).unwrap();
        let track = tracker.get_track_mut(1).unwrap();
        track.history[1].timestamp = 0.0;

        assert!(matches!(
            est.estimate(track, &cal),
            Err(EngineError::NonMonotonicTime { .. })
        ));
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        assert!(SpeedEstimator::new(SpeedConfig {
            alpha: 0.0,
            ..Default::default()
        })
        .is_err());
        assert!(SpeedEstimator::new(SpeedConfig {
            alpha: 1.5,
            ..Default::default()
        })
        .is_err());
    }
}
