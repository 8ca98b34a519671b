//! The "TRACKING" Engine - Per-Frame Data Association and Track Lifecycle
//!
//! Associates each frame's detections with persistent tracks using:
//! - Label equality as a hard gate
//! - Euclidean pixel distance between the track's last position and the
//!   detection's box centre as a soft gate
//! - Closest-pair-first greedy assignment (deterministic, O(P log P) in the
//!   number of gated pairs; not a globally optimal assignment)
//!
//! Track lifecycle: `Tentative → Confirmed ⇄ Lost → Removed`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::detection::{partition_valid, Detection, PixelPoint};
use crate::error::EngineError;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the Tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Absolute association distance in pixels. When `None`, the gate is
    /// `max_distance_ratio` × frame diagonal.
    pub max_distance: Option<f64>,

    /// Association gate as a fraction of the frame diagonal (default: 0.1)
    pub max_distance_ratio: f64,

    /// Consecutive matched frames before a Tentative track is Confirmed (N, default: 3)
    pub confirm_hits: u32,

    /// Consecutive missed frames a Lost track survives (M, default: 10)
    pub max_misses: u32,

    /// Position history window per track (default: 30 samples)
    pub history_len: usize,

    /// Confidence multiplier applied per missed frame while Lost (default: 0.85)
    pub lost_confidence_decay: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance: None,
            max_distance_ratio: 0.1,
            confirm_hits: 3,
            max_misses: 10,
            history_len: 30,
            lost_confidence_decay: 0.85,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(d) = self.max_distance {
            if !(d.is_finite() && d > 0.0) {
                return Err(EngineError::invalid_dimension(format!(
                    "max_distance must be > 0, got {}",
                    d
                )));
            }
        }
        if !(self.max_distance_ratio.is_finite() && self.max_distance_ratio > 0.0) {
            return Err(EngineError::invalid_dimension(format!(
                "max_distance_ratio must be > 0, got {}",
                self.max_distance_ratio
            )));
        }
        if self.confirm_hits == 0 {
            return Err(EngineError::invalid_dimension("confirm_hits must be >= 1"));
        }
        if self.history_len < 2 {
            return Err(EngineError::invalid_dimension("history_len must be >= 2"));
        }
        if !(0.0..=1.0).contains(&self.lost_confidence_decay) {
            return Err(EngineError::invalid_dimension(format!(
                "lost_confidence_decay must be in [0, 1], got {}",
                self.lost_confidence_decay
            )));
        }
        Ok(())
    }
}

// ============================================================================
// TRACK (Internal State)
// ============================================================================

/// Lifecycle state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Removed,
}

impl TrackState {
    /// Confirmed and Lost tracks are reported to callers.
    pub fn is_active(&self) -> bool {
        matches!(self, TrackState::Confirmed | TrackState::Lost)
    }
}

/// One position observation of a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackSample {
    pub position: PixelPoint,
    pub timestamp: f64,
}

/// A persistent identity for one physical object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Process-unique, never reused
    pub id: u64,

    pub label: String,

    /// Sliding window of matched positions, oldest first
    pub history: VecDeque<TrackSample>,

    pub state: TrackState,

    pub first_seen: f64,

    pub last_seen: f64,

    /// Consecutive matched frames
    pub hits: u32,

    /// Consecutive missed frames
    pub misses: u32,

    /// Detector confidence of the last match, decayed while Lost
    pub confidence: f64,

    /// Smoothed metric speed (m/s), maintained by the SpeedEstimator
    pub smoothed_speed: Option<f64>,

    /// Timestamp of the newest sample folded into `smoothed_speed`
    pub speed_sample_time: Option<f64>,
}

impl Track {
    fn new(id: u64, detection: &Detection, timestamp: f64, history_len: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_len);
        history.push_back(TrackSample {
            position: detection.center(),
            timestamp,
        });
        Self {
            id,
            label: detection.label.clone(),
            history,
            state: TrackState::Tentative,
            first_seen: timestamp,
            last_seen: timestamp,
            hits: 1,
            misses: 0,
            confidence: detection.confidence,
            smoothed_speed: None,
            speed_sample_time: None,
        }
    }

    /// Last matched pixel position.
    #[inline]
    pub fn position(&self) -> PixelPoint {
        self.history
            .back()
            .map(|s| s.position)
            .unwrap_or_default()
    }

    /// The two most recent samples, oldest first.
    pub fn last_two_samples(&self) -> Option<(TrackSample, TrackSample)> {
        let n = self.history.len();
        if n < 2 {
            return None;
        }
        Some((self.history[n - 2], self.history[n - 1]))
    }

    fn record(&mut self, detection: &Detection, timestamp: f64, history_len: usize) {
        self.history.push_back(TrackSample {
            position: detection.center(),
            timestamp,
        });
        while self.history.len() > history_len {
            self.history.pop_front();
        }
        self.last_seen = timestamp;
        self.confidence = detection.confidence;
        self.misses = 0;
        self.hits = self.hits.saturating_add(1);
    }
}

// ============================================================================
// TRACKER OUTPUT
// ============================================================================

/// Summary of one `Tracker::update` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerOutput {
    /// Confirmed ∪ Lost track ids after the update, ascending
    pub active_ids: Vec<u64>,

    /// Tracks promoted to Confirmed during this update
    pub confirmed_ids: Vec<u64>,

    /// Tracks deleted during this update
    pub removed_ids: Vec<u64>,

    /// Detections skipped as malformed
    pub malformed: usize,
}

// ============================================================================
// TRACKER (The Engine)
// ============================================================================

/// Owns every track of one session.
#[derive(Debug, Clone)]
pub struct Tracker {
    tracks: BTreeMap<u64, Track>,
    config: TrackerConfig,
    /// Association gate in pixels
    gate: f64,
    next_id: u64,
    last_timestamp: Option<f64>,
}

impl Tracker {
    /// Create a tracker for frames of the given pixel size.
    pub fn new(config: TrackerConfig, frame_width: u32, frame_height: u32) -> Result<Self, EngineError> {
        config.validate()?;
        if frame_width == 0 || frame_height == 0 {
            return Err(EngineError::invalid_dimension(format!(
                "frame size must be non-zero, got {}x{}",
                frame_width, frame_height
            )));
        }
        let diagonal = (frame_width as f64).hypot(frame_height as f64);
        let gate = config
            .max_distance
            .unwrap_or(config.max_distance_ratio * diagonal);
        Ok(Self {
            tracks: BTreeMap::new(),
            config,
            gate,
            next_id: 1,
            last_timestamp: None,
        })
    }

    /// Association gate in pixels.
    pub fn gate(&self) -> f64 {
        self.gate
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Advance all tracks by one frame.
    ///
    /// Malformed detections are skipped and counted. A timestamp that does
    /// not advance past the previous frame fails with `NonMonotonicTime` and
    /// leaves every track untouched.
    pub fn update(&mut self, detections: &[Detection], timestamp: f64) -> Result<TrackerOutput, EngineError> {
        if !timestamp.is_finite() {
            return Err(EngineError::NonMonotonicTime {
                previous: self.last_timestamp.unwrap_or(f64::NEG_INFINITY),
                current: timestamp,
            });
        }
        if let Some(previous) = self.last_timestamp {
            if timestamp <= previous {
                return Err(EngineError::NonMonotonicTime {
                    previous,
                    current: timestamp,
                });
            }
        }
        self.last_timestamp = Some(timestamp);

        let (valid, malformed) = partition_valid(detections);
        if malformed > 0 {
            tracing::warn!(malformed, timestamp, "skipped malformed detections");
        }

        let mut output = TrackerOutput {
            malformed,
            ..Default::default()
        };

        let assignments = self.associate(&valid);

        let mut matched_tracks = Vec::with_capacity(assignments.len());
        let mut matched_dets = vec![false; valid.len()];
        for &(track_id, det_idx) in &assignments {
            matched_dets[det_idx] = true;
            matched_tracks.push(track_id);
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.record(valid[det_idx], timestamp, self.config.history_len);
                match track.state {
                    TrackState::Tentative if track.hits >= self.config.confirm_hits => {
                        track.state = TrackState::Confirmed;
                        output.confirmed_ids.push(track_id);
                        tracing::debug!(track_id, label = %track.label, "track confirmed");
                    }
                    TrackState::Lost => track.state = TrackState::Confirmed,
                    _ => {}
                }
            }
        }

        // Unmatched tracks.
        for (id, track) in self.tracks.iter_mut() {
            if matched_tracks.contains(id) {
                continue;
            }
            track.hits = 0;
            track.misses = track.misses.saturating_add(1);
            match track.state {
                TrackState::Tentative => track.state = TrackState::Removed,
                TrackState::Confirmed | TrackState::Lost => {
                    track.confidence *= self.config.lost_confidence_decay;
                    track.state = if track.misses > self.config.max_misses {
                        TrackState::Removed
                    } else {
                        TrackState::Lost
                    };
                }
                TrackState::Removed => {}
            }
        }

        // Unmatched detections spawn Tentative tracks.
        for (det_idx, det) in valid.iter().enumerate() {
            if matched_dets[det_idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut track = Track::new(id, det, timestamp, self.config.history_len);
            if self.config.confirm_hits <= 1 {
                track.state = TrackState::Confirmed;
                output.confirmed_ids.push(id);
            }
            self.tracks.insert(id, track);
        }

        self.tracks.retain(|id, track| {
            if track.state == TrackState::Removed {
                output.removed_ids.push(*id);
                tracing::debug!(track_id = *id, "track removed");
                false
            } else {
                true
            }
        });

        output.active_ids = self
            .tracks
            .values()
            .filter(|t| t.state.is_active())
            .map(|t| t.id)
            .collect();

        Ok(output)
    }

    /// Closest-pair-first greedy assignment of tracks to detections.
    ///
    /// Returns `(track_id, detection_index)` pairs.
    fn associate(&self, detections: &[&Detection]) -> Vec<(u64, usize)> {
        let mut pairs: Vec<(f64, u64, usize)> = Vec::new();
        for track in self.tracks.values() {
            let last = track.position();
            for (det_idx, det) in detections.iter().enumerate() {
                // Hard gate: label must match
                if det.label != track.label {
                    continue;
                }
                let dist = last.distance_to(&det.center());
                if dist <= self.gate {
                    pairs.push((dist, track.id, det_idx));
                }
            }
        }

        // Ties broken by track id then detection index for determinism.
        pairs.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut used_tracks = Vec::new();
        let mut used_dets = vec![false; detections.len()];
        let mut assignments = Vec::new();
        for (_, track_id, det_idx) in pairs {
            if used_dets[det_idx] || used_tracks.contains(&track_id) {
                continue;
            }
            used_dets[det_idx] = true;
            used_tracks.push(track_id);
            assignments.push((track_id, det_idx));
        }
        assignments
    }

    /// Remove every track. Ids keep increasing.
    pub fn reset(&mut self) -> Vec<u64> {
        let removed: Vec<u64> = self.tracks.keys().copied().collect();
        self.tracks.clear();
        removed
    }

    /// Confirmed ∪ Lost tracks ordered by id.
    pub fn active_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values().filter(|t| t.state.is_active())
    }

    /// Every live track (including Tentative) ordered by id.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    pub fn get_track(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn get_track_mut(&mut self, id: u64) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// The id the next new track will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }
}

// ============================================================================
// TESTS
// ============================================================================
