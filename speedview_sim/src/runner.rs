//! Scenario runner - drives a session with synthetic traffic and checks the output.

use image::RgbaImage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use speedview_core::{
    CalibrationEdit, CalibrationStatus, EngineConfig, FrameBatch, FrameSnapshot, PixelPoint, Session,
    SessionId, SpeedReading, TrackState, UnavailableReason,
};
use speedview_env::{EngineHandle, EngineWorker};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::SimError;
use crate::exporter::{SimEvent, SimExport, SimFrame, TruthPosition};
use crate::oracle::{CameraModel, DetectorModel, Oracle};
use crate::scenarios::ScenarioId;

/// A track is attributed to the nearest same-label vehicle within this radius.
const MATCH_RADIUS_PX: f64 = 20.0;

/// Speed readings before this many smoothed updates are not scored.
const SETTLE_FRAMES: u32 = 8;

const CAR_BOX: (f64, f64) = (40.0, 28.0);
const TRUCK_BOX: (f64, f64) = (60.0, 40.0);

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    pub frames: u64,
    pub detections: u64,
    pub vehicles_spawned: u64,

    /// Distinct track ids that reached Confirmed
    pub confirmed_tracks: usize,

    /// Extra track ids attributed to the same vehicle
    pub id_switches: usize,

    pub speed_samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_speed_error_mps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_speed_error_mps: Option<f64>,

    pub malformed_injected: u64,
    pub malformed_reported: u64,

    pub heatmap_peak: f64,
    pub heatmap_total: u64,
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    pub total_frames: u64,
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,
}

/// Everything a run produced.
pub struct ScenarioRun {
    pub result: ScenarioResult,
    pub export: Option<SimExport>,
    pub recording: Option<Vec<FrameBatch>>,
    pub heatmap: Option<RgbaImage>,
}

/// A source of traffic in one lane.
#[derive(Debug, Clone)]
struct Lane {
    offset: f64,
    speed: f64,
    label: &'static str,
    box_size: (f64, f64),
    first_spawn: f64,
    /// `None` spawns a single vehicle
    spawn_every: Option<f64>,
}

/// Setup for one scenario.
#[derive(Debug, Clone)]
struct Plan {
    duration_secs: f64,
    lanes: Vec<Lane>,
    detector: DetectorModel,
    occlusions: Vec<(f64, f64)>,
    /// Reset the zone at this time and re-enter it one edit per frame
    recalibrate_at: Option<f64>,
}

/// Either an in-process session or one running on an engine worker.
enum Backend {
    Local(Box<Session>),
    Offload(EngineHandle),
}

impl Backend {
    async fn process(&mut self, batch: FrameBatch) -> Result<FrameSnapshot, SimError> {
        match self {
            Backend::Local(session) => Ok(session.process_frame(&batch)?),
            Backend::Offload(handle) => Ok(handle.process_frame(batch).await?),
        }
    }

    async fn edit(&mut self, edit: CalibrationEdit) -> Result<CalibrationStatus, SimError> {
        match self {
            Backend::Local(session) => Ok(session.apply_calibration_edit(edit)?),
            Backend::Offload(handle) => Ok(handle.edit_calibration(edit).await?),
        }
    }

    async fn render(&mut self, opacity: f32) -> Result<RgbaImage, SimError> {
        match self {
            Backend::Local(session) => Ok(session.render_heatmap(opacity)),
            Backend::Offload(handle) => Ok(handle.render_heatmap(opacity).await?),
        }
    }

    async fn finish(self) -> Result<(), SimError> {
        if let Backend::Offload(handle) = self {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

/// Scores snapshots against ground truth.
#[derive(Debug, Default)]
struct Evaluator {
    vehicle_tracks: BTreeMap<u64, BTreeSet<u64>>,
    track_labels: BTreeMap<u64, String>,
    mixed_label_tracks: BTreeSet<u64>,
    available_frames: BTreeMap<u64, u32>,
    confirmed: BTreeSet<u64>,
    lost: BTreeSet<u64>,
    recovered: BTreeSet<u64>,
    seen_ids: BTreeSet<u64>,
    error_sum: f64,
    error_max: f64,
    samples: u64,
    /// Confirmed tracks reporting anything but `Uncalibrated` while the zone is invalid
    uncalibrated_violations: u64,
    malformed_reported: u64,
}

impl Evaluator {
    fn observe(&mut self, snapshot: &FrameSnapshot, truth: &[TruthPosition]) {
        self.malformed_reported += snapshot.malformed_detections as u64;
        self.confirmed.extend(snapshot.confirmed_ids.iter().copied());
        let calibrated = snapshot.calibration.is_valid();

        for track in &snapshot.tracks {
            self.seen_ids.insert(track.id);
            let label = self.track_labels.entry(track.id).or_insert_with(|| track.label.clone());
            if *label != track.label {
                self.mixed_label_tracks.insert(track.id);
            }

            match track.state {
                TrackState::Lost => {
                    self.lost.insert(track.id);
                }
                TrackState::Confirmed => {
                    if self.lost.contains(&track.id) {
                        self.recovered.insert(track.id);
                    }
                    if !calibrated && track.speed != SpeedReading::Unavailable(UnavailableReason::Uncalibrated) {
                        self.uncalibrated_violations += 1;
                    }
                    let Some(vehicle) = nearest(truth, &track.position, &track.label) else {
                        continue;
                    };
                    self.vehicle_tracks.entry(vehicle.id).or_default().insert(track.id);

                    if let Some(speed) = track.speed.mps() {
                        let n = self.available_frames.entry(track.id).or_insert(0);
                        *n += 1;
                        if *n >= SETTLE_FRAMES {
                            let err = (speed - vehicle.speed_mps).abs();
                            self.error_sum += err;
                            self.error_max = self.error_max.max(err);
                            self.samples += 1;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn id_switches(&self) -> usize {
        self.vehicle_tracks.values().map(|ids| ids.len().saturating_sub(1)).sum()
    }

    fn mean_error(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.error_sum / self.samples as f64)
    }
}

fn nearest<'a>(truth: &'a [TruthPosition], p: &PixelPoint, label: &str) -> Option<&'a TruthPosition> {
    truth
        .iter()
        .filter(|t| t.label == label)
        .map(|t| ((t.x - p.x).hypot(t.y - p.y), t))
        .filter(|(d, _)| *d <= MATCH_RADIUS_PX)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, t)| t)
}

/// Runs traffic scenarios.
pub struct ScenarioRunner {
    seed: u64,
    frame_rate_hz: u32,
    duration_secs: f64,
    config: EngineConfig,
    camera: CameraModel,
    offload: bool,
    export: bool,
    record: bool,
    heatmap_opacity: Option<f32>,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            frame_rate_hz: 10,
            duration_secs: 20.0,
            config: EngineConfig::default(),
            camera: CameraModel::default(),
            offload: false,
            export: false,
            record: false,
            heatmap_opacity: None,
        }
    }

    pub fn with_frame_rate(mut self, hz: u32) -> Self {
        self.frame_rate_hz = hz.max(1);
        self
    }

    /// Duration of the open-ended scenarios (steady traffic, noisy detector, recalibration).
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the session on an engine worker instead of in-process.
    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }

    /// Collect per-frame export data.
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    /// Keep every generated batch for writing a replayable recording.
    pub fn with_recording(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Render the final heatmap at this opacity.
    pub fn with_heatmap(mut self, opacity: f32) -> Self {
        self.heatmap_opacity = Some(opacity);
        self
    }

    fn plan(&self, scenario: ScenarioId, rng: &mut ChaCha8Rng) -> Plan {
        let two_lanes = |rng: &mut ChaCha8Rng| {
            vec![
                Lane {
                    offset: 1.75,
                    speed: rng.gen_range(10.0..20.0),
                    label: "car",
                    box_size: CAR_BOX,
                    first_spawn: 0.0,
                    spawn_every: Some(2.5),
                },
                Lane {
                    offset: 5.25,
                    speed: rng.gen_range(10.0..20.0),
                    label: "car",
                    box_size: CAR_BOX,
                    first_spawn: 1.1,
                    spawn_every: Some(2.5),
                },
            ]
        };

        match scenario {
            ScenarioId::SteadyTraffic => Plan {
                duration_secs: self.duration_secs,
                lanes: two_lanes(rng),
                detector: DetectorModel::default(),
                occlusions: vec![],
                recalibrate_at: None,
            },
            ScenarioId::Occlusion => Plan {
                duration_secs: 5.0,
                lanes: vec![Lane {
                    offset: 3.5,
                    speed: 8.0,
                    label: "car",
                    box_size: CAR_BOX,
                    first_spawn: 0.0,
                    spawn_every: None,
                }],
                detector: DetectorModel::default(),
                occlusions: vec![(1.45, 1.95)],
                recalibrate_at: None,
            },
            ScenarioId::LabelGate => {
                let lane = |label, box_size| Lane {
                    offset: 3.5,
                    speed: 12.0,
                    label,
                    box_size,
                    first_spawn: 0.0,
                    spawn_every: None,
                };
                Plan {
                    duration_secs: 3.0,
                    lanes: vec![lane("car", CAR_BOX), lane("truck", TRUCK_BOX)],
                    detector: DetectorModel::default(),
                    occlusions: vec![],
                    recalibrate_at: None,
                }
            }
            ScenarioId::NoisyDetector => Plan {
                duration_secs: self.duration_secs,
                lanes: two_lanes(rng),
                detector: DetectorModel {
                    pixel_noise_std: 2.0,
                    miss_rate: 0.1,
                    malformed_rate: 0.05,
                    confidence_range: (0.3, 0.9),
                },
                occlusions: vec![],
                recalibrate_at: None,
            },
            ScenarioId::Recalibration => Plan {
                duration_secs: self.duration_secs.max(12.0),
                lanes: vec![Lane {
                    offset: 3.5,
                    speed: rng.gen_range(10.0..20.0),
                    label: "car",
                    box_size: CAR_BOX,
                    first_spawn: 0.0,
                    spawn_every: Some(2.5),
                }],
                detector: DetectorModel::default(),
                occlusions: vec![],
                recalibrate_at: Some(6.0),
            },
        }
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> Result<ScenarioRun, SimError> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut scenario_rng = ChaCha8Rng::seed_from_u64(self.seed);
        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let plan = self.plan(scenario, &mut scenario_rng);

        let mut oracle = Oracle::new(physics_seed, self.camera.clone())?;
        oracle.set_detector(plan.detector.clone())?;
        for &(start, end) in &plan.occlusions {
            oracle.add_occlusion(start, end);
        }

        let session = Session::with_id(
            SessionId::from_seed(self.seed),
            self.config.clone(),
            self.camera.frame_width,
            self.camera.frame_height,
        )?;
        let mut backend = if self.offload {
            Backend::Offload(EngineWorker::spawn(session))
        } else {
            Backend::Local(Box::new(session))
        };
        for edit in self.camera.calibration_edits() {
            backend.edit(edit).await?;
        }

        let dt = 1.0 / self.frame_rate_hz as f64;
        let total_frames = (plan.duration_secs * self.frame_rate_hz as f64).round() as u64;
        let reset_frame = plan
            .recalibrate_at
            .map(|t| (t * self.frame_rate_hz as f64).round() as u64);

        let mut next_spawn: Vec<Option<f64>> = plan.lanes.iter().map(|l| Some(l.first_spawn)).collect();
        let mut pending_edits: Vec<CalibrationEdit> = Vec::new();
        let mut eval = Evaluator::default();
        let mut metrics = ScenarioMetrics::default();
        let mut export = self.export.then(|| SimExport::new(scenario.name(), self.seed));
        let mut recording = self.record.then(Vec::new);

        let mut max_id_before_reset: Option<u64> = None;
        let mut min_id_after_reset: Option<u64> = None;
        let mut tracks_right_after_reset: Option<usize> = None;
        let mut post_recalibration_speeds = 0u64;
        let mut last_snapshot: Option<FrameSnapshot> = None;

        for frame in 0..total_frames {
            let t = frame as f64 * dt;
            let mut events = Vec::new();

            for (lane, due) in plan.lanes.iter().zip(next_spawn.iter_mut()) {
                if let Some(at) = *due {
                    if t + 1e-9 >= at {
                        oracle.spawn_vehicle(lane.offset, lane.speed, lane.label, lane.box_size);
                        metrics.vehicles_spawned += 1;
                        *due = lane.spawn_every.map(|every| at + every);
                    }
                }
            }

            // Calibration edits land between frames.
            if Some(frame) == reset_frame {
                max_id_before_reset = eval.seen_ids.iter().next_back().copied();
                backend.edit(CalibrationEdit::Reset).await?;
                pending_edits = self.camera.calibration_edits();
                pending_edits.reverse();
                events.push(SimEvent::info("calibration reset"));
            } else if let Some(edit) = pending_edits.pop() {
                let status = backend.edit(edit).await?;
                events.push(SimEvent::info(format!("calibration edit -> {}", status.name())));
            }

            let truth: Vec<TruthPosition> = oracle
                .truth_pixels()
                .into_iter()
                .filter_map(|(id, p)| {
                    let v = oracle.vehicle(id)?;
                    Some(TruthPosition {
                        id,
                        label: v.label.clone(),
                        x: p.x,
                        y: p.y,
                        speed_mps: v.speed(),
                    })
                })
                .collect();

            let detections = oracle.generate_detections();
            if oracle.is_occluded() {
                events.push(SimEvent::info("occluded"));
            }
            metrics.detections += detections.len() as u64;
            let batch = FrameBatch::new(t, detections);
            if let Some(rec) = recording.as_mut() {
                rec.push(batch.clone());
            }

            let snapshot = backend.process(batch).await?;
            eval.observe(&snapshot, &truth);

            if let Some(reset) = reset_frame {
                if frame == reset {
                    tracks_right_after_reset = Some(
                        snapshot
                            .tracks
                            .iter()
                            .filter(|t| t.state != TrackState::Tentative)
                            .count(),
                    );
                }
                if frame >= reset {
                    if let Some(min_id) = snapshot.tracks.iter().map(|t| t.id).min() {
                        min_id_after_reset = Some(min_id_after_reset.map_or(min_id, |m| m.min(min_id)));
                    }
                    if snapshot.calibration.is_valid() {
                        post_recalibration_speeds +=
                            snapshot.tracks.iter().filter(|t| t.speed.is_available()).count() as u64;
                    }
                }
            }

            if frame % self.frame_rate_hz as u64 == 0 {
                debug!(
                    "  t={:.1}s | vehicles={} | tracks={}",
                    t,
                    oracle.active_vehicles().count(),
                    snapshot.tracks.len()
                );
            }

            if let Some(export) = export.as_mut() {
                export.add_frame(SimFrame {
                    time_sec: t,
                    ground_truth: truth,
                    tracks: snapshot.tracks.clone(),
                    calibration: snapshot.calibration.name().to_string(),
                    events,
                });
            }

            last_snapshot = Some(snapshot);
            oracle.step(dt);
        }

        let heatmap = match self.heatmap_opacity {
            Some(opacity) => Some(backend.render(opacity).await?),
            None => None,
        };
        backend.finish().await?;

        metrics.frames = total_frames;
        metrics.confirmed_tracks = eval.confirmed.len();
        metrics.id_switches = eval.id_switches();
        metrics.speed_samples = eval.samples;
        metrics.mean_speed_error_mps = eval.mean_error();
        metrics.max_speed_error_mps = (eval.samples > 0).then_some(eval.error_max);
        metrics.malformed_injected = oracle.malformed_injected();
        metrics.malformed_reported = eval.malformed_reported;
        if let Some(last) = &last_snapshot {
            metrics.heatmap_peak = last.heatmap_stats.peak_intensity;
            metrics.heatmap_total = last.heatmap_stats.total_detections;
        }

        let mean_error_below = |limit: f64| match eval.mean_error() {
            Some(e) if e < limit => None,
            Some(e) => Some(format!("mean speed error {:.2} m/s exceeds {:.1}", e, limit)),
            None => Some("no settled speed readings".to_string()),
        };

        let failure_reason = match scenario {
            ScenarioId::SteadyTraffic => {
                if metrics.id_switches > 0 {
                    Some(format!("{} id switches", metrics.id_switches))
                } else {
                    mean_error_below(1.0)
                }
            }
            ScenarioId::Occlusion => {
                if eval.confirmed.len() != 1 {
                    Some(format!("expected 1 confirmed track, got {}", eval.confirmed.len()))
                } else if eval.recovered.is_empty() {
                    Some("track was never recovered from Lost".to_string())
                } else {
                    mean_error_below(1.0)
                }
            }
            ScenarioId::LabelGate => {
                if eval.confirmed.len() != 2 {
                    Some(format!("expected 2 confirmed tracks, got {}", eval.confirmed.len()))
                } else if !eval.mixed_label_tracks.is_empty() {
                    Some(format!("tracks {:?} changed label", eval.mixed_label_tracks))
                } else if metrics.id_switches > 0 {
                    Some(format!("{} id switches", metrics.id_switches))
                } else {
                    None
                }
            }
            ScenarioId::NoisyDetector => {
                if metrics.malformed_reported != metrics.malformed_injected {
                    Some(format!(
                        "injected {} corrupt detections, session reported {}",
                        metrics.malformed_injected, metrics.malformed_reported
                    ))
                } else if metrics.heatmap_peak > self.config.heatmap.max_intensity {
                    Some(format!("heatmap peak {:.2} above cap", metrics.heatmap_peak))
                } else if metrics.id_switches > 2 {
                    Some(format!("{} id switches", metrics.id_switches))
                } else {
                    mean_error_below(2.5)
                }
            }
            ScenarioId::Recalibration => {
                let ids_increase = match (max_id_before_reset, min_id_after_reset) {
                    (Some(before), Some(after)) => after > before,
                    _ => false,
                };
                if tracks_right_after_reset != Some(0) {
                    Some(format!("{:?} established tracks right after reset", tracks_right_after_reset))
                } else if !ids_increase {
                    Some("track ids after reset do not exceed ids before".to_string())
                } else if eval.uncalibrated_violations > 0 {
                    Some(format!("{} speed readings while uncalibrated", eval.uncalibrated_violations))
                } else if post_recalibration_speeds == 0 {
                    Some("no speeds after recalibration".to_string())
                } else {
                    mean_error_below(1.0)
                }
            }
        };

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_frames,
            final_time_secs: oracle.time(),
            failure_reason,
            metrics,
        };

        if let Some(export) = export.as_mut() {
            export.finalize(result.passed, result.failure_reason.clone(), Some(result.metrics.clone()));
        }

        Ok(ScenarioRun {
            result,
            export,
            recording,
            heatmap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(scenario: ScenarioId) -> ScenarioResult {
        ScenarioRunner::new(42).run(scenario).await.unwrap().result
    }

    #[tokio::test]
    async fn test_steady_traffic() {
        let result = run(ScenarioId::SteadyTraffic).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.confirmed_tracks >= 10);
        assert_eq!(result.total_frames, 200);
    }

    #[tokio::test]
    async fn test_occlusion_keeps_identity() {
        let result = run(ScenarioId::Occlusion).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.confirmed_tracks, 1);
    }

    #[tokio::test]
    async fn test_label_gate() {
        let result = run(ScenarioId::LabelGate).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test]
    async fn test_noisy_detector_counts_corrupt_boxes() {
        let result = run(ScenarioId::NoisyDetector).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.malformed_injected > 0);
    }

    #[tokio::test]
    async fn test_recalibration() {
        let result = run(ScenarioId::Recalibration).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test]
    async fn test_offload_matches_local() {
        let local = ScenarioRunner::new(7).run(ScenarioId::Occlusion).await.unwrap().result;
        let offload = ScenarioRunner::new(7)
            .with_offload(true)
            .run(ScenarioId::Occlusion)
            .await
            .unwrap()
            .result;
        assert_eq!(local.metrics, offload.metrics);
        assert_eq!(local.passed, offload.passed);
    }

    #[tokio::test]
    async fn test_same_seed_is_deterministic() {
        let a = ScenarioRunner::new(99).with_duration(5.0).run(ScenarioId::NoisyDetector).await.unwrap();
        let b = ScenarioRunner::new(99).with_duration(5.0).run(ScenarioId::NoisyDetector).await.unwrap();
        assert_eq!(a.result.metrics, b.result.metrics);
    }

    #[tokio::test]
    async fn test_artifacts_collected_on_request() {
        let run = ScenarioRunner::new(1)
            .with_export(true)
            .with_recording(true)
            .with_heatmap(0.6)
            .run(ScenarioId::LabelGate)
            .await
            .unwrap();
        let export = run.export.unwrap();
        assert_eq!(export.frames.len() as u64, run.result.total_frames);
        assert_eq!(run.recording.unwrap().len() as u64, run.result.total_frames);
        assert_eq!(run.heatmap.unwrap().dimensions(), (1280, 720));
    }
}
