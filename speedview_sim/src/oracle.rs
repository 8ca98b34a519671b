//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of a simulated road:
//! - True ground-plane positions of every vehicle (metres)
//! - Constant-velocity kinematics along the road
//! - A camera model projecting the road plane into pixels
//! - A detector model producing noisy, occasionally missing or corrupt boxes

use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use speedview_core::{
    BoundingBox, CalibrationEdit, CalibrationEngine, Detection, EngineError, MetricPoint, PixelPoint,
};
use std::collections::BTreeMap;

use crate::error::SimError;

/// A fixed camera looking down a straight road.
///
/// The zone corners are ordered front-left, front-right, back-right,
/// back-left. `length` runs across the road, `width` along it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub frame_width: u32,
    pub frame_height: u32,
    pub zone: [PixelPoint; 4],
    pub length: f64,
    pub width: f64,
}

impl Default for CameraModel {
    /// Two 3.5 m lanes, 40 m of road, 1280×720 frame.
    fn default() -> Self {
        Self {
            frame_width: 1280,
            frame_height: 720,
            zone: [
                PixelPoint::new(340.0, 660.0),
                PixelPoint::new(940.0, 660.0),
                PixelPoint::new(760.0, 300.0),
                PixelPoint::new(520.0, 300.0),
            ],
            length: 7.0,
            width: 40.0,
        }
    }
}

impl CameraModel {
    /// The edits a user would make to calibrate this camera, in click order.
    pub fn calibration_edits(&self) -> Vec<CalibrationEdit> {
        let mut edits: Vec<CalibrationEdit> =
            self.zone.iter().map(|p| CalibrationEdit::AddPoint(*p)).collect();
        edits.push(CalibrationEdit::SetDimensions {
            length: self.length,
            width: self.width,
        });
        edits
    }

    pub fn calibration(&self) -> Result<CalibrationEngine, EngineError> {
        let mut engine = CalibrationEngine::new();
        for p in &self.zone {
            engine.add_point(*p)?;
        }
        let status = engine.set_dimensions(self.length, self.width)?;
        if !status.is_valid() {
            return Err(EngineError::degenerate("camera zone does not calibrate"));
        }
        Ok(engine)
    }
}

/// Detector imperfections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorModel {
    /// Gaussian noise on the box centre, pixels
    pub pixel_noise_std: f64,
    /// Probability a visible vehicle is not reported
    pub miss_rate: f64,
    /// Probability of an extra corrupt detection per frame
    pub malformed_rate: f64,
    /// Confidence is drawn uniformly from this range
    pub confidence_range: (f64, f64),
}

impl Default for DetectorModel {
    fn default() -> Self {
        Self {
            pixel_noise_std: 0.5,
            miss_rate: 0.0,
            malformed_rate: 0.0,
            confidence_range: (0.6, 0.95),
        }
    }
}

/// A ground truth vehicle in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthVehicle {
    pub id: u64,

    /// Position on the road plane [across, along] in metres
    pub position: Vector2<f64>,

    /// Velocity [across, along] in m/s
    pub velocity: Vector2<f64>,

    /// Detector class ("car", "truck", ...)
    pub label: String,

    /// Box size in pixels (width, height)
    pub box_size: (f64, f64),

    /// Still on the modelled stretch of road
    pub active: bool,
}

impl GroundTruthVehicle {
    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }
}

/// The Oracle - maintains ground truth and generates detections.
pub struct Oracle {
    /// RNG for detector noise and dropouts
    physics_rng: ChaCha8Rng,

    camera: CameraModel,

    /// Road plane → pixels
    projection: CalibrationEngine,

    detector: DetectorModel,
    noise: Normal<f64>,

    vehicles: BTreeMap<u64, GroundTruthVehicle>,
    next_id: u64,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Time windows `[start, end)` during which nothing is detected
    occlusions: Vec<(f64, f64)>,

    malformed_injected: u64,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64, camera: CameraModel) -> Result<Self, SimError> {
        let projection = camera.calibration()?;
        let detector = DetectorModel::default();
        let noise = noise_for(&detector)?;
        Ok(Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            camera,
            projection,
            detector,
            noise,
            vehicles: BTreeMap::new(),
            next_id: 0,
            current_time: 0.0,
            occlusions: Vec::new(),
            malformed_injected: 0,
        })
    }

    pub fn set_detector(&mut self, detector: DetectorModel) -> Result<(), SimError> {
        self.noise = noise_for(&detector)?;
        self.detector = detector;
        Ok(())
    }

    /// Suppress every detection for `start <= t < end`.
    pub fn add_occlusion(&mut self, start: f64, end: f64) {
        self.occlusions.push((start, end));
    }

    /// Spawns a vehicle at the front edge of the zone and returns its ID.
    pub fn spawn_vehicle(&mut self, lane_offset: f64, speed: f64, label: &str, box_size: (f64, f64)) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.vehicles.insert(
            id,
            GroundTruthVehicle {
                id,
                position: Vector2::new(lane_offset, 0.0),
                velocity: Vector2::new(0.0, speed),
                label: label.to_string(),
                box_size,
                active: true,
            },
        );
        id
    }

    /// Advances kinematics by dt seconds. Vehicles leaving the zone go inactive.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        let limit = self.camera.width;
        for vehicle in self.vehicles.values_mut() {
            if !vehicle.active {
                continue;
            }
            vehicle.position += vehicle.velocity * dt;
            if vehicle.position.y > limit || vehicle.position.y < 0.0 {
                vehicle.active = false;
            }
        }
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn active_vehicles(&self) -> impl Iterator<Item = &GroundTruthVehicle> {
        self.vehicles.values().filter(|v| v.active)
    }

    pub fn vehicle(&self, id: u64) -> Option<&GroundTruthVehicle> {
        self.vehicles.get(&id)
    }

    pub fn malformed_injected(&self) -> u64 {
        self.malformed_injected
    }

    pub fn is_occluded(&self) -> bool {
        self.occlusions
            .iter()
            .any(|&(start, end)| self.current_time >= start && self.current_time < end)
    }

    /// Noise-free pixel position of every active vehicle.
    pub fn truth_pixels(&self) -> Vec<(u64, PixelPoint)> {
        self.active_vehicles()
            .filter_map(|v| {
                let p = self
                    .projection
                    .metric_to_pixel(&MetricPoint::new(v.position.x, v.position.y))
                    .ok()?;
                Some((v.id, p))
            })
            .collect()
    }

    /// This frame's detector output.
    pub fn generate_detections(&mut self) -> Vec<Detection> {
        if self.is_occluded() {
            return Vec::new();
        }

        let truth: Vec<(u64, PixelPoint)> = self.truth_pixels();
        let mut detections = Vec::with_capacity(truth.len() + 1);
        for (id, pixel) in truth {
            if self.detector.miss_rate > 0.0 && self.physics_rng.gen_bool(self.detector.miss_rate) {
                continue;
            }
            let Some(vehicle) = self.vehicles.get(&id) else {
                continue;
            };
            let (w, h) = vehicle.box_size;
            let label = vehicle.label.clone();
            let center = PixelPoint::new(
                pixel.x + self.noise.sample(&mut self.physics_rng),
                pixel.y + self.noise.sample(&mut self.physics_rng),
            );
            let (lo, hi) = self.detector.confidence_range;
            let confidence = if hi > lo { self.physics_rng.gen_range(lo..hi) } else { lo };
            detections.push(Detection::new(BoundingBox::centered(center, w, h), label, confidence));
        }

        if self.detector.malformed_rate > 0.0 && self.physics_rng.gen_bool(self.detector.malformed_rate) {
            let bbox = if self.malformed_injected % 2 == 0 {
                BoundingBox::new(f64::NAN, 10.0, 20.0, 30.0)
            } else {
                BoundingBox::new(200.0, 10.0, 100.0, 30.0)
            };
            detections.push(Detection::new(bbox, "car", 0.5));
            self.malformed_injected += 1;
        }

        detections
    }
}

fn noise_for(detector: &DetectorModel) -> Result<Normal<f64>, SimError> {
    let rate_ok = |r: f64| (0.0..=1.0).contains(&r);
    if !rate_ok(detector.miss_rate) || !rate_ok(detector.malformed_rate) {
        return Err(SimError::Setup("detector rates must be in [0, 1]".to_string()));
    }
    Normal::new(0.0, detector.pixel_noise_std)
        .map_err(|e| SimError::Setup(format!("pixel noise: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_oracle_spawn_and_step() {
        let mut oracle = Oracle::new(42, CameraModel::default()).unwrap();
        let id = oracle.spawn_vehicle(1.75, 20.0, "car", (40.0, 28.0));

        oracle.step(1.0);
        let vehicle = oracle.vehicle(id).unwrap();
        assert!((vehicle.position.y - 20.0).abs() < 1e-9);
        assert!(vehicle.active);

        oracle.step(1.5);
        assert!(!oracle.vehicle(id).unwrap().active);
        assert!(oracle.generate_detections().is_empty());
    }

    #[test]
    fn test_truth_projects_onto_zone_front_edge() {
        let oracle_camera = CameraModel::default();
        let mut oracle = Oracle::new(1, oracle_camera).unwrap();
        oracle.spawn_vehicle(0.0, 10.0, "car", (40.0, 28.0));
        let (_, p) = oracle.truth_pixels()[0];
        assert!((p.x - 340.0).abs() < 1e-6);
        assert!((p.y - 660.0).abs() < 1e-6);
    }

    #[test]
    fn test_occlusion_suppresses_detections() {
        let mut oracle = Oracle::new(7, CameraModel::default()).unwrap();
        oracle.spawn_vehicle(3.5, 8.0, "car", (40.0, 28.0));
        oracle.add_occlusion(0.5, 1.0);

        assert_eq!(oracle.generate_detections().len(), 1);
        oracle.step(0.6);
        assert!(oracle.is_occluded());
        assert!(oracle.generate_detections().is_empty());
        oracle.step(0.5);
        assert_eq!(oracle.generate_detections().len(), 1);
    }

    #[test]
    fn test_malformed_injection_is_counted() {
        let mut oracle = Oracle::new(3, CameraModel::default()).unwrap();
        oracle
            .set_detector(DetectorModel {
                malformed_rate: 1.0,
                ..Default::default()
            })
            .unwrap();
        let dets = oracle.generate_detections();
        assert_eq!(dets.len(), 1);
        assert!(dets[0].validate().is_err());
        assert_eq!(oracle.malformed_injected(), 1);
    }

    #[test]
    fn test_invalid_detector_rejected() {
        let mut oracle = Oracle::new(3, CameraModel::default()).unwrap();
        let bad = DetectorModel {
            miss_rate: 1.5,
            ..Default::default()
        };
        assert!(matches!(oracle.set_detector(bad), Err(SimError::Setup(_))));
    }

    proptest! {
        #[test]
        fn prop_same_seed_same_detections(seed in any::<u64>()) {
            let run = |seed: u64| {
                let mut oracle = Oracle::new(seed, CameraModel::default()).unwrap();
                oracle.set_detector(DetectorModel { pixel_noise_std: 2.0, miss_rate: 0.2, ..Default::default() }).unwrap();
                oracle.spawn_vehicle(1.75, 12.0, "car", (40.0, 28.0));
                oracle.spawn_vehicle(5.25, 15.0, "truck", (60.0, 40.0));
                let mut out = Vec::new();
                for _ in 0..10 {
                    out.extend(oracle.generate_detections());
                    oracle.step(0.1);
                }
                out
            };
            prop_assert_eq!(run(seed), run(seed));
        }
    }
}
