//! The "HEATMAP" Engine - Decaying Detection Density Grid
//!
//! A fixed-resolution grid over the frame. Each detection adds weight to the
//! cell containing its box centre (clipped to `max_intensity`); every frame all
//! cells are multiplied by `decay_factor`, leaving a fading trail.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::detection::{partition_valid, Detection};
use crate::error::EngineError;

/// Configuration for the HeatmapEngine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Cell edge in pixels (default: 10)
    pub cell_size: u32,

    /// Per-frame multiplicative decay in (0, 1) (default: 0.95)
    pub decay_factor: f64,

    /// Weight added per detection (default: 1.0)
    pub base_weight: f64,

    /// Scale the weight by detection confidence (default: true)
    pub weight_by_confidence: bool,

    /// Intensity cap per cell; also the full-scale value when rendering (default: 10.0)
    pub max_intensity: f64,

    /// Intensities below this snap to zero after decay (default: 1e-4)
    pub zero_floor: f64,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            cell_size: 10,
            decay_factor: 0.95,
            base_weight: 1.0,
            weight_by_confidence: true,
            max_intensity: 10.0,
            zero_floor: 1e-4,
        }
    }
}

impl HeatmapConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.cell_size == 0 {
            return Err(EngineError::invalid_dimension("cell_size must be >= 1"));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(EngineError::invalid_dimension(format!(
                "decay_factor must be in (0, 1), got {}",
                self.decay_factor
            )));
        }
        if !(self.base_weight.is_finite() && self.base_weight >= 0.0) {
            return Err(EngineError::invalid_dimension(format!(
                "base_weight must be >= 0, got {}",
                self.base_weight
            )));
        }
        if !(self.max_intensity.is_finite() && self.max_intensity > 0.0) {
            return Err(EngineError::invalid_dimension(format!(
                "max_intensity must be > 0, got {}",
                self.max_intensity
            )));
        }
        if !(self.zero_floor.is_finite() && self.zero_floor >= 0.0) {
            return Err(EngineError::invalid_dimension(format!(
                "zero_floor must be >= 0, got {}",
                self.zero_floor
            )));
        }
        Ok(())
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeatmapStats {
    /// Detections ever recorded (never decays)
    pub total_detections: u64,
    /// Highest cell intensity right now
    pub peak_intensity: f64,
}

/// Density grid for one session's frame size.
#[derive(Debug, Clone)]
pub struct HeatmapEngine {
    config: HeatmapConfig,
    frame_width: u32,
    frame_height: u32,
    cols: usize,
    rows: usize,
    /// Row-major intensities
    cells: Vec<f64>,
    total_detections: u64,
}

impl HeatmapEngine {
    /// Build a grid covering a `frame_width × frame_height` frame.
    pub fn new(config: HeatmapConfig, frame_width: u32, frame_height: u32) -> Result<Self, EngineError> {
        config.validate()?;
        if frame_width == 0 || frame_height == 0 {
            return Err(EngineError::invalid_dimension(format!(
                "frame size must be non-zero, got {}x{}",
                frame_width, frame_height
            )));
        }
        let cols = frame_width.div_ceil(config.cell_size) as usize;
        let rows = frame_height.div_ceil(config.cell_size) as usize;
        Ok(Self {
            config,
            frame_width,
            frame_height,
            cols,
            rows,
            cells: vec![0.0; cols * rows],
            total_detections: 0,
        })
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    /// `(rows, cols)`
    pub fn grid_size(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.frame_width, self.frame_height)
    }

    pub fn intensity(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        Some(self.cells[row * self.cols + col])
    }

    /// Add every well-formed detection to its nearest cell.
    ///
    /// Returns the number of malformed detections that were skipped.
    pub fn record_detections(&mut self, detections: &[Detection]) -> usize {
        let (valid, malformed) = partition_valid(detections);
        let cell = self.config.cell_size as f64;
        for det in valid {
            let c = det.center();
            let col = ((c.x / cell).floor().max(0.0) as usize).min(self.cols - 1);
            let row = ((c.y / cell).floor().max(0.0) as usize).min(self.rows - 1);

            let weight = if self.config.weight_by_confidence {
                self.config.base_weight * det.confidence
            } else {
                self.config.base_weight
            };
            let idx = row * self.cols + col;
            self.cells[idx] = (self.cells[idx] + weight).min(self.config.max_intensity);
            self.total_detections += 1;
        }
        malformed
    }

    /// Multiply every cell by the decay factor. Call once per frame.
    pub fn apply_decay(&mut self) {
        let factor = self.config.decay_factor;
        let floor = self.config.zero_floor;
        for v in self.cells.iter_mut() {
            *v *= factor;
            if *v < floor {
                *v = 0.0;
            }
        }
    }

    /// Zero every cell. The detection counter is kept.
    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn stats(&self) -> HeatmapStats {
        HeatmapStats {
            total_detections: self.total_detections,
            peak_intensity: self.cells.iter().copied().fold(0.0, f64::max),
        }
    }

    /// Colour-mapped density image at frame resolution.
    ///
    /// Zero intensity is fully transparent; alpha grows with intensity up to
    /// `opacity` (clamped to `[0, 1]`, NaN treated as 0) at `max_intensity`.
    pub fn render(&self, opacity: f32) -> RgbaImage {
        let opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
        let cell = self.config.cell_size;
        let palette: Vec<Rgba<u8>> = self
            .cells
            .iter()
            .map(|&v| colormap((v / self.config.max_intensity) as f32, opacity))
            .collect();

        RgbaImage::from_fn(self.frame_width, self.frame_height, |x, y| {
            let col = (x / cell) as usize;
            let row = (y / cell) as usize;
            palette[row * self.cols + col]
        })
    }
}

/// Blue → cyan → green → yellow → red ramp with alpha proportional to `t`.
fn colormap(t: f32, opacity: f32) -> Rgba<u8> {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    if t <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    const STOPS: [(f32, [f32; 3]); 5] = [
        (0.0, [0.0, 0.0, 255.0]),
        (0.25, [0.0, 255.0, 255.0]),
        (0.5, [0.0, 255.0, 0.0]),
        (0.75, [255.0, 255.0, 0.0]),
        (1.0, [255.0, 0.0, 0.0]),
    ];
    let mut rgb = STOPS[STOPS.len() - 1].1;
    for pair in STOPS.windows(2) {
        let (t0, c0) = pair[0];
        let (t1, c1) = pair[1];
        if t <= t1 {
            let f = (t - t0) / (t1 - t0);
            rgb = [
                c0[0] + (c1[0] - c0[0]) * f,
                c0[1] + (c1[1] - c0[1]) * f,
                c0[2] + (c1[2] - c0[2]) * f,
            ];
            break;
        }
    }
    let alpha = (t * opacity * 255.0).round() as u8;
    Rgba([rgb[0].round() as u8, rgb[1].round() as u8, rgb[2].round() as u8, alpha])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, PixelPoint};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn det(x: f64, y: f64, confidence: f64) -> Detection {
        Detection::new(BoundingBox::centered(PixelPoint::new(x, y), 8.0, 8.0), "car", confidence)
    }

    fn engine() -> HeatmapEngine {
        HeatmapEngine::new(HeatmapConfig::default(), 100, 50).unwrap()
    }

    #[test]
    fn test_grid_covers_frame() {
        let h = HeatmapEngine::new(HeatmapConfig::default(), 105, 50).unwrap();
        assert_eq!(h.grid_size(), (5, 11));
        assert!(HeatmapEngine::new(HeatmapConfig::default(), 0, 50).is_err());
    }

    #[test]
    fn test_record_adds_confidence_weight_to_nearest_cell() {
        let mut h = engine();
        h.record_detections(&[det(25.0, 15.0, 0.5), det(27.0, 12.0, 1.0)]);
        assert_relative_eq!(h.intensity(1, 2).unwrap(), 1.5);
        assert_eq!(h.intensity(0, 0), Some(0.0));
        assert_eq!(h.stats().total_detections, 2);
    }

    #[test]
    fn test_out_of_frame_centres_clamp_to_edge() {
        let mut h = engine();
        h.record_detections(&[det(-30.0, -30.0, 1.0), det(500.0, 500.0, 1.0)]);
        assert_relative_eq!(h.intensity(0, 0).unwrap(), 1.0);
        assert_relative_eq!(h.intensity(4, 9).unwrap(), 1.0);
    }

    #[test]
    fn test_intensity_clipped_to_max() {
        let mut h = engine();
        let burst: Vec<Detection> = (0..50).map(|_| det(5.0, 5.0, 1.0)).collect();
        h.record_detections(&burst);
        assert_relative_eq!(h.intensity(0, 0).unwrap(), 10.0);
        assert_relative_eq!(h.stats().peak_intensity, 10.0);
        assert_eq!(h.stats().total_detections, 50);
    }

    #[test]
    fn test_malformed_skipped() {
        let mut h = engine();
        let bad = Detection::new(BoundingBox::new(10.0, 10.0, 0.0, 0.0), "car", 0.9);
        let skipped = h.record_detections(&[bad, det(5.0, 5.0, 1.0)]);
        assert_eq!(skipped, 1);
        assert_eq!(h.stats().total_detections, 1);
    }

    #[test]
    fn test_decay_strictly_decreases_to_zero() {
        let mut h = engine();
        h.record_detections(&[det(5.0, 5.0, 1.0)]);
        let mut prev = h.intensity(0, 0).unwrap();
        for _ in 0..500 {
            h.apply_decay();
            let v = h.intensity(0, 0).unwrap();
            assert!(v >= 0.0);
            assert!(v < prev || (v == 0.0 && prev == 0.0));
            prev = v;
        }
        assert_eq!(prev, 0.0);
        // The counter never decays.
        assert_eq!(h.stats().total_detections, 1);
        assert_eq!(h.stats().peak_intensity, 0.0);
    }

    #[test]
    fn test_render_transparent_when_empty() {
        let h = engine();
        let img = h.render(0.8);
        assert_eq!(img.dimensions(), (100, 50));
        assert!(img.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_render_hot_cell_is_warm_and_opaque() {
        let mut h = engine();
        let burst: Vec<Detection> = (0..20).map(|_| det(55.0, 25.0, 1.0)).collect();
        h.record_detections(&burst);
        h.record_detections(&[det(5.0, 45.0, 0.5)]);

        let img = h.render(1.0);
        let hot = img.get_pixel(55, 25);
        assert_eq!(hot.0, [255, 0, 0, 255]);

        let cool = img.get_pixel(5, 45);
        assert!(cool.0[2] > cool.0[0], "low intensity should be blue-ish");
        assert!(cool.0[3] < 64);

        let half = h.render(0.5);
        assert_eq!(half.get_pixel(55, 25).0[3], 128);
    }

    #[test]
    fn test_render_is_pure() {
        let mut h = engine();
        h.record_detections(&[det(5.0, 5.0, 1.0)]);
        let before = h.stats();
        let a = h.render(0.7);
        let b = h.render(0.7);
        assert_eq!(a, b);
        assert_eq!(h.stats(), before);
    }

    #[test]
    fn test_invalid_config() {
        let cfg = HeatmapConfig {
            decay_factor: 1.0,
            ..Default::default()
        };
        assert!(HeatmapEngine::new(cfg, 10, 10).is_err());
    }

    proptest! {
        #[test]
        fn prop_intensity_never_negative(
            points in proptest::collection::vec((-50.0f64..150.0, -50.0f64..100.0, 0.0f64..=1.0), 0..40),
            decays in 0usize..30,
        ) {
            let mut h = engine();
            let dets: Vec<Detection> = points.iter().map(|&(x, y, c)| det(x, y, c)).collect();
            h.record_detections(&dets);
            let (rows, cols) = h.grid_size();
            let before: Vec<f64> = (0..rows).flat_map(|r| (0..cols).map(move |c| (r, c)))
                .map(|(r, c)| h.intensity(r, c).unwrap())
                .collect();
            for _ in 0..decays {
                h.apply_decay();
            }
            let mut i = 0;
            for r in 0..rows {
                for c in 0..cols {
                    let v = h.intensity(r, c).unwrap();
                    prop_assert!(v >= 0.0);
                    prop_assert!(v <= h.config().max_intensity);
                    if decays > 0 {
                        prop_assert!(v < before[i] || v == 0.0);
                    }
                    i += 1;
                }
            }
        }
    }
}
