//! JSON frame export and PNG heatmap export.
//!
//! Exports per-frame ground truth next to the session's track output so runs
//! can be inspected or plotted offline.

use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use speedview_core::TrackSnapshot;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::SimError;
use crate::runner::ScenarioMetrics;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Frame timestamp in seconds
    pub time_sec: f64,

    /// Ground truth vehicle positions (empty for replays)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ground_truth: Vec<TruthPosition>,

    /// Session output for this frame
    pub tracks: Vec<TrackSnapshot>,

    /// Calibration status name
    pub calibration: String,

    /// Events (calibration edits, occlusions, ...)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

/// Pixel position and true speed of a simulated vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthPosition {
    pub id: u64,
    pub label: String,
    pub x: f64,
    pub y: f64,
    pub speed_mps: f64,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name (or "replay")
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ScenarioMetrics>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
            metrics: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, metrics: Option<ScenarioMetrics>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.metrics = metrics;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Writes a rendered heatmap as PNG.
pub fn write_heatmap_png(image: &RgbaImage, path: impl AsRef<Path>) -> Result<(), SimError> {
    image.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_tracks_duration_and_skips_empty() {
        let mut export = SimExport::new("occlusion", 42);
        export.add_frame(SimFrame {
            time_sec: 0.1,
            ground_truth: vec![],
            tracks: vec![],
            calibration: "valid".to_string(),
            events: vec![SimEvent::info("occlusion started")],
        });
        export.finalize(true, None, None);
        assert_eq!(export.duration_sec, 0.1);

        let json = serde_json::to_value(&export).unwrap();
        assert!(json["frames"][0].get("ground_truth").is_none());
        assert_eq!(json["frames"][0]["events"][0]["message"], "occlusion started");
        assert!(json.get("failure_reason").is_none());
    }
}
