//! JSON-lines recordings of detector output.
//!
//! One `FrameBatch` per line:
//!
//! ```text
//! {"timestamp": 0.0, "detections": [{"box": [10, 20, 50, 60], "label": "car", "confidence": 0.9}]}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use speedview_core::{FrameBatch, FrameSnapshot, Session};
use speedview_env::{EngineWorker, EnvError, FrameDriver, IterSource, TokioContext};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::SimError;
use crate::exporter::{SimExport, SimFrame};

/// Detection source reading a recording.
pub type ReplaySource = IterSource<Box<dyn Iterator<Item = Result<FrameBatch, EnvError>> + Send>>;

/// Parse one recording line.
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<FrameBatch>, SimError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| SimError::Replay {
            line: line_no,
            message: e.to_string(),
        })
}

/// Every batch in a recording, in file order.
pub fn read_batches<R: BufRead>(reader: R) -> impl Iterator<Item = Result<FrameBatch, SimError>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(i, line)| match line {
            Ok(line) => parse_line(i + 1, &line).transpose(),
            Err(e) => Some(Err(SimError::Io(e))),
        })
}

/// Open a recording as a `DetectionSource`.
pub fn open_replay(path: impl AsRef<Path>) -> Result<ReplaySource, SimError> {
    let reader = BufReader::new(File::open(path)?);
    let iter = read_batches(reader).map(|r| r.map_err(|e| EnvError::source(e.to_string())));
    Ok(IterSource::new(Box::new(iter)))
}

pub fn write_batches<W: Write>(mut writer: W, batches: &[FrameBatch]) -> Result<(), SimError> {
    for batch in batches {
        serde_json::to_writer(&mut writer, batch)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a recording that `open_replay` can read back.
pub fn write_recording(path: impl AsRef<Path>, batches: &[FrameBatch]) -> Result<(), SimError> {
    write_batches(BufWriter::new(File::create(path)?), batches)
}

/// Summary of a replayed recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub malformed_detections: u64,
    /// Tracks that reached Confirmed at least once
    pub confirmed_tracks: usize,
    pub max_speed_mps: Option<f64>,
}

impl ReplaySummary {
    fn observe(&mut self, snapshot: &FrameSnapshot, confirmed: &mut BTreeSet<u64>) {
        self.malformed_detections += snapshot.malformed_detections as u64;
        confirmed.extend(snapshot.confirmed_ids.iter().copied());
        for speed in snapshot.tracks.iter().filter_map(|t| t.speed.mps()) {
            self.max_speed_mps = Some(self.max_speed_mps.map_or(speed, |m| m.max(speed)));
        }
    }
}

/// Everything produced by `run_replay`.
pub struct ReplayOutput {
    pub summary: ReplaySummary,
    pub export: SimExport,
    pub heatmap: RgbaImage,
}

/// Drive a recording through a background session.
pub async fn run_replay<I>(
    session: Session,
    source: IterSource<I>,
    heatmap_opacity: f32,
) -> Result<ReplayOutput, SimError>
where
    I: Iterator<Item = Result<FrameBatch, EnvError>> + Send + 'static,
{
    let engine = EngineWorker::spawn(session);
    let driver = FrameDriver::new(TokioContext::shared(), source, engine.clone());

    let mut summary = ReplaySummary::default();
    let mut confirmed = BTreeSet::new();
    let mut export = SimExport::new("replay", 0);

    let stats = driver
        .run(|snapshot| {
            summary.observe(&snapshot, &mut confirmed);
            export.add_frame(SimFrame {
                time_sec: snapshot.timestamp,
                ground_truth: Vec::new(),
                calibration: snapshot.calibration.name().to_string(),
                tracks: snapshot.tracks,
                events: Vec::new(),
            });
        })
        .await?;

    summary.frames_processed = stats.processed;
    summary.frames_rejected = stats.rejected;
    summary.confirmed_tracks = confirmed.len();

    let heatmap = engine.render_heatmap(heatmap_opacity).await?;
    engine.shutdown().await?;

    export.finalize(true, None, None);
    tracing::info!(
        frames = summary.frames_processed,
        rejected = summary.frames_rejected,
        tracks = summary.confirmed_tracks,
        "replay finished"
    );
    Ok(ReplayOutput {
        summary,
        export,
        heatmap,
    })
}
