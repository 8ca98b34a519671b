//! SpeedView Demo - Calibrate a zone, track a car, read its speed
//!
//! Walks through the three artifacts a session produces:
//!
//! 1. Calibration - four clicked corners plus the zone's real size
//! 2. Tracks with speed - one car crossing the zone at 10 m/s
//! 3. Heatmap - where detections landed, rendered as an overlay
//!
//! Run: `cargo run --example speedview_demo`

use speedview_core::{
    BoundingBox, CalibrationEdit, Detection, EngineConfig, FrameBatch, PixelPoint, Session, SpeedReading,
};

// ============================================================================
// ANSI COLOR CODES
// ============================================================================

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
}

use colors::*;

fn main() -> Result<(), speedview_core::EngineError> {
    println!("{BOLD}{CYAN}SpeedView{RESET} {DIM}calibrate → track → measure{RESET}\n");

    let mut session = Session::new(EngineConfig::default(), 640, 480)?;

    // A 100×50 px rectangle standing in for a 20×10 m patch of road.
    let corners = [(100.0, 100.0), (200.0, 100.0), (200.0, 150.0), (100.0, 150.0)];
    for (x, y) in corners {
        let status = session.apply_calibration_edit(CalibrationEdit::AddPoint(PixelPoint::new(x, y)))?;
        println!("  corner ({x:>5.1}, {y:>5.1})  status={YELLOW}{}{RESET}", status.name());
    }
    let status = session.apply_calibration_edit(CalibrationEdit::SetDimensions {
        length: 20.0,
        width: 10.0,
    })?;
    println!("  dimensions 20×10 m       status={GREEN}{}{RESET}\n", status.name());

    // 5 px per metre, 10 frames per second: 10 m/s is 5 px per frame.
    for frame in 0..12 {
        let x = 110.0 + frame as f64 * 5.0;
        let bbox = BoundingBox::centered(PixelPoint::new(x, 125.0), 12.0, 8.0);
        let batch = FrameBatch::new(frame as f64 * 0.1, vec![Detection::new(bbox, "car", 0.9)]);
        let snapshot = session.process_frame(&batch)?;

        for track in &snapshot.tracks {
            let speed = match track.speed {
                SpeedReading::Available(mps) => format!("{GREEN}{:5.1} km/h{RESET}", mps * speedview_core::MPS_TO_KMH),
                SpeedReading::Unavailable(reason) => format!("{DIM}{reason:?}{RESET}"),
            };
            println!(
                "  t={:.1}s  track #{} {:<9}  px=({:>5.1}, {:>5.1})  {}",
                snapshot.timestamp,
                track.id,
                format!("{:?}", track.state),
                track.position.x,
                track.position.y,
                speed
            );
        }
    }

    let stats = session.heatmap().stats();
    let overlay = session.render_heatmap(0.6);
    println!(
        "\n  heatmap: {} detections recorded, peak {:.2}, overlay {}×{}",
        stats.total_detections,
        stats.peak_intensity,
        overlay.width(),
        overlay.height()
    );
    Ok(())
}
