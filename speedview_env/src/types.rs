//! Messages exchanged with a background session.
//!
//! Every request owns its payload and carries a one-shot reply channel, so
//! nothing is shared by reference between the caller and the worker.

use image::RgbaImage;
use speedview_core::{
    CalibrationEdit, CalibrationSnapshot, CalibrationStatus, EngineError, FrameBatch, FrameSnapshot,
    Session,
};
use tokio::sync::oneshot;

use crate::worker::InFlightGuard;

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// A request to the engine worker.
#[derive(Debug)]
pub(crate) enum FrameRequest {
    /// Run the per-frame pipeline on one batch.
    ///
    /// The guard keeps the frame counted as in flight until the worker has
    /// processed it, even if the caller stopped waiting.
    Process {
        batch: FrameBatch,
        guard: InFlightGuard,
        reply: Reply<Result<FrameSnapshot, EngineError>>,
    },
    /// Apply a calibration edit at the next frame boundary.
    Edit {
        edit: CalibrationEdit,
        reply: Reply<Result<CalibrationStatus, EngineError>>,
    },
    /// Render the current heatmap.
    RenderHeatmap { opacity: f32, reply: Reply<RgbaImage> },
    /// Copy out the calibration zone for persistence.
    Calibration { reply: Reply<CalibrationSnapshot> },
    /// Stop the worker and hand the session back.
    Shutdown { reply: Reply<Session> },
}

impl FrameRequest {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            FrameRequest::Process { .. } => "process",
            FrameRequest::Edit { .. } => "edit",
            FrameRequest::RenderHeatmap { .. } => "render_heatmap",
            FrameRequest::Calibration { .. } => "calibration",
            FrameRequest::Shutdown { .. } => "shutdown",
        }
    }
}
