//! Error types for the simulator.

use speedview_core::EngineError;
use speedview_env::EnvError;
use thiserror::Error;

/// Errors that abort a simulation run or an export.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image export error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Env(#[from] EnvError),

    /// A replay line could not be parsed.
    #[error("Replay line {line}: {message}")]
    Replay { line: usize, message: String },

    /// The simulated world was configured inconsistently.
    #[error("Invalid scenario setup: {0}")]
    Setup(String),
}
