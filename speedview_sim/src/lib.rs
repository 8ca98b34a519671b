//! SpeedView Deterministic Scenario Harness
//!
//! Drives a [`speedview_core::Session`] with synthetic traffic whose ground
//! truth is known exactly, then scores tracking identity and speed accuracy.
//!
//! # Core Principle
//!
//! All randomness derives from a single 64-bit seed, so a failing run can be
//! reproduced bit-for-bit from its seed alone:
//! - **Traffic**: lane speeds drawn from the scenario seed
//! - **Detector**: box noise, dropouts and corrupt boxes from the physics seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                        │
//! │  ┌────────────────────┐        ┌──────────────────────┐  │
//! │  │       Oracle        │ boxes  │  Session (local) or  │  │
//! │  │ road-plane vehicles ├───────►│  EngineHandle        │  │
//! │  │ + detector model    │        │  (speedview_env)     │  │
//! │  └─────────┬──────────┘        └──────────┬───────────┘  │
//! │            │ ground truth                  │ snapshots    │
//! │            └──────────►  Evaluator  ◄──────┘              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Recorded detector output can be replayed through the same session via
//! [`replay::run_replay`].
//!
//! # Usage
//!
//! ```no_run
//! use speedview_sim::{ScenarioId, ScenarioRunner};
//!
//! # async fn demo() -> Result<(), speedview_sim::SimError> {
//! let run = ScenarioRunner::new(42).run(ScenarioId::Occlusion).await?;
//! assert!(run.result.passed);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod exporter;
pub mod oracle;
pub mod replay;
pub mod runner;
pub mod scenarios;

pub use error::SimError;
pub use exporter::{write_heatmap_png, SimEvent, SimExport, SimFrame, TruthPosition};
pub use oracle::{CameraModel, DetectorModel, GroundTruthVehicle, Oracle};
pub use replay::{open_replay, run_replay, write_recording, ReplayOutput, ReplaySource, ReplaySummary};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRun, ScenarioRunner};
pub use scenarios::ScenarioId;
