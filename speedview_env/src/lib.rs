//! SpeedView Execution Environment
//!
//! Runs `speedview_core` sessions outside the caller's thread and feeds them
//! frames at the rate they can sustain.
//!
//! # Core Concept: Message Passing, One Frame In Flight
//!
//! - A `Session` is moved into an [`EngineWorker`] task; callers talk to it
//!   through a cloneable [`EngineHandle`] using owned requests and replies
//! - A [`FrameDriver`] pulls batches from a [`DetectionSource`], sheds stale
//!   batches, and forwards each `FrameSnapshot` to a sink
//! - Time comes from a [`FrameContext`]; [`SteppedContext`] makes latency
//!   measurements reproducible in tests
//!
//! # Example
//!
//! ```no_run
//! use speedview_core::{EngineConfig, Session};
//! use speedview_env::{ChannelSource, EngineWorker, FrameDriver, TokioContext};
//!
//! # async fn demo() -> Result<(), speedview_env::EnvError> {
//! let session = Session::new(EngineConfig::default(), 1280, 720)?;
//! let engine = EngineWorker::spawn(session);
//! let (detector, source) = ChannelSource::new(4);
//!
//! let driver = FrameDriver::new(TokioContext::shared(), source, engine);
//! let stats = driver.run(|snapshot| println!("{} tracks", snapshot.tracks.len())).await?;
//! # drop(detector);
//! # let _ = stats;
//! # Ok(())
//! # }
//! ```

mod context;
mod driver;
mod error;
mod source;
mod stepped;
mod tokio_impl;
mod types;
mod worker;

pub use context::FrameContext;
pub use driver::{DriverStats, FrameDriver, StopHandle};
pub use error::EnvError;
pub use source::{BatchSender, ChannelSource, DetectionSource, IterSource};
pub use stepped::SteppedContext;
pub use tokio_impl::TokioContext;
pub use worker::{EngineHandle, EngineWorker, DEFAULT_QUEUE_DEPTH};
