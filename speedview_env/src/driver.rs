//! The frame loop: source → background session → sink.
//!
//! One frame is in flight at a time. Before each submission the driver
//! drains every batch that queued up while the previous frame was being
//! processed and keeps only the newest, so a slow session sheds load instead
//! of falling further behind.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use speedview_core::FrameSnapshot;
use tokio::sync::Notify;

use crate::context::FrameContext;
use crate::error::EnvError;
use crate::source::DetectionSource;
use crate::worker::EngineHandle;

/// Counters reported when the driver stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverStats {
    /// Frames that produced a snapshot
    pub processed: u64,
    /// Stale batches discarded in favour of a newer one
    pub dropped: u64,
    /// Frames the session rejected (e.g. non-monotonic timestamps)
    pub rejected: u64,
    /// Submit-to-snapshot time of the most recent frame
    pub last_latency: Option<Duration>,
}

/// Cloneable stop signal for a running driver.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    notify: Arc<Notify>,
}

impl StopHandle {
    /// Ask the driver to stop after the frame currently in flight.
    pub fn stop(&self) {
        self.notify.notify_one();
    }
}

/// Drives a background session from a detection source.
pub struct FrameDriver<C: FrameContext, S: DetectionSource> {
    context: Arc<C>,
    source: S,
    engine: EngineHandle,
    stop: StopHandle,
}

impl<C: FrameContext, S: DetectionSource> FrameDriver<C, S> {
    pub fn new(context: Arc<C>, source: S, engine: EngineHandle) -> Self {
        Self {
            context,
            source,
            engine,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the loop after the frame currently in flight.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Run until the source closes or `stop` is called.
    ///
    /// Frames the session rejects are counted and skipped; a failing source
    /// or a closed worker ends the loop with an error.
    pub async fn run<F>(mut self, mut sink: F) -> Result<DriverStats, EnvError>
    where
        F: FnMut(FrameSnapshot) + Send,
    {
        let session = self.engine.session_id();
        let mut stats = DriverStats::default();
        tracing::info!(session = %session, "frame driver started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.notify.notified() => {
                    tracing::info!(session = %session, "frame driver stop requested");
                    break;
                }
                batch = self.source.next_batch() => batch?,
            };
            let Some(mut batch) = next else {
                tracing::info!(session = %session, "detection source closed");
                break;
            };

            while let Some(newer) = self.source.try_next_batch()? {
                stats.dropped += 1;
                tracing::debug!(
                    session = %session,
                    stale = batch.timestamp,
                    newer = newer.timestamp,
                    "dropping stale frame"
                );
                batch = newer;
            }

            let started = self.context.now();
            match self.engine.process_frame(batch).await {
                Ok(snapshot) => {
                    stats.processed += 1;
                    stats.last_latency = Some(self.context.now().saturating_sub(started));
                    sink(snapshot);
                }
                Err(EnvError::Engine(e)) => {
                    stats.rejected += 1;
                    tracing::warn!(session = %session, "frame rejected: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            session = %session,
            processed = stats.processed,
            dropped = stats.dropped,
            rejected = stats.rejected,
            "frame driver stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChannelSource, IterSource};
    use crate::stepped::SteppedContext;
    use crate::tokio_impl::TokioContext;
    use crate::worker::EngineWorker;
    use speedview_core::{BoundingBox, Detection, EngineConfig, FrameBatch, PixelPoint, Session};

    fn car(x: f64) -> Detection {
        Detection::new(BoundingBox::centered(PixelPoint::new(x, 25.0), 10.0, 6.0), "car", 1.0)
    }

    fn engine() -> EngineHandle {
        EngineWorker::spawn(Session::new(EngineConfig::default(), 640, 480).unwrap())
    }

    #[tokio::test]
    async fn test_processes_every_pulled_batch() {
        let batches = (0..5).map(|i| FrameBatch::new(i as f64 * 0.1, vec![car(50.0)])).collect();
        let context = SteppedContext::with_tick(Duration::from_millis(5)).shared();
        let driver = FrameDriver::new(context, IterSource::from_batches(batches), engine());

        let mut indices = Vec::new();
        let stats = driver.run(|snap| indices.push(snap.frame_index)).await.unwrap();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.dropped, 0);
        // One clock reading before submit and one after the reply.
        assert_eq!(stats.last_latency, Some(Duration::from_millis(5)));
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_drops_all_but_newest_queued_batch() {
        let (tx, source) = ChannelSource::new(8);
        for i in 0..5 {
            tx.send(FrameBatch::new(i as f64, vec![car(50.0)])).await.unwrap();
        }
        drop(tx);

        let driver = FrameDriver::new(TokioContext::shared(), source, engine());
        let mut timestamps = Vec::new();
        let stats = driver.run(|snap| timestamps.push(snap.timestamp)).await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.dropped, 4);
        assert_eq!(timestamps, vec![4.0]);
    }

    #[tokio::test]
    async fn test_rejected_frames_do_not_stop_the_loop() {
        let batches = vec![
            FrameBatch::new(1.0, vec![]),
            FrameBatch::new(1.0, vec![]),
            FrameBatch::new(2.0, vec![]),
        ];
        let driver = FrameDriver::new(TokioContext::shared(), IterSource::from_batches(batches), engine());
        let stats = driver.run(|_| {}).await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_source_error_ends_run() {
        let items = vec![Ok(FrameBatch::new(0.0, vec![])), Err(EnvError::source("truncated"))];
        let driver = FrameDriver::new(TokioContext::shared(), IterSource::new(items.into_iter()), engine());
        let err = driver.run(|_| {}).await.unwrap_err();
        assert!(matches!(err, EnvError::SourceError(_)));
    }

    #[tokio::test]
    async fn test_stop_ends_run_while_source_is_open() {
        let (tx, source) = ChannelSource::new(8);
        let driver = FrameDriver::new(TokioContext::shared(), source, engine());
        let stopper = driver.stop_handle();

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(driver.run(move |snap| {
            let _ = seen_tx.send(snap.frame_index);
        }));

        tx.send(FrameBatch::new(0.0, vec![car(50.0)])).await.unwrap();
        assert_eq!(seen_rx.recv().await, Some(1));

        stopper.stop();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.processed, 1);
        // Sender still alive: the loop ended because of the stop signal.
        drop(tx);
    }
}
