//! Background execution of a `Session`.
//!
//! The session is moved into a Tokio task and driven exclusively through
//! owned messages: the caller sends a `FrameBatch` and receives an owned
//! `FrameSnapshot`. Requests are served strictly in order, one at a time, so
//! a calibration edit queued while a frame is in flight takes effect at the
//! next frame boundary.
//!
//! ```text
//!  EngineHandle ──mpsc(FrameRequest)──► EngineWorker { Session }
//!       ▲                                       │
//!       └──────────── oneshot(reply) ───────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use speedview_core::{
    CalibrationEdit, CalibrationSnapshot, CalibrationStatus, FrameBatch, FrameSnapshot, Session,
    SessionId,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::EnvError;
use crate::types::FrameRequest;

/// Default request queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Owns a session inside a background task.
pub struct EngineWorker {
    session: Session,
    requests: mpsc::Receiver<FrameRequest>,
}

impl EngineWorker {
    /// Move `session` into a new Tokio task and return a handle to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(session: Session) -> EngineHandle {
        Self::spawn_with_capacity(session, DEFAULT_QUEUE_DEPTH)
    }

    pub fn spawn_with_capacity(session: Session, queue_depth: usize) -> EngineHandle {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let session_id = session.id();
        let worker = EngineWorker {
            session,
            requests: rx,
        };
        tokio::spawn(worker.run());
        EngineHandle {
            session_id,
            requests: tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn run(mut self) {
        let session_id = self.session.id();
        tracing::info!(session = %session_id, "engine worker started");

        while let Some(request) = self.requests.recv().await {
            tracing::trace!(session = %session_id, kind = request.kind(), "request");
            match request {
                FrameRequest::Process { batch, guard, reply } => {
                    let result = self.session.process_frame(&batch);
                    // Released before replying so the caller can submit again at once.
                    drop(guard);
                    let _ = reply.send(result);
                }
                FrameRequest::Edit { edit, reply } => {
                    let _ = reply.send(self.session.apply_calibration_edit(edit));
                }
                FrameRequest::RenderHeatmap { opacity, reply } => {
                    let _ = reply.send(self.session.render_heatmap(opacity));
                }
                FrameRequest::Calibration { reply } => {
                    let _ = reply.send(self.session.calibration().snapshot());
                }
                FrameRequest::Shutdown { reply } => {
                    tracing::info!(
                        session = %session_id,
                        frames = self.session.frame_index(),
                        "engine worker stopped"
                    );
                    let _ = reply.send(self.session);
                    return;
                }
            }
        }

        tracing::info!(session = %session_id, "engine worker stopped: all handles dropped");
    }
}

/// Marks a frame as in flight until dropped.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cloneable handle to a background session.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    session_id: SessionId,
    requests: mpsc::Sender<FrameRequest>,
    in_flight: Arc<AtomicUsize>,
}

impl EngineHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Frames submitted through this handle (or its clones) still awaiting a reply.
    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Process a frame, waiting for any frame already in flight.
    pub async fn process_frame(&self, batch: FrameBatch) -> Result<FrameSnapshot, EnvError> {
        let guard = self.enter_frame();
        self.submit(batch, guard).await
    }

    /// Process a frame unless one is already in flight.
    ///
    /// Fails with `FrameDropped` instead of queueing behind a busy worker.
    /// A frame stays in flight until the worker has processed it, even if the
    /// caller drops this future after the request was sent.
    pub async fn try_process_frame(&self, batch: FrameBatch) -> Result<FrameSnapshot, EnvError> {
        let Some(guard) = self.try_enter_frame() else {
            tracing::debug!(session = %self.session_id, timestamp = batch.timestamp, "frame dropped");
            return Err(EnvError::FrameDropped(batch.timestamp));
        };
        self.submit(batch, guard).await
    }

    /// Queue a calibration edit; it applies before the next frame.
    pub async fn edit_calibration(&self, edit: CalibrationEdit) -> Result<CalibrationStatus, EnvError> {
        let status = self.request(|reply| FrameRequest::Edit { edit, reply }).await??;
        Ok(status)
    }

    pub async fn render_heatmap(&self, opacity: f32) -> Result<RgbaImage, EnvError> {
        self.request(|reply| FrameRequest::RenderHeatmap { opacity, reply })
            .await
    }

    pub async fn calibration(&self) -> Result<CalibrationSnapshot, EnvError> {
        self.request(|reply| FrameRequest::Calibration { reply }).await
    }

    /// Stop the worker after every request queued before this one, and take
    /// the session back. Other handles then fail with `WorkerClosed`.
    pub async fn shutdown(&self) -> Result<Session, EnvError> {
        self.request(|reply| FrameRequest::Shutdown { reply }).await
    }

    async fn submit(&self, batch: FrameBatch, guard: InFlightGuard) -> Result<FrameSnapshot, EnvError> {
        let snapshot = self
            .request(|reply| FrameRequest::Process { batch, guard, reply })
            .await??;
        Ok(snapshot)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> FrameRequest,
    ) -> Result<T, EnvError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| EnvError::WorkerClosed)?;
        rx.await.map_err(|_| EnvError::WorkerClosed)
    }

    pub(crate) fn enter_frame(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }

    pub(crate) fn try_enter_frame(&self) -> Option<InFlightGuard> {
        self.in_flight
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speedview_core::{BoundingBox, Detection, EngineConfig, EngineError, PixelPoint};
    use std::future::Future;

    fn car(x: f64, y: f64) -> Detection {
        Detection::new(BoundingBox::centered(PixelPoint::new(x, y), 10.0, 6.0), "car", 1.0)
    }

    fn session() -> Session {
        Session::new(EngineConfig::default(), 640, 480).unwrap()
    }

    /// Poll once so the request is queued, without yielding to the worker task.
    async fn enqueue<F: Future + Unpin>(fut: &mut F) {
        tokio::select! {
            biased;
            _ = fut => unreachable!("worker ran before the request was queued"),
            _ = std::future::ready(()) => {}
        }
    }

    async fn calibrate(handle: &EngineHandle) {
        for (x, y) in [(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)] {
            handle
                .edit_calibration(CalibrationEdit::AddPoint(PixelPoint::new(x, y)))
                .await
                .unwrap();
        }
        let status = handle
            .edit_calibration(CalibrationEdit::SetDimensions { length: 20.0, width: 10.0 })
            .await
            .unwrap();
        assert!(status.is_valid());
    }

    #[tokio::test]
    async fn test_worker_processes_frames_in_order() {
        let handle = EngineWorker::spawn(session());
        calibrate(&handle).await;

        let mut last = None;
        for i in 0..3 {
            last = Some(
                handle
                    .process_frame(FrameBatch::new(i as f64 * 0.1, vec![car(50.0, 25.0)]))
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert_eq!(last.frame_index, 3);
        assert_eq!(last.session_id, handle.session_id());
        assert_eq!(last.tracks.len(), 1);
        assert!(last.calibration.is_valid());
        assert_eq!(handle.frames_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_engine_error_is_returned_not_fatal() {
        let handle = EngineWorker::spawn(session());
        handle.process_frame(FrameBatch::new(1.0, vec![])).await.unwrap();

        let err = handle.process_frame(FrameBatch::new(0.5, vec![])).await.unwrap_err();
        assert!(matches!(err, EnvError::Engine(EngineError::NonMonotonicTime { .. })));
        assert!(err.is_engine());

        // Worker is still alive.
        let snap = handle.process_frame(FrameBatch::new(2.0, vec![])).await.unwrap();
        assert_eq!(snap.frame_index, 2);
    }

    #[tokio::test]
    async fn test_try_process_drops_when_busy() {
        let handle = EngineWorker::spawn(session());

        let guard = handle.enter_frame();
        let err = handle
            .try_process_frame(FrameBatch::new(0.0, vec![car(50.0, 25.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::FrameDropped(t) if t == 0.0));
        drop(guard);

        let snap = handle
            .try_process_frame(FrameBatch::new(0.0, vec![car(50.0, 25.0)]))
            .await
            .unwrap();
        assert_eq!(snap.frame_index, 1);
        assert_eq!(handle.frames_in_flight(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_abandoned_frame_stays_in_flight_until_processed() {
        let handle = EngineWorker::spawn(session());

        let mut abandoned = Box::pin(handle.try_process_frame(FrameBatch::new(0.0, vec![car(50.0, 25.0)])));
        enqueue(&mut abandoned).await;
        drop(abandoned);
        assert_eq!(handle.frames_in_flight(), 1);

        let err = handle
            .try_process_frame(FrameBatch::new(0.1, vec![car(52.0, 25.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::FrameDropped(_)));

        // Served after the abandoned frame, so that frame is finished by now.
        handle.calibration().await.unwrap();
        assert_eq!(handle.frames_in_flight(), 0);
        let snap = handle
            .try_process_frame(FrameBatch::new(0.2, vec![car(54.0, 25.0)]))
            .await
            .unwrap();
        assert_eq!(snap.frame_index, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_edit_queued_mid_frame_applies_at_next_frame() {
        let handle = EngineWorker::spawn(session());
        for (x, y) in [(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)] {
            handle
                .edit_calibration(CalibrationEdit::AddPoint(PixelPoint::new(x, y)))
                .await
                .unwrap();
        }

        let (producer, editor) = (handle.clone(), handle.clone());
        let mut first = Box::pin(producer.process_frame(FrameBatch::new(0.0, vec![car(50.0, 25.0)])));
        enqueue(&mut first).await;
        let mut edit = Box::pin(editor.edit_calibration(CalibrationEdit::SetDimensions {
            length: 20.0,
            width: 10.0,
        }));
        enqueue(&mut edit).await;
        let mut second = Box::pin(handle.process_frame(FrameBatch::new(0.1, vec![car(55.0, 25.0)])));
        enqueue(&mut second).await;

        let first = first.await.unwrap();
        let status = edit.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(first.calibration, CalibrationStatus::Partial(4));
        assert!(status.is_valid());
        assert!(second.calibration.is_valid());
        assert_eq!(second.frame_index, first.frame_index + 1);
    }

    #[tokio::test]
    async fn test_rejected_edit_keeps_zone() {
        let handle = EngineWorker::spawn(session());
        calibrate(&handle).await;

        let err = handle
            .edit_calibration(CalibrationEdit::SetDimensions { length: -1.0, width: 10.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::Engine(EngineError::InvalidDimension(_))));

        let zone = handle.calibration().await.unwrap();
        assert_eq!(zone.real_length, Some(20.0));
        assert_eq!(zone.points.len(), 4);
    }

    #[tokio::test]
    async fn test_render_heatmap_over_channel() {
        let handle = EngineWorker::spawn(session());
        handle
            .process_frame(FrameBatch::new(0.0, vec![car(50.0, 25.0)]))
            .await
            .unwrap();
        let img = handle.render_heatmap(1.0).await.unwrap();
        assert_eq!(img.dimensions(), (640, 480));
        assert!(img.get_pixel(50, 25).0[3] > 0);
        assert_eq!(img.get_pixel(600, 400).0[3], 0);
    }

    #[tokio::test]
    async fn test_shutdown_returns_session_and_closes_handles() {
        let handle = EngineWorker::spawn(session());
        let other = handle.clone();
        handle.process_frame(FrameBatch::new(0.0, vec![])).await.unwrap();

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.frame_index(), 1);

        let err = other.process_frame(FrameBatch::new(1.0, vec![])).await.unwrap_err();
        assert!(matches!(err, EnvError::WorkerClosed));
    }
}
