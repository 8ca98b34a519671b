//! Detection sources feeding the frame driver.

use async_trait::async_trait;
use speedview_core::FrameBatch;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::EnvError;

/// Producer of per-frame detection batches.
///
/// # Implementations
///
/// - `ChannelSource`: push-driven (live detector posting into a channel)
/// - `IterSource`: pull-driven (recorded or synthetic batches)
#[async_trait]
pub trait DetectionSource: Send {
    /// Wait for the next batch.
    ///
    /// # Returns
    /// * `Ok(Some(batch))` - A batch is available
    /// * `Ok(None)` - The source is exhausted or closed
    async fn next_batch(&mut self) -> Result<Option<FrameBatch>, EnvError>;

    /// A batch that is already waiting, without blocking.
    ///
    /// Sources that only produce on demand return `Ok(None)`.
    fn try_next_batch(&mut self) -> Result<Option<FrameBatch>, EnvError> {
        Ok(None)
    }
}

/// Sending half of a `ChannelSource`.
pub type BatchSender = mpsc::Sender<FrameBatch>;

/// Batches pushed by a producer over a bounded channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<FrameBatch>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (BatchSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl DetectionSource for ChannelSource {
    async fn next_batch(&mut self) -> Result<Option<FrameBatch>, EnvError> {
        Ok(self.rx.recv().await)
    }

    fn try_next_batch(&mut self) -> Result<Option<FrameBatch>, EnvError> {
        match self.rx.try_recv() {
            Ok(batch) => Ok(Some(batch)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}

/// Batches yielded one at a time from an iterator of fallible items.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Result<FrameBatch, EnvError>> + Send,
{
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl IterSource<std::vec::IntoIter<Result<FrameBatch, EnvError>>> {
    /// Source over an in-memory list of batches.
    pub fn from_batches(batches: Vec<FrameBatch>) -> Self {
        Self::new(batches.into_iter().map(Ok).collect::<Vec<_>>().into_iter())
    }
}

#[async_trait]
impl<I> DetectionSource for IterSource<I>
where
    I: Iterator<Item = Result<FrameBatch, EnvError>> + Send,
{
    async fn next_batch(&mut self) -> Result<Option<FrameBatch>, EnvError> {
        self.iter.next().transpose()
    }
}
