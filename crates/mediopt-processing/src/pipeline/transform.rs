//! The transform seam: codec adapters implement [`MediaTransform`].

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use mediopt_core::{MediaKind, TransformProfile};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Encoded, Feed, StageEvent};
use crate::error::TransformError;

/// What the transform learned about its output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformSummary {
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
}

/// Write side toward egress.
pub struct ChunkSink {
    tx: mpsc::Sender<Encoded>,
    bytes_sent: u64,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<Encoded>) -> Self {
        Self { tx, bytes_sent: 0 }
    }

    /// Waits while egress is behind.
    pub async fn send(&mut self, chunk: Bytes) -> Result<(), TransformError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;
        self.tx
            .send(Encoded::Data(chunk))
            .await
            .map_err(|_| TransformError::OutputClosed)?;
        self.bytes_sent += len;
        Ok(())
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

/// Advisory reporting from inside a transform.
#[derive(Clone, Default)]
pub struct TransformMonitor {
    events: Option<mpsc::UnboundedSender<StageEvent>>,
}

impl TransformMonitor {
    /// A monitor that discards everything.
    pub fn detached() -> Self {
        Self::default()
    }

    pub(crate) fn new(events: mpsc::UnboundedSender<StageEvent>) -> Self {
        Self {
            events: Some(events),
        }
    }

    pub fn progress(&self, percent: u8) {
        if let Some(events) = &self.events {
            let _ = events.send(StageEvent::Progress(percent.min(100)));
        }
    }

    pub fn subprocess_spawned(&self, pid: u32) {
        if let Some(events) = &self.events {
            let _ = events.send(StageEvent::SubprocessSpawned(pid));
        }
    }
}

/// Channels and context handed to one transform run.
pub struct TransformIo {
    pub input: mpsc::Receiver<Feed>,
    pub output: ChunkSink,
    pub cancel: CancellationToken,
    pub monitor: TransformMonitor,
    /// Per-request scratch directory, present when `needs_scratch` is true.
    pub scratch_dir: Option<PathBuf>,
}

impl TransformIo {
    /// Next input chunk; `Ok(None)` at end of input.
    pub async fn next_input(&mut self) -> Result<Option<Bytes>, TransformError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransformError::Canceled),
            feed = self.input.recv() => match feed {
                Some(Feed::Data(chunk)) => Ok(Some(chunk)),
                Some(Feed::End) => Ok(None),
                None => Err(TransformError::InputAborted),
            },
        }
    }
}

#[async_trait]
pub trait MediaTransform: Send + Sync {
    fn profile(&self) -> &TransformProfile;

    fn kind(&self) -> MediaKind {
        self.profile().kind()
    }

    /// Whether the controller must provide a scratch directory.
    fn needs_scratch(&self) -> bool {
        false
    }

    /// Consume `io.input` until end of input and write the result to `io.output`.
    ///
    /// Must return `InputAborted` if the input channel closes without `Feed::End`
    /// and must stop promptly once `io.cancel` fires.
    async fn run(&self, io: TransformIo) -> Result<TransformSummary, TransformError>;
}
