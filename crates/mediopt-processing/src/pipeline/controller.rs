//! Pipeline supervision: wires the three stages, tracks their states and owns
//! the single-delivery decision.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use mediopt_core::{
    ErrorMetadata, LogLevel, MediaKind, PipelineError, PipelineOutcome, StageState, UploadResult,
};
use mediopt_storage::{generate_storage_key, Storage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::egress::{run_egress, EgressEnd, EgressJob, EgressReceipt};
use super::gate::ResponseGate;
use super::source::{ByteSource, IngestEvent};
use super::transform::{ChunkSink, MediaTransform, TransformIo, TransformMonitor};
use super::{Encoded, Feed, Stage, StageEvent};

const BUFFER_CHUNKS: usize = 8;
const EGRESS_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Capacity of each inter-stage channel, in chunks.
    pub buffer_chunks: usize,
    pub egress_timeout: Duration,
    /// Parent directory for per-request scratch directories.
    pub scratch_root: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            buffer_chunks: BUFFER_CHUNKS,
            egress_timeout: EGRESS_TIMEOUT,
            scratch_root: std::env::temp_dir(),
        }
    }
}

/// One inbound upload. Immutable once started.
pub struct PipelineRequest {
    pub request_id: Uuid,
    pub source: ByteSource,
    /// Codec adapter carrying the target profile.
    pub transform: Arc<dyn MediaTransform>,
    /// Destination folder in storage.
    pub folder: String,
}

/// Controller-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStates {
    pub ingest: StageState,
    pub transform: StageState,
    pub egress: StageState,
}

impl Default for StageStates {
    fn default() -> Self {
        Self {
            ingest: StageState::Idle,
            transform: StageState::Idle,
            egress: StageState::Idle,
        }
    }
}

impl StageStates {
    fn advance(&mut self, stage: Stage, next: StageState) {
        let current = match stage {
            Stage::Ingest => &mut self.ingest,
            Stage::Transform => &mut self.transform,
            Stage::Egress => &mut self.egress,
        };
        if current.can_transition_to(next) {
            *current = next;
        } else {
            tracing::warn!(
                stage = %stage,
                from = %current,
                to = %next,
                "Ignoring backward stage transition"
            );
        }
    }
}

/// Everything known about a request once all of its resources are released.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub request_id: Uuid,
    pub outcome: PipelineOutcome,
    pub state: PipelineState,
    pub stages: StageStates,
    pub bytes_ingested: u64,
    pub subprocess_pid: Option<u32>,
    pub scratch_dir: Option<PathBuf>,
    /// An object finished uploading after a failure was delivered and was deleted.
    pub compensating_delete: bool,
}

pub struct PipelineHandle {
    pub request_id: Uuid,
    outcome: oneshot::Receiver<PipelineOutcome>,
    report: JoinHandle<PipelineReport>,
}

impl PipelineHandle {
    /// Wait for the delivered outcome.
    pub async fn outcome(&mut self) -> PipelineOutcome {
        match (&mut self.outcome).await {
            Ok(outcome) => outcome,
            Err(_) => PipelineOutcome::Failure(PipelineError::Unexpected(
                "pipeline ended without delivering an outcome".to_string(),
            )),
        }
    }

    /// Wait for the outcome and for teardown to finish.
    pub async fn finish(mut self) -> (PipelineOutcome, Option<PipelineReport>) {
        let outcome = self.outcome().await;
        let report = match self.report.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, request_id = %self.request_id, "Pipeline supervisor failed");
                None
            }
        };
        (outcome, report)
    }
}

/// Starts pipelines against one storage backend.
#[derive(Clone)]
pub struct PipelineController {
    storage: Arc<dyn Storage>,
    settings: PipelineSettings,
}

impl PipelineController {
    pub fn new(storage: Arc<dyn Storage>, settings: PipelineSettings) -> Self {
        Self { storage, settings }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Spawn the stages and their supervisor. Must be called inside a Tokio runtime.
    pub fn start(&self, request: PipelineRequest) -> PipelineHandle {
        let request_id = request.request_id;
        let teardown = CancellationToken::new();
        let (gate, outcome) = ResponseGate::new(teardown);

        let span = tracing::info_span!(
            "pipeline",
            request_id = %request_id,
            kind = %request.transform.kind(),
        );
        let supervisor = supervise(
            request,
            gate,
            self.storage.clone(),
            self.settings.clone(),
        );
        let report = tokio::spawn(supervisor.instrument(span));

        PipelineHandle {
            request_id,
            outcome,
            report,
        }
    }
}

async fn supervise(
    request: PipelineRequest,
    gate: ResponseGate,
    storage: Arc<dyn Storage>,
    settings: PipelineSettings,
) -> PipelineReport {
    let started = Instant::now();
    let PipelineRequest {
        request_id,
        source,
        transform,
        folder,
    } = request;
    let profile = transform.profile().clone();
    let kind = profile.kind();
    let teardown = gate.teardown_token();

    let mut report = PipelineReport {
        request_id,
        outcome: PipelineOutcome::Failure(PipelineError::Unexpected(String::new())),
        state: PipelineState::Idle,
        stages: StageStates::default(),
        bytes_ingested: 0,
        subprocess_pid: None,
        scratch_dir: None,
        compensating_delete: false,
    };

    let scratch = if transform.needs_scratch() {
        let created = tempfile::Builder::new()
            .prefix("mediopt-")
            .tempdir_in(&settings.scratch_root);
        match created {
            Ok(dir) => {
                report.scratch_dir = Some(dir.path().to_path_buf());
                Some(dir)
            }
            Err(e) => {
                let err = PipelineError::Unexpected(format!(
                    "failed to create scratch directory in {}: {}",
                    settings.scratch_root.display(),
                    e
                ));
                log_failure(None, &err);
                gate.deliver(PipelineOutcome::Failure(err));
                report.state = PipelineState::Failed;
                report.outcome = gate.delivered_outcome().unwrap_or(report.outcome);
                return report;
            }
        }
    } else {
        None
    };

    let key = generate_storage_key(&folder, profile.output_format());
    tracing::info!(key = %key.key, "Pipeline started");

    let buffer = settings.buffer_chunks.max(1);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (feed_tx, feed_rx) = mpsc::channel(buffer);
    let (encoded_tx, encoded_rx) = mpsc::channel(buffer);

    report.state = PipelineState::Running;
    for stage in [Stage::Ingest, Stage::Transform, Stage::Egress] {
        report.stages.advance(stage, StageState::Running);
    }

    let io = TransformIo {
        input: feed_rx,
        output: ChunkSink::new(encoded_tx.clone()),
        cancel: teardown.clone(),
        monitor: TransformMonitor::new(event_tx.clone()),
        scratch_dir: report.scratch_dir.clone(),
    };
    let job = EgressJob {
        storage: storage.clone(),
        key,
        content_type: profile.content_type(),
        timeout: settings.egress_timeout,
    };

    let tasks = [
        spawn_stage(
            Stage::Ingest,
            event_tx.clone(),
            ingest_stage(source, feed_tx, teardown.clone(), event_tx.clone()),
        ),
        spawn_stage(
            Stage::Transform,
            event_tx.clone(),
            transform_stage(transform, io, encoded_tx, event_tx.clone()),
        ),
        spawn_stage(
            Stage::Egress,
            event_tx.clone(),
            egress_stage(job, encoded_rx, teardown.clone(), event_tx.clone()),
        ),
    ];
    drop(event_tx);

    let mut last_progress = 0u8;
    while let Some(event) = event_rx.recv().await {
        match event {
            StageEvent::InputComplete { bytes } => {
                report.stages.advance(Stage::Ingest, StageState::Completed);
                report.bytes_ingested = bytes;
                tracing::debug!(bytes, "End of input");
            }
            StageEvent::ClientClosed => {
                report.stages.advance(Stage::Ingest, StageState::Canceled);
                if report.state == PipelineState::Running {
                    report.state = PipelineState::Canceled;
                    let err = PipelineError::ClientCanceled;
                    log_failure(Some(Stage::Ingest), &err);
                    gate.deliver(PipelineOutcome::Failure(err));
                }
            }
            StageEvent::Progress(percent) => {
                if percent >= last_progress.saturating_add(10) || percent == 100 {
                    last_progress = percent;
                    tracing::debug!(progress = percent, "Transform progress");
                }
            }
            StageEvent::SubprocessSpawned(pid) => {
                report.subprocess_pid = Some(pid);
                tracing::debug!(pid, "Encoder subprocess spawned");
            }
            StageEvent::TransformDone(summary) => {
                report.stages.advance(Stage::Transform, StageState::Completed);
                tracing::debug!(
                    format = %summary.format,
                    width = ?summary.width,
                    height = ?summary.height,
                    "Transform completed"
                );
            }
            StageEvent::EgressDone(receipt) => {
                report.stages.advance(Stage::Egress, StageState::Completed);
                if report.state == PipelineState::Running {
                    report.state = PipelineState::Succeeded;
                    tracing::info!(
                        key = %receipt.key,
                        size_bytes = receipt.bytes,
                        duration_ms = started.elapsed().as_secs_f64() * 1000.0,
                        "Pipeline succeeded"
                    );
                    gate.deliver(PipelineOutcome::Success(upload_result(kind, receipt)));
                } else {
                    tracing::warn!(
                        key = %receipt.key,
                        "Upload completed after the request ended, deleting object"
                    );
                    if let Err(e) = storage.delete(&receipt.key).await {
                        tracing::error!(error = %e, key = %receipt.key, "Compensating delete failed");
                    }
                    report.compensating_delete = true;
                }
            }
            StageEvent::Failed(stage, err) => {
                report.stages.advance(stage, StageState::Failed);
                if report.state == PipelineState::Running {
                    report.state = PipelineState::Failed;
                    log_failure(Some(stage), &err);
                    gate.deliver(PipelineOutcome::Failure(err));
                } else {
                    tracing::debug!(stage = %stage, error = %err, "Stage failed after outcome");
                }
            }
            StageEvent::Canceled(stage) => {
                report.stages.advance(stage, StageState::Canceled);
            }
        }
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Stage task did not complete");
        }
    }

    if !gate.is_delivered() {
        let err = PipelineError::Unexpected("pipeline finished without an outcome".to_string());
        log_failure(None, &err);
        report.state = PipelineState::Failed;
        gate.deliver(PipelineOutcome::Failure(err));
    }

    if let Some(dir) = scratch {
        let path = dir.path().to_path_buf();
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => tracing::debug!(path = %path.display(), "Scratch directory removed"),
            Ok(Err(e)) => tracing::warn!(error = %e, path = %path.display(), "Failed to remove scratch directory"),
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "Scratch cleanup task failed"),
        }
    }

    if let Some(outcome) = gate.delivered_outcome() {
        report.outcome = outcome;
    }
    tracing::debug!(
        state = ?report.state,
        ingest = %report.stages.ingest,
        transform = %report.stages.transform,
        egress = %report.stages.egress,
        duration_ms = started.elapsed().as_secs_f64() * 1000.0,
        "Pipeline resources released"
    );
    report
}

fn upload_result(kind: MediaKind, receipt: EgressReceipt) -> UploadResult {
    let playback_url = match kind {
        MediaKind::Video => Some(receipt.url.clone()),
        MediaKind::Image => None,
    };
    UploadResult {
        url: receipt.url,
        public_id: receipt.public_id,
        playback_url,
        kind,
        width: receipt.summary.width,
        height: receipt.summary.height,
        format: receipt.summary.format,
        bytes: receipt.bytes,
        duration: receipt.summary.duration,
    }
}

fn log_failure(stage: Option<Stage>, err: &PipelineError) {
    let stage = stage.map(|s| s.to_string()).unwrap_or_else(|| "controller".to_string());
    match err.log_level() {
        LogLevel::Debug => tracing::debug!(
            stage = %stage,
            error_type = err.error_type(),
            error_code = err.error_code(),
            error = %err,
            "Pipeline ended"
        ),
        LogLevel::Warn => tracing::warn!(
            stage = %stage,
            error_type = err.error_type(),
            error_code = err.error_code(),
            error = %err,
            "Pipeline failed"
        ),
        LogLevel::Error => tracing::error!(
            stage = %stage,
            error_type = err.error_type(),
            error_code = err.error_code(),
            error = %err,
            "Pipeline failed"
        ),
    }
}

/// Run a stage on its own task; a panic becomes a stage failure.
fn spawn_stage<F>(
    stage: Stage,
    events: mpsc::UnboundedSender<StageEvent>,
    stage_future: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = async move {
        if let Err(panic) = AssertUnwindSafe(stage_future).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            tracing::error!(stage = %stage, panic = %message, "Pipeline stage panicked");
            let _ = events.send(StageEvent::Failed(
                stage,
                PipelineError::Unexpected(format!("{} stage panicked: {}", stage, message)),
            ));
        }
    };
    tokio::spawn(task.in_current_span())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum IngestEnd {
    Completed { bytes: u64 },
    ClientClosed,
    Failed(PipelineError),
    /// Torn down, or the transform stopped listening.
    Canceled,
}

async fn ingest_stage(
    source: ByteSource,
    tx: mpsc::Sender<Feed>,
    teardown: CancellationToken,
    events: mpsc::UnboundedSender<StageEvent>,
) {
    let event = match run_ingest(source, tx, teardown).await {
        IngestEnd::Completed { bytes } => StageEvent::InputComplete { bytes },
        IngestEnd::ClientClosed => StageEvent::ClientClosed,
        IngestEnd::Failed(err) => StageEvent::Failed(Stage::Ingest, err),
        IngestEnd::Canceled => StageEvent::Canceled(Stage::Ingest),
    };
    let _ = events.send(event);
}

/// The only place the caller's connection is watched: once end of input is
/// forwarded this returns, so a later close cannot cancel anything.
async fn run_ingest(
    mut source: ByteSource,
    tx: mpsc::Sender<Feed>,
    teardown: CancellationToken,
) -> IngestEnd {
    let disconnect = source.disconnect_token().clone();
    loop {
        let event = tokio::select! {
            biased;
            _ = teardown.cancelled() => return IngestEnd::Canceled,
            event = source.next_event() => event,
        };

        let feed = match event {
            IngestEvent::Chunk(chunk) => Feed::Data(chunk),
            IngestEvent::EndOfInput => Feed::End,
            IngestEvent::Closed => return IngestEnd::ClientClosed,
            IngestEvent::TransportError(err) => {
                return IngestEnd::Failed(PipelineError::IngestTransport(err.to_string()))
            }
        };
        let is_end = feed == Feed::End;

        let sent = tokio::select! {
            biased;
            _ = teardown.cancelled() => return IngestEnd::Canceled,
            // A chunk stuck behind a slow transform must not hide a hang-up.
            _ = disconnect.cancelled(), if !is_end => return IngestEnd::ClientClosed,
            sent = tx.send(feed) => sent,
        };
        if sent.is_err() {
            return IngestEnd::Canceled;
        }
        if is_end {
            return IngestEnd::Completed {
                bytes: source.bytes_read(),
            };
        }
    }
}

async fn transform_stage(
    transform: Arc<dyn MediaTransform>,
    io: TransformIo,
    output: mpsc::Sender<Encoded>,
    events: mpsc::UnboundedSender<StageEvent>,
) {
    let event = match transform.run(io).await {
        Ok(summary) => {
            if output.send(Encoded::End(summary.clone())).await.is_ok() {
                StageEvent::TransformDone(summary)
            } else {
                StageEvent::Canceled(Stage::Transform)
            }
        }
        Err(err) if err.is_cancellation() => {
            tracing::debug!(reason = %err, "Transform stopped");
            StageEvent::Canceled(Stage::Transform)
        }
        Err(err) => StageEvent::Failed(Stage::Transform, err.into()),
    };
    let _ = events.send(event);
}

async fn egress_stage(
    job: EgressJob,
    input: mpsc::Receiver<Encoded>,
    teardown: CancellationToken,
    events: mpsc::UnboundedSender<StageEvent>,
) {
    let event = match run_egress(job, input, teardown).await {
        EgressEnd::Completed(receipt) => StageEvent::EgressDone(receipt),
        EgressEnd::Failed(err) => StageEvent::Failed(Stage::Egress, err),
        EgressEnd::Canceled => StageEvent::Canceled(Stage::Egress),
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::pipeline::TransformSummary;
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use futures::{stream, StreamExt};
    use mediopt_core::{ImageProfile, TransformProfile};
    use mediopt_storage::{LocalStorage, StorageBackend, StorageResult, UploadReceipt, UploadSink};
    use std::io;

    /// Uppercases its input once end of input arrives.
    struct Shout {
        profile: TransformProfile,
        hold: Duration,
    }

    impl Shout {
        fn new() -> Self {
            Self {
                profile: TransformProfile::Image(ImageProfile::default()),
                hold: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl MediaTransform for Shout {
        fn profile(&self) -> &TransformProfile {
            &self.profile
        }

        async fn run(&self, mut io: TransformIo) -> Result<TransformSummary, TransformError> {
            let mut data = BytesMut::new();
            while let Some(chunk) = io.next_input().await? {
                data.extend_from_slice(&chunk);
            }
            tokio::time::sleep(self.hold).await;
            io.output
                .send(Bytes::from(data.to_ascii_uppercase()))
                .await?;
            Ok(TransformSummary {
                format: "webp".to_string(),
                width: Some(1),
                height: Some(1),
                duration: None,
            })
        }
    }

    struct Broken {
        profile: TransformProfile,
        panic: bool,
    }

    #[async_trait]
    impl MediaTransform for Broken {
        fn profile(&self) -> &TransformProfile {
            &self.profile
        }

        async fn run(&self, mut io: TransformIo) -> Result<TransformSummary, TransformError> {
            let _ = io.next_input().await?;
            if self.panic {
                panic!("codec exploded");
            }
            Err(TransformError::Decode("unsupported image format".to_string()))
        }
    }

    /// Ends its output immediately without waiting for input.
    struct Impatient {
        profile: TransformProfile,
    }

    #[async_trait]
    impl MediaTransform for Impatient {
        fn profile(&self) -> &TransformProfile {
            &self.profile
        }

        async fn run(&self, mut io: TransformIo) -> Result<TransformSummary, TransformError> {
            io.output.send(Bytes::from_static(b"early")).await?;
            Ok(TransformSummary::default())
        }
    }

    /// Holds its input unread until torn down.
    struct Stalled {
        profile: TransformProfile,
    }

    #[async_trait]
    impl MediaTransform for Stalled {
        fn profile(&self) -> &TransformProfile {
            &self.profile
        }

        async fn run(&self, io: TransformIo) -> Result<TransformSummary, TransformError> {
            io.cancel.cancelled().await;
            Err(TransformError::Canceled)
        }
    }

    /// Local storage whose uploads take a while to complete.
    struct SlowFinishStorage {
        inner: LocalStorage,
        delay: Duration,
    }

    struct SlowFinishSink {
        inner: Box<dyn UploadSink>,
        delay: Duration,
    }

    #[async_trait]
    impl UploadSink for SlowFinishSink {
        async fn write(&mut self, chunk: Bytes) -> StorageResult<()> {
            self.inner.write(chunk).await
        }

        async fn finish(&mut self) -> StorageResult<UploadReceipt> {
            tokio::time::sleep(self.delay).await;
            self.inner.finish().await
        }

        async fn abort(&mut self) -> StorageResult<()> {
            self.inner.abort().await
        }

        fn bytes_written(&self) -> u64 {
            self.inner.bytes_written()
        }
    }

    #[async_trait]
    impl Storage for SlowFinishStorage {
        async fn begin_upload(
            &self,
            storage_key: &str,
            content_type: &str,
        ) -> StorageResult<Box<dyn UploadSink>> {
            let inner = self.inner.begin_upload(storage_key, content_type).await?;
            Ok(Box::new(SlowFinishSink {
                inner,
                delay: self.delay,
            }))
        }

        fn public_url(&self, storage_key: &str) -> String {
            self.inner.public_url(storage_key)
        }

        async fn delete(&self, storage_key: &str) -> StorageResult<()> {
            self.inner.delete(storage_key).await
        }

        async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
            self.inner.exists(storage_key).await
        }

        fn backend_type(&self) -> StorageBackend {
            StorageBackend::Local
        }
    }

    async fn local_storage(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::new(dir.path(), "http://localhost/media".to_string())
            .await
            .unwrap()
            .with_upload_limits(16, 2)
    }

    fn controller(storage: Arc<dyn Storage>) -> PipelineController {
        PipelineController::new(
            storage,
            PipelineSettings {
                buffer_chunks: 2,
                egress_timeout: Duration::from_secs(5),
                scratch_root: std::env::temp_dir(),
            },
        )
    }

    fn chunks(parts: &[&'static [u8]]) -> Vec<Result<Bytes, io::Error>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect()
    }

    fn request(source: ByteSource, transform: Arc<dyn MediaTransform>) -> PipelineRequest {
        PipelineRequest {
            request_id: Uuid::new_v4(),
            source,
            transform,
            folder: "optimized/images".to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_uploads_transformed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(local_storage(&dir).await);
        let source = ByteSource::new(
            stream::iter(chunks(&[b"hello ", b"pipe", b"line"])),
            CancellationToken::new(),
        );

        let handle = controller(storage.clone()).start(request(source, Arc::new(Shout::new())));
        let (outcome, report) = handle.finish().await;
        let report = report.unwrap();

        let result = match outcome {
            PipelineOutcome::Success(result) => result,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(result.kind, MediaKind::Image);
        assert_eq!(result.bytes, 14);
        assert!(result.public_id.starts_with("optimized/images/"));
        assert!(result.playback_url.is_none());

        let key = format!("{}.webp", result.public_id);
        assert_eq!(std::fs::read(dir.path().join(&key)).unwrap(), b"HELLO PIPELINE");
        assert_eq!(report.state, PipelineState::Succeeded);
        assert_eq!(report.bytes_ingested, 14);
        assert_eq!(report.stages.ingest, StageState::Completed);
        assert_eq!(report.stages.transform, StageState::Completed);
        assert_eq!(report.stages.egress, StageState::Completed);
    }

    #[tokio::test]
    async fn test_transform_failure_reports_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(local_storage(&dir).await);
        let source = ByteSource::new(stream::iter(chunks(&[b"not an image"])), CancellationToken::new());
        let transform = Arc::new(Broken {
            profile: TransformProfile::Image(ImageProfile::default()),
            panic: false,
        });

        let (outcome, report) = controller(storage).start(request(source, transform)).finish().await;
        let report = report.unwrap();

        assert_eq!(outcome.http_status(), 500);
        assert!(matches!(outcome.error(), Some(PipelineError::Transform(_))));
        assert_eq!(report.stages.transform, StageState::Failed);
        assert_eq!(report.stages.egress, StageState::Canceled);
        assert!(!dir.path().join("optimized").join("images").exists()
            || std::fs::read_dir(dir.path().join("optimized/images")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_panicking_stage_is_unexpected_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(local_storage(&dir).await);
        let source = ByteSource::new(stream::iter(chunks(&[b"x"])), CancellationToken::new());
        let transform = Arc::new(Broken {
            profile: TransformProfile::Image(ImageProfile::default()),
            panic: true,
        });

        let (outcome, report) = controller(storage).start(request(source, transform)).finish().await;

        assert!(matches!(outcome.error(), Some(PipelineError::Unexpected(msg)) if msg.contains("codec exploded")));
        assert_eq!(report.unwrap().stages.transform, StageState::Failed);
    }

    #[tokio::test]
    async fn test_close_before_end_of_input_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(local_storage(&dir).await);
        let disconnect = CancellationToken::new();
        let body = stream::iter(chunks(&[b"partial"])).chain(stream::pending());
        let source = ByteSource::new(body, disconnect.clone());

        let mut handle = controller(storage).start(request(source, Arc::new(Shout::new())));
        tokio::time::sleep(Duration::from_millis(20)).await;
        disconnect.cancel();

        let outcome = handle.outcome().await;
        assert_eq!(outcome, PipelineOutcome::Failure(PipelineError::ClientCanceled));
        assert_eq!(outcome.http_status(), 499);

        let (_, report) = handle.finish().await;
        let report = report.unwrap();
        assert_eq!(report.state, PipelineState::Canceled);
        assert_eq!(report.stages.ingest, StageState::Canceled);
        assert_eq!(report.stages.transform, StageState::Canceled);
        assert_eq!(report.stages.egress, StageState::Canceled);
    }

    #[tokio::test]
    async fn test_close_after_end_of_input_is_not_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(local_storage(&dir).await);
        let disconnect = CancellationToken::new();
        let source = ByteSource::new(stream::iter(chunks(&[b"done"])), disconnect.clone());
        let transform = Arc::new(Shout {
            profile: TransformProfile::Image(ImageProfile::default()),
            hold: Duration::from_millis(100),
        });

        let mut handle = controller(storage).start(request(source, transform));
        tokio::time::sleep(Duration::from_millis(30)).await;
        disconnect.cancel();

        assert!(handle.outcome().await.is_success());
    }

    #[tokio::test]
    async fn test_one_outcome_when_failures_race() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(local_storage(&dir).await);
        let disconnect = CancellationToken::new();
        disconnect.cancel();
        let body = stream::iter(chunks(&[b"x"])).chain(stream::pending());
        let source = ByteSource::new(body, disconnect);
        let transform = Arc::new(Broken {
            profile: TransformProfile::Image(ImageProfile::default()),
            panic: false,
        });

        let (outcome, report) = controller(storage).start(request(source, transform)).finish().await;
        let report = report.unwrap();

        // Whichever failure won, the report holds the same single outcome.
        assert_eq!(report.outcome, outcome);
        assert!(matches!(
            outcome.error(),
            Some(PipelineError::ClientCanceled) | Some(PipelineError::Transform(_))
        ));
    }

    #[tokio::test]
    async fn test_late_upload_is_deleted_after_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SlowFinishStorage {
            inner: local_storage(&dir).await,
            delay: Duration::from_millis(200),
        });
        let disconnect = CancellationToken::new();
        let body = stream::iter(chunks(&[b"x"])).chain(stream::pending());
        let source = ByteSource::new(body, disconnect.clone());
        let transform = Arc::new(Impatient {
            profile: TransformProfile::Image(ImageProfile::default()),
        });

        let mut handle = controller(storage.clone()).start(request(source, transform));
        tokio::time::sleep(Duration::from_millis(30)).await;
        disconnect.cancel();

        assert_eq!(handle.outcome().await.http_status(), 499);
        let (_, report) = handle.finish().await;
        let report = report.unwrap();
        assert!(report.compensating_delete);
        assert_eq!(report.stages.egress, StageState::Completed);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("optimized/images"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_close_while_transform_applies_backpressure_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(local_storage(&dir).await);
        let disconnect = CancellationToken::new();
        let parts = vec![b"chunk".as_slice(); 16];
        let body = stream::iter(chunks(&parts)).chain(stream::pending());
        let source = ByteSource::new(body, disconnect.clone());
        let transform = Arc::new(Stalled {
            profile: TransformProfile::Image(ImageProfile::default()),
        });

        let mut handle = controller(storage).start(request(source, transform));
        tokio::time::sleep(Duration::from_millis(30)).await;
        disconnect.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.outcome())
            .await
            .expect("hang-up must be noticed while ingest is blocked");
        assert_eq!(outcome, PipelineOutcome::Failure(PipelineError::ClientCanceled));

        let (_, report) = handle.finish().await;
        assert_eq!(report.unwrap().stages.ingest, StageState::Canceled);
    }
}
