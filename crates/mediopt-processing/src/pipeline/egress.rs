//! Streaming upload of transformed bytes.

use std::sync::Arc;
use std::time::Duration;

use mediopt_core::PipelineError;
use mediopt_storage::{Storage, StorageKey, UploadSink};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Encoded, TransformSummary};

/// Upper bound for aborting a multipart upload during teardown.
const ABORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage acknowledgment merged with the transform summary.
#[derive(Debug, Clone, PartialEq)]
pub struct EgressReceipt {
    pub key: String,
    pub public_id: String,
    pub url: String,
    pub bytes: u64,
    pub e_tag: Option<String>,
    pub summary: TransformSummary,
}

pub(crate) struct EgressJob {
    pub storage: Arc<dyn Storage>,
    pub key: StorageKey,
    pub content_type: &'static str,
    pub timeout: Duration,
}

#[derive(Debug)]
pub(crate) enum EgressEnd {
    Completed(EgressReceipt),
    Failed(PipelineError),
    Canceled,
}

enum Step {
    Finish(TransformSummary),
    Stop(EgressEnd),
}

pub(crate) async fn run_egress(
    job: EgressJob,
    mut input: mpsc::Receiver<Encoded>,
    cancel: CancellationToken,
) -> EgressEnd {
    let deadline = Instant::now() + job.timeout;
    let timed_out = || {
        PipelineError::Egress(format!(
            "upload timed out after {}s",
            job.timeout.as_secs_f64()
        ))
    };

    let begin = tokio::select! {
        biased;
        _ = cancel.cancelled() => return EgressEnd::Canceled,
        _ = tokio::time::sleep_until(deadline) => return EgressEnd::Failed(timed_out()),
        begin = job.storage.begin_upload(&job.key.key, job.content_type) => begin,
    };
    let mut sink = match begin {
        Ok(sink) => sink,
        Err(e) => return EgressEnd::Failed(PipelineError::Egress(e.to_string())),
    };

    let step = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Step::Stop(EgressEnd::Canceled),
            _ = tokio::time::sleep_until(deadline) => break Step::Stop(EgressEnd::Failed(timed_out())),
            item = input.recv() => item,
        };

        match item {
            Some(Encoded::Data(chunk)) => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Step::Stop(EgressEnd::Canceled),
                    _ = tokio::time::sleep_until(deadline) => break Step::Stop(EgressEnd::Failed(timed_out())),
                    written = sink.write(chunk) => written,
                };
                if let Err(e) = written {
                    break Step::Stop(EgressEnd::Failed(PipelineError::Egress(e.to_string())));
                }
            }
            Some(Encoded::End(summary)) => break Step::Finish(summary),
            // Transform went away without finishing; its own event explains why.
            None => break Step::Stop(EgressEnd::Canceled),
        }
    };

    match step {
        Step::Stop(end) => {
            abort_upload(sink, &job.key.key).await;
            end
        }
        Step::Finish(summary) => {
            // Not interruptible by teardown: a completed object is cleaned up by the
            // controller instead.
            let finished = tokio::time::timeout_at(deadline, sink.finish()).await;
            match finished {
                Ok(Ok(receipt)) => EgressEnd::Completed(EgressReceipt {
                    key: receipt.key,
                    public_id: job.key.public_id,
                    url: receipt.url,
                    bytes: receipt.size_bytes,
                    e_tag: receipt.e_tag,
                    summary,
                }),
                Ok(Err(e)) => {
                    abort_upload(sink, &job.key.key).await;
                    EgressEnd::Failed(PipelineError::Egress(e.to_string()))
                }
                Err(_) => {
                    abort_upload(sink, &job.key.key).await;
                    EgressEnd::Failed(timed_out())
                }
            }
        }
    }
}

async fn abort_upload(mut sink: Box<dyn UploadSink>, key: &str) {
    let written = sink.bytes_written();
    match tokio::time::timeout(ABORT_TIMEOUT, sink.abort()).await {
        Ok(Ok(())) => tracing::debug!(key = %key, bytes_written = written, "Partial upload aborted"),
        Ok(Err(e)) => tracing::warn!(error = %e, key = %key, "Failed to abort partial upload"),
        Err(_) => tracing::warn!(key = %key, "Timed out aborting partial upload"),
    }
}
