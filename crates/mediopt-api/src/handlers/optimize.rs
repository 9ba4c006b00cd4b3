//! `POST /optimize/image` and `POST /optimize/video`.
//!
//! The request body is streamed straight into the pipeline, either raw or as the
//! file part of a multipart form. The response is sent once the pipeline has
//! decided and released its resources.

use crate::error::HttpAppError;
use crate::state::AppState;
use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap},
    Json,
};
use bytes::Bytes;
use futures::Stream;
use mediopt_core::{MediaKind, PipelineError, PipelineOutcome, UploadResult};
use mediopt_processing::{ByteSource, IngestError, PipelineRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: UploadResult,
}

pub async fn optimize_image(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<OptimizeResponse>, HttpAppError> {
    optimize(state, MediaKind::Image, request).await
}

pub async fn optimize_video(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<OptimizeResponse>, HttpAppError> {
    optimize(state, MediaKind::Video, request).await
}

#[tracing::instrument(skip(state, request), fields(request_id))]
async fn optimize(
    state: Arc<AppState>,
    kind: MediaKind,
    request: Request,
) -> Result<Json<OptimizeResponse>, HttpAppError> {
    let request_id = Uuid::new_v4();
    tracing::Span::current().record("request_id", tracing::field::display(request_id));

    // Fires when this future is dropped, i.e. when the server gives up on the
    // connection before a response was written.
    let disconnect = CancellationToken::new();
    let _disconnect_guard = disconnect.clone().drop_guard();

    let source = byte_source(request, disconnect).await?;
    let route = state.route(kind);
    let handle = state.pipeline.start(PipelineRequest {
        request_id,
        source,
        transform: route.transform.clone(),
        folder: route.folder.clone(),
    });

    let (outcome, _report) = handle.finish().await;
    match outcome {
        PipelineOutcome::Success(result) => Ok(Json(OptimizeResponse {
            success: true,
            result,
        })),
        PipelineOutcome::Failure(err) => Err(HttpAppError(err)),
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

async fn byte_source(
    request: Request,
    disconnect: CancellationToken,
) -> Result<ByteSource, HttpAppError> {
    if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| HttpAppError(PipelineError::IngestTransport(e.body_text())))?;
        Ok(ByteSource::from_classified(
            multipart_file_stream(multipart),
            disconnect,
        ))
    } else {
        Ok(ByteSource::new(
            request.into_body().into_data_stream(),
            disconnect,
        ))
    }
}

/// Bytes of the first part that carries a filename or is named `file`. Other
/// parts before it are skipped; anything after it is ignored.
fn multipart_file_stream(
    mut multipart: Multipart,
) -> impl Stream<Item = Result<Bytes, IngestError>> + Send + 'static {
    async_stream::stream! {
        loop {
            let mut field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => {
                    yield Err(IngestError::Transport("multipart body has no file part".to_string()));
                    return;
                }
                Err(e) => {
                    yield Err(IngestError::classify(&e));
                    return;
                }
            };

            if field.file_name().is_none() && field.name() != Some("file") {
                continue;
            }
            tracing::debug!(
                field = ?field.name(),
                file_name = ?field.file_name(),
                content_type = ?field.content_type(),
                "Reading multipart file part"
            );

            loop {
                match field.chunk().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => return,
                    Err(e) => {
                        yield Err(IngestError::classify(&e));
                        return;
                    }
                }
            }
        }
    }
}
