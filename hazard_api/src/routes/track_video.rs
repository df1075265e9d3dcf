use crate::{
    annotate::Annotator,
    artifact::{ArtifactStore, TempArtifact},
    config::StreamConfig,
    encoder::STREAM_CONTENT_TYPE,
    pipeline::{spawn_stream, DetectionStage, PipelineError, StreamSettings},
    routes::UPLOAD_FIELD,
    sampler::FrameStride,
    server::SharedState,
};
use axum::{
    body::Body,
    extract::{Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::instrument;

const ROUTE: &str = "/track/video";

#[derive(Debug, Default, Deserialize)]
pub struct TrackParams {
    pub confidence: Option<f32>,
    pub frame_skip: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackRequest {
    pub confidence: f32,
    pub stride: FrameStride,
}

impl TrackParams {
    /// Fills in configured defaults and checks ranges.
    pub fn resolve(&self, defaults: &StreamConfig) -> Result<TrackRequest, PipelineError> {
        let confidence = self.confidence.unwrap_or(defaults.default_confidence);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(PipelineError::InvalidInput(format!(
                "confidence must be within [0, 1], got {}",
                confidence
            )));
        }

        let stride = FrameStride::new(self.frame_skip.unwrap_or(defaults.default_frame_skip))
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

        Ok(TrackRequest { confidence, stride })
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            tracing::error!("Request failed: {}", self);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn track_video(
    State(state): State<SharedState>,
    Query(params): Query<TrackParams>,
    multipart: Multipart,
) -> Result<Response, PipelineError> {
    state.metrics.record_request(ROUTE);
    let request = params.resolve(&state.stream_config)?;

    let artifact = receive_upload(multipart, &state.artifact_store).await?;
    tracing::info!(
        "Received upload of {} bytes into {:?}",
        artifact.bytes_written(),
        artifact.dir()
    );

    let annotator = Annotator::new(
        state.detector.clone(),
        request.confidence,
        state.stream_config.persist_tracks,
    );
    let stage = DetectionStage::new(
        annotator,
        state.stream_config.jpeg_quality,
        Some(state.metrics.clone()),
    );
    let settings = StreamSettings {
        stride: request.stride,
        release_grace: state.stream_config.release_grace(),
        metrics: Some(state.metrics.clone()),
    };

    let frames = spawn_stream(state.opener.clone(), stage, artifact, settings)
        .start()
        .await?;

    Response::builder()
        .header(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)
        .body(Body::from_stream(frames))
        .map_err(|e| PipelineError::HttpBuilder(e.to_string()))
}

/// Streams the `file` field to disk chunk by chunk. Any early return drops
/// the artifact, which schedules its removal.
async fn receive_upload(
    mut multipart: Multipart,
    store: &ArtifactStore,
) -> Result<TempArtifact, PipelineError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Receive(e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let extension = field
            .file_name()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(str::to_owned);
        let mut artifact = store.acquire(extension.as_deref()).await?;

        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| PipelineError::Receive(e.to_string()))?
        {
            artifact.write(&chunk).await?;
        }
        artifact.finish().await?;

        return Ok(artifact);
    }

    Err(PipelineError::InvalidInput(format!(
        "missing `{}` field in multipart body",
        UPLOAD_FIELD
    )))
}
