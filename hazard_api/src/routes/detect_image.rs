use crate::{
    annotate::{mat_to_rgb, AnnotateError},
    routes::UPLOAD_FIELD,
    server::SharedState,
};
use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;
use yolo_detector::Detection;

const ROUTE: &str = "/detect/image";

#[derive(Error, Debug)]
pub enum DetectImageError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Failed to receive upload: {0}")]
    Receive(String),
    #[error("Detection failed: {0}")]
    Detection(#[from] AnnotateError),
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl IntoResponse for DetectImageError {
    fn into_response(self) -> Response {
        let status = match self {
            DetectImageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!("Image detection failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectParams {
    pub confidence: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub detections: Vec<Detection>,
}

fn decode_image(data: &[u8]) -> Result<Mat, DetectImageError> {
    let buf = Vector::<u8>::from_slice(data);
    let mat = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)
        .map_err(|e| DetectImageError::InvalidInput(e.to_string()))?;
    if mat.empty() {
        return Err(DetectImageError::InvalidInput(
            "upload is not a decodable image".to_string(),
        ));
    }
    Ok(mat)
}

async fn read_upload(mut multipart: Multipart) -> Result<Bytes, DetectImageError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DetectImageError::Receive(e.to_string()))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            return field
                .bytes()
                .await
                .map_err(|e| DetectImageError::Receive(e.to_string()));
        }
    }
    Err(DetectImageError::InvalidInput(format!(
        "missing `{}` field in multipart body",
        UPLOAD_FIELD
    )))
}

/// Single-image detection without tracking.
#[instrument(skip(state, multipart))]
pub async fn detect_image(
    State(state): State<SharedState>,
    Query(params): Query<DetectParams>,
    multipart: Multipart,
) -> Result<Json<DetectResponse>, DetectImageError> {
    state.metrics.record_request(ROUTE);
    let confidence = params
        .confidence
        .unwrap_or(state.stream_config.default_confidence);
    if !(0.0..=1.0).contains(&confidence) {
        return Err(DetectImageError::InvalidInput(format!(
            "confidence must be within [0, 1], got {}",
            confidence
        )));
    }

    let data = read_upload(multipart).await?;
    let detector = state.detector.clone();
    let metrics = state.metrics.clone();

    let detections = tokio::task::spawn_blocking(move || {
        let mat = decode_image(&data)?;
        let image = mat_to_rgb(&mat)?;
        let started = Instant::now();
        let detections = detector
            .infer(&image, confidence)
            .map_err(AnnotateError::from)?;
        metrics.record_inference_duration(started.elapsed().as_millis() as u64, ROUTE);
        Ok::<_, DetectImageError>(detections)
    })
    .await
    .map_err(|e| DetectImageError::Worker(e.to_string()))??;

    tracing::debug!("Detected {} objects", detections.len());
    Ok(Json(DetectResponse { detections }))
}
