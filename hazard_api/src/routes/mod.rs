mod detect_image;
mod health;
mod metrics;
mod track_video;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub const UPLOAD_FIELD: &str = "file";

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/track/video", post(track_video::track_video))
        .route("/detect/image", post(detect_image::detect_image))
}
