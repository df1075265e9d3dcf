use crate::{
    artifact::ArtifactStore, config::StreamConfig, routes::api_routes, sampler::OpenCvOpener,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use yolo_detector::Detector;

#[derive(Clone)]
pub struct SharedState {
    pub detector: Arc<dyn Detector>,
    pub artifact_store: ArtifactStore,
    pub opener: Arc<OpenCvOpener>,
    pub stream_config: StreamConfig,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        state: SharedState,
        addr: &str,
        max_upload_bytes: usize,
    ) -> anyhow::Result<Self> {
        let metrics_layer = HttpMetricsLayerBuilder::new().build();
        let router = build_router(state, max_upload_bytes).layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{annotate::tests::MockDetector, cleanup::RetryPolicy, encoder::encode_jpeg};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use opencv::{
        core::{Mat, Scalar, CV_8UC3},
        prelude::*,
    };
    use std::{path::Path, time::Duration};
    use tower::ServiceExt;

    const BOUNDARY: &str = "XBOUNDARY";

    fn test_router(temp_root: &Path) -> Router {
        let state = SharedState {
            detector: Arc::new(MockDetector::new(None)),
            artifact_store: ArtifactStore::new(
                temp_root,
                RetryPolicy::new(5, Duration::ZERO),
                1024 * 1024,
            ),
            opener: Arc::new(OpenCvOpener),
            stream_config: StreamConfig {
                release_grace_ms: 0,
                ..StreamConfig::default()
            },
            metrics: Arc::new(Metrics::new().unwrap()),
        };
        build_router(state, 16 * 1024 * 1024)
    }

    fn multipart_body(field: &str, filename: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn error_message(response: axum::response::Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["error"].as_str().unwrap().to_string()
    }

    async fn wait_until_empty(dir: &Path) {
        for _ in 0..200 {
            if std::fs::read_dir(dir).unwrap().next().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("temporary artifacts left in {:?}", dir);
    }

    #[tokio::test]
    async fn test_health() {
        let root = tempfile::tempdir().unwrap();
        let response = test_router(root.path())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_zero_frame_skip_is_rejected_before_upload() {
        let root = tempfile::tempdir().unwrap();
        let request = upload(
            "/track/video?frame_skip=0",
            multipart_body("file", "clip.mp4", b"data"),
        );

        let response = test_router(root.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(response).await.contains("frame_skip"));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let request = upload(
            "/track/video?confidence=1.5",
            multipart_body("file", "clip.mp4", b"data"),
        );

        let response = test_router(root.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_file_field_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let request = upload("/track/video", multipart_body("video", "clip.mp4", b"data"));

        let response = test_router(root.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unreadable_video_is_bad_request_and_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let request = upload(
            "/track/video?frame_skip=3&confidence=0.4",
            multipart_body("file", "clip.mp4", b"this is not a video container"),
        );

        let response = test_router(root.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(error_message(response).await.contains("open"));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_truncated_upload_is_server_error_and_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let mut body = multipart_body("file", "clip.mp4", b"partial video bytes");
        // Drop the closing boundary so the field never completes.
        body.truncate(body.len() - format!("\r\n--{BOUNDARY}--\r\n").len());
        let request = upload("/track/video", body);

        let response = test_router(root.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error_message(response).await.contains("receive"));
        wait_until_empty(root.path()).await;
    }

    #[tokio::test]
    async fn test_detect_image_returns_detections() {
        let root = tempfile::tempdir().unwrap();
        let mat = Mat::new_rows_cols_with_default(24, 24, CV_8UC3, Scalar::all(40.)).unwrap();
        let jpeg = encode_jpeg(&mat, 90).unwrap();
        let request = upload("/detect/image", multipart_body("file", "road.jpg", &jpeg));

        let response = test_router(root.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let detections = json["detections"].as_array().unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0]["class_name"], "pothole");
        assert_eq!(detections[0]["bbox"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_detect_image_rejects_garbage() {
        let root = tempfile::tempdir().unwrap();
        let request = upload("/detect/image", multipart_body("file", "road.jpg", b"garbage"));

        let response = test_router(root.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
