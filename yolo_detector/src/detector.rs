use crate::{detection::Detection, labels::ClassLabels};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Failed to prepare input: {0}")]
    Input(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A detection model shared read-only by every request.
///
/// Implementations must be safe to call concurrently; any per-request state
/// (such as track IDs) lives outside the detector.
pub trait Detector: Send + Sync + 'static {
    fn infer(&self, image: &RgbImage, confidence: f32) -> Result<Vec<Detection>, DetectorError>;

    fn labels(&self) -> &ClassLabels;
}
