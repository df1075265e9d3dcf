use image::RgbImage;
use opencv::{
    core::{Mat, Point, Rect, Scalar, CV_8UC3},
    imgproc,
    prelude::*,
};
use std::sync::Arc;
use thiserror::Error;
use yolo_detector::{ClassLabels, Detection, Detector, DetectorError, TrackState};

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Unsupported frame layout: {0}")]
    UnsupportedFrame(String),
    #[error("Detector failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Copies a BGR `Mat` into an RGB image for the detector.
pub fn mat_to_rgb(mat: &Mat) -> Result<RgbImage, AnnotateError> {
    if mat.typ() != CV_8UC3 {
        return Err(AnnotateError::UnsupportedFrame(format!(
            "expected 8-bit BGR, got type {}",
            mat.typ()
        )));
    }

    let continuous;
    let mat = if mat.is_continuous() {
        mat
    } else {
        continuous = mat.try_clone()?;
        &continuous
    };

    let width = mat.cols() as u32;
    let height = mat.rows() as u32;
    let rgb: Vec<u8> = mat
        .data_bytes()?
        .chunks_exact(3)
        .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
        .collect();

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| AnnotateError::UnsupportedFrame("buffer size mismatch".to_string()))
}

/// Draws boxes and `label #track confidence` captions onto the frame.
pub fn draw_detections(
    mat: &mut Mat,
    detections: &[Detection],
    labels: &ClassLabels,
) -> Result<(), AnnotateError> {
    for detection in detections {
        let bbox = &detection.bbox;
        let x1 = bbox.x1 as i32;
        let y1 = bbox.y1 as i32;
        let x2 = bbox.x2 as i32;
        let y2 = bbox.y2 as i32;
        let label = match detection.track_id {
            Some(id) => format!(
                "{} #{} {:.2}",
                detection.class_name, id, detection.confidence
            ),
            None => format!("{} {:.2}", detection.class_name, detection.confidence),
        };

        let (red, green, blue) = labels.color(detection.class_id);
        let color = Scalar::new(blue as f64, green as f64, red as f64, 0.0);

        imgproc::rectangle(
            mat,
            Rect::new(x1, y1, x2 - x1, y2 - y1),
            color,
            2,
            imgproc::LINE_8,
            0,
        )?;

        imgproc::put_text(
            mat,
            &label,
            Point::new(x1, (y1 - 5).max(10)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

/// Thin adapter over the shared detector. Each request builds its own
/// `Annotator`, so the track state it carries is never shared.
pub struct Annotator {
    detector: Arc<dyn Detector>,
    confidence: f32,
    tracks: Option<TrackState>,
}

impl Annotator {
    pub fn new(detector: Arc<dyn Detector>, confidence: f32, persist_tracks: bool) -> Self {
        Self {
            detector,
            confidence,
            tracks: persist_tracks.then(TrackState::default),
        }
    }

    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, AnnotateError> {
        let mut detections = self.detector.infer(image, self.confidence)?;
        if let Some(tracks) = self.tracks.as_mut() {
            tracks.update(&mut detections);
        }
        Ok(detections)
    }

    /// Runs detection on `frame` and renders the overlays in place.
    pub fn annotate(&mut self, frame: &mut Mat) -> Result<Vec<Detection>, AnnotateError> {
        let image = mat_to_rgb(frame)?;
        let detections = self.detect(&image)?;
        draw_detections(frame, &detections, self.detector.labels())?;
        Ok(detections)
    }
}
