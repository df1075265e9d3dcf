mod detection;
mod detector;
mod labels;
mod ort_detector;
mod tracker;

pub mod config;

pub use detection::{BoundingBox, Detection};
pub use detector::{Detector, DetectorError};
pub use labels::{load_labels, ClassLabel, ClassLabels, LabelsError};
pub use ort_detector::OrtDetector;
pub use tracker::TrackState;
