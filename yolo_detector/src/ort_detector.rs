use crate::{
    config::{ModelConfig, Validatable},
    detection::{BoundingBox, Detection},
    detector::{Detector, DetectorError},
    labels::ClassLabels,
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array, ArrayD, Axis, Ix4};
use ort::{
    execution_providers::TensorRTExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Resizes to the square model input and normalizes to `[0, 1]` in NCHW order.
fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let resized = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);
    let size = input_size as usize;

    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Greedy non-maximum suppression, highest confidence first.
fn non_max_suppression(
    mut boxes: Vec<(u32, f32, BoundingBox)>,
    iou_threshold: f32,
) -> Vec<(u32, f32, BoundingBox)> {
    boxes.sort_by(|box1, box2| box2.1.total_cmp(&box1.1));
    let mut result = Vec::new();

    while !boxes.is_empty() {
        let best = boxes[0];
        result.push(best);
        boxes = boxes
            .into_iter()
            .skip(1)
            .filter(|candidate| best.2.iou(&candidate.2) < iou_threshold)
            .collect();
    }

    result
}

/// Decodes a YOLOv8 `[1, 4 + classes, anchors]` output into boxes scaled
/// back to the source image.
fn decode_output(
    outputs: &ArrayD<f32>,
    input_size: u32,
    img_width: u32,
    img_height: u32,
    min_probability: f32,
) -> Vec<(u32, f32, BoundingBox)> {
    let mut boxes = Vec::new();
    let transposed = outputs.t();
    let output = transposed.slice(s![.., .., 0]);
    let scale_x = img_width as f32 / input_size as f32;
    let scale_y = img_height as f32 / input_size as f32;

    for row in output.axis_iter(Axis(0)) {
        let row: Vec<_> = row.iter().copied().collect();
        let best = row
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        let Some((class_id, prob)) = best else {
            continue;
        };

        if prob < min_probability {
            continue;
        }

        boxes.push((
            class_id as u32,
            prob,
            BoundingBox::from_center(
                row[0] * scale_x,
                row[1] * scale_y,
                row[2] * scale_x,
                row[3] * scale_y,
            ),
        ));
    }

    boxes
}

#[derive(Clone)]
pub struct OrtDetector {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    labels: Arc<ClassLabels>,
    input_size: u32,
    iou_threshold: f32,
}

impl OrtDetector {
    pub fn new(model_config: &ModelConfig, labels: ClassLabels) -> Result<Self, DetectorError> {
        model_config.validate().map_err(DetectorError::ModelLoad)?;

        if model_config.use_tensorrt {
            ort::init()
                .with_execution_providers([TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .build()])
                .commit()
                .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;
        }

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;

        tracing::info!("Created {} ONNX sessions", num_instances);

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            labels: Arc::new(labels),
            input_size: model_config.input_size,
            iou_threshold: model_config.iou_threshold,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, DetectorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| DetectorError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling inference with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectorError::Input(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Inference(format!("failed to extract tensor: {}", e)))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| DetectorError::Inference(format!("invalid tensor shape: {}", e)))
    }
}

impl Detector for OrtDetector {
    fn infer(&self, image: &RgbImage, confidence: f32) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::Input("empty frame".to_string()));
        }

        let input = transform_image(image, self.input_size);
        let outputs = self.run_inference(&input)?;
        let boxes = decode_output(
            &outputs,
            self.input_size,
            image.width(),
            image.height(),
            confidence,
        );

        let detections: Vec<Detection> = non_max_suppression(boxes, self.iou_threshold)
            .into_iter()
            .map(|(class_id, confidence, bbox)| Detection {
                class_id,
                class_name: self.labels.name(class_id),
                confidence,
                bbox,
                track_id: None,
            })
            .collect();

        tracing::debug!("Returning {} detections", detections.len());
        Ok(detections)
    }

    fn labels(&self) -> &ClassLabels {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_transform_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));

        let input = transform_image(&img, 640);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-3);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-3);
    }

    #[test]
    fn test_non_max_suppression_drops_overlapping_boxes() {
        let boxes = vec![
            (0, 0.6, BoundingBox::new(0.5, 0.5, 10.5, 10.5)),
            (0, 0.9, BoundingBox::new(0., 0., 10., 10.)),
            (1, 0.8, BoundingBox::new(50., 50., 60., 60.)),
        ];

        let kept = non_max_suppression(boxes, 0.7);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.9);
        assert_eq!(kept[1].0, 1);
    }

    #[test]
    fn test_decode_output_scales_and_filters() {
        // Two classes, two anchors: anchor 0 is class 1 @ 0.8, anchor 1 is below threshold.
        let mut outputs = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 6, 2]));
        outputs[[0, 0, 0]] = 320.;
        outputs[[0, 1, 0]] = 320.;
        outputs[[0, 2, 0]] = 64.;
        outputs[[0, 3, 0]] = 64.;
        outputs[[0, 5, 0]] = 0.8;
        outputs[[0, 4, 1]] = 0.1;

        let boxes = decode_output(&outputs, 640, 1280, 640, 0.5);

        assert_eq!(boxes.len(), 1);
        let (class_id, prob, bbox) = boxes[0];
        assert_eq!(class_id, 1);
        assert_eq!(prob, 0.8);
        assert_eq!(bbox, BoundingBox::new(576., 288., 704., 352.));
    }
}
