//! Object detection with a YOLO-style ONNX model.
//!
use std::{cmp::Ordering, collections::BTreeMap, path::Path};

use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::Serialize;
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Number of box coordinates preceding the class scores of a prediction.
const BOX_COORDS: usize = 4;

pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// One detected object.
///
/// `bbox` is `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]` relative to the image
/// size, i.e. every coordinate lies in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// Object detector shared by all requests.
pub trait InferModel: Send + Sync {
    fn run(&self, image: &RgbImage) -> Result<Vec<Detection>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSettings {
    /// Side length of the square model input.
    pub input_size: u32,
    pub min_confidence: f32,
    pub max_iou: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            input_size: 640,
            min_confidence: 0.25,
            max_iou: 0.45,
        }
    }
}

pub struct YoloModel {
    model: NnModel,
    labels: Option<Vec<String>>,
    settings: ModelSettings,
}

impl YoloModel {
    pub fn new(path: &Path, labels: Option<&Path>, settings: ModelSettings) -> Result<Self> {
        let model = load_model(path, settings.input_size)?;
        let labels = labels.map(read_labels).transpose()?;
        log::info!("Loaded model {}", path.display());

        Ok(Self {
            model,
            labels,
            settings,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let size = self.settings.input_size;
        let resized: RgbImage =
            image::imageops::resize(input, size, size, image::imageops::FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }

    fn label(&self, class_id: usize, num_classes: usize) -> String {
        class_label(self.labels.as_deref(), class_id, num_classes)
    }
}

impl InferModel for YoloModel {
    fn run(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.preproc(image);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;

        let output = raw_nn_out
            .first()
            .context("model produced no output")?
            .to_array_view::<f32>()?;
        if output.ndim() != 3 {
            bail!("expected output of rank 3, got shape {:?}", output.shape());
        }
        let output = output.index_axis_move(tract_ndarray::Axis(0), 0);
        let mut predictions = output.into_dimensionality::<tract_ndarray::Ix2>()?;
        // Predictions are expected along the longer axis
        if predictions.shape()[0] > predictions.shape()[1] {
            predictions = predictions.reversed_axes();
        }

        let num_classes = predictions.shape()[0].saturating_sub(BOX_COORDS);
        let mut detections = decode_predictions(
            predictions,
            self.settings.input_size as f32,
            self.settings.min_confidence,
        );
        detections = non_maximum_suppression(detections, self.settings.max_iou);
        for detection in detections.iter_mut() {
            detection.label = self.label(detection.class_id, num_classes);
        }

        Ok(detections)
    }
}

fn load_model(path: &Path, input_size: u32) -> Result<NnModel> {
    let size = input_size as usize;
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("could not read model {}", path.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

fn read_labels(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read labels {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Name of a class: from the label file if given, COCO names for 80-class models, the index
/// otherwise.
pub fn class_label(labels: Option<&[String]>, class_id: usize, num_classes: usize) -> String {
    if let Some(label) = labels.and_then(|labels| labels.get(class_id)) {
        return label.clone();
    }
    if num_classes == COCO_CLASSES.len() {
        if let Some(label) = COCO_CLASSES.get(class_id) {
            return label.to_string();
        }
    }
    format!("class {class_id}")
}

/// Turn raw predictions into candidate detections.
///
/// `predictions` has one column per anchor; every column holds `cx, cy, w, h` in input pixels
/// followed by one score per class. The best class of each column is kept if its score exceeds
/// `min_confidence`. Labels are left empty.
pub fn decode_predictions(
    predictions: tract_ndarray::ArrayView2<f32>,
    input_size: f32,
    min_confidence: f32,
) -> Vec<Detection> {
    if predictions.shape()[0] <= BOX_COORDS {
        return vec![];
    }

    predictions
        .axis_iter(tract_ndarray::Axis(1))
        .filter_map(|column| {
            let (class_id, confidence) = column
                .iter()
                .skip(BOX_COORDS)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?;
            if !(confidence > min_confidence) {
                return None;
            }

            let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
            let bbox = [
                (cx - w / 2.0) / input_size,
                (cy - h / 2.0) / input_size,
                (cx + w / 2.0) / input_size,
                (cy + h / 2.0) / input_size,
            ]
            .map(|v| v.clamp(0.0, 1.0));

            Some(Detection {
                class_id,
                label: String::new(),
                confidence,
                bbox,
            })
        })
        .collect()
}

/// Run non-maximum-suppression on candidate detections, separately for every class.
///
/// Within a class, start with the most confident box and iterate over the others in the order of
/// sinking confidence. A candidate is kept only if its IoU with every box kept before does not
/// exceed `max_iou`. The result is ordered by descending confidence.
pub fn non_maximum_suppression(candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    let mut by_class: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
    for candidate in candidates {
        by_class.entry(candidate.class_id).or_default().push(candidate);
    }

    let mut selected: Vec<Detection> = vec![];
    for (_, mut sorted) in by_class {
        sorted.sort_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(Ordering::Equal)
        });

        let mut kept: Vec<Detection> = vec![];
        'candidates: while let Some(candidate) = sorted.pop() {
            for chosen in kept.iter() {
                if iou(&candidate.bbox, &chosen.bbox) > max_iou {
                    continue 'candidates;
                }
            }
            kept.push(candidate);
        }
        selected.extend(kept);
    }

    selected.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the top left corner of the overlap box lies below and to the
    // right of its bottom right corner and the area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`. If the
/// bottom-right point is above or to the left of the top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
