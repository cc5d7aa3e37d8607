//! Object detection.
//!
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use image::RgbImage;
use ndarray::{s, Array4, ArrayView1, ArrayView2, ArrayViewD, Ix3};
use tract_onnx::prelude::*;

use crate::{signal::Signal, utils};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

const ULTRAFACE_BASE_URL: &str =
    "https://github.com/onnx/models/raw/main/vision/body_analysis/ultraface/models";

/// A detected object, in pixels of the detector input.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundingBox {
    pub label: String,
    /// Confidence in 0..=1. Zero marks an unused slot.
    pub value: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Time spent in the stages of one detection.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timing {
    pub preprocess: Duration,
    pub inference: Duration,
    pub postprocess: Duration,
}

/// Result of running a detector on one signal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inference {
    pub boxes: Vec<BoundingBox>,
    pub timing: Timing,
}

/// Object detector.
pub trait Detector: Send + Sync {
    /// Image size (width, height) the detector consumes.
    fn input_size(&self) -> (u32, u32);

    /// Find objects in `signal`, which has the size of [`Detector::input_size`].
    fn detect(&self, signal: &Signal) -> Result<Inference>;
}

/// Input sizes of the Ultraface model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UltrafaceVariant {
    W640H480,
    W320H240,
}

impl UltrafaceVariant {
    pub fn width_height(&self) -> (u32, u32) {
        match self {
            UltrafaceVariant::W640H480 => (640, 480),
            UltrafaceVariant::W320H240 => (320, 240),
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            UltrafaceVariant::W640H480 => "version-RFB-640.onnx",
            UltrafaceVariant::W320H240 => "version-RFB-320.onnx",
        }
    }
}

impl FromStr for UltrafaceVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "640" | "640x480" => Ok(UltrafaceVariant::W640H480),
            "320" | "320x240" => Ok(UltrafaceVariant::W320H240),
            _ => bail!("unknown Ultraface variant {s:?}, expected 320 or 640"),
        }
    }
}

/// Face detector running the Ultraface ONNX model.
pub struct UltrafaceModel {
    model: NnModel,
    width: u32,
    height: u32,
    max_iou: f32,
    min_confidence: f32,
    debug: bool,
}

impl UltrafaceModel {
    /// Load the model for `variant`.
    ///
    /// Without a `model_path`, the model is downloaded once into the user's
    /// cache directory.
    pub async fn new(
        variant: UltrafaceVariant,
        model_path: Option<PathBuf>,
        max_iou: f32,
        min_confidence: f32,
    ) -> Result<Self> {
        let model_path = match model_path {
            Some(path) => path,
            None => fetch_model(variant).await?,
        };
        let (width, height) = variant.width_height();
        let model = load_model(&model_path, width, height)?;

        Ok(Self {
            model,
            width,
            height,
            max_iou,
            min_confidence,
            debug: false,
        })
    }

    /// Log raw candidate counts on every detection.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn postproc(
        &self,
        confidences: ArrayViewD<f32>,
        bboxes: ArrayViewD<f32>,
    ) -> Result<Vec<BoundingBox>> {
        let candidates = ultraface_candidates(confidences, bboxes, self.min_confidence)?;
        if self.debug {
            log::debug!(
                "{} candidates above confidence {}",
                candidates.len(),
                self.min_confidence
            );
        }

        let selected = non_maximum_suppression(candidates, self.max_iou);
        Ok(corners_to_boxes(selected, self.width, self.height))
    }
}

impl Detector for UltrafaceModel {
    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn detect(&self, signal: &Signal) -> Result<Inference> {
        if (signal.width(), signal.height()) != (self.width, self.height) {
            bail!(
                "signal is {}x{}, model expects {}x{}",
                signal.width(),
                signal.height(),
                self.width,
                self.height
            );
        }

        let start = Instant::now();
        let input: Tensor = ultraface_input(signal.image()).into();
        let preprocess = start.elapsed();

        let start = Instant::now();
        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        let inference = start.elapsed();

        let start = Instant::now();
        let boxes = self.postproc(
            raw_nn_out[0].to_array_view::<f32>()?,
            raw_nn_out[1].to_array_view::<f32>()?,
        )?;
        let postprocess = start.elapsed();

        Ok(Inference {
            boxes,
            timing: Timing {
                preprocess,
                inference,
                postprocess,
            },
        })
    }
}

fn load_model(path: &Path, width: u32, height: u32) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, height as usize, width as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load model {path:?}"))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    log::info!("Loaded model {:?} with input {}x{}", path, width, height);
    Ok(model)
}

/// Path of the cached model file, downloading it first if needed.
async fn fetch_model(variant: UltrafaceVariant) -> Result<PathBuf> {
    let path = utils::cache_path(variant.file_name())?;
    if !path.exists() {
        let url = format!("{ULTRAFACE_BASE_URL}/{}", variant.file_name());
        log::info!("Downloading model from {} to {:?}", &url, &path);
        utils::download_file(&reqwest::Client::new(), &url, &path).await?;
    }

    Ok(path)
}

/// Model input of shape `[1, 3, height, width]`, channels in RGB order and
/// every value normalized by `(p - 127) / 128`.
fn ultraface_input(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| (image[(x as _, y as _)][c] as f32 - 127.0) / 128.0,
    )
}

/// Convert normalized corner points to boxes in pixels of a `width` x
/// `height` model input.
fn corners_to_boxes(
    selected: Vec<([f32; 4], f32)>,
    width: u32,
    height: u32,
) -> Vec<BoundingBox> {
    let (width, height) = (width as f32, height as f32);
    selected
        .into_iter()
        .map(|(bbox, confidence)| BoundingBox {
            label: "face".to_owned(),
            value: confidence,
            x: bbox[0] * width,
            y: bbox[1] * height,
            width: (bbox[2] - bbox[0]) * width,
            height: (bbox[3] - bbox[1]) * height,
        })
        .collect()
}

/// Pair Ultraface confidences with their boxes and keep the confident ones.
///
/// `confidences` has the shape `[1, N, 2]` with the face score in column 1,
/// `bboxes` has the shape `[1, N, 4]` with normalized corner points
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
fn ultraface_candidates(
    confidences: ArrayViewD<f32>,
    bboxes: ArrayViewD<f32>,
    min_confidence: f32,
) -> Result<Vec<([f32; 4], f32)>> {
    let confidences = confidences
        .into_dimensionality::<Ix3>()
        .context("confidences are not three-dimensional")?;
    let bboxes = bboxes
        .into_dimensionality::<Ix3>()
        .context("boxes are not three-dimensional")?;

    let (conf_shape, bbox_shape) = (confidences.shape(), bboxes.shape());
    if conf_shape[0] < 1
        || bbox_shape[0] < 1
        || conf_shape[2] < 2
        || bbox_shape[2] != 4
        || conf_shape[1] != bbox_shape[1]
    {
        bail!(
            "unexpected output shapes {:?} and {:?}",
            conf_shape,
            bbox_shape
        );
    }

    let confidences: ArrayView1<f32> = confidences.slice(s![0, .., 1]);
    let bboxes: ArrayView2<f32> = bboxes.slice(s![0, .., ..]);

    Ok(confidences
        .iter()
        .zip(bboxes.rows())
        .filter(|(confidence, _)| **confidence > min_confidence)
        .map(|(confidence, bbox)| ([bbox[0], bbox[1], bbox[2], bbox[3]], *confidence))
        .collect())
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Candidates are visited in the order of sinking confidence. A candidate is
/// selected unless its IoU with an already selected box exceeds `max_iou`.
pub fn non_maximum_suppression(
    candidates: Vec<([f32; 4], f32)>,
    max_iou: f32,
) -> Vec<([f32; 4], f32)> {
    let mut selected: Vec<([f32; 4], f32)> = Vec::new();

    for (bbox, confidence) in candidates
        .into_iter()
        .sorted_by(|a, b| b.1.total_cmp(&a.1))
    {
        if selected
            .iter()
            .all(|(selected_bbox, _)| iou(&bbox, selected_bbox) <= max_iou)
        {
            selected.push((bbox, confidence));
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // Boxes that do not overlap produce an ill-defined overlap box of zero area
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bottom-right point lies above or left of the top-left point, the
/// area is zero.
pub fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
