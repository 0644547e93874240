//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by non-maximum
//! suppression. Works on the canonical grayscale images produced by
//! `hina-imaging`; the single channel is replicated into RGB.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download the insightface models into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Uniform scale plus centring offsets that fit an image into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: (INPUT_SIZE - new_w) / 2,
            pad_y: (INPUT_SIZE - new_h) / 2,
            width: new_w,
            height: new_h,
        }
    }

    /// Map a point in network input space back to the source image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHeads {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw network outputs for one stride.
struct StrideOutput<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [StrideHeads; 3],
}

impl FaceDetector {
    /// Load an SCRFD ONNX model (with keypoint heads) from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {}",
                output_names.len()
            )));
        }

        let heads = map_output_heads(&output_names);
        tracing::debug!(?heads, "SCRFD output heads");

        Ok(Self { session, heads })
    }

    /// Detect faces, most confident first.
    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(image.width(), image.height());
        let input = to_input_tensor(image, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (heads, &stride) in self.heads.iter().zip(STRIDES.iter()) {
            let (_, scores) = outputs[heads.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores, stride {stride}: {e}")))?;
            let (_, boxes) = outputs[heads.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes, stride {stride}: {e}")))?;
            let (_, landmarks) = outputs[heads.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("landmarks, stride {stride}: {e}")))?;

            let output = StrideOutput {
                stride,
                scores,
                boxes,
                landmarks,
            };
            candidates.extend(decode_stride(&output, &letterbox, SCORE_THRESHOLD));
        }

        Ok(suppress_overlaps(candidates, NMS_IOU_THRESHOLD))
    }
}

/// Letterbox the image into a 1×3×640×640 tensor. Padding is the mean
/// pixel value, which normalizes to zero.
fn to_input_tensor(image: &GrayImage, letterbox: &Letterbox) -> Array4<f32> {
    let resized = imageops::resize(image, letterbox.width, letterbox.height, FilterType::Triangle);
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let ty = (y + letterbox.pad_y) as usize;
        let tx = (x + letterbox.pad_x) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = value;
        }
    }

    tensor
}

/// Find score/bbox/kps heads by name (`score_8`, `bbox_16`, ...), falling
/// back to the standard export order `[scores 8/16/32, boxes 8/16/32, kps 8/16/32]`.
fn map_output_heads(names: &[String]) -> [StrideHeads; 3] {
    let position = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideHeads>> = STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideHeads {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideHeads {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Decode all anchors of one stride scoring above `threshold`.
fn decode_stride(output: &StrideOutput<'_>, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
    let stride = output.stride;
    let grid_w = INPUT_SIZE as usize / stride;
    let grid_h = INPUT_SIZE as usize / stride;
    let anchors = grid_w * grid_h * ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut faces = Vec::new();
    for idx in 0..anchors {
        let score = output.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(d) = output.boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

        let landmarks = output.landmarks.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        faces.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    faces
}

/// Greedy non-maximum suppression; returns survivors sorted by confidence.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            landmarks: None,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_suppress_overlaps() {
        let kept = suppress_overlaps(
            vec![
                make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_overlaps_empty() {
        assert!(suppress_overlaps(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_square_input_has_no_padding() {
        let lb = Letterbox::fit(800, 800);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 0));
        assert_eq!((lb.width, lb.height), (640, 640));
        let (x, y) = lb.unmap(320.0, 64.0);
        assert!((x - 400.0).abs() < 1e-3 && (y - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_letterbox_wide_input_pads_vertically() {
        let lb = Letterbox::fit(320, 240);
        assert_eq!(lb.width, 640);
        assert_eq!(lb.height, 480);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));

        let (ox, oy) = (100.0f32, 50.0f32);
        let (x, y) = lb.unmap(ox * lb.scale + lb.pad_x as f32, oy * lb.scale + lb.pad_y as f32);
        assert!((x - ox).abs() < 0.1 && (y - oy).abs() < 0.1);
    }

    #[test]
    fn test_input_tensor_padding_normalizes_to_zero() {
        let image = GrayImage::from_pixel(320, 240, image::Luma([255]));
        let lb = Letterbox::fit(320, 240);
        let t = to_input_tensor(&image, &lb);
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        let inside = t[[0, 1, 320, 320]];
        assert!((inside - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-6);
    }

    #[test]
    fn test_map_output_heads_named() {
        let heads = map_output_heads(&names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16", "kps_32",
        ]));
        assert_eq!(heads[0], StrideHeads { score: 0, bbox: 3, kps: 6 });
        assert_eq!(heads[2], StrideHeads { score: 2, bbox: 5, kps: 8 });
    }

    #[test]
    fn test_map_output_heads_shuffled_named() {
        let heads = map_output_heads(&names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]));
        assert_eq!(heads[0], StrideHeads { score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[1], StrideHeads { score: 5, bbox: 3, kps: 4 });
        assert_eq!(heads[2], StrideHeads { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_map_output_heads_positional_fallback() {
        let generic: Vec<String> = (0..9).map(|i: usize| (i + 400).to_string()).collect();
        let heads = map_output_heads(&generic);
        assert_eq!(heads[1], StrideHeads { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        // Stride 32 → 20×20 grid, 800 anchors. Fire anchor 2 (cell 1: x=32, y=0).
        let stride = 32;
        let anchors = 20 * 20 * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[2] = 0.9;
        let mut boxes = vec![0.0f32; anchors * 4];
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);
        let landmarks = vec![0.0f32; anchors * 10];

        let lb = Letterbox::fit(640, 640);
        let output = StrideOutput {
            stride,
            scores: &scores,
            boxes: &boxes,
            landmarks: &landmarks,
        };
        let faces = decode_stride(&output, &lb, 0.5);

        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert!((f.x - 16.0).abs() < 1e-4);
        assert!((f.y - 0.0).abs() < 1e-4);
        assert!((f.width - 48.0).abs() < 1e-4);
        assert!((f.height - 64.0).abs() < 1e-4);
        assert_eq!(f.landmarks.unwrap()[0], (32.0, 0.0));
    }
}
