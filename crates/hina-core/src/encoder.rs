//! Face encoder capability and its ONNX implementation.
//!
//! An encoder turns one preprocessed image into zero or more detections,
//! each a face location plus a fixed-length feature vector.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{self, FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// File name of the recognizer model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Failed(String),
}

/// Detects faces and computes one feature vector per face.
///
/// Zero faces is a valid, empty result. Every vector returned by one
/// encoder has length [`FaceEncoder::dimension`].
pub trait FaceEncoder {
    fn dimension(&self) -> usize;
    fn model_version(&self) -> &str;
    fn detect_and_encode(&mut self, image: &GrayImage) -> Result<Vec<Detection>, EncoderError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn model_version(&self) -> &str {
        (**self).model_version()
    }

    fn detect_and_encode(&mut self, image: &GrayImage) -> Result<Vec<Detection>, EncoderError> {
        (**self).detect_and_encode(image)
    }
}

/// Detector variant: speed versus recall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorModel {
    #[default]
    Fast,
    Accurate,
}

impl DetectorModel {
    pub fn file_name(self) -> &'static str {
        match self {
            DetectorModel::Fast => "det_500m.onnx",
            DetectorModel::Accurate => "det_10g.onnx",
        }
    }
}

impl fmt::Display for DetectorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorModel::Fast => "fast",
            DetectorModel::Accurate => "accurate",
        })
    }
}

impl FromStr for DetectorModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(DetectorModel::Fast),
            "accurate" => Ok(DetectorModel::Accurate),
            other => Err(format!("unknown detector model '{other}' (expected fast or accurate)")),
        }
    }
}

/// SCRFD detection, five-point alignment and ArcFace recognition.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, model: DetectorModel) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(&model_dir.join(model.file_name()))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        tracing::info!(model_dir = %model_dir.display(), detector = %model, "face encoder ready");
        Ok(Self { detector, recognizer })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn dimension(&self) -> usize {
        recognizer::EMBEDDING_DIM
    }

    fn model_version(&self) -> &str {
        recognizer::MODEL_VERSION
    }

    fn detect_and_encode(&mut self, image: &GrayImage) -> Result<Vec<Detection>, EncoderError> {
        let faces = self.detector.detect(image)?;
        tracing::debug!(faces = faces.len(), "detected faces");

        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            if bbox.landmarks.is_none() {
                tracing::debug!(confidence = bbox.confidence, "face without landmarks, skipping");
                continue;
            }
            let vector = self.recognizer.extract(image, &bbox)?;
            detections.push(Detection { bbox, vector });
        }
        Ok(detections)
    }
}
