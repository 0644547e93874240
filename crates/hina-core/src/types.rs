use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Label reported when no gallery entry is within tolerance.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Rescale box and landmarks per axis.
    pub fn scaled(&self, sx: f32, sy: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(x, y)| (x * sx, y * sy))),
        }
    }
}

/// Fixed-length face feature vector produced by the encoder.
///
/// Immutable once built; compared to other vectors only by distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Build a vector scaled to unit L2 norm. A zero vector is kept as is.
    pub fn l2_normalized(values: Vec<f32>) -> Self {
        let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Self::new(values.into_iter().map(|x| x / norm).collect())
        } else {
            Self::new(values)
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when no component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance. Callers must compare equal-length vectors.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One face found by the encoder: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub vector: FeatureVector,
}

/// Outcome of matching one feature vector against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Winning identity, `None` when nothing was within tolerance.
    pub label: Option<String>,
    /// Number of gallery entries of the winning identity within tolerance.
    pub votes: usize,
    /// Closest distance among the winning identity's matching entries.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            label: None,
            votes: 0,
            distance: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.label.is_some()
    }

    /// Label for display, `"unknown"` when unmatched.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Why a batch item was skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    ImageDecode(String),
    Encoder(String),
    NoFace,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ImageDecode(e) => write!(f, "image decode error: {e}"),
            SkipReason::Encoder(e) => write!(f, "encoder failure: {e}"),
            SkipReason::NoFace => f.write_str("no face detected"),
        }
    }
}

/// A batch item that was skipped, and why.
#[derive(Debug, Clone)]
pub struct SkippedItem {
    pub path: PathBuf,
    pub reason: SkipReason,
}
