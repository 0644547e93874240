//! hina-core — Face gallery training, matching and validation.
//!
//! Faces are located with SCRFD and encoded with ArcFace (ONNX Runtime,
//! CPU). Encoded faces are enrolled into a labeled [`Gallery`] and
//! identified by majority vote over every entry within tolerance.

pub mod alignment;
pub mod classify;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod trainer;
pub mod types;
pub mod validator;

pub use classify::{Classification, ClassifyError, FaceMatch};
pub use config::Config;
pub use encoder::{DetectorModel, EncoderError, FaceEncoder, OnnxFaceEncoder};
pub use gallery::{Gallery, GalleryError, GalleryStore};
pub use matcher::{InvalidTolerance, MajorityVoteMatcher, Matcher};
pub use types::{BoundingBox, Detection, FeatureVector, MatchResult, SkipReason, SkippedItem};
