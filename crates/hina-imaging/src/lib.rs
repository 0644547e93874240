//! hina-imaging — Image decoding, canonical preprocessing and the training staging area.
//!
//! Every image that reaches the face encoder goes through the same
//! pipeline: fixed-size resize, grayscale, non-local means denoising,
//! CLAHE and a sharpening pass.

pub mod filters;
pub mod preprocess;
pub mod staging;

pub use preprocess::{preprocess, preprocess_file, PreprocessError, PreprocessOptions, Preprocessed};
pub use staging::{LabeledImage, StagingError, StagingSkip, StagingSummary};
