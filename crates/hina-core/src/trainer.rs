//! Gallery training from labeled image directories.
//!
//! Images are staged (preprocessed to disk) first, then every staged image
//! is encoded. Each detected face is matched against the entries enrolled
//! so far before it is itself enrolled, which yields a running
//! self-consistency score for the dataset.

use crate::encoder::FaceEncoder;
use crate::gallery::{Gallery, GalleryError, GalleryStore};
use crate::matcher::Matcher;
use crate::types::{SkipReason, SkippedItem};
use hina_imaging::preprocess::{self, PreprocessOptions};
use hina_imaging::staging::{self, LabeledImage, StagingError};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub staging_dir: PathBuf,
    /// Encode whatever is already staged instead of re-preprocessing the roots.
    pub reuse_staging: bool,
    pub preprocess: PreprocessOptions,
}

#[derive(Debug, Default)]
pub struct TrainingReport {
    /// Input images considered, including skipped ones.
    pub images: usize,
    pub faces: usize,
    /// Faces whose pre-enrollment match named their own identity.
    pub correct: usize,
    pub identities: usize,
    pub skipped: Vec<SkippedItem>,
}

impl TrainingReport {
    /// Fraction of faces matched to their own identity, `None` without faces.
    pub fn accuracy(&self) -> Option<f64> {
        (self.faces > 0).then(|| self.correct as f64 / self.faces as f64)
    }
}

impl fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "images:     {}", self.images)?;
        writeln!(f, "faces:      {}", self.faces)?;
        writeln!(f, "identities: {}", self.identities)?;
        writeln!(f, "skipped:    {}", self.skipped.len())?;
        match self.accuracy() {
            Some(acc) => write!(f, "accuracy:   {:.2}% ({}/{})", acc * 100.0, self.correct, self.faces),
            None => write!(f, "accuracy:   no faces found"),
        }
    }
}

/// Build a gallery from `<root>/<identity>/<image>` trees and persist it.
pub fn train(
    roots: &[PathBuf],
    encoder: &mut dyn FaceEncoder,
    matcher: &dyn Matcher,
    store: &GalleryStore,
    options: &TrainOptions,
) -> Result<(Gallery, TrainingReport), TrainError> {
    let mut report = TrainingReport::default();

    if options.reuse_staging {
        tracing::info!(staging = %options.staging_dir.display(), "reusing staged images");
    } else {
        staging::reset(&options.staging_dir)?;
        let summary = staging::stage_dataset(roots, &options.staging_dir, &options.preprocess)?;
        report.images += summary.skipped.len();
        report.skipped.extend(summary.skipped.into_iter().map(|skip| SkippedItem {
            path: skip.path,
            reason: SkipReason::ImageDecode(skip.error.to_string()),
        }));
    }

    let staged = staging::list_staged(&options.staging_dir)?;
    report.images += staged.len();

    let mut gallery = Gallery::new(encoder.dimension(), encoder.model_version());
    for image in &staged {
        enroll(image, encoder, matcher, &mut gallery, &mut report)?;
    }

    report.identities = gallery.identities().len();
    store.save(&gallery)?;

    tracing::info!(
        images = report.images,
        faces = report.faces,
        correct = report.correct,
        identities = report.identities,
        skipped = report.skipped.len(),
        gallery = %store.path().display(),
        "training complete"
    );

    Ok((gallery, report))
}

/// Encode one staged image and enroll every face found in it.
fn enroll(
    image: &LabeledImage,
    encoder: &mut dyn FaceEncoder,
    matcher: &dyn Matcher,
    gallery: &mut Gallery,
    report: &mut TrainingReport,
) -> Result<(), GalleryError> {
    let skip = |report: &mut TrainingReport, reason: SkipReason| {
        tracing::warn!(path = %image.path.display(), %reason, "skipping image");
        report.skipped.push(SkippedItem {
            path: image.path.clone(),
            reason,
        });
    };

    let gray = match preprocess::load(&image.path) {
        Ok(decoded) => decoded.to_luma8(),
        Err(e) => {
            skip(report, SkipReason::ImageDecode(e.to_string()));
            return Ok(());
        }
    };

    let detections = match encoder.detect_and_encode(&gray) {
        Ok(d) if d.is_empty() => {
            skip(report, SkipReason::NoFace);
            return Ok(());
        }
        Ok(d) => d,
        Err(e) => {
            skip(report, SkipReason::Encoder(e.to_string()));
            return Ok(());
        }
    };

    for detection in detections {
        if !detection.vector.is_finite() {
            skip(report, SkipReason::Encoder("feature vector has non-finite components".into()));
            continue;
        }
        let result = matcher.identify(&detection.vector, gallery)?;
        let correct = result.label.as_deref() == Some(image.label.as_str());
        tracing::debug!(
            path = %image.path.display(),
            label = %image.label,
            matched = result.display_label(),
            correct,
            "enrolling face"
        );

        report.faces += 1;
        if correct {
            report.correct += 1;
        }
        gallery.push(image.label.clone(), detection.vector)?;
    }

    Ok(())
}
