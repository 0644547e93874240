//! Batch identification of a directory of probe images.
//!
//! Every file under the directory (recursively) is preprocessed exactly like
//! training input and identified against the gallery. A file inside an
//! identity sub-directory (`<dir>/<identity>/.../<file>`, labeled by the
//! first directory below `<dir>`) counts towards accuracy; loose files directly under
//! `<dir>` are identified without ground truth.

use crate::classify::{self, ClassifyError, FaceMatch};
use crate::encoder::FaceEncoder;
use crate::gallery::{Gallery, GalleryError};
use crate::matcher::Matcher;
use crate::types::{SkipReason, SkippedItem};
use hina_imaging::PreprocessOptions;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// Identification result for one probe file.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub path: PathBuf,
    /// Identity implied by the directory layout, if any.
    pub expected: Option<String>,
    pub faces: Vec<FaceMatch>,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub files: usize,
    pub faces: usize,
    pub matched: usize,
    pub unknown: usize,
    /// Faces found in files with an expected identity.
    pub labeled_faces: usize,
    pub correct: usize,
    pub skipped: Vec<SkippedItem>,
    pub outcomes: Vec<ProbeOutcome>,
}

impl ValidationReport {
    /// Fraction of labeled faces identified as their expected identity.
    pub fn accuracy(&self) -> Option<f64> {
        (self.labeled_faces > 0).then(|| self.correct as f64 / self.labeled_faces as f64)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "files:   {}", self.files)?;
        writeln!(f, "skipped: {}", self.skipped.len())?;
        writeln!(f, "faces:   {}", self.faces)?;
        writeln!(f, "matched: {}", self.matched)?;
        writeln!(f, "unknown: {}", self.unknown)?;
        match self.accuracy() {
            Some(acc) => write!(
                f,
                "accuracy: {:.2}% ({}/{})",
                acc * 100.0,
                self.correct,
                self.labeled_faces
            ),
            None => write!(f, "accuracy: n/a (no labeled faces)"),
        }
    }
}

/// Identify every image under `directory` against `gallery`.
pub fn validate(
    directory: &Path,
    gallery: &Gallery,
    encoder: &mut dyn FaceEncoder,
    matcher: &dyn Matcher,
    options: &PreprocessOptions,
) -> Result<ValidationReport, ValidateError> {
    if !directory.is_dir() {
        return Err(ValidateError::DirectoryNotFound(directory.to_path_buf()));
    }

    let mut files = Vec::new();
    collect_files(directory, &mut files)?;

    let mut report = ValidationReport {
        files: files.len(),
        ..Default::default()
    };

    for path in files {
        let expected = expected_label(directory, &path);
        let classification = match classify::classify_file(&path, encoder, matcher, gallery, options) {
            Ok(c) => c,
            Err(ClassifyError::Gallery(e)) => return Err(e.into()),
            Err(e) => {
                let reason = match e {
                    ClassifyError::Encoder(e) => SkipReason::Encoder(e.to_string()),
                    other => SkipReason::ImageDecode(other.to_string()),
                };
                tracing::warn!(path = %path.display(), %reason, "skipping probe");
                report.skipped.push(SkippedItem { path, reason });
                continue;
            }
        };

        if classification.faces.is_empty() {
            tracing::debug!(path = %path.display(), "no faces in probe");
        }

        for face in &classification.faces {
            report.faces += 1;
            if face.result.is_match() {
                report.matched += 1;
            } else {
                report.unknown += 1;
            }
            if let Some(expected) = &expected {
                report.labeled_faces += 1;
                if face.result.label.as_ref() == Some(expected) {
                    report.correct += 1;
                }
            }
        }

        report.outcomes.push(ProbeOutcome {
            path,
            expected,
            faces: classification.faces,
        });
    }

    tracing::info!(
        directory = %directory.display(),
        files = report.files,
        faces = report.faces,
        matched = report.matched,
        unknown = report.unknown,
        skipped = report.skipped.len(),
        "validation complete"
    );

    Ok(report)
}

/// The identity directory directly below the validation root, as in the
/// training layout. Files directly in the root carry no label.
fn expected_label(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let identity = components.next()?;
    components.next()?;
    identity.as_os_str().to_str().map(str::to_string)
}

/// Depth-first, sorted, skipping hidden entries.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ValidateError> {
    let io_err = |source| ValidateError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.sort();

    for path in entries {
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::BrightnessEncoder;
    use crate::matcher::MajorityVoteMatcher;
    use image::{GrayImage, Luma};

    fn write_png(path: &Path, value: u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_pixel(48, 48, Luma([value])).save(path).unwrap();
    }

    fn options() -> PreprocessOptions {
        PreprocessOptions {
            canonical_size: 64,
            clahe_tiles: 2,
            ..Default::default()
        }
    }

    /// Vectors as the stub encoder sees preprocessed uniform images at 30 and 220.
    fn gallery() -> Gallery {
        let mut g = Gallery::new(2, "brightness");
        g.push("alice", vec![33.0 / 255.0, 0.0].into()).unwrap();
        g.push("bob", vec![222.0 / 255.0, 0.0].into()).unwrap();
        g
    }

    #[test]
    fn test_validate_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_png(&root.join("alice/a.png"), 30);
        write_png(&root.join("bob/b.png"), 220);
        // Mislabeled: a bright face filed under alice.
        write_png(&root.join("alice/nested/odd.png"), 220);
        write_png(&root.join("loose.png"), 120);
        write_png(&root.join("blank.png"), 0);
        std::fs::write(root.join("notes.txt"), b"hello").unwrap();
        write_png(&root.join(".cache/x.png"), 30);

        let report = validate(
            root,
            &gallery(),
            &mut BrightnessEncoder::default(),
            &MajorityVoteMatcher::new(0.1).unwrap(),
            &options(),
        )
        .unwrap();

        assert_eq!(report.files, 6);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].path.ends_with("notes.txt"));
        assert_eq!(report.faces, 4);
        assert_eq!(report.matched, 3);
        assert_eq!(report.unknown, 1);
        // odd.png is nested under alice and expects "alice".
        assert_eq!(report.labeled_faces, 3);
        assert_eq!(report.correct, 2);

        let loose = report
            .outcomes
            .iter()
            .find(|o| o.path.ends_with("loose.png"))
            .unwrap();
        assert_eq!(loose.expected, None);
        assert!(!loose.faces[0].result.is_match());

        let odd = report
            .outcomes
            .iter()
            .find(|o| o.path.ends_with("odd.png"))
            .unwrap();
        assert_eq!(odd.expected.as_deref(), Some("alice"));
        assert_eq!(odd.faces[0].result.label.as_deref(), Some("bob"));

        let blank = report
            .outcomes
            .iter()
            .find(|o| o.path.ends_with("blank.png"))
            .unwrap();
        assert!(blank.faces.is_empty());
    }

    #[test]
    fn test_validate_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let report = validate(
            dir.path(),
            &gallery(),
            &mut BrightnessEncoder::default(),
            &MajorityVoteMatcher::default(),
            &options(),
        )
        .unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(report.faces, 0);
        assert!(report.skipped.is_empty());
        assert_eq!(report.accuracy(), None);
    }

    #[test]
    fn test_validate_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(
            &dir.path().join("validation"),
            &gallery(),
            &mut BrightnessEncoder::default(),
            &MajorityVoteMatcher::default(),
            &options(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidateError::DirectoryNotFound(_)));
    }

    #[test]
    fn test_validate_dimension_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("alice/a.png"), 30);
        let wide = Gallery::new(4, "other");
        let err = validate(
            dir.path(),
            &wide,
            &mut BrightnessEncoder::default(),
            &MajorityVoteMatcher::default(),
            &options(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidateError::Gallery(GalleryError::DimensionMismatch { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_expected_label() {
        let root = Path::new("/data/validation");
        assert_eq!(expected_label(root, &root.join("x.png")), None);
        assert_eq!(expected_label(root, &root.join("alice/x.png")).as_deref(), Some("alice"));
        assert_eq!(expected_label(root, &root.join("a/b/x.png")).as_deref(), Some("a"));
    }
}
