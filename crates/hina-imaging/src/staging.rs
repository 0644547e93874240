//! Staging area for preprocessed training images.
//!
//! Layout mirrors the training roots: `<staging>/<identity>/<image>.png`.
//! Staged images are written losslessly so a later run can skip
//! preprocessing entirely. Sources sharing a stem (`1.jpg`, `1.png`, or the
//! same name under two roots) get numbered names so none is overwritten.

use crate::preprocess::{self, PreprocessError, PreprocessOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("staging I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An image file whose identity is the name of its parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub label: String,
    pub path: PathBuf,
}

/// An input that could not be staged.
#[derive(Debug)]
pub struct StagingSkip {
    pub path: PathBuf,
    pub error: PreprocessError,
}

/// Outcome of staging a dataset.
#[derive(Debug, Default)]
pub struct StagingSummary {
    pub staged: Vec<LabeledImage>,
    pub skipped: Vec<StagingSkip>,
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, StagingError> {
    let io_err = |source| StagingError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.retain(|p| !is_hidden(p));
    entries.sort();
    Ok(entries)
}

/// Enumerate `<root>/<identity>/<file>`, sorted by identity then file name.
///
/// Files directly under `root` and anything nested deeper than one level are ignored.
pub fn labeled_images(root: &Path) -> Result<Vec<LabeledImage>, StagingError> {
    if !root.is_dir() {
        return Err(StagingError::DirectoryNotFound(root.to_path_buf()));
    }

    let mut images = Vec::new();
    for identity_dir in sorted_entries(root)? {
        if !identity_dir.is_dir() {
            continue;
        }
        let Some(label) = identity_dir.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %identity_dir.display(), "skipping identity directory with non-UTF-8 name");
            continue;
        };
        for path in sorted_entries(&identity_dir)? {
            if path.is_file() {
                images.push(LabeledImage {
                    label: label.to_string(),
                    path,
                });
            }
        }
    }
    Ok(images)
}

/// Remove the staging directory with everything in it, then recreate it empty.
pub fn reset(dir: &Path) -> Result<(), StagingError> {
    let io_err = |source| StagingError::Io {
        path: dir.to_path_buf(),
        source,
    };
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(io_err)?;
    }
    std::fs::create_dir_all(dir).map_err(io_err)?;
    tracing::debug!(path = %dir.display(), "staging directory reset");
    Ok(())
}

/// Preprocess every labeled image under `roots` into `staging`.
///
/// A missing root is fatal; an image that fails to decode is recorded in
/// [`StagingSummary::skipped`] and the run continues.
pub fn stage_dataset(
    roots: &[PathBuf],
    staging: &Path,
    options: &PreprocessOptions,
) -> Result<StagingSummary, StagingError> {
    let mut summary = StagingSummary::default();

    for root in roots {
        let images = labeled_images(root)?;
        tracing::info!(root = %root.display(), images = images.len(), "staging training root");

        for image in images {
            let normalized = match preprocess::preprocess_file(&image.path, options) {
                Ok(p) => p,
                Err(error) => {
                    tracing::warn!(path = %image.path.display(), %error, "skipping image");
                    summary.skipped.push(StagingSkip {
                        path: image.path,
                        error,
                    });
                    continue;
                }
            };

            let out_dir = staging.join(&image.label);
            std::fs::create_dir_all(&out_dir).map_err(|source| StagingError::Io {
                path: out_dir.clone(),
                source,
            })?;
            let out_path = unique_staged_path(&out_dir, &image.path);

            if let Err(e) = normalized.image.save(&out_path) {
                let error = PreprocessError::Write {
                    path: out_path.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(path = %image.path.display(), %error, "skipping image");
                summary.skipped.push(StagingSkip {
                    path: image.path,
                    error,
                });
                continue;
            }

            tracing::debug!(path = %out_path.display(), "staged image");
            summary.staged.push(LabeledImage {
                label: image.label,
                path: out_path,
            });
        }
    }

    Ok(summary)
}

/// `<dir>/<stem>.png`, or `<stem>-2.png`, `<stem>-3.png`, ... when taken.
fn unique_staged_path(dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let mut candidate = dir.join(format!("{stem}.png"));
    let mut n = 2;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}-{n}.png"));
        n += 1;
    }
    candidate
}

/// List images already present in the staging directory.
pub fn list_staged(staging: &Path) -> Result<Vec<LabeledImage>, StagingError> {
    labeled_images(staging)
}
