//! Enrolled-identity gallery and its on-disk store.
//!
//! A gallery is an ordered list of `(label, vector)` entries sharing one
//! dimensionality. It is built once per training run and replaced
//! wholesale; the store persists it as a single JSON document holding two
//! parallel sequences (`labels`, `vectors`) plus a SHA-256 checksum.

use crate::types::FeatureVector;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const GALLERY_FORMAT: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery is corrupt: {0}")]
    Corrupt(String),
    #[error("feature vector has {actual} dimensions, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("feature vector for '{label}' has non-finite components")]
    NonFinite { label: String },
}

/// One enrolled sample.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub label: String,
    pub vector: FeatureVector,
}

/// Ordered set of enrolled samples with a fixed dimensionality.
#[derive(Debug, Clone, PartialEq)]
pub struct Gallery {
    id: String,
    created_at: String,
    model_version: String,
    dimension: usize,
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Start an empty gallery for vectors of `dimension` components.
    pub fn new(dimension: usize, model_version: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            model_version: model_version.into(),
            dimension,
            entries: Vec::new(),
        }
    }

    /// Append an entry. A vector of the wrong length or with NaN/infinite
    /// components is rejected and the gallery is left untouched.
    pub fn push(&mut self, label: impl Into<String>, vector: FeatureVector) -> Result<(), GalleryError> {
        self.check_dimension(&vector)?;
        let label = label.into();
        if !vector.is_finite() {
            return Err(GalleryError::NonFinite { label });
        }
        self.entries.push(GalleryEntry { label, vector });
        Ok(())
    }

    pub fn check_dimension(&self, vector: &FeatureVector) -> Result<(), GalleryError> {
        if vector.len() != self.dimension {
            return Err(GalleryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct labels with their sample counts, in order of first enrollment.
    pub fn identities(&self) -> Vec<(&str, usize)> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for entry in &self.entries {
            match index.get(entry.label.as_str()) {
                Some(&i) => counts[i].1 += 1,
                None => {
                    index.insert(entry.label.as_str(), counts.len());
                    counts.push((entry.label.as_str(), 1));
                }
            }
        }
        counts
    }

    fn checksum(&self) -> String {
        checksum(
            self.dimension,
            self.entries.iter().map(|e| (e.label.as_str(), e.vector.values())),
        )
    }
}

/// SHA-256 over dimension, labels (length-prefixed) and the little-endian
/// bit patterns of every vector component.
fn checksum<'a>(dimension: usize, entries: impl Iterator<Item = (&'a str, &'a [f32])>) -> String {
    let mut hasher = Sha256::new();
    hasher.update((dimension as u64).to_le_bytes());
    for (label, values) in entries {
        hasher.update((label.len() as u64).to_le_bytes());
        hasher.update(label.as_bytes());
        for v in values {
            hasher.update(v.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Serialized layout. Components are widened to f64 so that reading them
/// back into f32 is exact.
#[derive(Serialize, Deserialize)]
struct GalleryFile {
    format: Option<u32>,
    id: Option<String>,
    created_at: Option<String>,
    model: Option<String>,
    dimension: Option<usize>,
    labels: Option<Vec<String>>,
    vectors: Option<Vec<Vec<f64>>>,
    checksum: Option<String>,
}

impl GalleryFile {
    fn from_gallery(gallery: &Gallery) -> Self {
        Self {
            format: Some(GALLERY_FORMAT),
            id: Some(gallery.id.clone()),
            created_at: Some(gallery.created_at.clone()),
            model: Some(gallery.model_version.clone()),
            dimension: Some(gallery.dimension),
            labels: Some(gallery.entries.iter().map(|e| e.label.clone()).collect()),
            vectors: Some(
                gallery
                    .entries
                    .iter()
                    .map(|e| e.vector.values().iter().map(|&v| f64::from(v)).collect())
                    .collect(),
            ),
            checksum: Some(gallery.checksum()),
        }
    }

    fn into_gallery(self) -> Result<Gallery, GalleryError> {
        if let Some(format) = self.format {
            if format != GALLERY_FORMAT {
                return Err(GalleryError::Corrupt(format!("unsupported format version {format}")));
            }
        }
        let labels = self
            .labels
            .ok_or_else(|| GalleryError::Corrupt("missing label sequence".into()))?;
        let vectors = self
            .vectors
            .ok_or_else(|| GalleryError::Corrupt("missing vector sequence".into()))?;
        if labels.len() != vectors.len() {
            return Err(GalleryError::Corrupt(format!(
                "{} labels but {} vectors",
                labels.len(),
                vectors.len()
            )));
        }

        let dimension = match (self.dimension, vectors.first()) {
            (Some(d), _) => d,
            (None, Some(first)) => first.len(),
            (None, None) => {
                return Err(GalleryError::Corrupt("missing dimension for empty gallery".into()))
            }
        };

        let mut gallery = Gallery {
            id: self.id.unwrap_or_default(),
            created_at: self.created_at.unwrap_or_default(),
            model_version: self.model.unwrap_or_default(),
            dimension,
            entries: Vec::with_capacity(labels.len()),
        };
        for (label, components) in labels.into_iter().zip(vectors) {
            let vector = FeatureVector::new(components.into_iter().map(|v| v as f32).collect());
            gallery.push(label, vector)?;
        }

        if let Some(expected) = self.checksum {
            let actual = gallery.checksum();
            if actual != expected {
                return Err(GalleryError::Corrupt(format!(
                    "checksum mismatch: file says {expected}, content hashes to {actual}"
                )));
            }
        }

        Ok(gallery)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> GalleryError {
    let path = path.to_path_buf();
    move |source| GalleryError::Io { path, source }
}

/// Persists a [`Gallery`] as one file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    path: PathBuf,
}

impl GalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temporary sibling the new gallery is written to before the rename.
    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gallery".to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }

    /// Write the gallery to a temporary file, fsync it, then rename it over
    /// the target. Readers see either the old or the new gallery, never a mix.
    pub fn save(&self, gallery: &Gallery) -> Result<(), GalleryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let tmp = self.temp_path();
        let file = std::fs::File::create(&tmp).map_err(io_err(&tmp))?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, &GalleryFile::from_gallery(gallery))
            .map_err(std::io::Error::from)
            .map_err(io_err(&tmp))?;
        writer.flush().map_err(io_err(&tmp))?;
        writer.get_ref().sync_all().map_err(io_err(&tmp))?;
        drop(writer);

        std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;

        tracing::info!(
            path = %self.path.display(),
            id = gallery.id(),
            entries = gallery.len(),
            dimension = gallery.dimension(),
            "gallery saved"
        );
        Ok(())
    }

    /// Load the whole gallery. Any structural problem is an error; there is
    /// no partial load.
    pub fn load(&self) -> Result<Gallery, GalleryError> {
        let raw = std::fs::read(&self.path).map_err(io_err(&self.path))?;
        let file: GalleryFile = serde_json::from_slice(&raw)
            .map_err(|e| GalleryError::Corrupt(format!("{}: {e}", self.path.display())))?;
        let gallery = file.into_gallery()?;

        tracing::info!(
            path = %self.path.display(),
            id = gallery.id(),
            entries = gallery.len(),
            dimension = gallery.dimension(),
            "gallery loaded"
        );
        Ok(gallery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_gallery() -> Gallery {
        let mut g = Gallery::new(3, "test-model");
        g.push("alice", vec![0.1, 0.2, 0.3].into()).unwrap();
        g.push("bob", vec![-1.0e-7, f32::MAX, 0.333_333_34].into()).unwrap();
        g.push("alice", vec![1.0 / 3.0, 2.0 / 3.0, f32::MIN_POSITIVE].into()).unwrap();
        g
    }

    #[test]
    fn test_round_trip_is_exact_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("gallery.json"));
        let g = sample_gallery();

        store.save(&g).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, g);
        for (a, b) in loaded.entries().iter().zip(g.entries()) {
            assert_eq!(a.label, b.label);
            let bits_a: Vec<u32> = a.vector.values().iter().map(|v| v.to_bits()).collect();
            let bits_b: Vec<u32> = b.vector.values().iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits_a, bits_b);
        }
    }

    #[test]
    fn test_round_trip_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("gallery.json"));
        let g = Gallery::new(512, "w600k_r50");
        store.save(&g).unwrap();
        let loaded = store.load().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimension(), 512);
    }

    #[test]
    fn test_save_creates_parent_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("output/gallery.json"));
        store.save(&sample_gallery()).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("output"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["gallery.json".to_string()]);
    }

    #[test]
    fn test_save_replaces_previous_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("gallery.json"));
        store.save(&sample_gallery()).unwrap();

        let mut replacement = Gallery::new(3, "test-model");
        replacement.push("carol", vec![0.0, 0.0, 1.0].into()).unwrap();
        store.save(&replacement).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.entries()[0].label, "carol");
    }

    #[test]
    fn test_push_wrong_dimension_rejected_before_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("gallery.json"));
        let mut g = sample_gallery();
        store.save(&g).unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let err = g.push("mallory", vec![1.0, 2.0].into()).unwrap_err();
        assert!(matches!(err, GalleryError::DimensionMismatch { expected: 3, actual: 2 }));
        assert_eq!(g.len(), 3);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_push_non_finite_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("gallery.json"));
        let mut g = Gallery::new(2, "test-model");
        g.push("alice", vec![0.5, 0.5].into()).unwrap();

        let err = g.push("bob", vec![f32::INFINITY, 0.0].into()).unwrap_err();
        assert!(matches!(err, GalleryError::NonFinite { ref label } if label == "bob"));
        assert!(g.push("bob", vec![0.0, f32::NAN].into()).is_err());
        assert_eq!(g.len(), 1);

        store.save(&g).unwrap();
        assert_eq!(store.load().unwrap(), g);
    }

    #[test]
    fn test_load_out_of_range_component_rejected() {
        let err = load_str(r#"{"labels": ["a"], "vectors": [[1e300, 0.0]]}"#).unwrap_err();
        assert!(matches!(err, GalleryError::NonFinite { .. }), "{err}");
    }

    #[test]
    fn test_identities_in_first_enrollment_order() {
        let g = sample_gallery();
        assert_eq!(g.identities(), vec![("alice", 2), ("bob", 1)]);
    }

    fn load_str(contents: &str) -> Result<Gallery, GalleryError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, contents).unwrap();
        GalleryStore::new(path).load()
    }

    #[test]
    fn test_load_missing_labels_is_corrupt() {
        let err = load_str(r#"{"dimension": 2, "vectors": [[1.0, 2.0]]}"#).unwrap_err();
        assert!(matches!(err, GalleryError::Corrupt(ref m) if m.contains("label")), "{err}");
    }

    #[test]
    fn test_load_missing_vectors_is_corrupt() {
        let err = load_str(r#"{"dimension": 2, "labels": ["a"]}"#).unwrap_err();
        assert!(matches!(err, GalleryError::Corrupt(ref m) if m.contains("vector")), "{err}");
    }

    #[test]
    fn test_load_length_mismatch_is_corrupt() {
        let err = load_str(r#"{"labels": ["a", "b"], "vectors": [[1.0, 2.0]]}"#).unwrap_err();
        assert!(matches!(err, GalleryError::Corrupt(_)));
    }

    #[test]
    fn test_load_not_json_is_corrupt() {
        let err = load_str("\u{80}pickle").unwrap_err();
        assert!(matches!(err, GalleryError::Corrupt(_)));
    }

    #[test]
    fn test_load_ragged_vectors_is_dimension_mismatch() {
        let err = load_str(r#"{"labels": ["a", "b"], "vectors": [[1.0, 2.0], [1.0]]}"#).unwrap_err();
        assert!(matches!(err, GalleryError::DimensionMismatch { expected: 2, actual: 1 }));
    }

    #[test]
    fn test_load_without_checksum_or_metadata() {
        let g = load_str(r#"{"labels": ["a"], "vectors": [[0.5, 0.25]]}"#).unwrap();
        assert_eq!(g.dimension(), 2);
        assert_eq!(g.entries()[0].vector.values(), &[0.5, 0.25]);
    }

    #[test]
    fn test_load_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::new(dir.path().join("gallery.json"));
        store.save(&sample_gallery()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let tampered = raw.replacen("\"bob\"", "\"eve\"", 1);
        assert_ne!(raw, tampered);
        std::fs::write(store.path(), tampered).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, GalleryError::Corrupt(ref m) if m.contains("checksum")), "{err}");
    }

    #[test]
    fn test_load_unsupported_format() {
        let err = load_str(r#"{"format": 9, "labels": [], "vectors": [], "dimension": 2}"#).unwrap_err();
        assert!(matches!(err, GalleryError::Corrupt(_)));
    }

    #[test]
    fn test_load_missing_file_is_io() {
        let err = GalleryStore::new("/nonexistent/hina/gallery.json").load().unwrap_err();
        assert!(matches!(err, GalleryError::Io { .. }));
    }
}
