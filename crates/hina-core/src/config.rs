//! Runtime configuration shared by the CLI and the daemon.
//!
//! Layers, later wins: built-in defaults, an optional TOML file, then
//! `HINA_*` environment variables. Binaries apply their own flags on top.

use crate::encoder::{DetectorModel, RECOGNIZER_MODEL_FILE};
use crate::matcher::{self, InvalidTolerance, DEFAULT_TOLERANCE};
use hina_imaging::PreprocessOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HINA_CONFIG";
/// Config file picked up from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "hina.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },
    #[error(transparent)]
    Tolerance(#[from] InvalidTolerance),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the detector and recognizer ONNX files.
    pub model_dir: PathBuf,
    pub gallery_path: PathBuf,
    /// Preprocessed training images, mirrored per identity.
    pub staging_dir: PathBuf,
    /// Maximum Euclidean distance for a gallery entry to count as a vote.
    pub tolerance: f32,
    pub detector_model: DetectorModel,
    /// Daemon listen address.
    pub bind_addr: String,
    pub max_upload_bytes: usize,
    pub preprocess: PreprocessOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            gallery_path: PathBuf::from("output/gallery.json"),
            staging_dir: PathBuf::from("processed"),
            tolerance: DEFAULT_TOLERANCE,
            detector_model: DetectorModel::default(),
            bind_addr: "0.0.0.0:9999".to_string(),
            max_upload_bytes: 16 * 1024 * 1024,
            preprocess: PreprocessOptions::default(),
        }
    }
}

impl Config {
    /// Load defaults, the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but make no sense. Binaries call this again
    /// after applying their own overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        matcher::check_tolerance(self.tolerance)?;
        Ok(())
    }

    /// Parse a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Override fields from `HINA_*` variables as resolved by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("HINA_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HINA_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HINA_STAGING_DIR") {
            self.staging_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HINA_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("HINA_TOLERANCE") {
            self.tolerance = parse_env("HINA_TOLERANCE", v)?;
            self.validate()?;
        }
        if let Some(v) = lookup("HINA_DETECTOR_MODEL") {
            self.detector_model = parse_env("HINA_DETECTOR_MODEL", v)?;
        }
        if let Some(v) = lookup("HINA_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_env("HINA_MAX_UPLOAD_BYTES", v)?;
        }
        if let Some(v) = lookup("HINA_CANONICAL_SIZE") {
            self.preprocess.canonical_size = parse_env("HINA_CANONICAL_SIZE", v)?;
        }
        Ok(())
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(self.detector_model.file_name())
    }

    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(RECOGNIZER_MODEL_FILE)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    let parsed = value.trim().parse().ok();
    parsed.ok_or(ConfigError::InvalidEnv { key, value })
}
