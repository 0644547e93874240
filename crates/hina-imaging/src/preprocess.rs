//! Canonical preprocessing applied to every image before feature extraction.
//!
//! resize → intensity → denoise → CLAHE → sharpen. Each step is a pure
//! function of its input and the [`PreprocessOptions`].

use crate::filters;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageReader};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CANONICAL_SIZE: u32 = 800;
const DEFAULT_DENOISE_STRENGTH: f32 = 10.0;
const DEFAULT_DENOISE_PATCH_RADIUS: u32 = 3;
const DEFAULT_DENOISE_SEARCH_RADIUS: u32 = 10;
const DEFAULT_CLAHE_TILES: u32 = 8;
const DEFAULT_CLAHE_CLIP_LIMIT: f32 = 2.0;
const DEFAULT_SHARPEN_FACTOR: f32 = 2.0;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("image decode failed: {0}")]
    ImageDecode(String),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Tunables for the preprocessing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    /// Output is `canonical_size` × `canonical_size`; aspect ratio is not kept.
    pub canonical_size: u32,
    /// Non-local means filter strength (`h`).
    pub denoise_strength: f32,
    /// Compared patches are `2r + 1` pixels square (7×7 by default).
    pub denoise_patch_radius: u32,
    /// Search window is `2r + 1` pixels square (21×21 by default).
    pub denoise_search_radius: u32,
    /// CLAHE grid is `clahe_tiles` × `clahe_tiles`.
    pub clahe_tiles: u32,
    /// CLAHE clip limit, as a multiple of the uniform histogram bin height.
    pub clahe_clip_limit: f32,
    pub sharpen_factor: f32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            canonical_size: DEFAULT_CANONICAL_SIZE,
            denoise_strength: DEFAULT_DENOISE_STRENGTH,
            denoise_patch_radius: DEFAULT_DENOISE_PATCH_RADIUS,
            denoise_search_radius: DEFAULT_DENOISE_SEARCH_RADIUS,
            clahe_tiles: DEFAULT_CLAHE_TILES,
            clahe_clip_limit: DEFAULT_CLAHE_CLIP_LIMIT,
            sharpen_factor: DEFAULT_SHARPEN_FACTOR,
        }
    }
}

/// A normalized image plus the dimensions of the image it came from.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub image: GrayImage,
    pub source_width: u32,
    pub source_height: u32,
}

impl Preprocessed {
    /// Per-axis factors mapping canonical coordinates back to the source image.
    pub fn scale_to_source(&self) -> (f32, f32) {
        let (w, h) = self.image.dimensions();
        (
            self.source_width as f32 / w.max(1) as f32,
            self.source_height as f32 / h.max(1) as f32,
        )
    }
}

/// Decode an image file. The format is sniffed from the content, not the extension.
pub fn load(path: &Path) -> Result<DynamicImage, PreprocessError> {
    let io_err = |source| PreprocessError::Io {
        path: path.to_path_buf(),
        source,
    };
    ImageReader::open(path)
        .map_err(io_err)?
        .with_guessed_format()
        .map_err(io_err)?
        .decode()
        .map_err(|e| PreprocessError::ImageDecode(format!("{}: {e}", path.display())))
}

/// Decode an in-memory image (e.g. an upload body).
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    image::load_from_memory(bytes).map_err(|e| PreprocessError::ImageDecode(e.to_string()))
}

/// Run the full pipeline on a decoded image.
pub fn preprocess(
    image: &DynamicImage,
    options: &PreprocessOptions,
) -> Result<Preprocessed, PreprocessError> {
    let (source_width, source_height) = (image.width(), image.height());
    if source_width == 0 || source_height == 0 {
        return Err(PreprocessError::ImageDecode("image has no pixels".into()));
    }

    let size = options.canonical_size.max(1);
    let gray = image
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_luma8();

    let mut normalized = filters::denoise(
        &gray,
        options.denoise_strength,
        options.denoise_patch_radius,
        options.denoise_search_radius,
    );
    filters::clahe(&mut normalized, options.clahe_tiles, options.clahe_clip_limit);
    let image = filters::sharpen(&normalized, options.sharpen_factor);

    Ok(Preprocessed {
        image,
        source_width,
        source_height,
    })
}

/// Decode and preprocess a file in one step.
pub fn preprocess_file(path: &Path, options: &PreprocessOptions) -> Result<Preprocessed, PreprocessError> {
    let image = load(path)?;
    preprocess(&image, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn small_options() -> PreprocessOptions {
        PreprocessOptions {
            canonical_size: 32,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let opts = PreprocessOptions::default();
        assert_eq!(opts.canonical_size, 800);
        assert_eq!((opts.denoise_patch_radius, opts.denoise_search_radius), (3, 10));
        assert_eq!(opts.clahe_tiles, 8);
        assert!((opts.clahe_clip_limit - 2.0).abs() < 1e-6);
        assert!((opts.sharpen_factor - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_output_is_canonical_square_regardless_of_aspect() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 20, Rgb([10, 200, 30])));
        let out = preprocess(&img, &small_options()).unwrap();
        assert_eq!(out.image.dimensions(), (32, 32));
        assert_eq!((out.source_width, out.source_height), (50, 20));
    }

    #[test]
    fn test_scale_to_source() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 16, Luma([90])));
        let out = preprocess(&img, &small_options()).unwrap();
        let (sx, sy) = out.scale_to_source();
        assert!((sx - 2.0).abs() < 1e-6);
        assert!((sy - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_fn(40, 40, |x, y| {
            Luma([((x * 7 + y * 13) % 256) as u8])
        }));
        let a = preprocess(&img, &small_options()).unwrap();
        let b = preprocess(&img, &small_options()).unwrap();
        assert_eq!(a.image, b.image);
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PreprocessError::ImageDecode(_)));
    }

    #[test]
    fn test_load_corrupt_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"\xff\xd8\xff garbage").unwrap();
        let err = preprocess_file(&path, &small_options()).unwrap_err();
        assert!(matches!(err, PreprocessError::ImageDecode(_)), "got {err:?}");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load(Path::new("/nonexistent/hina/face.png")).unwrap_err();
        assert!(matches!(err, PreprocessError::Io { .. }));
    }
}
