//! Single-image identification: decode, preprocess, encode, match.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::gallery::{Gallery, GalleryError};
use crate::matcher::Matcher;
use crate::types::{BoundingBox, MatchResult};
use hina_imaging::preprocess::{self, PreprocessError, PreprocessOptions};
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error(transparent)]
    Image(#[from] PreprocessError),
    #[error("encoder failure: {0}")]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// One identified face. The box is in source image coordinates.
#[derive(Debug, Clone)]
pub struct FaceMatch {
    pub bbox: BoundingBox,
    pub result: MatchResult,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub faces: Vec<FaceMatch>,
    pub source_width: u32,
    pub source_height: u32,
}

/// Identify every face in an already decoded image.
pub fn classify_image(
    image: &DynamicImage,
    encoder: &mut dyn FaceEncoder,
    matcher: &dyn Matcher,
    gallery: &Gallery,
    options: &PreprocessOptions,
) -> Result<Classification, ClassifyError> {
    let normalized = preprocess::preprocess(image, options)?;
    let (sx, sy) = normalized.scale_to_source();

    let detections = encoder.detect_and_encode(&normalized.image)?;
    let mut faces = Vec::with_capacity(detections.len());
    for detection in detections {
        let result = matcher.identify(&detection.vector, gallery)?;
        tracing::debug!(
            label = result.display_label(),
            votes = result.votes,
            "face identified"
        );
        faces.push(FaceMatch {
            bbox: detection.bbox.scaled(sx, sy),
            result,
        });
    }

    Ok(Classification {
        faces,
        source_width: normalized.source_width,
        source_height: normalized.source_height,
    })
}

/// Identify every face in an encoded image (PNG, JPEG, ...).
pub fn classify_bytes(
    bytes: &[u8],
    encoder: &mut dyn FaceEncoder,
    matcher: &dyn Matcher,
    gallery: &Gallery,
    options: &PreprocessOptions,
) -> Result<Classification, ClassifyError> {
    let image = preprocess::decode(bytes)?;
    classify_image(&image, encoder, matcher, gallery, options)
}

pub fn classify_file(
    path: &Path,
    encoder: &mut dyn FaceEncoder,
    matcher: &dyn Matcher,
    gallery: &Gallery,
    options: &PreprocessOptions,
) -> Result<Classification, ClassifyError> {
    let image = preprocess::load(path)?;
    classify_image(&image, encoder, matcher, gallery, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::BrightnessEncoder;
    use crate::matcher::MajorityVoteMatcher;
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn options() -> PreprocessOptions {
        PreprocessOptions {
            canonical_size: 64,
            clahe_tiles: 2,
            ..Default::default()
        }
    }

    fn png(width: u32, height: u32, value: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value])))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn gallery() -> Gallery {
        let mut g = Gallery::new(2, "brightness");
        g.push("alice", vec![30.0 / 255.0, 0.0].into()).unwrap();
        g.push("bob", vec![220.0 / 255.0, 0.0].into()).unwrap();
        g
    }

    #[test]
    fn test_classify_known_face() {
        let mut encoder = BrightnessEncoder::default();
        let c = classify_bytes(
            &png(128, 96, 220),
            &mut encoder,
            &MajorityVoteMatcher::new(0.1).unwrap(),
            &gallery(),
            &options(),
        )
        .unwrap();
        assert_eq!((c.source_width, c.source_height), (128, 96));
        assert_eq!(c.faces.len(), 1);
        assert_eq!(c.faces[0].result.label.as_deref(), Some("bob"));
        // Stub box covers the canonical image; mapped back it covers the source.
        assert!((c.faces[0].bbox.width - 128.0).abs() < 1e-3);
        assert!((c.faces[0].bbox.height - 96.0).abs() < 1e-3);
    }

    #[test]
    fn test_classify_unknown_face() {
        let mut encoder = BrightnessEncoder::default();
        let c = classify_bytes(
            &png(32, 32, 120),
            &mut encoder,
            &MajorityVoteMatcher::new(0.1).unwrap(),
            &gallery(),
            &options(),
        )
        .unwrap();
        assert_eq!(c.faces.len(), 1);
        assert!(!c.faces[0].result.is_match());
    }

    #[test]
    fn test_classify_no_faces() {
        let mut encoder = BrightnessEncoder::default();
        let c = classify_bytes(
            &png(32, 32, 0),
            &mut encoder,
            &MajorityVoteMatcher::new(0.1).unwrap(),
            &gallery(),
            &options(),
        )
        .unwrap();
        assert!(c.faces.is_empty());
    }

    #[test]
    fn test_classify_undecodable() {
        let mut encoder = BrightnessEncoder::default();
        let err = classify_bytes(
            b"definitely not an image",
            &mut encoder,
            &MajorityVoteMatcher::default(),
            &gallery(),
            &options(),
        )
        .unwrap_err();
        assert!(matches!(err, ClassifyError::Image(PreprocessError::ImageDecode(_))));
        assert_eq!(encoder.calls, 0);
    }

    #[test]
    fn test_classify_dimension_mismatch() {
        let mut encoder = BrightnessEncoder::default();
        let mut wide = Gallery::new(3, "other");
        wide.push("carol", vec![0.0, 0.0, 0.0].into()).unwrap();
        let err = classify_bytes(
            &png(16, 16, 200),
            &mut encoder,
            &MajorityVoteMatcher::default(),
            &wide,
            &options(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Gallery(GalleryError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_classify_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.png");
        std::fs::write(&path, png(40, 40, 30)).unwrap();
        let mut encoder = BrightnessEncoder::default();
        let c = classify_file(
            &path,
            &mut encoder,
            &MajorityVoteMatcher::new(0.1).unwrap(),
            &gallery(),
            &options(),
        )
        .unwrap();
        assert_eq!(c.faces[0].result.label.as_deref(), Some("alice"));
    }
}
