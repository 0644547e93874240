//! Gallery matching: per-entry distance threshold, then majority vote.

use crate::gallery::{Gallery, GalleryError};
use crate::types::{FeatureVector, MatchResult};
use std::collections::HashMap;
use thiserror::Error;

/// Default Euclidean tolerance for L2-normalized ArcFace embeddings
/// (cosine similarity of roughly 0.40).
pub const DEFAULT_TOLERANCE: f32 = 1.10;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("tolerance must be a finite, non-negative distance, got {0}")]
pub struct InvalidTolerance(pub f32);

/// Reject NaN, infinite and negative tolerances.
pub fn check_tolerance(tolerance: f32) -> Result<f32, InvalidTolerance> {
    if tolerance.is_finite() && tolerance >= 0.0 {
        Ok(tolerance)
    } else {
        Err(InvalidTolerance(tolerance))
    }
}

/// Strategy for identifying a probe vector against a gallery.
pub trait Matcher {
    fn identify(&self, probe: &FeatureVector, gallery: &Gallery) -> Result<MatchResult, GalleryError>;
}

/// Counts every gallery entry within `tolerance` of the probe as a vote for
/// its label; the label with the most votes wins.
///
/// Ties go to the label whose first matching entry comes earliest in gallery
/// order, so results never depend on hash ordering.
#[derive(Debug, Clone, Copy)]
pub struct MajorityVoteMatcher {
    tolerance: f32,
}

impl MajorityVoteMatcher {
    pub fn new(tolerance: f32) -> Result<Self, InvalidTolerance> {
        Ok(Self {
            tolerance: check_tolerance(tolerance)?,
        })
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }
}

impl Default for MajorityVoteMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Running vote count for one label.
struct Tally<'g> {
    label: &'g str,
    votes: usize,
    closest: f32,
}

impl Matcher for MajorityVoteMatcher {
    fn identify(&self, probe: &FeatureVector, gallery: &Gallery) -> Result<MatchResult, GalleryError> {
        gallery.check_dimension(probe)?;

        // Tallies are kept in order of each label's first matching entry.
        let mut tallies: Vec<Tally<'_>> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        for entry in gallery.entries() {
            let distance = probe.euclidean_distance(&entry.vector);
            if distance.is_nan() || distance > self.tolerance {
                continue;
            }
            match index.get(entry.label.as_str()) {
                Some(&i) => {
                    let tally = &mut tallies[i];
                    tally.votes += 1;
                    tally.closest = tally.closest.min(distance);
                }
                None => {
                    index.insert(entry.label.as_str(), tallies.len());
                    tallies.push(Tally {
                        label: entry.label.as_str(),
                        votes: 1,
                        closest: distance,
                    });
                }
            }
        }

        let mut winner: Option<&Tally<'_>> = None;
        for tally in &tallies {
            if winner.map_or(true, |w| tally.votes > w.votes) {
                winner = Some(tally);
            }
        }

        Ok(match winner {
            Some(w) => MatchResult {
                label: Some(w.label.to_string()),
                votes: w.votes,
                distance: Some(w.closest),
            },
            None => MatchResult::unknown(),
        })
    }
}
