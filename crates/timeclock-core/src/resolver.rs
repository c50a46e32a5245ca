//! Identity resolution: nearest enrolled embedding under a distance threshold.

use crate::types::{Embedding, Identity, IdentityId, MatchResult, Registry};
use thiserror::Error;

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// Enrollment data and the live extractor disagree on dimension. This
    /// means the registry is corrupt or was built by a different model.
    #[error("identity {identity} has a {expected}-d embedding, probe has {actual}")]
    DimensionMismatch {
        identity: IdentityId,
        expected: usize,
        actual: usize,
    },
    #[error("match threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f32),
}

/// Find the registry entry closest to `probe`.
///
/// Returns `Ok(None)` when the registry is empty or the closest entry is not
/// strictly nearer than `threshold`. On equal distances the entry that comes
/// first in the registry wins. Every entry is checked for a matching
/// dimension; a single mismatch fails the whole call.
pub fn resolve(
    probe: &Embedding,
    registry: &Registry,
    threshold: f32,
) -> Result<Option<MatchResult>, ResolveError> {
    if !(threshold.is_finite() && threshold > 0.0) {
        return Err(ResolveError::InvalidThreshold(threshold));
    }

    let mut best: Option<(&Identity, f32)> = None;

    for identity in registry {
        if identity.embedding.dim() != probe.dim() {
            return Err(ResolveError::DimensionMismatch {
                identity: identity.id.clone(),
                expected: identity.embedding.dim(),
                actual: probe.dim(),
            });
        }

        let distance = probe.euclidean_distance(&identity.embedding);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((identity, distance)),
        }
    }

    Ok(best
        .filter(|&(_, distance)| distance < threshold)
        .map(|(identity, distance)| MatchResult {
            identity: identity.clone(),
            distance,
        }))
}

/// Strategy for comparing a probe embedding against a registry snapshot.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        registry: &Registry,
    ) -> Result<Option<MatchResult>, ResolveError>;
}

/// Linear-scan Euclidean matcher with a fixed acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Result<Self, ResolveError> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(ResolveError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        registry: &Registry,
    ) -> Result<Option<MatchResult>, ResolveError> {
        resolve(probe, registry, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, values: Vec<f32>) -> Identity {
        Identity {
            id: id.into(),
            display_name: format!("Employee {id}"),
            embedding: Embedding::new(values),
        }
    }

    fn registry(entries: Vec<Identity>) -> Registry {
        Registry::new(entries).unwrap()
    }

    #[test]
    fn test_empty_registry_never_matches() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        for threshold in [0.01, 0.6, 10.0, 1e6] {
            assert_eq!(resolve(&probe, &Registry::empty(), threshold), Ok(None));
        }
    }

    #[test]
    fn test_exact_embedding_matches_at_distance_zero() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let reg = registry(vec![identity("e1", vec![0.0, 0.0])]);

        let result = resolve(&probe, &reg, 0.6).unwrap().unwrap();
        assert_eq!(result.identity.id.as_str(), "e1");
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_exact_embedding_matches_for_any_positive_threshold() {
        let probe = Embedding::new(vec![0.3, -0.2, 0.9]);
        let reg = registry(vec![
            identity("a", vec![1.0, 1.0, 1.0]),
            identity("b", vec![0.3, -0.2, 0.9]),
        ]);
        for threshold in [1e-6, 0.1, 0.6, 5.0] {
            let result = resolve(&probe, &reg, threshold).unwrap().unwrap();
            assert_eq!(result.identity.id.as_str(), "b");
        }
    }

    #[test]
    fn test_far_embedding_is_not_a_match() {
        let probe = Embedding::new(vec![1.0, 1.0]);
        let reg = registry(vec![identity("e1", vec![0.0, 0.0])]);
        assert_eq!(resolve(&probe, &reg, 0.6), Ok(None));
        // √2 ≈ 1.414 is still above the threshold
        let enrolled = &reg.iter().next().unwrap().embedding;
        assert!((probe.euclidean_distance(enrolled) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_picks_closest_of_several_candidates() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let reg = registry(vec![
            identity("far", vec![0.5, 0.0]),
            identity("near", vec![0.0, 0.3]),
        ]);

        let result = resolve(&probe, &reg, 0.6).unwrap().unwrap();
        assert_eq!(result.identity.id.as_str(), "near");
        assert!((result.distance - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let reg = registry(vec![identity("e1", vec![0.5, 0.0])]);
        assert_eq!(resolve(&probe, &reg, 0.5), Ok(None));
        assert!(resolve(&probe, &reg, 0.500_001).unwrap().is_some());
    }

    #[test]
    fn test_raising_threshold_keeps_existing_match() {
        let probe = Embedding::new(vec![0.1, 0.2, 0.0]);
        let reg = registry(vec![
            identity("a", vec![0.0, 0.0, 0.0]),
            identity("b", vec![1.0, 0.0, 0.0]),
            identity("c", vec![0.0, 1.0, 1.0]),
        ]);

        let low = resolve(&probe, &reg, 0.3).unwrap().unwrap();
        for threshold in [0.31, 0.6, 1.0, 100.0] {
            let high = resolve(&probe, &reg, threshold).unwrap().unwrap();
            assert_eq!(high.identity.id, low.identity.id);
            assert_eq!(high.distance, low.distance);
        }
    }

    #[test]
    fn test_tie_keeps_first_entry() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let reg = registry(vec![
            identity("first", vec![0.2, 0.0]),
            identity("second", vec![0.0, 0.2]),
        ]);
        let result = resolve(&probe, &reg, 0.6).unwrap().unwrap();
        assert_eq!(result.identity.id.as_str(), "first");
    }

    #[test]
    fn test_dimension_mismatch_fails_loudly() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let reg = registry(vec![
            identity("ok", vec![0.0, 0.0]),
            identity("corrupt", vec![0.0, 0.0, 0.0]),
        ]);

        let err = resolve(&probe, &reg, 0.6).unwrap_err();
        assert_eq!(
            err,
            ResolveError::DimensionMismatch {
                identity: "corrupt".into(),
                expected: 3,
                actual: 2,
            }
        );
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let probe = Embedding::new(vec![0.0]);
        for threshold in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                resolve(&probe, &Registry::empty(), threshold),
                Err(ResolveError::InvalidThreshold(_))
            ));
        }
        assert!(EuclideanMatcher::new(0.0).is_err());
    }

    #[test]
    fn test_matcher_uses_configured_threshold() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let reg = registry(vec![identity("e1", vec![0.4, 0.0])]);

        assert!(EuclideanMatcher::default().compare(&probe, &reg).unwrap().is_some());
        let strict = EuclideanMatcher::new(0.3).unwrap();
        assert!(strict.compare(&probe, &reg).unwrap().is_none());
    }
}
