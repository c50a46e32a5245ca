use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector. The dimension is fixed by the extractor that
/// produced it (512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must ensure both embeddings have the same dimension; extra
    /// trailing components of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Opaque identifier of an enrolled identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An enrolled person and the embedding captured at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub embedding: Embedding,
}

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("duplicate identity id in registry: {0}")]
    DuplicateId(IdentityId),
}

/// Read-only snapshot of enrolled identities.
///
/// Cloning is cheap (shared `Arc`). A snapshot is never mutated; enrolling or
/// removing someone produces a new `Registry` that the detection loop picks up
/// on its next cycle.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: Arc<[Identity]>,
}

impl Registry {
    /// Build a snapshot, rejecting duplicate ids.
    pub fn new(identities: Vec<Identity>) -> Result<Self, RegistryError> {
        {
            let mut seen = HashSet::with_capacity(identities.len());
            if let Some(dup) = identities.iter().find(|identity| !seen.insert(&identity.id)) {
                return Err(RegistryError::DuplicateId(dup.id.clone()));
            }
        }
        Ok(Self {
            entries: identities.into(),
        })
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::<Identity>::new().into(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Identity> {
        self.entries.iter()
    }

    pub fn get(&self, id: &IdentityId) -> Option<&Identity> {
        self.entries.iter().find(|identity| &identity.id == id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::empty()
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a Identity;
    type IntoIter = std::slice::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Best registry candidate under the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Euclidean distance between the probe and the matched embedding.
    pub distance: f32,
}

/// A captured grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

/// One face located and embedded by an extractor.
#[derive(Debug, Clone)]
pub struct Detection {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
    pub confidence: f32,
}
