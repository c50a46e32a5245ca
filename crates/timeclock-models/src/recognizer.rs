//! ArcFace embedding extraction (w600k_r50, 512-d, L2-normalized).

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use timeclock_core::{BoundingBox, Embedding};

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::ModelError;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 512;
pub const MODEL_VERSION: &str = "w600k_r50";

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "face recognizer loaded");

        Ok(Self { session })
    }

    /// Align `face` to the canonical crop and embed it.
    pub fn embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, ModelError> {
        let landmarks = face.landmarks.as_ref().ok_or(ModelError::NoLandmarks)?;
        let aligned = align_face(frame, width, height, landmarks);
        let input = crop_tensor(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected a {EMBEDDING_DIM}-d embedding, model produced {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)).with_model_version(MODEL_VERSION))
    }
}

/// Grayscale crop replicated into three normalized channels.
fn crop_tensor(aligned: &[u8]) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, _, y, x)| {
        let pixel = aligned.get(y * ALIGNED_SIZE + x).copied().unwrap_or(0) as f32;
        (pixel - PIXEL_MEAN) / PIXEL_STD
    })
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
