//! timeclock-models — ONNX-backed face embedding extraction.
//!
//! [`FacePipeline`] runs SCRFD detection followed by ArcFace embedding on a
//! grayscale frame. [`OnnxExtractor`] wraps it as a
//! [`timeclock_core::EmbeddingExtractor`], moving inference off the async
//! runtime and retrying model loading until the files appear.

pub mod alignment;
pub mod detector;
pub mod recognizer;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use timeclock_core::{Detection, EmbeddingExtractor, ExtractError, Frame};

pub use detector::FaceDetector;
pub use recognizer::{FaceRecognizer, EMBEDDING_DIM, MODEL_VERSION};

/// SCRFD detector file name inside the model directory.
pub const DETECTOR_MODEL: &str = "det_10g.onnx";
/// ArcFace recognizer file name inside the model directory.
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

/// Minimum spacing between attempts to load missing models.
const RELOAD_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {width}x{height} with {len} bytes")]
    InvalidFrame { width: u32, height: u32, len: usize },
    #[error("face has no landmarks to align with")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ModelError> for ExtractError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::ModelNotFound(path) => {
                ExtractError::NotReady(format!("model file not found: {path}"))
            }
            other => ExtractError::Failed(other.to_string()),
        }
    }
}

/// Detector and recognizer loaded together.
pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FacePipeline {
    pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
        Ok(Self {
            detector: FaceDetector::load(&model_dir.join(DETECTOR_MODEL))?,
            recognizer: FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL))?,
        })
    }

    /// Embed the most confident face in the frame, if there is one.
    pub fn process(&mut self, frame: &Frame) -> Result<Option<Detection>, ModelError> {
        let faces = self.detector.detect(&frame.data, frame.width, frame.height)?;
        let Some(best) = faces.into_iter().next() else {
            return Ok(None);
        };

        tracing::trace!(
            seq = frame.sequence,
            confidence = best.confidence,
            x = best.x,
            y = best.y,
            "face detected"
        );
        let embedding = self.recognizer.embed(&frame.data, frame.width, frame.height, &best)?;
        Ok(Some(Detection {
            embedding,
            confidence: best.confidence,
            bbox: best,
        }))
    }
}

/// [`EmbeddingExtractor`] over a lazily loaded [`FacePipeline`].
pub struct OnnxExtractor {
    model_dir: PathBuf,
    pipeline: Option<Arc<Mutex<FacePipeline>>>,
    last_attempt: Option<Instant>,
    last_error: Option<String>,
}

impl OnnxExtractor {
    /// Defer loading to the first extraction. Until the models load, every
    /// extraction reports [`ExtractError::NotReady`].
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            pipeline: None,
            last_attempt: None,
            last_error: None,
        }
    }

    /// Load the models now, failing if they are missing or invalid.
    pub fn load(model_dir: impl Into<PathBuf>) -> Result<Self, ModelError> {
        let model_dir = model_dir.into();
        let pipeline = FacePipeline::load(&model_dir)?;
        Ok(Self {
            model_dir,
            pipeline: Some(Arc::new(Mutex::new(pipeline))),
            last_attempt: Some(Instant::now()),
            last_error: None,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.is_some()
    }

    async fn pipeline(&mut self) -> Result<Arc<Mutex<FacePipeline>>, ExtractError> {
        if let Some(pipeline) = &self.pipeline {
            return Ok(Arc::clone(pipeline));
        }

        let due = self.last_attempt.map_or(true, |at| at.elapsed() >= RELOAD_BACKOFF);
        if !due {
            let reason = self.last_error.clone().unwrap_or_else(|| "models loading".into());
            return Err(ExtractError::NotReady(reason));
        }
        self.last_attempt = Some(Instant::now());

        let dir = self.model_dir.clone();
        let loaded = tokio::task::spawn_blocking(move || FacePipeline::load(&dir))
            .await
            .map_err(|e| ExtractError::Failed(format!("model load task failed: {e}")))?;

        match loaded {
            Ok(pipeline) => {
                tracing::info!(dir = %self.model_dir.display(), "face models loaded");
                let pipeline = Arc::new(Mutex::new(pipeline));
                self.pipeline = Some(Arc::clone(&pipeline));
                self.last_error = None;
                Ok(pipeline)
            }
            Err(err) => {
                tracing::warn!(
                    dir = %self.model_dir.display(),
                    error = %err,
                    "face models unavailable"
                );
                let err = ExtractError::from(err);
                self.last_error = Some(err.to_string());
                Err(match err {
                    ExtractError::Failed(msg) => ExtractError::NotReady(msg),
                    other => other,
                })
            }
        }
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    async fn extract(&mut self, frame: &Frame) -> Result<Detection, ExtractError> {
        let pipeline = self.pipeline().await?;
        let frame = frame.clone();

        tokio::task::spawn_blocking(move || {
            let mut pipeline = pipeline
                .lock()
                .map_err(|_| ExtractError::Failed("face pipeline lock poisoned".into()))?;
            pipeline.process(&frame)?.ok_or(ExtractError::NoFaceFound)
        })
        .await
        .map_err(|e| ExtractError::Failed(format!("inference task failed: {e}")))?
    }
}
