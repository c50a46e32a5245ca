//! Face embedding extraction seam and the one-shot enrollment capture.

use crate::source::{FrameError, FrameSource};
use crate::types::{BoundingBox, Detection, Embedding, Frame};
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    /// Expected, high-frequency outcome: nobody in front of the camera.
    #[error("no face found")]
    NoFaceFound,
    #[error("model not ready: {0}")]
    NotReady(String),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Locates the most prominent face in a frame and embeds it.
///
/// Latency is unbounded (typically hundreds of milliseconds of inference).
/// Callers never run two extractions on the same extractor concurrently.
pub trait EmbeddingExtractor: Send {
    fn extract(
        &mut self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Detection, ExtractError>> + Send;
}

/// Reject embeddings that cannot be compared meaningfully.
pub(crate) fn check_embedding(embedding: &Embedding) -> Result<(), ExtractError> {
    if embedding.values.is_empty() {
        return Err(ExtractError::Failed("extractor returned an empty embedding".into()));
    }
    if embedding.values.iter().any(|v| !v.is_finite()) {
        return Err(ExtractError::Failed(
            "extractor returned a non-finite embedding".into(),
        ));
    }
    Ok(())
}

/// Result of a successful enrollment capture.
#[derive(Debug, Clone)]
pub struct EnrollmentCapture {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error(transparent)]
    Camera(#[from] FrameError),
    #[error("no face found")]
    NoFace,
    #[error("model not ready: {0}")]
    NotReady(String),
    #[error("extraction failed: {0}")]
    Extractor(String),
}

impl From<ExtractError> for CaptureError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::NoFaceFound => CaptureError::NoFace,
            ExtractError::NotReady(msg) => CaptureError::NotReady(msg),
            ExtractError::Failed(msg) => CaptureError::Extractor(msg),
        }
    }
}

/// Grab one fresh frame and embed the face in it.
///
/// No registry lookup happens here: enrollment trusts the operator's entry.
/// Retrying on [`CaptureError::NoFace`] is the caller's decision.
pub async fn capture_enrollment<S, E>(
    source: &mut S,
    extractor: &mut E,
) -> Result<EnrollmentCapture, CaptureError>
where
    S: FrameSource,
    E: EmbeddingExtractor,
{
    let frame = source.current_frame().await?;
    let detection = extractor.extract(&frame).await?;
    check_embedding(&detection.embedding)?;

    tracing::debug!(
        sequence = frame.sequence,
        confidence = detection.confidence,
        dim = detection.embedding.dim(),
        "enrollment capture"
    );

    Ok(EnrollmentCapture {
        embedding: detection.embedding,
        bbox: detection.bbox,
        confidence: detection.confidence,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_capture_returns_embedding_and_box() {
        let mut source = ScriptedSource::healthy();
        let mut extractor = ScriptedExtractor::new(vec![], Ok(detection(vec![0.1, 0.2])));

        let capture = capture_enrollment(&mut source, &mut extractor).await.unwrap();
        assert_eq!(capture.embedding.values, vec![0.1, 0.2]);
        assert_eq!(capture.bbox.width, 1.0);
        assert!((capture.confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_capture_reports_no_face() {
        let mut source = ScriptedSource::healthy();
        let mut extractor = ScriptedExtractor::new(vec![], Err(ExtractError::NoFaceFound));

        let err = capture_enrollment(&mut source, &mut extractor).await.unwrap_err();
        assert_eq!(err, CaptureError::NoFace);
    }

    #[tokio::test]
    async fn test_capture_reports_camera_unavailable() {
        let mut source = ScriptedSource {
            failures: 1,
            ..ScriptedSource::healthy()
        };
        let mut extractor = ScriptedExtractor::new(vec![], Ok(detection(vec![0.0])));

        let err = capture_enrollment(&mut source, &mut extractor).await.unwrap_err();
        assert!(matches!(err, CaptureError::Camera(FrameError::Unavailable(_))));
        // the extractor is never reached without a frame
        assert_eq!(extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capture_rejects_non_finite_embedding() {
        let mut source = ScriptedSource::healthy();
        let mut extractor =
            ScriptedExtractor::new(vec![], Ok(detection(vec![0.0, f32::NAN])));

        let err = capture_enrollment(&mut source, &mut extractor).await.unwrap_err();
        assert!(matches!(err, CaptureError::Extractor(_)));
    }

    #[test]
    fn test_check_embedding_rejects_empty() {
        assert!(check_embedding(&Embedding::new(vec![])).is_err());
        assert!(check_embedding(&Embedding::new(vec![1.0])).is_ok());
    }
}
