//! timeclock-core — Face identity resolution for the time-clock kiosk.
//!
//! Resolves live face embeddings against enrolled employees, debounces
//! repeated recognitions and drives the camera detection loop. Cameras,
//! inference models and persistence plug in through the [`FrameSource`],
//! [`EmbeddingExtractor`] and [`RecognitionSink`] traits.

pub mod cooldown;
pub mod extractor;
pub mod resolver;
pub mod scheduler;
pub mod source;
pub mod types;

pub use cooldown::{CooldownState, Verdict, DEFAULT_COOLDOWN};
pub use extractor::{
    capture_enrollment, CaptureError, EmbeddingExtractor, EnrollmentCapture, ExtractError,
};
pub use resolver::{resolve, EuclideanMatcher, Matcher, ResolveError, DEFAULT_MATCH_THRESHOLD};
pub use scheduler::{
    DetectionStatus, Disposition, LoopConfig, LoopError, LoopHandle, LoopSnapshot, LoopStats,
    RecognitionSink, RunningLoop,
};
pub use source::{FrameError, FrameSource};
pub use types::{
    BoundingBox, Detection, Embedding, Frame, Identity, IdentityId, MatchResult, Registry,
    RegistryError,
};
