use crate::types::Frame;
use std::future::Future;
use thiserror::Error;

/// Why a frame could not be produced this cycle. Always transient from the
/// detection loop's point of view.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("camera not available: {0}")]
    Unavailable(String),
    #[error("frame too dark")]
    Dark,
    #[error("frame source closed")]
    Closed,
}

/// Supplies the current camera frame on demand.
///
/// Implementations must tolerate being called every cycle; an unavailable
/// camera is reported as an error, never a panic.
pub trait FrameSource: Send {
    fn current_frame(&mut self) -> impl Future<Output = Result<Frame, FrameError>> + Send;
}
