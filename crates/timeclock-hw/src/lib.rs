//! timeclock-hw — Frame sources for the detection loop.
//!
//! Provides V4L2-based camera capture and a still-image source, both
//! producing grayscale frames through [`timeclock_core::FrameSource`].

pub mod camera;
pub mod frame;
pub mod still;

pub use camera::{Camera, CameraError, CameraSource};
pub use frame::PixelFormat;
pub use still::{StillError, StillSource};
