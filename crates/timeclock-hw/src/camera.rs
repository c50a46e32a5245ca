//! V4L2 camera capture via the `v4l` crate.
//!
//! The device is owned by a dedicated OS thread; [`CameraSource`] sends
//! frame requests to it over a channel so blocking dequeues never run on the
//! async runtime.

use crate::frame::{self, PixelFormat, DARK_FRAME_RATIO};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use timeclock_core::{Frame, FrameError, FrameSource};
use tokio::sync::{mpsc, oneshot};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture")]
    StreamingNotSupported,
    #[error("failed to spawn camera thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl From<CameraError> for FrameError {
    fn from(err: CameraError) -> Self {
        FrameError::Unavailable(err.to_string())
    }
}

/// An opened and format-negotiated V4L2 device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 device by path (e.g., "/dev/video0") and negotiate a
    /// pixel format we can turn into grayscale.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let format = pixel_format_for(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            ?format,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            format,
        })
    }

    fn open_stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))
    }

    fn next_frame(&self, stream: &mut MmapStream<'_>) -> Result<Frame, FrameError> {
        let (buf, meta) = stream
            .next()
            .map_err(|e| FrameError::Unavailable(format!("failed to dequeue buffer: {e}")))?;
        let gray = frame::to_grayscale(self.format, buf, self.width, self.height)
            .map_err(|e| FrameError::Unavailable(e.to_string()))?;

        if frame::is_dark_frame(&gray, DARK_FRAME_RATIO) {
            tracing::trace!(seq = meta.sequence, "dark frame");
            return Err(FrameError::Dark);
        }

        Ok(Frame {
            data: gray,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }
}

fn pixel_format_for(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"GREY" => Some(PixelFormat::Grey),
        b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
        _ => None,
    }
}

type FrameReply = oneshot::Sender<Result<Frame, FrameError>>;

/// Frame source backed by a camera thread.
pub struct CameraSource {
    tx: mpsc::Sender<FrameReply>,
}

impl CameraSource {
    /// Open the camera (failing fast if it is missing), discard
    /// `warmup_frames` while exposure settles, then serve frames on demand.
    pub fn spawn(device_path: &str, warmup_frames: usize) -> Result<Self, CameraError> {
        let camera = Camera::open(device_path)?;
        let (tx, mut rx) = mpsc::channel::<FrameReply>(1);

        std::thread::Builder::new()
            .name("timeclock-camera".into())
            .spawn(move || {
                tracing::info!(device = %camera.device_path, "camera thread started");
                let mut stream = None;
                let mut warmup = warmup_frames;

                while let Some(reply) = rx.blocking_recv() {
                    if stream.is_none() {
                        match camera.open_stream() {
                            Ok(s) => stream = Some(s),
                            Err(err) => {
                                let _ = reply.send(Err(err.into()));
                                continue;
                            }
                        }
                    }
                    let Some(active) = stream.as_mut() else {
                        continue;
                    };

                    while warmup > 0 {
                        warmup -= 1;
                        let _ = active.next();
                    }

                    let result = camera.next_frame(active);
                    if matches!(result, Err(FrameError::Unavailable(_))) {
                        // reopen the stream on the next request
                        stream = None;
                    }
                    let _ = reply.send(result);
                }
                tracing::info!("camera thread exiting");
            })?;

        Ok(Self { tx })
    }
}

impl FrameSource for CameraSource {
    async fn current_frame(&mut self) -> Result<Frame, FrameError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(reply_tx).await.map_err(|_| FrameError::Closed)?;
        reply_rx.await.map_err(|_| FrameError::Closed)?
    }
}

/// Info about a discovered V4L2 capture device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// List V4L2 devices that support video capture.
pub fn list_devices() -> Vec<DeviceInfo> {
    (0..16)
        .map(|i| format!("/dev/video{i}"))
        .filter(|path| Path::new(path).exists())
        .filter_map(|path| {
            let dev = Device::with_path(&path).ok()?;
            let caps = dev.query_caps().ok()?;
            caps.capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                .then(|| DeviceInfo {
                    path,
                    name: caps.card.clone(),
                    driver: caps.driver.clone(),
                })
        })
        .collect()
}
