//! Raw buffer → grayscale conversion and dark-frame detection.

use image::GrayImage;
use std::time::Instant;
use timeclock_core::Frame;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// Pixel values below this are "near black".
const DARK_PIXEL_LEVEL: u8 = 32;

/// Pixel layouts a camera may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, two bytes per pixel; luma is every even byte.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Grey => 1,
            PixelFormat::Yuyv | PixelFormat::Y16 => 2,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameBufferError {
    #[error("{format:?} buffer too short: expected {expected} bytes, got {actual}")]
    TooShort {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Convert a raw capture buffer to one luma byte per pixel.
pub fn to_grayscale(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<Vec<u8>, FrameBufferError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * format.bytes_per_pixel();
    if buf.len() < expected {
        return Err(FrameBufferError::TooShort {
            format,
            expected,
            actual: buf.len(),
        });
    }

    let gray = match format {
        PixelFormat::Grey => buf[..pixels].to_vec(),
        PixelFormat::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
        // keep the high byte of each little-endian sample
        PixelFormat::Y16 => buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
    };
    Ok(gray)
}

/// True if more than `ratio` of the pixels are near black.
pub fn is_dark_frame(gray: &[u8], ratio: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_PIXEL_LEVEL).count();
    (dark as f32 / gray.len() as f32) > ratio
}

/// Wrap a decoded grayscale image as a frame.
pub fn frame_from_luma(image: GrayImage, sequence: u32) -> Frame {
    let (width, height) = image.dimensions();
    Frame {
        data: image.into_raw(),
        width,
        height,
        timestamp: Instant::now(),
        sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_keeps_luma_bytes() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let gray = to_grayscale(PixelFormat::Yuyv, &[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_ignores_trailing_bytes() {
        let buf: Vec<u8> = (0..20).collect();
        let gray = to_grayscale(PixelFormat::Yuyv, &buf, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_y16_takes_high_byte() {
        let buf = [0x34, 0x12, 0xff, 0xab];
        let gray = to_grayscale(PixelFormat::Y16, &buf, 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xab]);
    }

    #[test]
    fn test_grey_passthrough() {
        let gray = to_grayscale(PixelFormat::Grey, &[1, 2, 3, 4, 5], 2, 2).unwrap();
        assert_eq!(gray, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let err = to_grayscale(PixelFormat::Yuyv, &[100, 128], 2, 1).unwrap_err();
        assert_eq!(
            err,
            FrameBufferError::TooShort {
                format: PixelFormat::Yuyv,
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_RATIO));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));

        // 96% dark → dark; 94% dark → not dark
        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend([128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_RATIO));

        let mut borderline = vec![10u8; 940];
        borderline.extend([128u8; 60]);
        assert!(!is_dark_frame(&borderline, DARK_FRAME_RATIO));
    }

    #[test]
    fn test_frame_from_luma_dimensions() {
        let image = GrayImage::from_pixel(3, 2, image::Luma([77]));
        let frame = frame_from_luma(image, 9);
        assert_eq!((frame.width, frame.height, frame.sequence), (3, 2, 9));
        assert_eq!(frame.data, vec![77; 6]);
        assert!((frame.avg_brightness() - 77.0).abs() < 1e-6);
    }
}
