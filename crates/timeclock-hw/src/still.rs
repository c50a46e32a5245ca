//! Frame source over still image files.
//!
//! Used for enrolling from a photo and for running the detection loop
//! against recorded frames.

use crate::frame::frame_from_luma;
use std::path::{Path, PathBuf};
use thiserror::Error;
use timeclock_core::{Frame, FrameError, FrameSource};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Error, Debug)]
pub enum StillError {
    #[error("no images found at {0}")]
    Empty(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Decode one image file into a grayscale frame.
pub fn load_frame(path: &Path, sequence: u32) -> Result<Frame, FrameError> {
    let image = image::open(path)
        .map_err(|e| FrameError::Unavailable(format!("{}: {e}", path.display())))?;
    Ok(frame_from_luma(image.to_luma8(), sequence))
}

/// Cycles through a fixed list of image files, one per request.
#[derive(Debug)]
pub struct StillSource {
    paths: Vec<PathBuf>,
    next: usize,
    sequence: u32,
    repeat: bool,
}

impl StillSource {
    /// A single image, or every image in a directory (sorted by name).
    pub fn open(path: &Path) -> Result<Self, StillError> {
        let paths = if path.is_dir() {
            let entries = std::fs::read_dir(path).map_err(|source| StillError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| is_image(p))
                .collect();
            paths.sort();
            paths
        } else {
            vec![path.to_path_buf()]
        };

        if paths.is_empty() {
            return Err(StillError::Empty(path.to_path_buf()));
        }
        tracing::debug!(count = paths.len(), path = %path.display(), "still frame source");

        Ok(Self {
            paths,
            next: 0,
            sequence: 0,
            repeat: true,
        })
    }

    /// Stop after the last image instead of starting over.
    pub fn once(mut self) -> Self {
        self.repeat = false;
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl FrameSource for StillSource {
    async fn current_frame(&mut self) -> Result<Frame, FrameError> {
        if self.next >= self.paths.len() {
            if !self.repeat {
                return Err(FrameError::Closed);
            }
            self.next = 0;
        }
        let path = self.paths[self.next].clone();
        let sequence = self.sequence;
        self.next += 1;
        self.sequence = self.sequence.wrapping_add(1);

        tokio::task::spawn_blocking(move || load_frame(&path, sequence))
            .await
            .map_err(|e| FrameError::Unavailable(format!("image decode task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::tempdir;

    fn write_png(dir: &Path, name: &str, level: u8) -> PathBuf {
        let path = dir.join(name);
        GrayImage::from_pixel(4, 3, Luma([level])).save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_directory_is_cycled_in_name_order() {
        let dir = tempdir().unwrap();
        write_png(dir.path(), "b.png", 20);
        write_png(dir.path(), "a.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = StillSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let levels: Vec<u8> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(source.current_frame().await.unwrap().data[0]);
            }
            out
        };
        assert_eq!(levels, vec![10, 20, 10]);
    }

    #[tokio::test]
    async fn test_once_closes_after_last_image() {
        let dir = tempdir().unwrap();
        let path = write_png(dir.path(), "only.png", 99);

        let mut source = StillSource::open(&path).unwrap().once();
        let frame = source.current_frame().await.unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(source.current_frame().await.unwrap_err(), FrameError::Closed);
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = tempdir().unwrap();
        assert!(matches!(StillSource::open(dir.path()), Err(StillError::Empty(_))));
    }

    #[test]
    fn test_unreadable_file_is_unavailable() {
        let err = load_frame(Path::new("/nonexistent/face.png"), 0).unwrap_err();
        assert!(matches!(err, FrameError::Unavailable(_)));
    }
}
