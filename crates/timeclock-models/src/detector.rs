//! SCRFD face detection.
//!
//! The frame is letterboxed into a square 640×640 input, run through the
//! three-stride SCRFD head, decoded into boxes with five landmarks each and
//! de-duplicated with greedy NMS.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use timeclock_core::BoundingBox;

use crate::ModelError;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Where a resized frame sits inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(frame_width: u32, frame_height: u32) -> Self {
        let side = INPUT_SIZE as f32;
        let scale = (side / frame_width as f32).min(side / frame_height as f32);
        let width = ((frame_width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let height = ((frame_height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: (INPUT_SIZE - width) / 2,
            pad_y: (INPUT_SIZE - height) / 2,
            width,
            height,
        }
    }

    /// Model-input coordinates back to frame coordinates.
    fn unmap(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Map the nine SCRFD outputs to strides, by name when the export uses
/// `score_8`-style names, otherwise in the usual score/bbox/kps order.
fn head_layout(names: &[String]) -> [HeadOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<HeadOutputs>> = STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match by_name {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::debug!(?names, "SCRFD outputs unnamed, assuming positional layout");
            std::array::from_fn(|i| HeadOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

pub struct FaceDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(ModelError::InferenceFailed(format!(
                "SCRFD expects 9 outputs, model has {}",
                names.len()
            )));
        }
        let heads = head_layout(&names);
        tracing::info!(path = %model_path.display(), ?heads, "face detector loaded");

        Ok(Self { session, heads })
    }

    /// All faces in a grayscale frame, highest confidence first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, ModelError> {
        let (input, letterbox) = prepare_input(frame, width, height)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(STRIDES.iter()) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        ModelError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = tensor(head.score, "scores")?;
            let boxes = tensor(head.bbox, "boxes")?;
            let kps = tensor(head.kps, "landmarks")?;
            candidates.extend(decode_head(scores, boxes, kps, stride, &letterbox));
        }

        Ok(suppress_overlaps(candidates, NMS_IOU))
    }
}

/// Letterbox a grayscale frame into a normalized NCHW tensor.
fn prepare_input(
    frame: &[u8],
    width: u32,
    height: u32,
) -> Result<(Array4<f32>, Letterbox), ModelError> {
    let expected = width as usize * height as usize;
    if width == 0 || height == 0 || frame.len() < expected {
        return Err(ModelError::InvalidFrame {
            width,
            height,
            len: frame.len(),
        });
    }
    let gray = GrayImage::from_raw(width, height, frame[..expected].to_vec()).ok_or(
        ModelError::InvalidFrame {
            width,
            height,
            len: frame.len(),
        },
    )?;

    let letterbox = Letterbox::fit(width, height);
    let resized = imageops::resize(&gray, letterbox.width, letterbox.height, FilterType::Triangle);

    let side = INPUT_SIZE as usize;
    let tensor = Array4::from_shape_fn((1, 3, side, side), |(_, _, y, x)| {
        let inside_x = (x as u32).checked_sub(letterbox.pad_x).filter(|&rx| rx < letterbox.width);
        let inside_y = (y as u32).checked_sub(letterbox.pad_y).filter(|&ry| ry < letterbox.height);
        let pixel = match (inside_x, inside_y) {
            (Some(rx), Some(ry)) => resized.get_pixel(rx, ry).0[0] as f32,
            _ => PIXEL_MEAN,
        };
        (pixel - PIXEL_MEAN) / PIXEL_STD
    });

    Ok((tensor, letterbox))
}

/// Turn one stride's raw outputs into candidate boxes in frame coordinates.
fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let cells_per_row = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > SCORE_THRESHOLD)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row) as f32 * step;
            let cy = (cell / cells_per_row) as f32 * step;

            let d = boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (x1, y1) = letterbox.unmap((cx - d[0] * step, cy - d[1] * step));
            let (x2, y2) = letterbox.unmap((cx + d[2] * step, cy + d[3] * step));

            let landmarks = kps.get(anchor * 10..anchor * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.unmap((cx + k[2 * i] * step, cy + k[2 * i + 1] * step))
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; result is sorted by confidence.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let intersection = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_letterbox_landscape_frame() {
        let lb = Letterbox::fit(640, 480);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert_eq!((lb.width, lb.height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        assert_eq!(lb.unmap((100.0, 180.0)), (100.0, 100.0));
    }

    #[test]
    fn test_letterbox_downscales_large_frame() {
        let lb = Letterbox::fit(1280, 960);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        let (x, y) = lb.unmap((320.0, 320.0));
        assert!((x - 640.0).abs() < 1e-3 && (y - 480.0).abs() < 1e-3);
    }

    #[test]
    fn test_prepare_input_pads_with_zero() {
        let frame = vec![255u8; 640 * 480];
        let (tensor, lb) = prepare_input(&frame, 640, 480).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // padding band normalizes to zero, image area to (255 - mean) / std
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 2, lb.pad_y as usize + 10, 10]];
        assert!((inside - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-3);
    }

    #[test]
    fn test_prepare_input_rejects_short_buffer() {
        let err = prepare_input(&[0u8; 10], 640, 480).unwrap_err();
        assert!(matches!(err, ModelError::InvalidFrame { len: 10, .. }));
    }

    #[test]
    fn test_head_layout_by_name() {
        let names: Vec<String> = [
            "kps_8", "score_8", "bbox_8", "score_16", "bbox_16", "kps_16", "score_32", "bbox_32",
            "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let heads = head_layout(&names);
        assert_eq!(heads[0], HeadOutputs { score: 1, bbox: 2, kps: 0 });
        assert_eq!(heads[2], HeadOutputs { score: 6, bbox: 7, kps: 8 });
    }

    #[test]
    fn test_head_layout_positional_fallback() {
        let names: Vec<String> = (440..449).map(|i| i.to_string()).collect();
        let heads = head_layout(&names);
        assert_eq!(heads[1], HeadOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_head_single_anchor() {
        let lb = Letterbox::fit(640, 640);
        let cells = (640 / 32) * (640 / 32) * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut boxes = vec![0.0f32; cells * 4];
        let kps = vec![0.0f32; cells * 10];

        // anchor 2 → cell 1 → centre (32, 0)
        scores[2] = 0.9;
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);

        let dets = decode_head(&scores, &boxes, &kps, 32, &lb);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 16.0).abs() < 1e-4 && (d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 32.0).abs() < 1e-4 && (d.height - 32.0).abs() < 1e-4);
        assert_eq!(d.landmarks.unwrap()[0], (32.0, 0.0));
    }

    #[test]
    fn test_iou_cases() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &bbox(20.0, 20.0, 10.0, 10.0, 0.9)), 0.0);
        // 5x10 overlap over 150 union
        assert!((iou(&a, &bbox(5.0, 0.0, 10.0, 10.0, 0.9)) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_overlaps_keeps_best() {
        let dets = vec![
            bbox(1.0, 1.0, 10.0, 10.0, 0.7),
            bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            bbox(100.0, 100.0, 10.0, 10.0, 0.8),
        ];
        let kept = suppress_overlaps(dets, NMS_IOU);
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8]);
    }
}
