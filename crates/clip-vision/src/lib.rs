mod nms;
pub mod analyzer;
pub mod doctor;
pub mod labels;
pub mod mapper;
pub mod preprocess;
pub mod tensor;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub use mapper::{FrameSize, Viewport, MODEL_INPUT};
pub use nms::iou;
pub use preprocess::InputTensor;
pub use tensor::{AnchorRecord, RawTensor, NUM_ANCHORS, NUM_CHANNELS, NUM_CLASSES};

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("tensor shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("degenerate viewport {width}x{height}")]
    DegenerateViewport { width: f32, height: f32 },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("jpeg encode failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("crop region is empty")]
    EmptyCrop,
}

/// Corner-form box, `x1 <= x2` and `y1 <= y2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Bbox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1: x1.min(x2), y1: y1.min(y2), x2: x1.max(x2), y2: y1.max(y2) }
    }

    /// Center-form (cx, cy, w, h) to corners.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }
}

/// Anchor that cleared the confidence threshold; lives only until NMS.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub anchor: usize,
    pub class_id: u32,
    pub conf: f32,
    pub bbox: Bbox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub conf: f32,
    pub bbox: Bbox,
}

impl From<Candidate> for Detection {
    fn from(c: Candidate) -> Self {
        Self { class_id: c.class_id, conf: c.conf, bbox: c.bbox }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    /// Cap on NMS survivors; unset keeps all of them.
    pub max_detections: Option<usize>,
    /// Depth of the analyzer's result queue.
    pub result_queue: usize,
    pub labels_path: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: None,
            result_queue: 4,
            labels_path: None,
        }
    }
}

/// The model boundary: takes the normalized 1x3x640x640 input, returns the raw
/// 1x84x8400 output.
pub trait TensorProducer: Send {
    fn run(&mut self, input: &InputTensor) -> anyhow::Result<RawTensor>;
}

impl<F> TensorProducer for F
where
    F: FnMut(&InputTensor) -> anyhow::Result<RawTensor> + Send,
{
    fn run(&mut self, input: &InputTensor) -> anyhow::Result<RawTensor> {
        self(input)
    }
}

/// Everything known about one analyzed frame. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Frame pixel space.
    pub detections: Vec<Detection>,
    pub frame: Arc<RgbImage>,
    pub process_time: Duration,
}

impl DetectionResult {
    pub fn frame_size(&self) -> FrameSize {
        FrameSize::of(&self.frame)
    }

    pub fn in_viewport(&self, viewport: Viewport) -> Vec<Detection> {
        mapper::to_viewport(&self.detections, self.frame_size(), viewport)
    }
}

/// Arg-max class per anchor, keep if `conf >= conf_th`, convert to corners.
pub fn filter_candidates(records: &[AnchorRecord], conf_th: f32) -> Vec<Candidate> {
    let mut out = Vec::new();

    for (anchor, r) in records.iter().enumerate() {
        let scores = &r[tensor::BOX_CHANNELS..];
        let mut best_c = 0usize;
        let mut best_p = scores[0];
        for (c, &p) in scores.iter().enumerate().skip(1) {
            // strict: ties keep the lower class index
            if p > best_p { best_p = p; best_c = c; }
        }
        if best_p >= conf_th {
            out.push(Candidate {
                anchor,
                class_id: best_c as u32,
                conf: best_p,
                bbox: Bbox::from_center(r[0], r[1], r[2], r[3]),
            });
        }
    }
    out
}

/// Greedy NMS. Candidates are visited by descending confidence (stable, so equal
/// scores keep anchor order); each accepted box suppresses every later box whose
/// IOU with it is strictly above `iou_th`.
pub fn nms_filter(mut cands: Vec<Candidate>, iou_th: f32, max_det: Option<usize>) -> Vec<Detection> {
    cands.sort_by(|a, b| b.conf.partial_cmp(&a.conf).unwrap_or(std::cmp::Ordering::Equal));
    let mut suppressed = vec![false; cands.len()];
    let mut kept: Vec<Detection> = Vec::new();

    for i in 0..cands.len() {
        if suppressed[i] { continue; }
        let accepted = &cands[i];
        for j in (i + 1)..cands.len() {
            if !suppressed[j] && nms::iou(&accepted.bbox, &cands[j].bbox) > iou_th {
                suppressed[j] = true;
            }
        }
        kept.push(Detection::from(accepted.clone()));
        if max_det.is_some_and(|m| kept.len() >= m) { break; }
    }
    kept
}

/// Raw output tensor to model-space detections.
pub fn postprocess(raw: &RawTensor, cfg: &PipelineConfig) -> Result<Vec<Detection>, VisionError> {
    let records = tensor::decode(raw)?;
    let cands = filter_candidates(&records, cfg.conf_threshold);
    debug!("vision: {} candidates above {}", cands.len(), cfg.conf_threshold);
    let dets = nms_filter(cands, cfg.iou_threshold, cfg.max_detections);
    debug!("vision: {} detections after nms", dets.len());
    Ok(dets)
}

/// Full pass over one frame: preprocess, run the model, decode, suppress, rescale.
pub fn analyze_frame<P>(
    producer: &mut P,
    frame: Arc<RgbImage>,
    cfg: &PipelineConfig,
) -> Result<DetectionResult, VisionError>
where
    P: TensorProducer + ?Sized,
{
    let start = Instant::now();
    let input = preprocess::to_input_tensor(&frame);
    let raw = producer.run(&input).map_err(|e| VisionError::Inference(format!("{:#}", e)))?;
    let detections = mapper::to_frame(&postprocess(&raw, cfg)?, FrameSize::of(&frame));
    let process_time = start.elapsed();
    debug!("vision: frame {}x{} analyzed in {:?}", frame.width(), frame.height(), process_time);

    Ok(DetectionResult { detections, frame, process_time })
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::tensor::{BOX_CHANNELS, OUTPUT_SHAPE};
    use crate::{RawTensor, NUM_ANCHORS, NUM_CHANNELS};

    /// Every score 0.1; `boxes` is (anchor, class, score, [cx, cy, w, h]).
    pub fn tensor_with(boxes: &[(usize, usize, f32, [f32; 4])]) -> RawTensor {
        let mut data = vec![0.1f32; NUM_CHANNELS * NUM_ANCHORS];
        for &(anchor, class, score, b) in boxes {
            for (c, v) in b.iter().enumerate() {
                data[c * NUM_ANCHORS + anchor] = *v;
            }
            data[(BOX_CHANNELS + class) * NUM_ANCHORS + anchor] = score;
        }
        RawTensor::new(data, &OUTPUT_SHAPE).unwrap()
    }

    pub fn record(class: usize, score: f32, b: [f32; 4]) -> crate::AnchorRecord {
        let mut r = [0.0f32; NUM_CHANNELS];
        r[..BOX_CHANNELS].copy_from_slice(&b);
        r[BOX_CHANNELS + class] = score;
        r
    }
}
