use image::RgbImage;
use tracing::debug;

use crate::{Bbox, Detection, VisionError};

/// Model input grid (width, height). Every remapping goes through this pair.
pub const MODEL_INPUT: (f32, f32) = (640.0, 640.0);

const TALL_16_9: f32 = 16.0 / 9.0;
const WIDE_9_16: f32 = 9.0 / 16.0;

/// Pixel size of the captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn of(img: &RgbImage) -> Self {
        Self { width: img.width(), height: img.height() }
    }

    /// (x, y) factors from model space to this frame.
    pub fn scale(&self) -> (f32, f32) {
        (self.width as f32 / MODEL_INPUT.0, self.height as f32 / MODEL_INPUT.1)
    }
}

/// On-screen drawing surface. Not necessarily the frame's aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    width: f32,
    height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Result<Self, VisionError> {
        if !(width > 0.0 && height > 0.0) {
            return Err(VisionError::DegenerateViewport { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// height/width >= 16/9
    WidthConstrained,
    HeightConstrained,
}

pub fn fit(viewport: Viewport) -> Fit {
    if viewport.height / viewport.width >= TALL_16_9 {
        Fit::WidthConstrained
    } else {
        Fit::HeightConstrained
    }
}

/// Model space to frame pixel space.
pub fn to_frame(dets: &[Detection], frame: FrameSize) -> Vec<Detection> {
    let (xf, yf) = frame.scale();
    dets.iter()
        .map(|d| Detection {
            bbox: Bbox {
                x1: d.bbox.x1 * xf,
                y1: d.bbox.y1 * yf,
                x2: d.bbox.x2 * xf,
                y2: d.bbox.y2 * yf,
            },
            ..d.clone()
        })
        .collect()
}

/// Frame space to viewport space. Runs on the output of [`to_frame`].
///
/// Boxes are scaled by the fitting factor and shifted left by the side margin
/// between the frame's and a 9:16 aspect ratio, then clamped to the viewport.
pub fn to_viewport(dets: &[Detection], frame: FrameSize, viewport: Viewport) -> Vec<Detection> {
    let image_aspect = frame.height as f32 / frame.width as f32;
    let side_margin = 1.0 / image_aspect - WIDE_9_16;

    let (factor, x_shift) = match fit(viewport) {
        Fit::WidthConstrained => (
            viewport.width * TALL_16_9 / MODEL_INPUT.0,
            side_margin * viewport.width,
        ),
        Fit::HeightConstrained => (
            viewport.height / MODEL_INPUT.1,
            side_margin * viewport.height * WIDE_9_16,
        ),
    };
    debug!("mapper: {:?} factor={} x_shift={}", fit(viewport), factor, x_shift);

    let cx = |x: f32| (x * factor - x_shift).clamp(0.0, viewport.width);
    let cy = |y: f32| (y * factor).clamp(0.0, viewport.height);

    dets.iter()
        .map(|d| Detection {
            bbox: Bbox { x1: cx(d.bbox.x1), y1: cy(d.bbox.y1), x2: cx(d.bbox.x2), y2: cy(d.bbox.y2) },
            ..d.clone()
        })
        .collect()
}

/// Index of the first box containing the tap point.
pub fn hit_test(boxes: &[Detection], x: f32, y: f32) -> Option<usize> {
    boxes.iter().position(|d| d.bbox.contains(x, y))
}

/// Integer pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamp a frame-space box to the frame. `None` if nothing is left.
pub fn crop_region(bbox: &Bbox, frame: FrameSize) -> Option<CropRect> {
    let (fw, fh) = (frame.width as f32, frame.height as f32);
    let x1 = bbox.x1.clamp(0.0, fw) as u32;
    let y1 = bbox.y1.clamp(0.0, fh) as u32;
    let x2 = bbox.x2.clamp(0.0, fw) as u32;
    let y2 = bbox.y2.clamp(0.0, fh) as u32;

    let width = x2.saturating_sub(x1);
    let height = y2.saturating_sub(y1);
    if width == 0 || height == 0 {
        return None;
    }
    Some(CropRect { x: x1, y: y1, width, height })
}
