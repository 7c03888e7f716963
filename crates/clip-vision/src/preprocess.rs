use image::{codecs::jpeg::JpegEncoder, imageops, imageops::FilterType, RgbImage};

use crate::mapper::{crop_region, FrameSize, MODEL_INPUT};
use crate::{Bbox, VisionError};

const RGB_CHANNELS: usize = 3;
const JPEG_QUALITY: u8 = 100;

/// Normalized model input, planar R, G, B (NCHW), values in [0, 1].
#[derive(Debug, Clone)]
pub struct InputTensor {
    data: Box<[f32]>,
}

impl InputTensor {
    pub fn shape(&self) -> [usize; 4] {
        [1, RGB_CHANNELS, MODEL_INPUT.1 as usize, MODEL_INPUT.0 as usize]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Scale to the model grid (unfiltered, like the camera preview scaler) and
/// split into channel planes.
pub fn to_input_tensor(frame: &RgbImage) -> InputTensor {
    let (w, h) = (MODEL_INPUT.0 as u32, MODEL_INPUT.1 as u32);
    let resized = imageops::resize(frame, w, h, FilterType::Nearest);

    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; RGB_CHANNELS * plane];
    for (i, px) in resized.pixels().enumerate() {
        data[i] = px[0] as f32 / 255.0;
        data[i + plane] = px[1] as f32 / 255.0;
        data[i + 2 * plane] = px[2] as f32 / 255.0;
    }
    InputTensor { data: data.into_boxed_slice() }
}

/// Cut a frame-space box out of the frame and encode it as the JPEG query image.
pub fn crop_jpeg(frame: &RgbImage, bbox: &Bbox) -> Result<Vec<u8>, VisionError> {
    let r = crop_region(bbox, FrameSize::of(frame)).ok_or(VisionError::EmptyCrop)?;
    let cropped = imageops::crop_imm(frame, r.x, r.y, r.width, r.height).to_image();

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&cropped)?;
    Ok(out)
}
