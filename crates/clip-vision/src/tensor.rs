use crate::VisionError;

pub const BOX_CHANNELS: usize = 4;
pub const NUM_CLASSES: usize = 80;
pub const NUM_CHANNELS: usize = BOX_CHANNELS + NUM_CLASSES;
pub const NUM_ANCHORS: usize = 8400;
pub const OUTPUT_SHAPE: [usize; 3] = [1, NUM_CHANNELS, NUM_ANCHORS];

/// One anchor: `[cx, cy, w, h, score_0 .. score_79]`.
pub type AnchorRecord = [f32; NUM_CHANNELS];

/// Read-only model output as handed over by the runtime.
#[derive(Debug, Clone)]
pub struct RawTensor {
    data: Box<[f32]>,
    shape: Vec<usize>,
}

impl RawTensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self, VisionError> {
        let want: usize = shape.iter().product();
        if data.len() != want {
            return Err(VisionError::ShapeMismatch { expected: shape.to_vec(), got: vec![data.len()] });
        }
        Ok(Self { data: data.into_boxed_slice(), shape: shape.to_vec() })
    }

    /// Little-endian f32 dump, as written by most runtimes' raw output export.
    pub fn from_le_bytes(bytes: &[u8], shape: &[usize]) -> Result<Self, VisionError> {
        if bytes.len() % 4 != 0 {
            return Err(VisionError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![bytes.len() / 4, bytes.len() % 4],
            });
        }
        let data = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(data, shape)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Transpose `[1][84][8400]` (channel-major) into 8400 anchor records.
pub fn decode(raw: &RawTensor) -> Result<Vec<AnchorRecord>, VisionError> {
    if raw.shape() != &OUTPUT_SHAPE[..] {
        return Err(VisionError::ShapeMismatch {
            expected: OUTPUT_SHAPE.to_vec(),
            got: raw.shape().to_vec(),
        });
    }

    let mut records = vec![[0.0f32; NUM_CHANNELS]; NUM_ANCHORS];
    for (c, row) in raw.data().chunks_exact(NUM_ANCHORS).enumerate() {
        for (rec, &v) in records.iter_mut().zip(row) {
            rec[c] = v;
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_transposes_channels() {
        let data: Vec<f32> = (0..NUM_CHANNELS * NUM_ANCHORS).map(|i| i as f32).collect();
        let raw = RawTensor::new(data, &OUTPUT_SHAPE).unwrap();
        let records = decode(&raw).unwrap();

        assert_eq!(records.len(), NUM_ANCHORS);
        assert_eq!(records[0][0], 0.0);
        assert_eq!(records[0][1], NUM_ANCHORS as f32);
        assert_eq!(records[7][83], (83 * NUM_ANCHORS + 7) as f32);
        assert_eq!(records[NUM_ANCHORS - 1][4], (5 * NUM_ANCHORS - 1) as f32);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let raw = RawTensor::new(vec![0.0; 85 * 10], &[1, 85, 10]).unwrap();
        let err = decode(&raw).unwrap_err();
        assert!(matches!(
            err,
            VisionError::ShapeMismatch { ref expected, ref got }
                if expected == &OUTPUT_SHAPE.to_vec() && got == &vec![1, 85, 10]
        ));

        assert!(RawTensor::new(vec![0.0; 3], &[1, 2, 2]).is_err());
    }

    #[test]
    fn le_bytes_roundtrip() {
        let mut bytes = Vec::new();
        for v in [1.5f32, -2.0, 0.25, 8.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let raw = RawTensor::from_le_bytes(&bytes, &[1, 2, 2]).unwrap();
        assert_eq!(raw.data(), &[1.5, -2.0, 0.25, 8.0]);

        assert!(RawTensor::from_le_bytes(&bytes[..7], &[1, 2, 2]).is_err());
    }
}
