use ndarray::{ArrayView3, ArrayViewMut3};

/// A single frame or face image: contiguous interleaved bytes in row-major order.
///
/// Frames only exist transiently inside a stage. Between stages the pixels live
/// in the weak heap and records carry an [`ImageRef`](crate::heap::ImageRef).
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    index: usize,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, index: usize) -> Self {
        debug_assert_eq!(
            data.len(),
            Self::expected_len(width, height, channels),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            index,
        }
    }

    /// A frame with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        let len = Self::expected_len(width, height, channels);
        Self::new(vec![value; len], width, height, channels, 0)
    }

    pub fn expected_len(width: u32, height: u32, channels: u8) -> usize {
        (width as usize) * (height as usize) * (channels as usize)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.shape(), &self.data)
            .expect("Frame data length must match dimensions")
    }

    pub fn as_ndarray_mut(&mut self) -> ArrayViewMut3<'_, u8> {
        ArrayViewMut3::from_shape(self.shape(), &mut self.data)
            .expect("Frame data length must match dimensions")
    }

    /// Bilinear sample of channel `c` at fractional coordinates.
    ///
    /// Returns `None` outside the frame so callers can leave those pixels alone.
    pub fn sample_bilinear(&self, x: f32, y: f32, c: usize) -> Option<f32> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let max_x = self.width as f32 - 1.0;
        let max_y = self.height as f32 - 1.0;
        if x > max_x || y > max_y {
            return None;
        }
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width as usize - 1);
        let y1 = (y0 + 1).min(self.height as usize - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let px = |xx: usize, yy: usize| -> f32 {
            let idx = (yy * self.width as usize + xx) * self.channels as usize + c;
            self.data[idx] as f32
        };
        let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
        let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
        Some(top * (1.0 - fy) + bottom * fy)
    }

    fn shape(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        )
    }
}
