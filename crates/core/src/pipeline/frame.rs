use chrono::NaiveDateTime;

/// One decoded `bgr24` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture order within the stream, starting at 0.
    pub index: u64,
    /// Local wall-clock time of capture.
    pub captured_at: NaiveDateTime,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64, captured_at: NaiveDateTime) -> Self {
        Self {
            data,
            width,
            height,
            index,
            captured_at,
        }
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Mutable view of the pixel at (`x`, `y`) as `[b, g, r]`.
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> Option<&mut [u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        self.data.get_mut(offset..offset + 3)
    }
}
