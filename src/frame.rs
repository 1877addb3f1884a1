//! Decoded frame and stream geometry types.
//!
//! - `StreamMetadata`: geometry and frame rate announced by the first video-data event.
//! - `RawFrame`: one decoded BGR24 frame, exactly `width * height * 3` bytes.

use serde::Serialize;

/// Bytes per pixel in the BGR24 layout produced by the decoder.
pub const BGR_CHANNELS: usize = 3;

/// Frame rate assumed when the device does not announce one.
pub const DEFAULT_FPS: u32 = 15;

/// Stream geometry, fixed for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BGR_CHANNELS
}

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// One decoded frame in BGR24 row-major order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Zero-based position of this frame within its session.
    pub sequence: u64,
}

impl RawFrame {
    /// Wrap decoded bytes. Returns `None` if the length does not match the geometry.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Option<Self> {
        if data.len() != frame_len(width, height) {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            sequence,
        })
    }

    /// Called by the decoder, which slices exactly one frame's worth of bytes.
    pub(crate) fn from_decoded(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        debug_assert_eq!(data.len(), frame_len(width, height));
        Self {
            data,
            width,
            height,
            sequence,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// BGR triple at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * BGR_CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Approximate luma (ITU-R BT.601 integer weights) at `(x, y)`.
    pub fn luma(&self, x: u32, y: u32) -> Option<u8> {
        let [b, g, r] = self.pixel(x, y)?;
        let y = (29 * b as u32 + 150 * g as u32 + 77 * r as u32) >> 8;
        Some(y as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_length() {
        assert!(RawFrame::new(vec![0u8; 299], 10, 10, 0).is_none());
        assert!(RawFrame::new(vec![0u8; 300], 10, 10, 0).is_some());
    }

    #[test]
    fn pixel_reads_bgr_order() {
        let mut data = vec![0u8; frame_len(2, 2)];
        // (1, 1) is the fourth pixel.
        data[9] = 10;
        data[10] = 20;
        data[11] = 30;
        let frame = RawFrame::new(data, 2, 2, 0).unwrap();
        assert_eq!(frame.pixel(1, 1), Some([10, 20, 30]));
        assert_eq!(frame.pixel(2, 0), None);
    }

    #[test]
    fn luma_of_white_is_saturated() {
        let frame = RawFrame::new(vec![255u8; 12], 2, 2, 0).unwrap();
        assert_eq!(frame.luma(0, 0), Some(255));
    }
}
