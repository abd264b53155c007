//! Raw video frame types for the ingest pipeline

use std::sync::Arc;

/// Decoded video frame delivered by the transport layer
///
/// This is the unit that flows from the transport callback into the frame pipe and on to
/// the encoder's input pipe. The pixel buffer is shared through `Arc` so handing it over
/// never copies the plane data.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Pixel data in the encoder's declared input format (planar I420 by default)
    pub data: Arc<[u8]>,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,
}

impl RawFrame {
    /// Create a new raw frame
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data: data.into(), width, height }
    }

    /// Create a blank I420 frame of the given dimensions
    pub fn blank_i420(width: u32, height: u32) -> Self {
        Self::new(vec![0u8; i420_frame_len(width, height)], width, height)
    }

    /// Size of the pixel buffer in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the pixel buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A frame that has passed decimation, stamped with its arrival sequence number
///
/// Sequence numbers count every frame handed to the pipe, including decimated ones, so
/// the numbers seen by the encoder are strictly increasing but not contiguous.
#[derive(Debug, Clone)]
pub struct SequencedFrame {
    /// Arrival sequence number (1-based)
    pub seq: u64,

    /// The frame itself
    pub frame: RawFrame,
}

/// Byte length of an I420 frame: a full luma plane plus two quarter-size chroma planes
pub fn i420_frame_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    w * h + 2 * chroma
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_lengths() {
        assert_eq!(i420_frame_len(640, 360), 640 * 360 * 3 / 2);
        // Odd dimensions round the chroma planes up
        assert_eq!(i420_frame_len(3, 3), 9 + 2 * 4);
        assert_eq!(RawFrame::blank_i420(4, 2).len(), 12);
    }

    #[test]
    fn clone_shares_pixel_data() {
        let frame = RawFrame::new(vec![1, 2, 3], 1, 1);
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.data, &copy.data));
    }
}
