use crate::error::{Result, TrapcamError};
use image::GrayImage;
use std::sync::Arc;
use std::time::SystemTime;

/// A single captured grayscale frame.
///
/// Frames are immutable once emitted: the pixel payload is reference counted
/// so the pre-roll buffer, the detector's delay window and an open recording
/// session can all retain the same frame without copying or aliasing hazards.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing sequence index assigned by the source
    pub seq: u64,
    /// Timestamp when the frame was captured
    pub timestamp: SystemTime,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Luma8 pixel data, row-major (shared ownership for efficiency)
    pub data: Arc<Vec<u8>>,
}

impl Frame {
    pub fn new(seq: u64, timestamp: SystemTime, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            seq,
            timestamp,
            width,
            height,
            data: Arc::new(data),
        }
    }

    /// Expected payload length for the frame dimensions
    pub fn expected_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Validate payload length against the frame dimensions
    pub fn validate_size(&self) -> bool {
        self.data.len() == self.expected_size()
    }

    /// View the frame as an owned `GrayImage` for analysis.
    ///
    /// The pixel data is copied; analysis operates on its own buffers and
    /// never mutates emitted frames.
    pub fn to_gray_image(&self) -> Result<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data.as_ref().clone()).ok_or_else(
            || {
                TrapcamError::invalid_frame(format!(
                    "frame {} payload of {} bytes does not match {}x{}",
                    self.seq,
                    self.data.len(),
                    self.width,
                    self.height
                ))
            },
        )
    }

    /// Build a frame from a rendered grayscale image, reusing the sequence
    /// number and timestamp of a template frame.
    pub fn from_gray_image(template: &Frame, image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            seq: template.seq,
            timestamp: template.timestamp,
            width,
            height,
            data: Arc::new(image.into_raw()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation_and_size() {
        let frame = Frame::new(7, SystemTime::now(), vec![0u8; 640 * 480], 640, 480);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.expected_size(), 640 * 480);
        assert!(frame.validate_size());
    }

    #[test]
    fn test_size_mismatch_detected() {
        let frame = Frame::new(1, SystemTime::now(), vec![0u8; 100], 640, 480);
        assert!(!frame.validate_size());
        assert!(frame.to_gray_image().is_err());
    }

    #[test]
    fn test_gray_image_round_trip() {
        let data: Vec<u8> = (0..16).collect();
        let frame = Frame::new(3, SystemTime::now(), data.clone(), 4, 4);
        let image = frame.to_gray_image().unwrap();
        assert_eq!(image.dimensions(), (4, 4));

        let rebuilt = Frame::from_gray_image(&frame, image);
        assert_eq!(rebuilt.seq, 3);
        assert_eq!(rebuilt.data.as_ref(), &data);
    }
}
