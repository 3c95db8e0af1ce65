//! A captured camera frame.

use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;

/// One camera image with its capture time and sequence number.
///
/// The pixel buffer is shared, so cloning a frame is cheap.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    captured_at: Instant,
    sequence: u64,
}

impl Frame {
    /// Create a frame. `captured_at` is the instant the read was started,
    /// so a frame captured after a move completed never shows the carriage
    /// mid-move.
    pub fn new(image: RgbImage, captured_at: Instant, sequence: u64) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
            sequence,
        }
    }

    /// Frame stamped with the current time.
    pub fn now(image: RgbImage, sequence: u64) -> Self {
        Self::new(image, Instant::now(), sequence)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Shared handle to the pixels, for moving into blocking tasks.
    pub fn shared_image(&self) -> Arc<RgbImage> {
        Arc::clone(&self.image)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
