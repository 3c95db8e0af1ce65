//! Pixel ↔ normalised frame coordinates.
//!
//! Normalised coordinates put the frame centre at `(0, 0)` and the edges at
//! `±0.5`, independent of resolution. Calibration and convergence must use
//! the same [`FrameGeometry`]; the feed freezes resolution for that reason.

use serde::{Deserialize, Serialize};

/// Frame size a calibration session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn from_resolution((width, height): (u32, u32)) -> Self {
        Self::new(width, height)
    }

    /// Pixel position → normalised position.
    pub fn normalize(&self, x: f64, y: f64) -> (f64, f64) {
        normalize(*self, x, y)
    }

    /// Normalised position → pixel position.
    pub fn denormalize(&self, x: f64, y: f64) -> (f64, f64) {
        denormalize(*self, x, y)
    }

    /// Frame centre in pixels.
    pub fn center(&self) -> (f64, f64) {
        self.denormalize(0.0, 0.0)
    }
}

/// `(x / width - 0.5, y / height - 0.5)`.
pub fn normalize(geometry: FrameGeometry, x: f64, y: f64) -> (f64, f64) {
    (
        x / geometry.width as f64 - 0.5,
        y / geometry.height as f64 - 0.5,
    )
}

pub fn denormalize(geometry: FrameGeometry, x: f64, y: f64) -> (f64, f64) {
    (
        (x + 0.5) * geometry.width as f64,
        (y + 0.5) * geometry.height as f64,
    )
}
