//! Camera frame acquisition.
//!
//! A [`FrameSource`] produces raw images. [`FrameFeed`] owns the source on a
//! spawned task, applies software adjustments, freezes the resolution for the
//! session and publishes the most recent frame.

mod adjust;
mod feed;
mod frame;
mod source;

use thiserror::Error;

pub use adjust::{CameraAdjustments, CameraProperty};
pub use feed::{FeedConfig, FrameFeed};
pub use frame::Frame;
pub use source::{FrameSource, SnapshotSource, StillSource};

/// Camera errors.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to read frame: {0}")]
    ReadFailed(String),
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Property {0} cannot be set on this source")]
    UnsupportedProperty(CameraProperty),
    #[error("Frame feed has stopped")]
    Closed,
}
