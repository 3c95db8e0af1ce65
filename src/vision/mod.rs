//! Feature detection on camera frames.

pub mod blob;
mod detector;
mod endstop;
pub mod overlay;
pub mod preprocess;

pub use detector::{
    Analysis, Candidates, Detection, DetectionOutcome, DetectorConfig, FeatureDetector,
    NozzleDetector,
};
pub use endstop::EndstopDetector;
pub use overlay::{render_preview, OverlayFont, OverlayOptions};
