//! Feature detectors and detection results.

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::blob::detect_blobs;
use super::preprocess::{adaptive_threshold_gaussian, apply_lut, gamma_lut, gaussian_blur, luma};

/// Parameters of the nozzle detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// First threshold of the blob scan.
    pub min_threshold: f32,
    /// Scan stops before reaching this threshold.
    pub max_threshold: f32,
    pub threshold_step: f32,
    /// Minimum blob area in px².
    pub min_area: f64,
    /// Blobs at or above this area are rejected.
    pub max_area: f64,
    pub min_circularity: f64,
    /// Circularity used instead of `min_circularity` in loose mode.
    pub loose_circularity: f64,
    pub loose: bool,
    pub min_convexity: f64,
    pub min_inertia_ratio: f64,
    /// Blobs closer than this (px) across thresholds are the same blob.
    pub min_dist_between_blobs: f64,
    /// Number of thresholds a blob must appear at.
    pub min_repeatability: usize,
    pub gamma: f64,
    pub blur_size: usize,
    pub blur_sigma: f64,
    pub block_size: usize,
    /// Constant subtracted from the local mean in adaptive thresholding.
    pub threshold_offset: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_threshold: 1.0,
            max_threshold: 50.0,
            threshold_step: 1.0,
            min_area: 600.0,
            max_area: 5000.0,
            min_circularity: 0.8,
            loose_circularity: 0.3,
            loose: false,
            min_convexity: 0.3,
            min_inertia_ratio: 0.3,
            min_dist_between_blobs: 10.0,
            min_repeatability: 2,
            gamma: 1.2,
            blur_size: 7,
            blur_sigma: 6.0,
            block_size: 35,
            threshold_offset: 1.0,
        }
    }
}

impl DetectorConfig {
    /// Circularity bound in effect for the current mode.
    pub fn effective_circularity(&self) -> f64 {
        if self.loose {
            self.loose_circularity
        } else {
            self.min_circularity
        }
    }

    pub fn with_loose(mut self, loose: bool) -> Self {
        self.loose = loose;
        self
    }

    pub fn with_min_area(mut self, min_area: f64) -> Self {
        self.min_area = min_area;
        self
    }

    pub fn with_thresholds(mut self, min: f32, max: f32, step: f32) -> Self {
        self.min_threshold = min;
        self.max_threshold = max;
        self.threshold_step = step;
        self
    }
}

/// A single located feature, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl Detection {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self { x, y, radius }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U{:3.0} V{:3.0} R{:2.0}", self.x, self.y, self.radius)
    }
}

/// All candidates found in one frame. Iteration can be restarted freely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidates(Vec<Detection>);

impl Candidates {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self(detections)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Detection] {
        &self.0
    }

    /// Classify by count. Only [`DetectionOutcome::One`] may be acted on.
    pub fn classify(&self) -> DetectionOutcome {
        match self.0.as_slice() {
            [] => DetectionOutcome::None,
            [only] => DetectionOutcome::One(*only),
            many => DetectionOutcome::Many(many.len()),
        }
    }
}

impl FromIterator<Detection> for Candidates {
    fn from_iter<I: IntoIterator<Item = Detection>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Candidates {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Result of classifying a frame's candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionOutcome {
    /// Nothing found.
    None,
    /// Exactly one feature.
    One(Detection),
    /// Ambiguous: more than one feature (usually a dirty nozzle).
    Many(usize),
}

impl DetectionOutcome {
    pub fn detection(&self) -> Option<Detection> {
        match self {
            Self::One(d) => Some(*d),
            _ => None,
        }
    }
}

/// Candidates plus the processed image they were found in.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub candidates: Candidates,
    /// The binary or edge image the detector worked on, for previews.
    pub processed: GrayImage,
}

/// Locates circular features in a frame.
pub trait FeatureDetector: Send + Sync {
    /// Run the full pipeline and keep the intermediate image.
    fn analyze(&self, image: &RgbImage) -> Analysis;

    fn detect(&self, image: &RgbImage) -> Candidates {
        self.analyze(image).candidates
    }

    fn name(&self) -> &'static str;
}

/// Nozzle detector: gamma → luma → Gaussian blur → adaptive threshold →
/// blob scan.
#[derive(Debug, Clone)]
pub struct NozzleDetector {
    config: DetectorConfig,
    lut: [u8; 256],
}

impl NozzleDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let lut = gamma_lut(config.gamma);
        Self { config, lut }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Binary image the blob scan runs on: features black, background white.
    pub fn preprocess(&self, image: &RgbImage) -> GrayImage {
        let corrected = apply_lut(image, &self.lut);
        let gray = luma(&corrected);
        let blurred = gaussian_blur(&gray, self.config.blur_size, self.config.blur_sigma);
        adaptive_threshold_gaussian(&blurred, self.config.block_size, self.config.threshold_offset)
    }
}

impl Default for NozzleDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl FeatureDetector for NozzleDetector {
    fn analyze(&self, image: &RgbImage) -> Analysis {
        let processed = self.preprocess(image);
        let candidates = Candidates::new(detect_blobs(&processed, &self.config));
        Analysis {
            candidates,
            processed,
        }
    }

    fn name(&self) -> &'static str {
        "nozzle"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;

    /// White frame with dark discs of radius 16 at the given centres.
    fn synthetic_frame(width: u32, height: u32, centres: &[(i32, i32)]) -> RgbImage {
        let mut image = RgbImage::from_pixel(width, height, Rgb([250, 250, 250]));
        for &centre in centres {
            draw_filled_circle_mut(&mut image, centre, 16, Rgb([0, 0, 0]));
        }
        image
    }

    #[test]
    fn test_classify_counts() {
        assert_eq!(Candidates::empty().classify(), DetectionOutcome::None);

        let one = Candidates::new(vec![Detection::new(10.0, 20.0, 5.0)]);
        assert_eq!(
            one.classify(),
            DetectionOutcome::One(Detection::new(10.0, 20.0, 5.0))
        );

        let three: Candidates = (0..3).map(|i| Detection::new(i as f64, 0.0, 1.0)).collect();
        assert_eq!(three.classify(), DetectionOutcome::Many(3));
        // Restartable
        assert_eq!(three.iter().count(), 3);
        assert_eq!(three.iter().count(), 3);
    }

    #[test]
    fn test_loose_mode_circularity() {
        let config = DetectorConfig::default();
        assert_eq!(config.effective_circularity(), 0.8);
        assert_eq!(config.with_loose(true).effective_circularity(), 0.3);
    }

    #[test]
    fn test_detects_single_nozzle() {
        let frame = synthetic_frame(320, 240, &[(160, 120)]);
        let detector = NozzleDetector::default();
        match detector.detect(&frame).classify() {
            DetectionOutcome::One(d) => {
                assert!((d.x - 160.0).abs() < 1.0, "x = {}", d.x);
                assert!((d.y - 120.0).abs() < 1.0, "y = {}", d.y);
                assert!(d.radius > 10.0 && d.radius < 25.0, "r = {}", d.radius);
            }
            other => panic!("expected one detection, got {:?}", other),
        }
    }

    #[test]
    fn test_detects_two_nozzles_as_many() {
        let frame = synthetic_frame(320, 240, &[(80, 120), (240, 120)]);
        let detector = NozzleDetector::default();
        assert_eq!(detector.detect(&frame).classify(), DetectionOutcome::Many(2));
    }

    #[test]
    fn test_blank_frame_has_no_candidates() {
        let frame = synthetic_frame(320, 240, &[]);
        let detector = NozzleDetector::default();
        assert_eq!(detector.detect(&frame).classify(), DetectionOutcome::None);
    }
}
