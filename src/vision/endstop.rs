//! Endstop fixture detector used to auto-capture the controlled point.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::edges::canny;
use imageproc::morphology::dilate;

use super::blob::PolygonMoments;
use super::detector::{Analysis, Candidates, Detection, FeatureDetector};
use super::preprocess::{gaussian_blur, luma};

/// Finds the endstop as the dominant closed outline in the frame.
///
/// Edges are found with Canny, thickened, filled, thickened again and the
/// largest resulting region is reported. Regions nested inside another
/// outline are preferred when present.
#[derive(Debug, Clone)]
pub struct EndstopDetector {
    pub blur_size: usize,
    pub blur_sigma: f64,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Dilation radius applied to the edge map (three 5×5 passes).
    pub edge_dilation: u8,
    /// Dilation radius applied to the filled regions (two 5×5 passes).
    pub fill_dilation: u8,
    /// Regions smaller than this (px²) are ignored.
    pub min_area: f64,
}

impl Default for EndstopDetector {
    fn default() -> Self {
        Self {
            blur_size: 9,
            blur_sigma: 3.0,
            canny_low: 50.0,
            canny_high: 190.0,
            edge_dilation: 6,
            fill_dilation: 4,
            min_area: 100.0,
        }
    }
}

fn fill_contours(contours: &[Contour<i32>], width: u32, height: u32) -> GrayImage {
    let mut filled = GrayImage::new(width, height);
    for contour in contours {
        let points = &contour.points;
        if points.len() < 3 || points.first() == points.last() {
            continue;
        }
        draw_polygon_mut(&mut filled, points, Luma([255]));
    }
    filled
}

impl EndstopDetector {
    fn locate(&self, regions: &GrayImage) -> Option<Detection> {
        let contours: Vec<Contour<i32>> = find_contours(regions);
        let nested: Vec<&Contour<i32>> = contours.iter().filter(|c| c.parent.is_some()).collect();
        let pool: Vec<&Contour<i32>> = if nested.is_empty() {
            contours
                .iter()
                .filter(|c| matches!(c.border_type, BorderType::Outer))
                .collect()
        } else {
            nested
        };

        pool.into_iter()
            .map(|c| (c, PolygonMoments::of(&c.points)))
            .filter(|(_, m)| m.area() >= self.min_area)
            .max_by(|(_, a), (_, b)| a.area().total_cmp(&b.area()))
            .and_then(|(_, m)| {
                let (x, y) = m.centroid()?;
                Some(Detection::new(x, y, (m.area() / std::f64::consts::PI).sqrt()))
            })
    }
}

impl FeatureDetector for EndstopDetector {
    fn analyze(&self, image: &RgbImage) -> Analysis {
        let (width, height) = image.dimensions();
        let gray = gaussian_blur(&luma(image), self.blur_size, self.blur_sigma);
        let edges = dilate(
            &canny(&gray, self.canny_low, self.canny_high),
            Norm::LInf,
            self.edge_dilation,
        );
        let outlines: Vec<Contour<i32>> = find_contours(&edges);
        let regions = dilate(
            &fill_contours(&outlines, width, height),
            Norm::LInf,
            self.fill_dilation,
        );

        let candidates = match self.locate(&regions) {
            Some(detection) => Candidates::new(vec![detection]),
            None => Candidates::empty(),
        };
        Analysis {
            candidates,
            processed: regions,
        }
    }

    fn name(&self) -> &'static str {
        "endstop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::DetectionOutcome;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;

    #[test]
    fn test_finds_round_endstop() {
        let mut image = RgbImage::from_pixel(320, 240, Rgb([230, 230, 230]));
        draw_filled_circle_mut(&mut image, (170, 110), 40, Rgb([30, 30, 30]));
        match EndstopDetector::default().detect(&image).classify() {
            DetectionOutcome::One(d) => {
                assert!((d.x - 170.0).abs() < 2.0, "x = {}", d.x);
                assert!((d.y - 110.0).abs() < 2.0, "y = {}", d.y);
            }
            other => panic!("expected endstop, got {:?}", other),
        }
    }

    #[test]
    fn test_featureless_frame() {
        let image = RgbImage::from_pixel(160, 120, Rgb([128, 128, 128]));
        assert!(EndstopDetector::default().detect(&image).is_empty());
    }
}
