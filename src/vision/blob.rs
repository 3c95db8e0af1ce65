//! Contour-based blob finder with a threshold scan.
//!
//! Dark regions are extracted at each threshold of the scan, filtered by
//! area, circularity, inertia ratio and convexity, and grouped across
//! thresholds. A group seen at enough thresholds becomes a detection.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::{self, ThresholdType};
use imageproc::geometry::{arc_length, convex_hull};
use imageproc::point::Point;
use std::f64::consts::PI;

use super::detector::{Detection, DetectorConfig};

/// Spatial and central moments of a closed polygon.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolygonMoments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
    pub m20: f64,
    pub m11: f64,
    pub m02: f64,
}

impl PolygonMoments {
    /// Moments of the polygon through `points` (Green's theorem).
    /// Orientation does not matter; the area is always non-negative.
    pub fn of(points: &[Point<i32>]) -> Self {
        let n = points.len();
        if n < 3 {
            return Self::default();
        }
        let (mut a00, mut a10, mut a01, mut a20, mut a11, mut a02) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..n {
            let p0 = points[(i + n - 1) % n];
            let p1 = points[i];
            let (x0, y0) = (p0.x as f64, p0.y as f64);
            let (x1, y1) = (p1.x as f64, p1.y as f64);
            let dxy = x0 * y1 - x1 * y0;
            let xs = x0 + x1;
            let ys = y0 + y1;
            a00 += dxy;
            a10 += dxy * xs;
            a01 += dxy * ys;
            a20 += dxy * (x0 * xs + x1 * x1);
            a11 += dxy * (x0 * (ys + y0) + x1 * (ys + y1));
            a02 += dxy * (y0 * ys + y1 * y1);
        }
        let sign = if a00 < 0.0 { -1.0 } else { 1.0 };
        Self {
            m00: sign * a00 / 2.0,
            m10: sign * a10 / 6.0,
            m01: sign * a01 / 6.0,
            m20: sign * a20 / 12.0,
            m11: sign * a11 / 24.0,
            m02: sign * a02 / 12.0,
        }
    }

    pub fn area(&self) -> f64 {
        self.m00
    }

    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.m00.abs() < f64::EPSILON {
            return None;
        }
        Some((self.m10 / self.m00, self.m01 / self.m00))
    }

    /// Ratio of the smallest to the largest principal moment of inertia.
    /// 1 for a circle, approaching 0 for a line.
    pub fn inertia_ratio(&self) -> f64 {
        let Some((cx, cy)) = self.centroid() else {
            return 0.0;
        };
        let mu20 = self.m20 - self.m10 * cx;
        let mu11 = self.m11 - self.m10 * cy;
        let mu02 = self.m02 - self.m01 * cy;

        let denominator = ((2.0 * mu11).powi(2) + (mu20 - mu02).powi(2)).sqrt();
        if denominator <= 1e-2 {
            return 1.0;
        }
        let cos_min = (mu20 - mu02) / denominator;
        let sin_min = 2.0 * mu11 / denominator;
        let i_min = 0.5 * (mu20 + mu02) - 0.5 * (mu20 - mu02) * cos_min - mu11 * sin_min;
        let i_max = 0.5 * (mu20 + mu02) + 0.5 * (mu20 - mu02) * cos_min + mu11 * sin_min;
        if i_max <= 0.0 {
            return 0.0;
        }
        i_min / i_max
    }
}

/// A blob found at a single threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Blob {
    x: f64,
    y: f64,
    radius: f64,
    confidence: f64,
}

/// Foreground (255) where the pixel is at or below `threshold`.
pub fn binarize_dark(gray: &GrayImage, threshold: f32) -> GrayImage {
    let level = threshold.floor().clamp(0.0, 255.0) as u8;
    contrast::threshold(gray, level, ThresholdType::BinaryInverted)
}

fn touches_border(contour: &Contour<i32>, width: u32, height: u32) -> bool {
    let (w, h) = (width as i32, height as i32);
    contour
        .points
        .iter()
        .any(|p| p.x <= 0 || p.y <= 0 || p.x >= w - 1 || p.y >= h - 1)
}

fn median_distance(points: &[Point<i32>], cx: f64, cy: f64) -> f64 {
    let mut distances: Vec<f64> = points
        .iter()
        .map(|p| (p.x as f64 - cx).hypot(p.y as f64 - cy))
        .collect();
    distances.sort_by(|a, b| a.total_cmp(b));
    let n = distances.len();
    (distances[(n - 1) / 2] + distances[n / 2]) / 2.0
}

/// Blobs in a binary image where features are foreground.
fn find_blobs(foreground: &GrayImage, config: &DetectorConfig) -> Vec<Blob> {
    let (width, height) = foreground.dimensions();
    let contours: Vec<Contour<i32>> = find_contours(foreground);
    let min_circularity = config.effective_circularity();
    let mut blobs = Vec::new();

    for contour in contours
        .iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer))
    {
        if contour.points.len() < 3 || touches_border(contour, width, height) {
            continue;
        }

        let moments = PolygonMoments::of(&contour.points);
        let area = moments.area();
        if area < config.min_area || area >= config.max_area {
            continue;
        }

        let perimeter = arc_length(&contour.points, true);
        if perimeter <= 0.0 {
            continue;
        }
        let circularity = 4.0 * PI * area / (perimeter * perimeter);
        if circularity < min_circularity {
            continue;
        }

        let inertia = moments.inertia_ratio();
        if inertia < config.min_inertia_ratio {
            continue;
        }

        let hull = convex_hull(contour.points.as_slice());
        let hull_area = PolygonMoments::of(&hull).area();
        if hull_area <= 0.0 || area / hull_area < config.min_convexity {
            continue;
        }

        let Some((cx, cy)) = moments.centroid() else {
            continue;
        };
        let (px, py) = (cx.round() as i64, cy.round() as i64);
        if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
            continue;
        }
        if foreground.get_pixel(px as u32, py as u32)[0] == 0 {
            continue;
        }

        blobs.push(Blob {
            x: cx,
            y: cy,
            radius: median_distance(&contour.points, cx, cy),
            confidence: inertia * inertia,
        });
    }
    blobs
}

/// Scan thresholds over a grayscale image and return repeatable dark blobs.
pub fn detect_blobs(gray: &GrayImage, config: &DetectorConfig) -> Vec<Detection> {
    let mut present = [false; 256];
    for px in gray.pixels() {
        present[px[0] as usize] = true;
    }

    let step = if config.threshold_step > 0.0 {
        config.threshold_step
    } else {
        1.0
    };

    let mut groups: Vec<Vec<Blob>> = Vec::new();
    let mut cached: Option<(usize, Vec<Blob>)> = None;
    let mut threshold = config.min_threshold;

    while threshold < config.max_threshold {
        // Identical binary images give identical blobs; only recompute when a
        // new grey level falls under the threshold.
        let level = present
            .iter()
            .enumerate()
            .filter(|(v, p)| **p && *v as f32 <= threshold)
            .count();
        let current = match &cached {
            Some((cached_level, blobs)) if *cached_level == level => blobs.clone(),
            _ => {
                let blobs = find_blobs(&binarize_dark(gray, threshold), config);
                cached = Some((level, blobs.clone()));
                blobs
            }
        };

        let mut fresh = Vec::new();
        for blob in current {
            let existing = groups.iter_mut().find(|group| {
                let mid = group[group.len() / 2];
                let dist = (mid.x - blob.x).hypot(mid.y - blob.y);
                dist < config.min_dist_between_blobs || dist < mid.radius || dist < blob.radius
            });
            match existing {
                Some(group) => {
                    let at = group.partition_point(|b| b.radius < blob.radius);
                    group.insert(at, blob);
                }
                None => fresh.push(vec![blob]),
            }
        }
        groups.extend(fresh);
        threshold += step;
    }

    groups
        .into_iter()
        .filter(|group| group.len() >= config.min_repeatability.max(1))
        .map(|group| {
            let weight: f64 = group.iter().map(|b| b.confidence).sum();
            let (x, y) = if weight > 0.0 {
                (
                    group.iter().map(|b| b.x * b.confidence).sum::<f64>() / weight,
                    group.iter().map(|b| b.y * b.confidence).sum::<f64>() / weight,
                )
            } else {
                let n = group.len() as f64;
                (
                    group.iter().map(|b| b.x).sum::<f64>() / n,
                    group.iter().map(|b| b.y).sum::<f64>() / n,
                )
            };
            Detection::new(x, y, group[group.len() / 2].radius)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;

    fn square(x: i32, y: i32, side: i32) -> Vec<Point<i32>> {
        vec![
            Point::new(x, y),
            Point::new(x + side, y),
            Point::new(x + side, y + side),
            Point::new(x, y + side),
        ]
    }

    #[test]
    fn test_square_moments() {
        let m = PolygonMoments::of(&square(0, 0, 10));
        assert_relative_eq!(m.area(), 100.0);
        let (cx, cy) = m.centroid().unwrap();
        assert_relative_eq!(cx, 5.0);
        assert_relative_eq!(cy, 5.0);
        assert_relative_eq!(m.inertia_ratio(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_orientation_does_not_change_area() {
        let mut points = square(3, 4, 6);
        points.reverse();
        assert_relative_eq!(PolygonMoments::of(&points).area(), 36.0);
    }

    #[test]
    fn test_rectangle_inertia_ratio() {
        let rect = vec![
            Point::new(0, 0),
            Point::new(40, 0),
            Point::new(40, 10),
            Point::new(0, 10),
        ];
        assert_relative_eq!(PolygonMoments::of(&rect).inertia_ratio(), 1.0 / 16.0, epsilon = 1e-9);
    }

    #[test]
    fn test_binarize_dark_includes_the_threshold_level() {
        let gray = GrayImage::from_fn(4, 1, |x, _| Luma([[49u8, 50, 51, 200][x as usize]]));
        let binary = binarize_dark(&gray, 50.0);
        let values: Vec<u8> = binary.pixels().map(|p| p[0]).collect();
        assert_eq!(values, vec![255, 255, 0, 0]);

        let fractional = binarize_dark(&gray, 50.9);
        assert_eq!(fractional.get_pixel(1, 0)[0], 255);
        assert_eq!(fractional.get_pixel(2, 0)[0], 0);
    }

    fn white(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255]))
    }

    #[test]
    fn test_single_disc() {
        let mut gray = white(200, 200);
        draw_filled_circle_mut(&mut gray, (90, 110), 20, Luma([0]));
        let found = detect_blobs(&gray, &DetectorConfig::default());
        assert_eq!(found.len(), 1);
        assert!((found[0].x - 90.0).abs() < 0.5);
        assert!((found[0].y - 110.0).abs() < 0.5);
        assert!((found[0].radius - 20.0).abs() < 2.0);
    }

    #[test]
    fn test_elongated_blob_is_rejected() {
        let mut gray = white(300, 200);
        draw_filled_rect_mut(&mut gray, Rect::at(50, 90).of_size(160, 12), Luma([0]));
        assert!(detect_blobs(&gray, &DetectorConfig::default()).is_empty());
    }

    #[test]
    fn test_blob_touching_border_is_ignored() {
        let mut gray = white(200, 200);
        draw_filled_circle_mut(&mut gray, (0, 100), 25, Luma([0]));
        assert!(detect_blobs(&gray, &DetectorConfig::default()).is_empty());
    }

    #[test]
    fn test_small_blob_below_min_area() {
        let mut gray = white(200, 200);
        draw_filled_circle_mut(&mut gray, (100, 100), 8, Luma([0]));
        assert!(detect_blobs(&gray, &DetectorConfig::default()).is_empty());
    }

    #[test]
    fn test_repeatability_requires_several_thresholds() {
        let mut gray = white(200, 200);
        draw_filled_circle_mut(&mut gray, (100, 100), 20, Luma([0]));
        let single = DetectorConfig::default().with_thresholds(1.0, 2.0, 1.0);
        assert!(detect_blobs(&gray, &single).is_empty());
    }
}
