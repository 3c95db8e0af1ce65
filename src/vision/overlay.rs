//! Annotated preview frames.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut, draw_line_segment_mut, draw_text_mut};
use std::path::Path;

use super::detector::{Analysis, DetectionOutcome};

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const MAGENTA: Rgb<u8> = Rgb([255, 0, 255]);

/// Half-length of the crosshair arms in pixels.
const CROSSHAIR_ARM: f32 = 25.0;

/// Optional font for captions.
pub struct OverlayFont {
    font: FontVec,
}

impl OverlayFont {
    /// Load a TrueType/OpenType font from disk.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(Self { font })
    }
}

/// What to draw on previews.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayOptions {
    pub crosshair: bool,
    /// Show the detector's processed image instead of the camera frame.
    pub xray: bool,
}

/// Green crosshair at the frame centre.
pub fn draw_crosshair(image: &mut RgbImage) {
    let cx = (image.width() as f32 / 2.0).round();
    let cy = (image.height() as f32 / 2.0).round();
    draw_line_segment_mut(image, (cx, cy - CROSSHAIR_ARM), (cx, cy + CROSSHAIR_ARM), GREEN);
    draw_line_segment_mut(image, (cx - CROSSHAIR_ARM, cy), (cx + CROSSHAIR_ARM, cy), GREEN);
}

fn draw_marker(image: &mut RgbImage, x: f64, y: f64, radius: f64, color: Rgb<u8>) {
    let centre = (x.round() as i32, y.round() as i32);
    draw_hollow_circle_mut(image, centre, radius.round().max(1.0) as i32, color);
    draw_filled_circle_mut(image, centre, 2, color);
}

fn caption(outcome: &DetectionOutcome) -> String {
    match outcome {
        DetectionOutcome::None => "No circles found".to_string(),
        DetectionOutcome::Many(n) => format!("Too many circles found {}", n),
        DetectionOutcome::One(d) => d.to_string(),
    }
}

/// Build a preview for one analysed frame.
///
/// A single detection is outlined in red, ambiguous candidates in white.
/// Captions are drawn only when a font is supplied.
pub fn render_preview(
    frame: &RgbImage,
    analysis: &Analysis,
    options: OverlayOptions,
    font: Option<&OverlayFont>,
) -> RgbImage {
    let mut out = if options.xray {
        image::DynamicImage::ImageLuma8(analysis.processed.clone()).to_rgb8()
    } else {
        frame.clone()
    };

    if options.crosshair {
        draw_crosshair(&mut out);
    }

    let outcome = analysis.candidates.classify();
    let color = match outcome {
        DetectionOutcome::One(_) => RED,
        _ => WHITE,
    };
    for d in analysis.candidates.iter() {
        draw_marker(&mut out, d.x, d.y, d.radius, color);
    }

    if let Some(font) = font {
        let scale = if out.width() > 640 { 32.0 } else { 20.0 };
        let y = (out.height() as i32 - 3 * scale as i32).max(0);
        draw_text_mut(
            &mut out,
            MAGENTA,
            8,
            y,
            PxScale::from(scale),
            &font.font,
            &caption(&outcome),
        );
    }
    out
}
