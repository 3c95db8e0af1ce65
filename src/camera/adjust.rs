//! Software image adjustments for sources without hardware controls.

use image::{imageops, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Adjustable camera properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraProperty {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

impl fmt::Display for CameraProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Brightness => "brightness",
            Self::Contrast => "contrast",
            Self::Saturation => "saturation",
            Self::Hue => "hue",
        };
        write!(f, "{}", name)
    }
}

/// Current adjustment values. All-zero is the identity.
///
/// * `brightness`: added to every channel, -255..=255
/// * `contrast`: percentage change, negative reduces
/// * `saturation`: percentage change, -100 is greyscale
/// * `hue`: rotation in degrees
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraAdjustments {
    pub brightness: i32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: i32,
}

impl CameraAdjustments {
    pub fn set(&mut self, property: CameraProperty, value: f32) {
        match property {
            CameraProperty::Brightness => self.brightness = value.round().clamp(-255.0, 255.0) as i32,
            CameraProperty::Contrast => self.contrast = value,
            CameraProperty::Saturation => self.saturation = value.max(-100.0),
            CameraProperty::Hue => self.hue = value.round() as i32,
        }
    }

    pub fn get(&self, property: CameraProperty) -> f32 {
        match property {
            CameraProperty::Brightness => self.brightness as f32,
            CameraProperty::Contrast => self.contrast,
            CameraProperty::Saturation => self.saturation,
            CameraProperty::Hue => self.hue as f32,
        }
    }

    /// Restore defaults.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the adjustments, returning the input untouched when there are none.
    pub fn apply(&self, image: RgbImage) -> RgbImage {
        if self.is_identity() {
            return image;
        }
        let mut out = image;
        if self.brightness != 0 {
            out = imageops::colorops::brighten(&out, self.brightness);
        }
        if self.contrast != 0.0 {
            out = imageops::colorops::contrast(&out, self.contrast);
        }
        if self.saturation != 0.0 {
            saturate(&mut out, 1.0 + self.saturation / 100.0);
        }
        if self.hue != 0 {
            out = imageops::colorops::huerotate(&out, self.hue);
        }
        out
    }
}

/// Scale each pixel's distance from its grey value by `factor`.
fn saturate(image: &mut RgbImage, factor: f32) {
    for Rgb(px) in image.pixels_mut() {
        let grey = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
        for c in px.iter_mut() {
            *c = (grey + (*c as f32 - grey) * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}
