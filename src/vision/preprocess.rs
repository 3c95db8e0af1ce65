//! Image preprocessing: gamma, luma, Gaussian blur and adaptive threshold.
//!
//! Filtering is done on `f32` copies with imageproc's separable filter, which
//! clamps at the border, and rounded back to 8 bits.

use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use imageproc::filter::separable_filter_equal;

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Lookup table for gamma correction: `((i / 255) ^ (1 / gamma)) * 255`, truncated.
pub fn gamma_lut(gamma: f64) -> [u8; 256] {
    let inv = 1.0 / gamma.max(f64::EPSILON);
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = ((i as f64 / 255.0).powf(inv) * 255.0).clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Apply a gamma lookup table to every channel.
pub fn apply_lut(image: &RgbImage, lut: &[u8; 256]) -> RgbImage {
    let mut out = image.clone();
    for px in out.iter_mut() {
        *px = lut[*px as usize];
    }
    out
}

/// Gamma-correct an image.
pub fn adjust_gamma(image: &RgbImage, gamma: f64) -> RgbImage {
    apply_lut(image, &gamma_lut(gamma))
}

/// Luma channel, `Y = 0.299 R + 0.587 G + 0.114 B`.
pub fn luma(image: &RgbImage) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut out = GrayImage::new(w, h);
    for (src, dst) in image.pixels().zip(out.pixels_mut()) {
        let [r, g, b] = src.0;
        let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        *dst = Luma([y.round().clamp(0.0, 255.0) as u8]);
    }
    out
}

/// Normalised 1-D Gaussian kernel of odd length `size`.
///
/// A non-positive `sigma` is derived from the size as
/// `0.3 * ((size - 1) * 0.5 - 1) + 0.8`.
pub fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f32> {
    let size = size.max(1) | 1;
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let half = (size as f64 - 1.0) / 2.0;
    let scale = -0.5 / (sigma * sigma);
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - half;
            (scale * x * x).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| (v / sum) as f32).collect()
}

fn to_f32(image: &GrayImage) -> GrayF32 {
    GrayF32::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[0] as f32])
    })
}

fn round_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Gaussian blur with a square `size`×`size` kernel.
pub fn gaussian_blur(image: &GrayImage, size: usize, sigma: f64) -> GrayImage {
    let kernel = gaussian_kernel(size, sigma);
    let blurred = separable_filter_equal(&to_f32(image), &kernel);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([round_u8(blurred.get_pixel(x, y)[0])])
    })
}

/// Adaptive threshold against a Gaussian-weighted local mean.
///
/// A pixel becomes 255 when it is brighter than `mean - c` over a
/// `block_size` neighbourhood, 0 otherwise. Dark features therefore come
/// out black on a white background.
pub fn adaptive_threshold_gaussian(image: &GrayImage, block_size: usize, c: f64) -> GrayImage {
    let kernel = gaussian_kernel(block_size, 0.0);
    let means = separable_filter_equal(&to_f32(image), &kernel);
    let delta = c.ceil() as i32;
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let src = image.get_pixel(x, y)[0] as i32;
        let mean = round_u8(means.get_pixel(x, y)[0]) as i32;
        Luma([if src - mean > -delta { 255 } else { 0 }])
    })
}
