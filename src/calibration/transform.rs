//! Quadratic pixel → machine transform fitted by least squares.

use nalgebra::{DMatrix, Matrix6x2, Vector2, Vector6};
use thiserror::Error;

/// Minimum number of samples that determine all six coefficients.
pub const MIN_SAMPLES: usize = 6;

/// Positions closer than this (normalised units) count as the same point.
const DISTINCT_EPSILON: f64 = 1e-9;

/// Errors from fitting a transform.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Not enough distinct calibration points: {distinct} of {samples} samples")]
    Degenerate { samples: usize, distinct: usize },
    #[error("Least-squares solve failed: {0}")]
    SolveFailed(String),
    #[error("Calibration sample recorded in state {0}")]
    UnexpectedSample(String),
    #[error("Transform requested before all samples were collected")]
    Incomplete,
}

/// One calibration observation: where the machine was and where the feature
/// appeared in normalised frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    pub machine: (f64, f64),
    pub pixel: (f64, f64),
}

impl CalibrationSample {
    pub fn new(machine: (f64, f64), pixel: (f64, f64)) -> Self {
        Self { machine, pixel }
    }
}

/// Feature vector `[x², y², xy, x, y, 1]`.
pub fn features(x: f64, y: f64) -> Vector6<f64> {
    Vector6::new(x * x, y * y, x * y, x, y, 1.0)
}

/// Maps a normalised pixel position to the machine XY at which the feature
/// would appear there.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformMatrix {
    coefficients: Matrix6x2<f64>,
    residual: f64,
}

impl TransformMatrix {
    pub fn from_coefficients(coefficients: Matrix6x2<f64>) -> Self {
        Self {
            coefficients,
            residual: 0.0,
        }
    }

    /// Fit against the samples with an SVD least-squares solve.
    ///
    /// Rank deficiency is tolerated (minimum-norm solution) but fewer than
    /// two distinct pixel positions is rejected.
    pub fn fit(samples: &[CalibrationSample]) -> Result<Self, FitError> {
        let distinct = count_distinct(samples);
        if distinct < 2 {
            return Err(FitError::Degenerate {
                samples: samples.len(),
                distinct,
            });
        }

        let n = samples.len();
        let design = DMatrix::from_fn(n, 6, |r, c| {
            let (x, y) = samples[r].pixel;
            features(x, y)[c]
        });
        let targets = DMatrix::from_fn(n, 2, |r, c| {
            let (x, y) = samples[r].machine;
            if c == 0 {
                x
            } else {
                y
            }
        });

        let svd = design.clone().svd(true, true);
        let largest = svd.singular_values.max();
        let eps = f64::EPSILON * n.max(6) as f64 * largest;
        let solution = svd
            .solve(&targets, eps)
            .map_err(|e| FitError::SolveFailed(e.to_string()))?;
        if solution.iter().any(|v| !v.is_finite()) {
            return Err(FitError::SolveFailed("non-finite coefficients".to_string()));
        }
        let coefficients = Matrix6x2::from_iterator(solution.iter().copied());

        let errors = &design * &solution - &targets;
        let residual = if n > MIN_SAMPLES {
            (0..2)
                .map(|c| errors.column(c).iter().map(|e| e * e).sum::<f64>())
                .sum::<f64>()
                / 2.0
        } else {
            0.0
        };

        Ok(Self {
            coefficients,
            residual,
        })
    }

    pub fn coefficients(&self) -> &Matrix6x2<f64> {
        &self.coefficients
    }

    /// Mean over both axes of the summed squared fit error. Zero when the
    /// fit is exactly determined.
    pub fn residual(&self) -> f64 {
        self.residual
    }

    /// Evaluate at a normalised pixel position.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let out: Vector2<f64> = self.coefficients.transpose() * features(x, y);
        (out[0], out[1])
    }

    /// Machine XY that puts the feature at the frame centre.
    pub fn camera_center(&self) -> (f64, f64) {
        self.apply(0.0, 0.0)
    }

    /// Relative move that brings a feature seen at `(x, y)` a fraction
    /// `gain` of the way to the centre. The constant term is dropped, so
    /// this is a displacement rather than a position.
    pub fn correction(&self, x: f64, y: f64, gain: f64) -> (f64, f64) {
        let mut f = features(x, y);
        f[5] = 0.0;
        let out: Vector2<f64> = self.coefficients.transpose() * f;
        (-gain * out[0], -gain * out[1])
    }
}

fn count_distinct(samples: &[CalibrationSample]) -> usize {
    let mut seen: Vec<(f64, f64)> = Vec::with_capacity(samples.len());
    for s in samples {
        let (x, y) = s.pixel;
        let duplicate = seen
            .iter()
            .any(|&(sx, sy)| (sx - x).abs() < DISTINCT_EPSILON && (sy - y).abs() < DISTINCT_EPSILON);
        if !duplicate {
            seen.push((x, y));
        }
    }
    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ground truth: machine = A · pixel + b.
    fn ground_truth(x: f64, y: f64) -> (f64, f64) {
        (100.0 + 42.0 * x - 3.5 * y, 50.0 + 2.5 * x + 39.0 * y)
    }

    fn samples_with_noise() -> Vec<CalibrationSample> {
        let mut pixels = vec![(0.02, -0.03)];
        for i in 0..10 {
            let a = i as f64 * std::f64::consts::TAU / 10.0;
            pixels.push((0.02 + 0.012 * a.sin(), -0.03 + 0.012 * a.cos()));
        }
        pixels
            .into_iter()
            .enumerate()
            .map(|(i, (x, y))| {
                let (mx, my) = ground_truth(x, y);
                let noise = 0.0005 * ((i as f64) * 1.7).sin();
                CalibrationSample::new((mx + noise, my - noise), (x, y))
            })
            .collect()
    }

    #[test]
    fn test_fit_reproduces_affine_ground_truth() {
        let transform = TransformMatrix::fit(&samples_with_noise()).unwrap();
        for &(x, y) in &[(0.02, -0.03), (0.025, -0.025), (0.015, -0.035)] {
            let (ex, ey) = ground_truth(x, y);
            let (fx, fy) = transform.apply(x, y);
            assert!((fx - ex).abs() < 0.01, "x: {} vs {}", fx, ex);
            assert!((fy - ey).abs() < 0.01, "y: {} vs {}", fy, ey);
        }
        assert!(transform.residual() < 1e-4, "residual {}", transform.residual());
    }

    #[test]
    fn test_camera_center_and_correction() {
        let mut m = Matrix6x2::zeros();
        // machine_x = 10 + 40 x, machine_y = 20 + 30 y
        m[(3, 0)] = 40.0;
        m[(5, 0)] = 10.0;
        m[(4, 1)] = 30.0;
        m[(5, 1)] = 20.0;
        let transform = TransformMatrix::from_coefficients(m);
        assert_eq!(transform.camera_center(), (10.0, 20.0));

        let (dx, dy) = transform.correction(0.1, -0.2, 0.5);
        assert!((dx - -2.0).abs() < 1e-12);
        assert!((dy - 3.0).abs() < 1e-12);
        assert_eq!(transform.correction(0.0, 0.0, 0.55), (-0.0, -0.0));
    }

    #[test]
    fn test_single_point_is_degenerate() {
        let samples = vec![CalibrationSample::new((1.0, 1.0), (0.1, 0.1)); 11];
        assert_eq!(
            TransformMatrix::fit(&samples),
            Err(FitError::Degenerate {
                samples: 11,
                distinct: 1
            })
        );
    }
}
