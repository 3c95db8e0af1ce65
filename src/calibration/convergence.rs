//! Damped closed-loop centring of a feature under the camera.

use super::coords::FrameGeometry;
use super::transform::TransformMatrix;
use crate::machine::round3;
use crate::vision::Detection;

/// Fraction of the predicted correction applied per move.
pub const DEFAULT_GAIN: f64 = 0.55;

/// Corrective moves allowed before giving up on a tool.
pub const DEFAULT_MOVE_BUDGET: u32 = 30;

/// Result of evaluating one detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvergenceStep {
    /// The rounded correction is zero on both axes.
    Converged { moves: u32 },
    /// Make this relative move, wait for idle, then step again.
    Move { dx: f64, dy: f64 },
    /// The correction is still nonzero and the budget is spent.
    Exhausted { moves: u32 },
}

/// Owns a transform for the duration of one tool's alignment.
#[derive(Debug, Clone)]
pub struct ConvergenceLoop {
    transform: TransformMatrix,
    geometry: FrameGeometry,
    gain: f64,
    budget: u32,
    moves: u32,
}

impl ConvergenceLoop {
    pub fn new(transform: TransformMatrix, geometry: FrameGeometry) -> Self {
        Self {
            transform,
            geometry,
            gain: DEFAULT_GAIN,
            budget: DEFAULT_MOVE_BUDGET,
            moves: 0,
        }
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget;
        self
    }

    /// Moves issued so far.
    pub fn moves(&self) -> u32 {
        self.moves
    }

    /// Rounded correction for a detection, without counting a move.
    pub fn correction(&self, detection: &Detection) -> (f64, f64) {
        let (x, y) = self.geometry.normalize(detection.x, detection.y);
        let (dx, dy) = self.transform.correction(x, y, self.gain);
        (round3(dx), round3(dy))
    }

    pub fn step(&mut self, detection: &Detection) -> ConvergenceStep {
        let (dx, dy) = self.correction(detection);
        if dx == 0.0 && dy == 0.0 {
            return ConvergenceStep::Converged { moves: self.moves };
        }
        if self.moves >= self.budget {
            return ConvergenceStep::Exhausted { moves: self.moves };
        }
        self.moves += 1;
        ConvergenceStep::Move { dx, dy }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix6x2;

    const GEOMETRY: FrameGeometry = FrameGeometry {
        width: 640,
        height: 480,
    };

    /// Machine XY at which the feature appears at a normalised position:
    /// 64 mm across the frame width, 48 mm down its height, centred on
    /// (100, 50). One pixel is 0.1 mm on both axes.
    fn transform() -> TransformMatrix {
        let mut m = Matrix6x2::zeros();
        m[(3, 0)] = 64.0;
        m[(5, 0)] = 100.0;
        m[(4, 1)] = 48.0;
        m[(5, 1)] = 50.0;
        TransformMatrix::from_coefficients(m)
    }

    /// Stub camera for a nozzle carried by the machine: the nozzle is
    /// centred at machine (100, 50) and 0.1 mm is one pixel.
    fn detect(carriage: (f64, f64)) -> Detection {
        Detection::new(
            320.0 + (carriage.0 - 100.0) / 0.1,
            240.0 + (carriage.1 - 50.0) / 0.1,
            15.0,
        )
    }

    #[test]
    fn test_converges_within_bounded_moves() {
        let mut carriage = (101.2, 49.2);
        let mut lp = ConvergenceLoop::new(transform(), GEOMETRY);
        let moves = loop {
            match lp.step(&detect(carriage)) {
                ConvergenceStep::Move { dx, dy } => {
                    carriage = (carriage.0 + dx, carriage.1 + dy);
                }
                ConvergenceStep::Converged { moves } => break moves,
                ConvergenceStep::Exhausted { moves } => panic!("exhausted after {}", moves),
            }
        };
        assert!(moves > 1 && moves <= DEFAULT_MOVE_BUDGET, "moves = {}", moves);
        assert!((carriage.0 - 100.0).abs() < 0.002, "x = {}", carriage.0);
        assert!((carriage.1 - 50.0).abs() < 0.002, "y = {}", carriage.1);
    }

    #[test]
    fn test_does_not_stop_on_nonzero_offset() {
        let mut lp = ConvergenceLoop::new(transform(), GEOMETRY).with_budget(3);
        // The nozzle never moves, so every step must ask for another move
        // until the budget runs out.
        let stuck = detect((100.5, 50.0));
        for _ in 0..3 {
            assert!(matches!(lp.step(&stuck), ConvergenceStep::Move { .. }));
        }
        assert_eq!(lp.step(&stuck), ConvergenceStep::Exhausted { moves: 3 });
    }

    #[test]
    fn test_centred_feature_converges_immediately() {
        let mut lp = ConvergenceLoop::new(transform(), GEOMETRY);
        let centred = Detection::new(320.0, 240.0, 15.0);
        assert_eq!(lp.step(&centred), ConvergenceStep::Converged { moves: 0 });
    }
}
