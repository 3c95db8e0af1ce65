//! Camera-to-machine calibration state machine.
//!
//! The calibrator is pure: it is fed one settled detection per position and
//! answers with the relative moves to make before the next one. Moving,
//! waiting for idle and detecting are the caller's job.

use std::fmt;

use super::coords::FrameGeometry;
use super::transform::{CalibrationSample, FitError, TransformMatrix};
use crate::machine::round3;
use crate::vision::Detection;

/// Distance between consecutive calibration points, in mm.
pub const CALIBRATION_STEP_MM: f64 = 0.5;

/// Relative offsets visited around the starting position, in order.
/// Consecutive points are 0.5 mm apart.
pub const CALIBRATION_MOVES: [(f64, f64); 10] = [
    (0.0, -0.5),
    (0.294, -0.405),
    (0.476, -0.155),
    (0.476, 0.155),
    (0.294, 0.405),
    (0.0, 0.5),
    (-0.294, 0.405),
    (-0.476, 0.155),
    (-0.476, -0.155),
    (-0.294, -0.405),
];

/// Number of samples in a complete session: the start plus one per move.
pub const SAMPLE_COUNT: usize = CALIBRATION_MOVES.len() + 1;

/// Where a calibration session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationState {
    #[default]
    AwaitingFirstSample,
    /// Waiting for the sample taken after move `n` (1-based).
    CollectingSample(usize),
    /// All samples in; ready to fit.
    Fitting,
    /// Fit done; the transform now belongs to the convergence loop.
    Converging,
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingFirstSample => write!(f, "awaiting first sample"),
            Self::CollectingSample(n) => write!(f, "collecting sample {}", n),
            Self::Fitting => write!(f, "fitting"),
            Self::Converging => write!(f, "converging"),
        }
    }
}

/// What the caller should do after recording a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    /// Issue these relative XY moves in order, wait for idle, then record
    /// the next sample.
    Move(Vec<(f64, f64)>),
    /// All samples are in; call [`TransformCalibrator::fit`].
    ReadyToFit,
}

/// Output of a completed calibration session.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCalibration {
    pub transform: TransformMatrix,
    /// Millimetres per pixel, from the first 0.5 mm step.
    pub mpp: f64,
    /// Machine XY that centres the feature, rounded to 0.001 mm.
    pub camera_center: (f64, f64),
    pub geometry: FrameGeometry,
    pub samples: Vec<CalibrationSample>,
}

/// Collects the fixed move circle and fits the transform.
#[derive(Debug, Clone)]
pub struct TransformCalibrator {
    geometry: FrameGeometry,
    state: CalibrationState,
    samples: Vec<CalibrationSample>,
    first_pixel: Option<(f64, f64)>,
    mpp: Option<f64>,
}

impl TransformCalibrator {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            geometry,
            state: CalibrationState::default(),
            samples: Vec::with_capacity(SAMPLE_COUNT),
            first_pixel: None,
            mpp: None,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    pub fn mpp(&self) -> Option<f64> {
        self.mpp
    }

    /// Progress in percent, for status messages.
    pub fn progress_percent(&self) -> u32 {
        match self.state {
            CalibrationState::AwaitingFirstSample => 0,
            CalibrationState::CollectingSample(n) => (n * 100 / SAMPLE_COUNT.saturating_sub(1)) as u32,
            CalibrationState::Fitting | CalibrationState::Converging => 100,
        }
    }

    /// Record the detection seen with the machine settled at `machine`.
    pub fn record(
        &mut self,
        machine: (f64, f64),
        detection: &Detection,
    ) -> Result<CalibrationStep, FitError> {
        let pixel = (detection.x, detection.y);
        let sample = CalibrationSample::new(machine, self.geometry.normalize(pixel.0, pixel.1));

        match self.state {
            CalibrationState::AwaitingFirstSample => {
                self.samples.push(sample);
                self.first_pixel = Some(pixel);
                self.state = CalibrationState::CollectingSample(1);
                Ok(CalibrationStep::Move(vec![CALIBRATION_MOVES[0]]))
            }
            CalibrationState::CollectingSample(n) => {
                if n == 1 {
                    self.mpp = Some(self.derive_mpp(pixel)?);
                }
                self.samples.push(sample);
                if n >= CALIBRATION_MOVES.len() {
                    self.state = CalibrationState::Fitting;
                    return Ok(CalibrationStep::ReadyToFit);
                }
                let (px, py) = CALIBRATION_MOVES[n - 1];
                self.state = CalibrationState::CollectingSample(n + 1);
                Ok(CalibrationStep::Move(vec![(-px, -py), CALIBRATION_MOVES[n]]))
            }
            state => Err(FitError::UnexpectedSample(state.to_string())),
        }
    }

    /// Fit the transform from the collected samples.
    pub fn fit(&mut self) -> Result<CameraCalibration, FitError> {
        if self.state != CalibrationState::Fitting {
            return Err(FitError::Incomplete);
        }
        let mpp = self.mpp.ok_or(FitError::Incomplete)?;
        let transform = TransformMatrix::fit(&self.samples)?;
        let (cx, cy) = transform.camera_center();
        self.state = CalibrationState::Converging;
        Ok(CameraCalibration {
            transform,
            mpp,
            camera_center: (round3(cx), round3(cy)),
            geometry: self.geometry,
            samples: self.samples.clone(),
        })
    }

    fn derive_mpp(&self, pixel: (f64, f64)) -> Result<f64, FitError> {
        let first = self.first_pixel.ok_or(FitError::Incomplete)?;
        let distance = ((pixel.0 - first.0).powi(2) + (pixel.1 - first.1).powi(2)).sqrt();
        let distance = round3(distance);
        if distance <= 0.0 {
            return Err(FitError::Degenerate {
                samples: self.samples.len() + 1,
                distinct: 1,
            });
        }
        Ok((CALIBRATION_STEP_MM / distance * 10_000.0).round() / 10_000.0)
    }
}
