//! Tool alignment: camera calibration, convergence and offset resolution.
//!
//! The pure pieces ([`TransformCalibrator`], [`ConvergenceLoop`],
//! [`resolve_offset`]) carry the math; [`ToolAligner`] drives them against a
//! [`MachineControl`](crate::machine::MachineControl) and a
//! [`FrameFeed`](crate::camera::FrameFeed).

mod aligner;
mod camera;
mod convergence;
pub mod coords;
mod events;
mod offset;
mod session;
mod transform;
pub mod zprobe;

use thiserror::Error;

use crate::camera::CameraError;
use crate::machine::MachineError;

pub use aligner::{AlignerConfig, ToolAligner};
pub use camera::{
    CalibrationState, CalibrationStep, CameraCalibration, TransformCalibrator, CALIBRATION_MOVES,
    CALIBRATION_STEP_MM, SAMPLE_COUNT,
};
pub use convergence::{ConvergenceLoop, ConvergenceStep, DEFAULT_GAIN, DEFAULT_MOVE_BUDGET};
pub use coords::FrameGeometry;
pub use events::{AlignmentEvent, CancelHandle, EventSink};
pub use offset::{apply_offset, capture_manual_offset, resolve_offset, ManualOffset, ToolOffsetResult};
pub use session::{ControlPoint, SessionContext, TransformCadence};
pub use transform::{CalibrationSample, FitError, TransformMatrix};
pub use zprobe::{NoPrompt, OperatorPrompt, ZReference};

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Abandon the current tool and carry on with the next one.
    Tool,
    /// Abort the whole run.
    Run,
}

/// Alignment errors.
#[derive(Error, Debug)]
pub enum AlignError {
    #[error("Machine error: {0}")]
    Machine(#[from] MachineError),
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("Calibration failed: {0}")]
    Fit(#[from] FitError),
    #[error("Nozzle did not converge after {moves} moves")]
    ConvergenceExhausted { moves: u32 },
    #[error("No usable detection after {attempts} attempts")]
    DetectionFailed { attempts: u32 },
    #[error("No tools to calibrate")]
    NoTools,
    #[error("Run cancelled")]
    Cancelled,
    #[error("Detection worker failed: {0}")]
    Worker(String),
}

impl AlignError {
    /// Motion, detection and degenerate-sample failures cost one tool;
    /// camera, solver and cancellation failures end the run.
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::Machine(_)
            | Self::ConvergenceExhausted { .. }
            | Self::DetectionFailed { .. }
            | Self::Fit(FitError::Degenerate { .. }) => ErrorScope::Tool,
            Self::Fit(_) | Self::Camera(_) | Self::NoTools | Self::Cancelled | Self::Worker(_) => {
                ErrorScope::Run
            }
        }
    }
}
