//! Per-run state, created fresh at the start of every run.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::camera::CameraCalibration;
use super::offset::ToolOffsetResult;
use super::zprobe::ZReference;
use crate::machine::MachinePosition;

/// How often the camera transform is fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformCadence {
    /// Fit once and reuse it for every tool and cycle of the run.
    #[default]
    PerSession,
    /// Fit again before every tool alignment.
    PerTool,
}

/// The controlled point all offsets are measured against.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPoint {
    pub position: MachinePosition,
    /// Reference endstop reading, when a knob sensor is fitted.
    pub z_reference: Option<ZReference>,
    /// Calibration made while locating the point, if it was found by camera.
    pub calibration: Option<CameraCalibration>,
}

impl ControlPoint {
    pub fn at(position: MachinePosition) -> Self {
        Self {
            position,
            z_reference: None,
            calibration: None,
        }
    }
}

/// Everything one alignment run accumulates.
#[derive(Debug, Clone)]
pub struct SessionContext {
    run_id: Uuid,
    started_at: DateTime<Local>,
    control_point: ControlPoint,
    cadence: TransformCadence,
    calibration: Option<CameraCalibration>,
    tool_z: BTreeMap<u32, f64>,
    results: Vec<ToolOffsetResult>,
}

impl SessionContext {
    pub fn new(control_point: ControlPoint, cadence: TransformCadence) -> Self {
        let calibration = match cadence {
            TransformCadence::PerSession => control_point.calibration.clone(),
            TransformCadence::PerTool => None,
        };
        Self {
            run_id: Uuid::new_v4(),
            started_at: Local::now(),
            control_point,
            cadence,
            calibration,
            tool_z: BTreeMap::new(),
            results: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn control_point(&self) -> &ControlPoint {
        &self.control_point
    }

    pub fn cadence(&self) -> TransformCadence {
        self.cadence
    }

    /// A calibration that may be reused for the next tool.
    pub fn reusable_calibration(&self) -> Option<&CameraCalibration> {
        match self.cadence {
            TransformCadence::PerSession => self.calibration.as_ref(),
            TransformCadence::PerTool => None,
        }
    }

    /// The most recent calibration, whatever the cadence.
    pub fn last_calibration(&self) -> Option<&CameraCalibration> {
        self.calibration.as_ref()
    }

    pub fn store_calibration(&mut self, calibration: CameraCalibration) {
        self.calibration = Some(calibration);
    }

    pub fn invalidate_calibration(&mut self) {
        self.calibration = None;
    }

    pub fn tool_z(&self, tool: u32) -> Option<f64> {
        self.tool_z.get(&tool).copied()
    }

    pub fn set_tool_z(&mut self, tool: u32, z: f64) {
        self.tool_z.insert(tool, z);
    }

    pub fn tool_z_offsets(&self) -> &BTreeMap<u32, f64> {
        &self.tool_z
    }

    pub fn push_result(&mut self, result: ToolOffsetResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[ToolOffsetResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<ToolOffsetResult> {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{FrameGeometry, TransformMatrix};
    use nalgebra::Matrix6x2;

    fn calibration() -> CameraCalibration {
        CameraCalibration {
            transform: TransformMatrix::from_coefficients(Matrix6x2::zeros()),
            mpp: 0.01,
            camera_center: (0.0, 0.0),
            geometry: FrameGeometry::new(640, 480),
            samples: Vec::new(),
        }
    }

    #[test]
    fn test_cadence_controls_reuse() {
        let mut cp = ControlPoint::at(MachinePosition::xyz(1.0, 2.0, 3.0));
        cp.calibration = Some(calibration());

        let per_session = SessionContext::new(cp.clone(), TransformCadence::PerSession);
        assert!(per_session.reusable_calibration().is_some());

        let mut per_tool = SessionContext::new(cp, TransformCadence::PerTool);
        assert!(per_tool.reusable_calibration().is_none());
        per_tool.store_calibration(calibration());
        assert!(per_tool.reusable_calibration().is_none());
        assert!(per_tool.last_calibration().is_some());
    }

    #[test]
    fn test_sessions_do_not_share_state() {
        let cp = ControlPoint::at(MachinePosition::xyz(0.0, 0.0, 0.0));
        let mut first = SessionContext::new(cp.clone(), TransformCadence::default());
        first.set_tool_z(1, -0.25);
        let second = SessionContext::new(cp, TransformCadence::default());
        assert_eq!(first.tool_z(1), Some(-0.25));
        assert_eq!(second.tool_z(1), None);
        assert_ne!(first.run_id(), second.run_id());
    }
}
