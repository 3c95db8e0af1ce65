//! Tool offset arithmetic and manual capture.

use serde::{Deserialize, Serialize};

use crate::machine::{round3, MachineControl, MachineError, MachinePosition, MotionCommand};

/// One completed trial: a tool's XY offset from one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOffsetResult {
    pub tool: u32,
    /// Zero-based cycle index.
    pub cycle: u32,
    /// Millimetres per pixel of the calibration used.
    pub mpp: f64,
    pub x: f64,
    pub y: f64,
    /// Seconds spent converging.
    pub elapsed_secs: f64,
}

/// Final XY offset: `(cp + existing) - detected`, rounded to 0.001 mm.
pub fn resolve_offset(
    cp: &MachinePosition,
    existing: &MachinePosition,
    detected: &MachinePosition,
) -> (f64, f64) {
    (
        round3(cp.x() + existing.x() - detected.x()),
        round3(cp.y() + existing.y() - detected.y()),
    )
}

/// Offset of the active tool with its nozzle centred by hand at the
/// current position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualOffset {
    pub tool: u32,
    pub x: f64,
    pub y: f64,
}

/// Compute the active tool's offset from where the operator has centred it.
pub async fn capture_manual_offset<M: MachineControl>(
    machine: &M,
    cp: &MachinePosition,
) -> Result<Option<ManualOffset>, MachineError> {
    let tool = machine.current_tool().await?;
    let Ok(tool) = u32::try_from(tool) else {
        return Ok(None);
    };
    let existing = machine.tool_offset(tool).await?;
    let position = machine.position().await?;
    let (x, y) = resolve_offset(cp, &existing, &position);
    tracing::info!(tool, x, y, "captured manual tool offset");
    Ok(Some(ManualOffset { tool, x, y }))
}

/// Write an offset to the firmware's tool table (`G10`).
pub async fn apply_offset<M: MachineControl>(
    machine: &M,
    tool: u32,
    x: f64,
    y: f64,
    z: Option<f64>,
) -> Result<(), MachineError> {
    machine
        .send(&MotionCommand::SetToolOffset { tool, x, y, z })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::SimulatedMachine;

    #[test]
    fn test_resolve_offset() {
        let cp = MachinePosition::xyz(100.0, 50.0, 10.0);
        let existing = MachinePosition::xyz(0.0, 0.0, 0.0);
        let detected = MachinePosition::from_pairs([('X', 99.5), ('Y', 50.2)]);
        assert_eq!(resolve_offset(&cp, &existing, &detected), (0.5, -0.2));
    }

    #[test]
    fn test_resolve_offset_includes_existing() {
        let cp = MachinePosition::xyz(100.0, 50.0, 10.0);
        let existing = MachinePosition::xyz(-12.1234, 3.0, 0.0);
        let detected = MachinePosition::xyz(100.0004, 50.0, 0.0);
        assert_eq!(resolve_offset(&cp, &existing, &detected), (-12.124, 3.0));
    }

    #[tokio::test]
    async fn test_manual_capture_needs_a_tool() {
        let machine = SimulatedMachine::new().with_position(MachinePosition::xyz(99.0, 51.0, 0.0));
        let cp = MachinePosition::xyz(100.0, 50.0, 10.0);
        assert_eq!(capture_manual_offset(&machine, &cp).await.unwrap(), None);

        machine.send(&MotionCommand::SelectTool(0)).await.unwrap();
        let offset = capture_manual_offset(&machine, &cp).await.unwrap().unwrap();
        assert_eq!(offset, ManualOffset { tool: 0, x: 1.0, y: -1.0 });
    }

    #[tokio::test]
    async fn test_apply_offset_reaches_tool_table() {
        let machine = SimulatedMachine::new();
        apply_offset(&machine, 0, 0.5, -0.2, Some(1.25)).await.unwrap();
        assert_eq!(machine.offset_of(0), Some(MachinePosition::xyz(0.5, -0.2, 1.25)));
    }
}
