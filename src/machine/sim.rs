//! In-memory machine for running the alignment core without hardware.
//!
//! Interprets the command vocabulary of [`MotionCommand`], keeps a user-space
//! position, a tool table and a probe model, and reports `busy` for a
//! configurable number of status polls after every motion.

use serde_json::{json, Value};
use std::sync::{Mutex, MutexGuard};

use super::duet::walk_model;
use super::{MachineControl, MachineError, MachinePosition, MachineStatus, MotionCommand};

/// Probe hardware exposed through `sensors.probes`.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    /// `triggerHeight` of probe 0.
    pub trigger_height: f64,
    /// Z at which the reference endstop (probe 0) triggers.
    pub endstop_z: f64,
    /// Whether a knob sensor is wired as probe 3.
    pub knob_present: bool,
    /// Z at which the knob triggers, per tool. Missing tools use `endstop_z`.
    pub knob_z: Vec<f64>,
    /// Number of upcoming reads for which the knob reports triggered.
    pub knob_stuck_reads: u32,
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self {
            trigger_height: 0.0,
            endstop_z: 0.0,
            knob_present: false,
            knob_z: Vec::new(),
            knob_stuck_reads: 0,
        }
    }
}

#[derive(Debug)]
struct SimState {
    position: MachinePosition,
    current_tool: i32,
    offsets: Vec<MachinePosition>,
    busy_polls: u32,
    busy_remaining: u32,
    status_polls: u64,
    fault: Option<String>,
    rejected_prefixes: Vec<String>,
    probe: SimulatedProbe,
    commands: Vec<String>,
    feedrate: f64,
    saved: bool,
}

/// A machine that lives entirely in memory.
#[derive(Debug)]
pub struct SimulatedMachine {
    state: Mutex<SimState>,
}

impl Default for SimulatedMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMachine {
    /// A machine at the origin with a single tool and no probes.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                position: MachinePosition::xyz(0.0, 0.0, 0.0),
                current_tool: -1,
                offsets: vec![MachinePosition::xyz(0.0, 0.0, 0.0)],
                busy_polls: 0,
                busy_remaining: 0,
                status_polls: 0,
                fault: None,
                rejected_prefixes: Vec::new(),
                probe: SimulatedProbe::default(),
                commands: Vec::new(),
                feedrate: 3000.0,
                saved: false,
            }),
        }
    }

    pub fn with_position(self, position: MachinePosition) -> Self {
        self.lock().position = position;
        self
    }

    /// Define the tool table from per-tool offsets.
    pub fn with_tools(self, offsets: Vec<MachinePosition>) -> Self {
        self.lock().offsets = offsets;
        self
    }

    /// Report `busy` for this many status polls after each motion command.
    pub fn with_busy_polls(self, polls: u32) -> Self {
        self.lock().busy_polls = polls;
        self
    }

    pub fn with_probe(self, probe: SimulatedProbe) -> Self {
        self.lock().probe = probe;
        self
    }

    /// Reject any command starting with `prefix` (case-insensitive).
    pub fn reject_commands(&self, prefix: impl Into<String>) {
        self.lock().rejected_prefixes.push(prefix.into().to_uppercase());
    }

    pub fn set_fault(&self, fault: Option<String>) {
        self.lock().fault = fault;
    }

    /// Make the knob read triggered for the next `reads` model queries.
    pub fn stick_knob(&self, reads: u32) {
        self.lock().probe.knob_stuck_reads = reads;
    }

    /// Current user-space position without going through the async API.
    pub fn snapshot_position(&self) -> MachinePosition {
        self.lock().position.clone()
    }

    pub fn snapshot_tool(&self) -> i32 {
        self.lock().current_tool
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn status_polls(&self) -> u64 {
        self.lock().status_polls
    }

    pub fn offsets_saved(&self) -> bool {
        self.lock().saved
    }

    pub fn offset_of(&self, tool: u32) -> Option<MachinePosition> {
        self.lock().offsets.get(tool as usize).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens in a failing test.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(state: &mut SimState, command: MotionCommand) -> Result<(), MachineError> {
        match command {
            MotionCommand::SelectTool(tool) => {
                if tool as usize >= state.offsets.len() {
                    return Err(MachineError::UnknownTool(tool));
                }
                state.current_tool = tool as i32;
                state.busy_remaining = state.busy_polls;
            }
            MotionCommand::UnloadTool => {
                state.current_tool = -1;
                state.busy_remaining = state.busy_polls;
            }
            MotionCommand::MoveRelative { x, y, z, feedrate } => {
                for (axis, delta) in [('X', x), ('Y', y), ('Z', z)] {
                    if let Some(delta) = delta {
                        let current = state.position.axis_or_zero(axis);
                        state.position.set(axis, current + delta);
                    }
                }
                if let Some(f) = feedrate {
                    state.feedrate = f;
                }
                state.busy_remaining = state.busy_polls;
            }
            MotionCommand::MoveAbsolute { x, y, z, feedrate } => {
                for (axis, value) in [('X', x), ('Y', y), ('Z', z)] {
                    if let Some(value) = value {
                        state.position.set(axis, value);
                    }
                }
                if let Some(f) = feedrate {
                    state.feedrate = f;
                }
                state.busy_remaining = state.busy_polls;
            }
            MotionCommand::SetFeedrate(f) => state.feedrate = f,
            MotionCommand::LimitAxes(_) => {}
            MotionCommand::Probe { probe } => {
                let z = if probe == 0 {
                    state.probe.endstop_z
                } else {
                    usize::try_from(state.current_tool)
                        .ok()
                        .and_then(|t| state.probe.knob_z.get(t).copied())
                        .unwrap_or(state.probe.endstop_z)
                };
                state.position.set('Z', z);
                state.busy_remaining = state.busy_polls;
            }
            MotionCommand::SetToolOffset { tool, x, y, z } => {
                let offset = state
                    .offsets
                    .get_mut(tool as usize)
                    .ok_or(MachineError::UnknownTool(tool))?;
                offset.set('X', x);
                offset.set('Y', y);
                if let Some(z) = z {
                    offset.set('Z', z);
                }
            }
            MotionCommand::SaveOffsets => state.saved = true,
            MotionCommand::Raw(_) => {}
        }
        Ok(())
    }

    fn model_document(state: &mut SimState) -> Value {
        let mut probes = vec![json!({
            "triggerHeight": state.probe.trigger_height,
            "value": [0],
        })];
        if state.probe.knob_present {
            let knob_value = if state.probe.knob_stuck_reads > 0 {
                state.probe.knob_stuck_reads -= 1;
                1000
            } else {
                0
            };
            probes.push(json!({"value": [0]}));
            probes.push(json!({"value": [0]}));
            probes.push(json!({"triggerHeight": 0.0, "value": [knob_value]}));
        }
        let tools: Vec<Value> = state
            .offsets
            .iter()
            .map(|o| json!({"offsets": [o.x(), o.y(), o.z()]}))
            .collect();
        json!({
            "sensors": {"probes": probes},
            "tools": tools,
            "state": {"currentTool": state.current_tool},
        })
    }
}

impl MachineControl for SimulatedMachine {
    async fn status(&self) -> Result<MachineStatus, MachineError> {
        let mut state = self.lock();
        state.status_polls += 1;
        if let Some(fault) = &state.fault {
            return Ok(MachineStatus::Error(fault.clone()));
        }
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            return Ok(MachineStatus::Busy);
        }
        Ok(MachineStatus::Idle)
    }

    async fn position(&self) -> Result<MachinePosition, MachineError> {
        Ok(self.lock().position.clone())
    }

    async fn current_tool(&self) -> Result<i32, MachineError> {
        Ok(self.lock().current_tool)
    }

    async fn tool_offset(&self, tool: u32) -> Result<MachinePosition, MachineError> {
        self.lock()
            .offsets
            .get(tool as usize)
            .cloned()
            .ok_or(MachineError::UnknownTool(tool))
    }

    async fn tool_count(&self) -> Result<usize, MachineError> {
        Ok(self.lock().offsets.len())
    }

    async fn execute(&self, command: &str) -> Result<(), MachineError> {
        let mut state = self.lock();
        state.commands.push(command.to_string());
        let upper = command.trim().to_uppercase();
        if state.rejected_prefixes.iter().any(|p| upper.starts_with(p.as_str())) {
            return Err(MachineError::CommandRejected {
                code: 400,
                reason: format!("rejected: {}", command),
            });
        }
        Self::apply(&mut state, MotionCommand::parse(command))
    }

    async fn query_model(&self, keys: &[&str]) -> Result<Value, MachineError> {
        let mut state = self.lock();
        let doc = Self::model_document(&mut state);
        walk_model(&doc, keys).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relative_and_absolute_moves() {
        let machine = SimulatedMachine::new().with_position(MachinePosition::xyz(10.0, 20.0, 5.0));
        machine.send(&MotionCommand::relative_xy(0.5, -0.25, 3000.0)).await.unwrap();
        let pos = machine.position().await.unwrap();
        assert_eq!(pos.x(), 10.5);
        assert_eq!(pos.y(), 19.75);

        machine.send(&MotionCommand::absolute_axis('Z', 12.0)).await.unwrap();
        assert_eq!(machine.position().await.unwrap().z(), 12.0);
    }

    #[tokio::test]
    async fn test_tool_offsets_and_save() {
        let machine = SimulatedMachine::new().with_tools(vec![
            MachinePosition::xyz(0.0, 0.0, 0.0),
            MachinePosition::xyz(1.0, 1.0, -1.0),
        ]);
        machine
            .send(&MotionCommand::SetToolOffset { tool: 1, x: 0.5, y: -0.2, z: None })
            .await
            .unwrap();
        machine.send(&MotionCommand::SaveOffsets).await.unwrap();

        let offset = machine.tool_offset(1).await.unwrap();
        assert_eq!(offset.x(), 0.5);
        assert_eq!(offset.y(), -0.2);
        assert_eq!(offset.z(), -1.0);
        assert!(machine.offsets_saved());
        assert_eq!(machine.tool_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let machine = SimulatedMachine::new();
        machine.reject_commands("T");
        let result = machine.send(&MotionCommand::SelectTool(0)).await;
        assert!(matches!(result, Err(MachineError::CommandRejected { code: 400, .. })));
    }

    #[tokio::test]
    async fn test_probe_model() {
        let machine = SimulatedMachine::new().with_probe(SimulatedProbe {
            trigger_height: 1.5,
            endstop_z: 2.0,
            knob_present: true,
            knob_z: vec![2.4],
            knob_stuck_reads: 1,
        });

        let probes = machine.query_model(&["sensors", "probes"]).await.unwrap();
        assert_eq!(probes[0]["triggerHeight"], 1.5);
        assert_eq!(probes[3]["value"][0], 1000);
        let probes = machine.query_model(&["sensors", "probes"]).await.unwrap();
        assert_eq!(probes[3]["value"][0], 0);

        machine.send(&MotionCommand::SelectTool(0)).await.unwrap();
        machine.send(&MotionCommand::Probe { probe: 3 }).await.unwrap();
        assert_eq!(machine.position().await.unwrap().z(), 2.4);
    }
}
