//! Optional Z offset calibration against a knob sensor.
//!
//! When a secondary trigger sensor is wired as probe 3, the reference
//! endstop (probe 0) is touched once at the controlled point and every tool
//! is then probed against the knob. The difference gives a per-tool Z
//! correction independent of the camera.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

use crate::machine::{round3, wait_until_idle, MachineControl, MachineError, MachinePosition, MotionCommand};

/// Probe number of the bed reference endstop.
pub const REFERENCE_PROBE: u32 = 0;
/// Probe number of the knob sensor.
pub const KNOB_PROBE: u32 = 3;
/// X distance from the controlled point to the probing spot, in mm.
pub const PROBE_X_OFFSET: f64 = 40.0;

/// Blocks until the operator has acted on a message.
pub trait OperatorPrompt: Send + Sync {
    fn acknowledge<'a>(&'a self, message: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Prompt that returns immediately, for unattended runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl OperatorPrompt for NoPrompt {
    fn acknowledge<'a>(&'a self, message: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        tracing::warn!(message, "operator prompt skipped");
        Box::pin(async {})
    }
}

/// What the probe table says about the machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    /// `triggerHeight` of the reference probe.
    pub trigger_height: f64,
    /// A knob sensor is present and currently reads untriggered.
    pub has_knob: bool,
}

/// Read [`ProbeInfo`] from the `sensors.probes` array.
pub fn parse_probe_info(probes: &Value) -> ProbeInfo {
    let trigger_height = probes
        .get(REFERENCE_PROBE as usize)
        .and_then(|p| p.get("triggerHeight"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let has_knob = knob_reading(probes) == Some(false);
    ProbeInfo {
        trigger_height,
        has_knob,
    }
}

/// `Some(true)` when the knob reads triggered, `None` when there is none.
pub fn knob_reading(probes: &Value) -> Option<bool> {
    let value = probes
        .get(KNOB_PROBE as usize)?
        .get("value")?
        .get(0)?
        .as_f64()?;
    Some(value != 0.0)
}

/// Reference taken once per run at the controlled point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZReference {
    /// Z at which the reference endstop triggered.
    pub endstop_z: f64,
    pub trigger_height: f64,
}

/// `(tool_z - trigger_height) - (current_z - endstop_z)`, rounded to 0.001 mm.
pub fn z_correction(tool_z: f64, reference: &ZReference, current_z: f64) -> f64 {
    round3((tool_z - reference.trigger_height) - (current_z - reference.endstop_z))
}

/// Outcome of probing one tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ZOutcome {
    Corrected(f64),
    Skipped(String),
}

async fn probes<M: MachineControl>(machine: &M) -> Result<Value, MachineError> {
    machine.query_model(&["sensors", "probes"]).await
}

async fn probe_at_side<M: MachineControl>(
    machine: &M,
    cp: &MachinePosition,
    probe: u32,
    poll: Duration,
) -> Result<f64, MachineError> {
    machine
        .send(&MotionCommand::absolute_axis('X', cp.x() + PROBE_X_OFFSET))
        .await?;
    wait_until_idle(machine, poll, None).await?;
    machine.send(&MotionCommand::Probe { probe }).await?;
    wait_until_idle(machine, poll, None).await?;
    let z = machine.position().await?.z();

    machine.send(&MotionCommand::absolute_axis('Z', cp.z())).await?;
    wait_until_idle(machine, poll, None).await?;
    machine.send(&MotionCommand::absolute_axis('X', cp.x())).await?;
    wait_until_idle(machine, poll, None).await?;
    Ok(z)
}

/// Touch the reference endstop next to the controlled point.
///
/// Returns `None` when the machine has no knob sensor or its probe table
/// cannot be read; Z calibration is then skipped for the whole run.
pub async fn capture_reference<M: MachineControl>(
    machine: &M,
    cp: &MachinePosition,
    poll: Duration,
) -> Result<Option<ZReference>, MachineError> {
    let info = match probes(machine).await {
        Ok(value) => parse_probe_info(&value),
        Err(e) => {
            tracing::warn!(error = %e, "probe table unavailable, skipping Z calibration");
            return Ok(None);
        }
    };
    if !info.has_knob {
        tracing::debug!("no knob sensor, skipping Z calibration");
        return Ok(None);
    }
    let endstop_z = probe_at_side(machine, cp, REFERENCE_PROBE, poll).await?;
    tracing::info!(endstop_z, trigger_height = info.trigger_height, "captured Z reference");
    Ok(Some(ZReference {
        endstop_z,
        trigger_height: info.trigger_height,
    }))
}

/// Probe the loaded tool against the knob.
///
/// A knob that already reads triggered gets one operator-mediated retry;
/// if it is still triggered the tool is skipped rather than failing.
pub async fn calibrate_tool_z<M: MachineControl>(
    machine: &M,
    cp: &MachinePosition,
    reference: &ZReference,
    tool_z: f64,
    prompt: &dyn OperatorPrompt,
    poll: Duration,
) -> Result<ZOutcome, MachineError> {
    let mut triggered = knob_reading(&probes(machine).await?);
    if triggered == Some(true) {
        prompt
            .acknowledge("Z sensor is triggered. Clear it, then continue.")
            .await;
        triggered = knob_reading(&probes(machine).await?);
    }
    match triggered {
        Some(false) => {}
        Some(true) => return Ok(ZOutcome::Skipped("Z sensor still triggered".to_string())),
        None => return Ok(ZOutcome::Skipped("Z sensor not found".to_string())),
    }

    let z = probe_at_side(machine, cp, KNOB_PROBE, poll).await?;
    Ok(ZOutcome::Corrected(z_correction(tool_z, reference, z)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{SimulatedMachine, SimulatedProbe};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingPrompt(AtomicU32);

    impl OperatorPrompt for CountingPrompt {
        fn acknowledge<'a>(&'a self, _message: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    fn knob_machine() -> SimulatedMachine {
        SimulatedMachine::new()
            .with_position(MachinePosition::xyz(100.0, 50.0, 10.0))
            .with_tools(vec![MachinePosition::xyz(0.0, 0.0, -1.5)])
            .with_probe(SimulatedProbe {
                trigger_height: 0.7,
                endstop_z: 2.0,
                knob_present: true,
                knob_z: vec![2.4],
                knob_stuck_reads: 0,
            })
    }

    #[test]
    fn test_parse_probe_info() {
        let probes = json!([
            {"triggerHeight": 0.7, "value": [0]},
            {"value": [0]},
            {"value": [0]},
            {"value": [0]},
        ]);
        assert_eq!(
            parse_probe_info(&probes),
            ProbeInfo {
                trigger_height: 0.7,
                has_knob: true
            }
        );
        let single = json!([{"triggerHeight": 1.0, "value": [1000]}]);
        assert!(!parse_probe_info(&single).has_knob);
        assert_eq!(knob_reading(&single), None);
    }

    #[test]
    fn test_z_correction() {
        let reference = ZReference {
            endstop_z: 2.0,
            trigger_height: 0.7,
        };
        // (-1.5 - 0.7) - (2.4 - 2.0)
        assert_eq!(z_correction(-1.5, &reference, 2.4), -2.6);
    }

    #[tokio::test]
    async fn test_reference_then_tool() {
        let machine = knob_machine();
        let cp = MachinePosition::xyz(100.0, 50.0, 10.0);
        let poll = Duration::from_millis(1);

        let reference = capture_reference(&machine, &cp, poll).await.unwrap().unwrap();
        assert_eq!(reference.endstop_z, 2.0);
        assert_eq!(machine.snapshot_position(), cp);

        machine.send(&MotionCommand::SelectTool(0)).await.unwrap();
        let prompt = CountingPrompt(AtomicU32::new(0));
        let outcome = calibrate_tool_z(&machine, &cp, &reference, -1.5, &prompt, poll)
            .await
            .unwrap();
        assert_eq!(outcome, ZOutcome::Corrected(-2.6));
        assert_eq!(prompt.0.load(Ordering::SeqCst), 0);
        assert!(machine.commands().iter().any(|c| c.starts_with("G30 S-1 K3")));
    }

    #[tokio::test]
    async fn test_stuck_knob_gets_one_retry() {
        let machine = knob_machine();
        let cp = MachinePosition::xyz(100.0, 50.0, 10.0);
        let reference = ZReference {
            endstop_z: 2.0,
            trigger_height: 0.7,
        };
        let prompt = CountingPrompt(AtomicU32::new(0));

        machine.stick_knob(1);
        let outcome = calibrate_tool_z(&machine, &cp, &reference, 0.0, &prompt, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(matches!(outcome, ZOutcome::Corrected(_)));
        assert_eq!(prompt.0.load(Ordering::SeqCst), 1);

        machine.stick_knob(5);
        let outcome = calibrate_tool_z(&machine, &cp, &reference, 0.0, &prompt, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(matches!(outcome, ZOutcome::Skipped(_)));
        assert_eq!(prompt.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_knob_means_no_reference() {
        let machine = SimulatedMachine::new();
        let cp = MachinePosition::xyz(0.0, 0.0, 0.0);
        let reference = capture_reference(&machine, &cp, Duration::from_millis(1)).await.unwrap();
        assert_eq!(reference, None);
        assert!(machine.commands().is_empty());
    }
}
