//! Motion controller access.
//!
//! The alignment core talks to the machine only through [`MachineControl`]:
//! it reads status, positions, tools and the object model, and issues
//! fire-and-forget commands whose completion it confirms by polling status.

mod command;
mod duet;
mod position;
mod sim;
mod status;

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;

pub use command::{format_coord, round3, MotionCommand};
pub use duet::{ApiFlavor, DuetClient, DuetConfig};
pub use position::MachinePosition;
pub use sim::{SimulatedMachine, SimulatedProbe};
pub use status::MachineStatus;

/// Machine communication errors.
#[derive(Error, Debug)]
pub enum MachineError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Command rejected with status {code}: {reason}")]
    CommandRejected { code: u16, reason: String },
    #[error("Failed to parse controller response: {0}")]
    ParseError(String),
    #[error("{0} does not appear to be an RRF2 or RRF3 controller")]
    UnsupportedFirmware(String),
    #[error("Machine reported an error state: {0}")]
    Faulted(String),
    #[error("Object model key not found: {0}")]
    ModelKeyMissing(String),
    #[error("Tool {0} does not exist")]
    UnknownTool(u32),
    #[error("Machine did not become idle within {0:?}")]
    IdleTimeout(Duration),
}

/// The motion collaborator contract consumed by the alignment core.
///
/// Implementations are expected to be cheap to call repeatedly; the core
/// polls [`MachineControl::status`] between every move and detection.
pub trait MachineControl: Send + Sync {
    /// Current controller state.
    fn status(&self) -> impl Future<Output = Result<MachineStatus, MachineError>> + Send;

    /// Current position in user (workspace) coordinates.
    fn position(&self) -> impl Future<Output = Result<MachinePosition, MachineError>> + Send;

    /// Index of the active tool, `-1` when none is loaded.
    fn current_tool(&self) -> impl Future<Output = Result<i32, MachineError>> + Send;

    /// The firmware's current offset for a tool.
    fn tool_offset(
        &self,
        tool: u32,
    ) -> impl Future<Output = Result<MachinePosition, MachineError>> + Send;

    /// Number of tools defined on the machine.
    fn tool_count(&self) -> impl Future<Output = Result<usize, MachineError>> + Send;

    /// Send a command. Completion is confirmed separately by polling status.
    fn execute(&self, command: &str) -> impl Future<Output = Result<(), MachineError>> + Send;

    /// Read a value from the controller's object model, e.g.
    /// `["sensors", "probes"]`.
    fn query_model(
        &self,
        keys: &[&str],
    ) -> impl Future<Output = Result<Value, MachineError>> + Send;

    /// Render and send a typed command.
    fn send(&self, command: &MotionCommand) -> impl Future<Output = Result<(), MachineError>> + Send {
        let gcode = command.to_gcode();
        async move {
            tracing::debug!(gcode = %gcode, "sending command");
            self.execute(&gcode).await
        }
    }
}

/// Poll the machine until it reports idle.
///
/// Sleeps `poll_interval` between polls so the controller is not flooded.
/// An error status ends the wait with [`MachineError::Faulted`].
pub async fn wait_until_idle<M: MachineControl>(
    machine: &M,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> Result<(), MachineError> {
    let started = Instant::now();
    loop {
        match machine.status().await? {
            MachineStatus::Idle => return Ok(()),
            MachineStatus::Error(reason) => return Err(MachineError::Faulted(reason)),
            status => {
                if let Some(limit) = timeout {
                    if started.elapsed() >= limit {
                        return Err(MachineError::IdleTimeout(limit));
                    }
                }
                tracing::trace!(%status, "machine busy, waiting");
                sleep(poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_until_idle_polls_through_busy() {
        let machine = SimulatedMachine::new().with_busy_polls(3);
        machine.send(&MotionCommand::relative_xy(1.0, 0.0, 3000.0)).await.unwrap();
        wait_until_idle(&machine, Duration::from_millis(1), None)
            .await
            .unwrap();
        assert!(machine.status_polls() >= 4);
    }

    #[tokio::test]
    async fn test_wait_until_idle_reports_fault() {
        let machine = SimulatedMachine::new();
        machine.set_fault(Some("driver error".to_string()));
        let result = wait_until_idle(&machine, Duration::from_millis(1), None).await;
        assert!(matches!(result, Err(MachineError::Faulted(_))));
    }

    #[tokio::test]
    async fn test_wait_until_idle_times_out() {
        let machine = SimulatedMachine::new().with_busy_polls(10_000);
        machine.send(&MotionCommand::relative_xy(1.0, 0.0, 3000.0)).await.unwrap();
        let result = wait_until_idle(
            &machine,
            Duration::from_millis(1),
            Some(Duration::from_millis(20)),
        )
        .await;
        assert!(matches!(result, Err(MachineError::IdleTimeout(_))));
    }
}
