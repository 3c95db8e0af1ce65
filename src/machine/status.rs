//! Machine status reported by the motion controller.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Controller state as reported by the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    /// Nothing queued, all moves complete.
    Idle,
    /// Executing moves or a job.
    Processing,
    /// Job paused.
    Paused,
    /// Job being cancelled.
    Canceling,
    /// Busy with a macro or homing (RRF3 `busy`).
    Busy,
    /// Controller reported an error or could not be reached.
    Error(String),
    /// Any other firmware state (e.g. `simulating`, `halted`).
    Other(String),
}

impl MachineStatus {
    /// Parse an RRF3 status word or an RRF2 single-letter status code.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_lowercase().as_str() {
            "idle" | "i" => Self::Idle,
            "processing" | "p" => Self::Processing,
            "paused" | "pausing" | "s" | "d" => Self::Paused,
            "canceling" | "cancelling" | "b" => Self::Canceling,
            "busy" => Self::Busy,
            "error" | "halted" | "h" => Self::Error(trimmed.to_string()),
            _ => Self::Other(trimmed.to_string()),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Paused => write!(f, "paused"),
            Self::Canceling => write!(f, "canceling"),
            Self::Busy => write!(f, "busy"),
            Self::Error(s) => write!(f, "error ({})", s),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rrf3_words() {
        assert_eq!(MachineStatus::parse("idle"), MachineStatus::Idle);
        assert_eq!(MachineStatus::parse("Processing"), MachineStatus::Processing);
        assert_eq!(MachineStatus::parse("busy"), MachineStatus::Busy);
        assert_eq!(
            MachineStatus::parse("simulating"),
            MachineStatus::Other("simulating".to_string())
        );
    }

    #[test]
    fn test_parse_rrf2_letters() {
        assert_eq!(MachineStatus::parse("I"), MachineStatus::Idle);
        assert_eq!(MachineStatus::parse("P"), MachineStatus::Processing);
        assert_eq!(MachineStatus::parse("S"), MachineStatus::Paused);
        assert_eq!(MachineStatus::parse("B"), MachineStatus::Canceling);
        assert!(MachineStatus::parse("H").is_error());
    }
}
