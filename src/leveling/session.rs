//! # Leveling Session
//!
//! State of one auto-level run and the status published while it runs.
//!
//! ```text
//!   Idle ──trigger──► DetectingPolarity ──► Converging ──► Succeeded
//!                            │                  │
//!                            └──── error ───────┴────────► Failed
//! ```
//!
//! `Succeeded` and `Failed` are terminal. After the display hold the status
//! drops back to `Idle` and a new session may start.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::device::types::ActuatorKey;

/// Phase of the auto-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Idle,
    /// Manual orientation calibration ("set as level") in progress
    Calibrating,
    DetectingPolarity,
    Converging,
    Succeeded,
    Failed,
}

impl Phase {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Calibrating => "calibrating",
            Phase::DetectingPolarity => "detecting polarity",
            Phase::Converging => "converging",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of controller progress for UIs and logs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SessionStatus {
    pub phase: Phase,
    /// Convergence iterations completed so far
    pub iteration: u32,
    pub message: String,
}

impl SessionStatus {
    #[must_use]
    pub fn idle() -> Self {
        Self::default()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "camelCase")]
pub enum SessionOutcome {
    Succeeded,
    Failed(String),
}

impl SessionOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Succeeded)
    }
}

/// Summary returned once a session has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Convergence iterations that issued a correction
    pub iterations: u32,
    /// Final `reversed` flag per actuator, for every actuator tested
    pub detected_polarity: BTreeMap<ActuatorKey, bool>,
    /// Actuator writes issued, test movements included
    pub writes: u32,
}

/// Working state of one auto-level run. Owned by the controller task.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub phase: Phase,
    pub iteration: u32,
    pub detected_polarity: BTreeMap<ActuatorKey, bool>,
    pub status_message: String,
    pub writes: u32,
}

impl Session {
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            phase: self.phase,
            iteration: self.iteration,
            message: self.status_message.clone(),
        }
    }

    /// Moves to a terminal phase and builds the report.
    pub fn finish(&mut self, outcome: SessionOutcome) -> SessionReport {
        self.phase = match outcome {
            SessionOutcome::Succeeded => Phase::Succeeded,
            SessionOutcome::Failed(_) => Phase::Failed,
        };
        SessionReport {
            outcome,
            iterations: self.iteration,
            detected_polarity: self.detected_polarity.clone(),
            writes: self.writes,
        }
    }
}
