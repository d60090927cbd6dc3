//! # Leveling Module
//!
//! Closed-loop auto-leveling of the four suspension corners.
//!
//! This module handles:
//! - Corner coupling and step-limited correction math
//! - Per-corner polarity detection from a test movement
//! - The session state machine and its published status
//! - Mutual exclusion between auto-level and manual calibration

pub mod controller;
pub mod correction;
pub mod polarity;
pub mod session;

pub use controller::{AutoLevelController, LevelCalibrator};
pub use session::{Phase, SessionOutcome, SessionReport, SessionStatus};
