//! # Suspension Tuner Library
//!
//! Remote tuning and auto-leveling for a four-corner active suspension rig.
//!
//! This library talks to the rig's embedded controller over HTTP and a
//! streaming connection, and drives the closed-loop leveling routine that
//! detects each corner's polarity and trims the rig level.

pub mod actuator;
pub mod config;
pub mod device;
pub mod error;
pub mod leveling;
pub mod sensors;
pub mod telemetry;
