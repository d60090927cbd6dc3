//! # Telemetry Module
//!
//! Live data from the device's streaming endpoint.
//!
//! This module handles:
//! - Holding one persistent connection with fixed-delay reconnects
//! - Sanitizing non-finite numeric tokens before decoding
//! - Fanning decoded messages out to subscribers by message type
//! - Optionally recording telemetry to rotating JSONL files

pub mod channel;
pub mod message;
pub mod recorder;
pub mod sanitize;

pub use channel::{Frame, LinkState, StreamConnector, Subscription, TelemetryChannel, WsConnector};
pub use message::TelemetryMessage;
pub use recorder::TelemetryRecorder;
