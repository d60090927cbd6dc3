//! # Actuator Client
//!
//! Single-parameter writes to one suspension corner.
//!
//! Each write is one authoritative `POST /api/servo-config`. The client keeps
//! no state, never retries and does not check bounds. Keeping trims in range
//! is the leveling controller's job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::device::types::{ActuatorKey, ActuatorSet};
use crate::device::{decode, HttpTransport};
use crate::error::DeviceError;

const SERVO_CONFIG_PATH: &str = "/api/servo-config";

/// Writable actuator parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServoParam {
    Trim,
    Min,
    Max,
    Reversed,
}

impl ServoParam {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServoParam::Trim => "trim",
            ServoParam::Min => "min",
            ServoParam::Max => "max",
            ServoParam::Reversed => "reversed",
        }
    }
}

impl fmt::Display for ServoParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value for a [`ServoParam`]. Angles are whole degrees on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServoValue {
    Degrees(i32),
    Flag(bool),
}

impl fmt::Display for ServoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServoValue::Degrees(d) => write!(f, "{}", d),
            ServoValue::Flag(b) => write!(f, "{}", b),
        }
    }
}

impl From<i32> for ServoValue {
    fn from(degrees: i32) -> Self {
        ServoValue::Degrees(degrees)
    }
}

impl From<bool> for ServoValue {
    fn from(flag: bool) -> Self {
        ServoValue::Flag(flag)
    }
}

/// Trait for reading and writing actuator parameters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Write one parameter of one actuator
    async fn write(&self, key: ActuatorKey, param: ServoParam, value: ServoValue) -> Result<(), DeviceError>;

    /// Read the current settings of all four actuators
    async fn fetch_states(&self) -> Result<ActuatorSet, DeviceError>;
}

/// HTTP actuator client.
#[derive(Clone)]
pub struct ActuatorClient {
    transport: Arc<dyn HttpTransport>,
}

impl ActuatorClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Actuator for ActuatorClient {
    async fn write(&self, key: ActuatorKey, param: ServoParam, value: ServoValue) -> Result<(), DeviceError> {
        debug!(actuator = %key, %param, %value, "actuator write");
        let body = json!({
            "servo": key.as_str(),
            "param": param.as_str(),
            "value": value,
        });
        self.transport.post_json(SERVO_CONFIG_PATH, &body).await?;
        Ok(())
    }

    async fn fetch_states(&self) -> Result<ActuatorSet, DeviceError> {
        let body = self.transport.get_json(SERVO_CONFIG_PATH).await?;
        decode(SERVO_CONFIG_PATH, body)
    }
}

impl fmt::Debug for ActuatorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActuatorClient").finish_non_exhaustive()
    }
}
