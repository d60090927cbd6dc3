//! # Device Wire Types
//!
//! Serde schema for everything the device sends or accepts.
//!
//! Optional or loosely-shaped fields are resolved here, once, at the decode
//! boundary. Code downstream of these types never re-inspects raw JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DeviceError;

/// One of the four suspension corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActuatorKey {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
}

impl ActuatorKey {
    /// All corners, in the order polarity detection visits them.
    pub const ALL: [ActuatorKey; 4] = [
        ActuatorKey::FrontLeft,
        ActuatorKey::FrontRight,
        ActuatorKey::RearLeft,
        ActuatorKey::RearRight,
    ];

    /// Name used by the device API.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActuatorKey::FrontLeft => "frontLeft",
            ActuatorKey::FrontRight => "frontRight",
            ActuatorKey::RearLeft => "rearLeft",
            ActuatorKey::RearRight => "rearRight",
        }
    }
}

impl fmt::Display for ActuatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActuatorKey {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActuatorKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DeviceError::ProtocolDecode(format!("unknown actuator '{}'", s)))
    }
}

/// Per-corner servo settings as stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorState {
    pub min: i32,
    pub max: i32,
    /// Signed bias in degrees, kept within ±20 by the leveling controller.
    pub trim: i32,
    pub reversed: bool,
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self {
            min: 30,
            max: 150,
            trim: 0,
            reversed: false,
        }
    }
}

/// Settings for all four corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActuatorSet {
    pub front_left: ActuatorState,
    pub front_right: ActuatorState,
    pub rear_left: ActuatorState,
    pub rear_right: ActuatorState,
}

impl ActuatorSet {
    #[must_use]
    pub fn get(&self, key: ActuatorKey) -> &ActuatorState {
        match key {
            ActuatorKey::FrontLeft => &self.front_left,
            ActuatorKey::FrontRight => &self.front_right,
            ActuatorKey::RearLeft => &self.rear_left,
            ActuatorKey::RearRight => &self.rear_right,
        }
    }

    pub fn get_mut(&mut self, key: ActuatorKey) -> &mut ActuatorState {
        match key {
            ActuatorKey::FrontLeft => &mut self.front_left,
            ActuatorKey::FrontRight => &mut self.front_right,
            ActuatorKey::RearLeft => &mut self.rear_left,
            ActuatorKey::RearRight => &mut self.rear_right,
        }
    }
}

/// Body of `GET /api/sensors`. Fields the firmware printed as `nan`/`inf`
/// arrive as `None`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SensorReading {
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub vertical_accel: Option<f64>,
    pub voltages: Vec<Option<f64>>,
}

/// A point-in-time sensor observation.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    /// Degrees
    pub roll: Option<f64>,
    /// Degrees
    pub pitch: Option<f64>,
    /// Degrees
    pub yaw: Option<f64>,
    /// g
    pub vertical_accel: Option<f64>,
    /// Volts, one entry per battery input
    pub voltages: Vec<Option<f64>>,
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySample {
    #[must_use]
    pub fn capture(reading: SensorReading, captured_at: DateTime<Utc>) -> Self {
        Self {
            roll: reading.roll,
            pitch: reading.pitch,
            yaw: reading.yaw,
            vertical_accel: reading.vertical_accel,
            voltages: reading.voltages,
            captured_at,
        }
    }

    /// Returns `(roll, pitch)`, or a decode error if either is missing.
    pub fn orientation(&self) -> Result<(f64, f64), DeviceError> {
        match (self.roll, self.pitch) {
            (Some(roll), Some(pitch)) => Ok((roll, pitch)),
            _ => Err(DeviceError::ProtocolDecode(
                "sensor sample is missing roll or pitch".to_string(),
            )),
        }
    }
}

/// One battery input as configured on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatteryConfig {
    pub name: String,
    pub cell_count: u8,
    pub plug_assignment: u8,
    #[serde(deserialize_with = "flag")]
    pub show_on_dashboard: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cell_count: 3,
            plug_assignment: 0,
            show_on_dashboard: false,
        }
    }
}

/// Body of `GET /api/battery-config`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct BatteryConfigDoc {
    #[serde(default, deserialize_with = "battery_list")]
    pub batteries: Vec<BatteryConfig>,
}

/// Combined body of `GET /api/config`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub reaction_speed: f64,
    pub ride_height_offset: f64,
    pub range_limit: f64,
    pub damping: f64,
    pub front_rear_balance: f64,
    pub stiffness: f64,
    pub mpu_orientation: u8,
    pub servos: ActuatorSet,
    #[serde(deserialize_with = "battery_list")]
    pub batteries: Vec<BatteryConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reaction_speed: 1.0,
            ride_height_offset: 0.0,
            range_limit: 30.0,
            damping: 0.8,
            front_rear_balance: 0.5,
            stiffness: 1.0,
            mpu_orientation: 0,
            servos: ActuatorSet::default(),
            batteries: Vec::new(),
        }
    }
}

/// Partial update for `POST /api/config`. Unset fields are not sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ride_height_offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damping: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub front_rear_balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stiffness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpu_orientation: Option<u8>,
}

impl ConfigUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == ConfigUpdate::default()
    }
}

/// Body of `GET /api/health`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Health {
    pub status: String,
    pub mpu6050: bool,
}

impl Health {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// The firmware stores booleans as 0/1 in some places.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Accepts the battery list either as an array or as an object keyed by
/// battery number (`{"1": {...}, "2": {...}}`), ordered by that number.
fn battery_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<BatteryConfig>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        List(Vec<BatteryConfig>),
        Keyed(BTreeMap<String, BatteryConfig>),
        Missing(()),
    }

    Ok(match Wire::deserialize(deserializer)? {
        Wire::List(list) => list,
        Wire::Keyed(map) => {
            let mut entries: Vec<(u32, BatteryConfig)> = map
                .into_iter()
                .map(|(k, v)| (k.trim().parse().unwrap_or(u32::MAX), v))
                .collect();
            entries.sort_by_key(|(n, _)| *n);
            entries.into_iter().map(|(_, v)| v).collect()
        }
        Wire::Missing(()) => Vec::new(),
    })
}
