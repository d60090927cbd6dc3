//! # Telemetry Messages
//!
//! Decoding of stream frames into type-tagged messages.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::sanitize::sanitize;
use crate::device::types::{SensorReading, TelemetrySample};
use crate::error::DeviceError;

/// A decoded stream message, keyed by its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    /// Value of the `type` field, e.g. `"telemetry"`
    pub kind: String,
    /// The full decoded object, `type` included
    pub body: Value,
}

impl TelemetryMessage {
    /// Interprets the message body as a sensor reading.
    ///
    /// Works for any message shape that carries orientation or voltage fields.
    pub fn to_sample(&self, captured_at: DateTime<Utc>) -> Result<TelemetrySample, DeviceError> {
        let reading: SensorReading = serde_json::from_value(self.body.clone())
            .map_err(|e| DeviceError::ProtocolDecode(format!("{} message: {}", self.kind, e)))?;
        Ok(TelemetrySample::capture(reading, captured_at))
    }
}

/// Decodes one text frame.
///
/// Returns `Ok(None)` for frames that are not JSON objects (plain-text status
/// lines from the firmware). Anything that looks like an object but fails to
/// decode, or lacks a string `type`, is a [`DeviceError::ProtocolDecode`].
pub fn decode_frame(payload: &str) -> Result<Option<TelemetryMessage>, DeviceError> {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') {
        return Ok(None);
    }

    let body: Value = serde_json::from_str(&sanitize(trimmed))
        .map_err(|e| DeviceError::ProtocolDecode(e.to_string()))?;

    let kind = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DeviceError::ProtocolDecode("frame has no string 'type' field".to_string()))?
        .to_string();

    Ok(Some(TelemetryMessage { kind, body }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_is_skipped() {
        assert_eq!(decode_frame("🔄 Starting recalibration...").unwrap(), None);
        assert_eq!(decode_frame("").unwrap(), None);
        assert_eq!(decode_frame("[1,2,3]").unwrap(), None);
    }

    #[test]
    fn test_leading_whitespace_allowed() {
        let msg = decode_frame("  \n{\"type\":\"telemetry\",\"roll\":1.0}").unwrap().unwrap();
        assert_eq!(msg.kind, "telemetry");
    }

    #[test]
    fn test_nan_fields_decode_to_null() {
        let msg = decode_frame(r#"{"type":"telemetry","roll":nan,"pitch":-inf,"yaw":2.5}"#)
            .unwrap()
            .unwrap();
        assert!(msg.body["roll"].is_null());
        assert!(msg.body["pitch"].is_null());

        let sample = msg.to_sample(Utc::now()).unwrap();
        assert_eq!(sample.roll, None);
        assert_eq!(sample.pitch, None);
        assert_eq!(sample.yaw, Some(2.5));
    }

    #[test]
    fn test_malformed_object_is_decode_error() {
        let result = decode_frame(r#"{"type":"telemetry","roll":"#);
        assert!(matches!(result, Err(DeviceError::ProtocolDecode(_))));
    }

    #[test]
    fn test_missing_type_is_decode_error() {
        let result = decode_frame(r#"{"roll":1.0}"#);
        assert!(matches!(result, Err(DeviceError::ProtocolDecode(_))));
    }

    #[test]
    fn test_battery_message_to_sample() {
        let msg = decode_frame(r#"{"type":"battery","voltages":[12.6,nan,7.4]}"#)
            .unwrap()
            .unwrap();
        let sample = msg.to_sample(Utc::now()).unwrap();
        assert_eq!(sample.voltages, vec![Some(12.6), None, Some(7.4)]);
        assert_eq!(sample.roll, None);
    }
}
