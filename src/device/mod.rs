//! # Device Module
//!
//! HTTP access to the suspension controller.
//!
//! This module handles:
//! - Routing requests directly or through the bridging proxy
//! - The serde schema for every device body
//! - Device-level operations (health, config, calibration, batteries, resets)

pub mod transport;
pub mod types;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::DeviceError;
pub use transport::{Endpoint, HttpTransport, ReqwestTransport};
pub use types::{
    ActuatorKey, ActuatorSet, ActuatorState, BatteryConfig, BatteryConfigDoc, ConfigUpdate,
    DeviceConfig, Health, SensorReading, TelemetrySample,
};

pub(crate) fn decode<T: DeserializeOwned>(path: &str, body: Value) -> Result<T, DeviceError> {
    serde_json::from_value(body).map_err(|e| DeviceError::ProtocolDecode(format!("{}: {}", path, e)))
}

/// Device operations outside the leveling loop.
#[derive(Clone)]
pub struct DeviceClient {
    transport: Arc<dyn HttpTransport>,
}

impl DeviceClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn health(&self) -> Result<Health, DeviceError> {
        let body = self.transport.get_json("/api/health").await?;
        decode("/api/health", body)
    }

    /// Full configuration: system parameters, servos and batteries.
    pub async fn config(&self) -> Result<DeviceConfig, DeviceError> {
        let body = self.transport.get_json("/api/config").await?;
        decode("/api/config", body)
    }

    /// Sends only the fields set in `update`. An empty update is a no-op.
    pub async fn update_config(&self, update: &ConfigUpdate) -> Result<(), DeviceError> {
        if update.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(update).map_err(|e| DeviceError::ProtocolDecode(e.to_string()))?;
        debug!(?update, "updating device config");
        self.transport.post_json("/api/config", &body).await?;
        Ok(())
    }

    /// Stores the current orientation as level on the device.
    pub async fn calibrate_orientation(&self) -> Result<(), DeviceError> {
        info!("calibrating orientation");
        self.transport.post_json("/api/calibrate", &json!({})).await?;
        Ok(())
    }

    pub async fn calibrate_actuator(&self, key: ActuatorKey) -> Result<(), DeviceError> {
        info!(actuator = %key, "calibrating actuator");
        self.transport
            .post_json("/api/calibrate", &json!({ "servo": key.as_str() }))
            .await?;
        Ok(())
    }

    pub async fn battery_config(&self) -> Result<Vec<BatteryConfig>, DeviceError> {
        let body = self.transport.get_json("/api/battery-config").await?;
        let doc: BatteryConfigDoc = decode("/api/battery-config", body)?;
        Ok(doc.batteries)
    }

    /// Sets one parameter of battery input `battery` (e.g. `"cellCount"`).
    pub async fn update_battery(&self, battery: u8, param: &str, value: Value) -> Result<(), DeviceError> {
        debug!(battery, param, %value, "updating battery config");
        self.transport
            .post_json(
                "/api/battery-config",
                &json!({ "battery": battery, "param": param, "value": value }),
            )
            .await?;
        Ok(())
    }

    /// Restores one actuator to factory settings.
    pub async fn reset_actuator(&self, key: ActuatorKey) -> Result<(), DeviceError> {
        info!(actuator = %key, "resetting actuator");
        self.transport
            .post_json("/api/servo-reset", &json!({ "servo": key.as_str() }))
            .await?;
        Ok(())
    }

    pub async fn reset_all_actuators(&self) -> Result<(), DeviceError> {
        info!("resetting all actuators");
        self.transport.post_json("/api/servo-reset-all", &json!({})).await?;
        Ok(())
    }
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use transport::MockHttpTransport;

    fn client(mock: MockHttpTransport) -> DeviceClient {
        DeviceClient::new(Arc::new(mock))
    }

    #[tokio::test]
    async fn test_health() {
        let mut mock = MockHttpTransport::new();
        mock.expect_get_json()
            .withf(|path| path == "/api/health")
            .times(1)
            .returning(|_| Ok(json!({"status": "ok", "mpu6050": true})));

        let health = client(mock).health().await.unwrap();
        assert!(health.is_ok());
        assert!(health.mpu6050);
    }

    #[tokio::test]
    async fn test_config_merges_servos_and_batteries() {
        let mut mock = MockHttpTransport::new();
        mock.expect_get_json().withf(|path| path == "/api/config").returning(|_| {
            Ok(json!({
                "damping": 0.7,
                "servos": {"rearLeft": {"trim": 4, "reversed": true}},
                "batteries": {"1": {"name": "Main"}}
            }))
        });

        let config = client(mock).config().await.unwrap();
        assert_eq!(config.damping, 0.7);
        assert_eq!(config.servos.rear_left.trim, 4);
        assert!(config.servos.rear_left.reversed);
        assert_eq!(config.batteries[0].name, "Main");
    }

    #[tokio::test]
    async fn test_config_decode_error() {
        let mut mock = MockHttpTransport::new();
        mock.expect_get_json().returning(|_| Ok(json!({"damping": "soft"})));

        let err = assert_err!(client(mock).config().await);
        assert!(matches!(err, DeviceError::ProtocolDecode(_)));
    }

    #[tokio::test]
    async fn test_update_config_sends_only_set_fields() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post_json()
            .withf(|path, body| path == "/api/config" && *body == json!({"stiffness": 1.4}))
            .times(1)
            .returning(|_, _| Ok(Value::Null));

        let update = ConfigUpdate {
            stiffness: Some(1.4),
            ..Default::default()
        };
        client(mock).update_config(&update).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_update_is_not_sent() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post_json().never();

        client(mock).update_config(&ConfigUpdate::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_calibrate_bodies() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post_json()
            .withf(|path, body| path == "/api/calibrate" && *body == json!({}))
            .times(1)
            .returning(|_, _| Ok(Value::Null));
        mock.expect_post_json()
            .withf(|path, body| path == "/api/calibrate" && *body == json!({"servo": "frontRight"}))
            .times(1)
            .returning(|_, _| Ok(Value::Null));

        let client = client(mock);
        assert_ok!(client.calibrate_orientation().await);
        assert_ok!(client.calibrate_actuator(ActuatorKey::FrontRight).await);
    }

    #[tokio::test]
    async fn test_battery_config_and_update() {
        let mut mock = MockHttpTransport::new();
        mock.expect_get_json()
            .withf(|path| path == "/api/battery-config")
            .returning(|_| Ok(json!({"batteries": [{"name": "Main", "cellCount": 4}]})));
        mock.expect_post_json()
            .withf(|path, body| {
                path == "/api/battery-config" && *body == json!({"battery": 1, "param": "cellCount", "value": 6})
            })
            .times(1)
            .returning(|_, _| Ok(Value::Null));

        let client = client(mock);
        let batteries = client.battery_config().await.unwrap();
        assert_eq!(batteries[0].cell_count, 4);
        client.update_battery(1, "cellCount", json!(6)).await.unwrap();
    }

    #[tokio::test]
    async fn test_resets() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post_json()
            .withf(|path, body| path == "/api/servo-reset" && *body == json!({"servo": "rearLeft"}))
            .times(1)
            .returning(|_, _| Ok(Value::Null));
        mock.expect_post_json()
            .withf(|path, _| path == "/api/servo-reset-all")
            .times(1)
            .returning(|_, _| Ok(Value::Null));

        let client = client(mock);
        assert_ok!(client.reset_actuator(ActuatorKey::RearLeft).await);
        assert_ok!(client.reset_all_actuators().await);
    }

    #[tokio::test]
    async fn test_rejected_write_propagates() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post_json()
            .returning(|_, _| Err(DeviceError::ActuationRejected("HTTP 400".into())));

        let err = client(mock).reset_all_actuators().await.unwrap_err();
        assert_eq!(err, DeviceError::ActuationRejected("HTTP 400".into()));
    }
}
