//! Trait abstraction for device HTTP calls to enable testing

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::telemetry::sanitize::sanitize;

/// Header the bridging proxy reads the target device address from.
pub const BRIDGE_ADDRESS_HEADER: &str = "X-ESP32-IP";

/// Where requests for one device go: straight to the device, or through the
/// bridging proxy with the device address attached to each call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    address: String,
    bridge_url: Option<String>,
}

impl Endpoint {
    /// # Errors
    ///
    /// Returns [`DeviceError::DeviceAddressMissing`] if the address is blank
    pub fn new(address: &str, bridge_url: Option<&str>) -> Result<Self, DeviceError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(DeviceError::DeviceAddressMissing);
        }
        Ok(Self {
            address: address.to_string(),
            bridge_url: bridge_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, DeviceError> {
        Self::new(&config.address, config.bridge_url.as_deref())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Full URL for an API path such as `/api/sensors`.
    pub fn http_url(&self, path: &str) -> String {
        match &self.bridge_url {
            Some(bridge) => format!("{}{}", bridge, path),
            None => format!("http://{}{}", self.address, path),
        }
    }

    /// URL of the streaming endpoint. Through the bridge the device address
    /// travels as the `ip` query parameter.
    pub fn stream_url(&self) -> String {
        match &self.bridge_url {
            Some(bridge) => {
                let ws_base = if let Some(rest) = bridge.strip_prefix("https://") {
                    format!("wss://{}", rest)
                } else if let Some(rest) = bridge.strip_prefix("http://") {
                    format!("ws://{}", rest)
                } else {
                    bridge.clone()
                };
                format!("{}/ws?ip={}", ws_base, self.address)
            }
            None => format!("ws://{}/ws", self.address),
        }
    }

    /// Header to attach to every HTTP request, if routing through the bridge.
    pub fn bridge_header(&self) -> Option<(&'static str, &str)> {
        self.bridge_url
            .as_ref()
            .map(|_| (BRIDGE_ADDRESS_HEADER, self.address.as_str()))
    }
}

/// Trait for device HTTP calls that exchange JSON
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET `path` and decode the body
    async fn get_json(&self, path: &str) -> Result<Value, DeviceError>;

    /// POST `body` to `path` and decode the reply (`Value::Null` if empty)
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, DeviceError>;
}

/// Wrapper around `reqwest::Client` that implements HttpTransport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    endpoint: Endpoint,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceError::TransportUnreachable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, DeviceError> {
        Self::new(Endpoint::from_config(config)?, config.http_timeout())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.endpoint.http_url(path));
        match self.endpoint.bridge_header() {
            Some((name, value)) => builder.header(name, value),
            None => builder,
        }
    }

    fn send_error(&self, path: &str, e: reqwest::Error) -> DeviceError {
        if e.is_timeout() {
            DeviceError::TransportTimeout {
                path: path.to_string(),
                timeout: self.timeout,
            }
        } else {
            DeviceError::TransportUnreachable(format!("{}: {}", path, e))
        }
    }

    async fn read_body(&self, path: &str, response: reqwest::Response) -> Result<Value, DeviceError> {
        let text = response
            .text()
            .await
            .map_err(|e| self.send_error(path, e))?;
        decode_body(&text)
    }
}

/// Decodes a response body, tolerating the firmware's non-finite tokens.
pub(crate) fn decode_body(text: &str) -> Result<Value, DeviceError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&sanitize(text)).map_err(|e| DeviceError::ProtocolDecode(e.to_string()))
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_json(&self, path: &str) -> Result<Value, DeviceError> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| self.send_error(path, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::TransportUnreachable(format!("HTTP {} from {}", status, path)));
        }

        debug!(path, "GET ok");
        self.read_body(path, response).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, DeviceError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| self.send_error(path, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DeviceError::ActuationRejected(format!(
                "HTTP {} from {}: {}",
                status,
                path,
                detail.trim()
            )));
        }

        debug!(path, "POST ok");
        self.read_body(path, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_blank_address_is_missing() {
        assert_eq!(Endpoint::new("  ", None), Err(DeviceError::DeviceAddressMissing));
        assert_err!(Endpoint::new("", Some("http://bridge:8080")));
    }

    #[test]
    fn test_direct_urls() {
        let endpoint = Endpoint::new("192.168.4.1", None).unwrap();
        assert_eq!(endpoint.http_url("/api/sensors"), "http://192.168.4.1/api/sensors");
        assert_eq!(endpoint.stream_url(), "ws://192.168.4.1/ws");
        assert_eq!(endpoint.bridge_header(), None);
    }

    #[test]
    fn test_bridge_urls() {
        let endpoint = Endpoint::new("10.0.0.7", Some("https://localhost:3443/")).unwrap();
        assert_eq!(endpoint.http_url("/api/config"), "https://localhost:3443/api/config");
        assert_eq!(endpoint.stream_url(), "wss://localhost:3443/ws?ip=10.0.0.7");
        assert_eq!(endpoint.bridge_header(), Some((BRIDGE_ADDRESS_HEADER, "10.0.0.7")));

        let plain = Endpoint::new("10.0.0.7", Some("http://bridge:8080")).unwrap();
        assert_eq!(plain.stream_url(), "ws://bridge:8080/ws?ip=10.0.0.7");
    }

    #[test]
    fn test_from_config_uses_default_address() {
        let endpoint = Endpoint::from_config(&DeviceConfig::default()).unwrap();
        assert_eq!(endpoint.address(), "192.168.4.1");
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body("").unwrap(), Value::Null);
        let value = decode_body(r#"{"roll":nan,"pitch":1.0}"#).unwrap();
        assert!(value["roll"].is_null());
        assert!(matches!(decode_body("<html>"), Err(DeviceError::ProtocolDecode(_))));
    }

    #[tokio::test]
    async fn test_unreachable_device_maps_to_transport_error() {
        // Port 9 on localhost is almost never listening
        let endpoint = Endpoint::new("127.0.0.1:9", None).unwrap();
        let transport = ReqwestTransport::new(endpoint, Duration::from_millis(500)).unwrap();

        let err = assert_err!(transport.get_json("/api/health").await);
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }
}
