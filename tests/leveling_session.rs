//! End-to-end leveling sessions against a simulated rig.
//!
//! The rig answers the device HTTP API in-process, so the real sensor
//! accessor, actuator client and controller all run unchanged.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use suspension_tuner::actuator::ActuatorClient;
use suspension_tuner::config::Config;
use suspension_tuner::device::{ActuatorKey, ActuatorSet, DeviceClient, HttpTransport};
use suspension_tuner::error::DeviceError;
use suspension_tuner::leveling::{AutoLevelController, Phase, SessionOutcome};
use suspension_tuner::sensors::SensorAccessor;
use suspension_tuner::telemetry::channel::FrameStream;
use suspension_tuner::telemetry::{LinkState, StreamConnector, TelemetryChannel};

const LATENCY: Duration = Duration::from_millis(20);

#[derive(Default)]
struct RigState {
    servos: ActuatorSet,
    base: (f64, f64),
    /// (roll, pitch) per degree of physical raise
    response: [(f64, f64); 4],
    inverted: [bool; 4],
    sensor_reads: u32,
    trim_writes: Vec<(ActuatorKey, i64)>,
    calibrations: u32,
}

/// In-process stand-in for the rig's HTTP API.
#[derive(Default)]
struct SimDevice {
    state: Mutex<RigState>,
}

fn index(key: ActuatorKey) -> usize {
    ActuatorKey::ALL.iter().position(|k| *k == key).unwrap()
}

impl SimDevice {
    fn new(roll: f64, pitch: f64) -> Arc<Self> {
        let device = SimDevice::default();
        device.state.lock().unwrap().base = (roll, pitch);
        Arc::new(device)
    }

    /// Right-hand corners correct tilt; front-right is mounted inverted
    fn with_inverted_front_right(roll: f64, pitch: f64) -> Arc<Self> {
        let device = SimDevice::new(roll, pitch);
        {
            let mut s = device.state.lock().unwrap();
            s.response = [(0.0, 0.0), (0.5, 0.5), (0.0, 0.0), (0.5, -0.5)];
            s.inverted[1] = true;
        }
        device
    }

    fn orientation(s: &RigState) -> (f64, f64) {
        let (mut roll, mut pitch) = s.base;
        for key in ActuatorKey::ALL {
            let i = index(key);
            let servo = s.servos.get(key);
            let sign = if s.inverted[i] != servo.reversed { -1.0 } else { 1.0 };
            let raise = f64::from(servo.trim) * sign;
            roll += s.response[i].0 * raise;
            pitch += s.response[i].1 * raise;
        }
        (roll, pitch)
    }
}

#[async_trait]
impl HttpTransport for SimDevice {
    async fn get_json(&self, path: &str) -> Result<Value, DeviceError> {
        tokio::time::sleep(LATENCY).await;
        let mut s = self.state.lock().unwrap();
        match path {
            "/api/sensors" => {
                s.sensor_reads += 1;
                let (roll, pitch) = SimDevice::orientation(&s);
                Ok(json!({
                    "roll": roll,
                    "pitch": pitch,
                    "yaw": 12.0,
                    "verticalAccel": 1.0,
                    "voltages": [12.4, null]
                }))
            }
            "/api/servo-config" => Ok(serde_json::to_value(s.servos).unwrap()),
            other => Err(DeviceError::TransportUnreachable(format!("HTTP 404 from {}", other))),
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, DeviceError> {
        tokio::time::sleep(LATENCY).await;
        let mut s = self.state.lock().unwrap();
        match path {
            "/api/servo-config" => {
                let key = ActuatorKey::from_str(body["servo"].as_str().unwrap_or_default())?;
                match body["param"].as_str() {
                    Some("trim") => {
                        let trim = body["value"]
                            .as_i64()
                            .ok_or_else(|| DeviceError::ActuationRejected("trim must be an integer".into()))?;
                        s.trim_writes.push((key, trim));
                        s.servos.get_mut(key).trim = trim as i32;
                    }
                    Some("reversed") => {
                        s.servos.get_mut(key).reversed = body["value"]
                            .as_bool()
                            .ok_or_else(|| DeviceError::ActuationRejected("reversed must be a bool".into()))?;
                    }
                    _ => return Err(DeviceError::ActuationRejected("HTTP 400".into())),
                }
                Ok(json!({"status": "ok"}))
            }
            "/api/calibrate" => {
                s.calibrations += 1;
                Ok(json!({"status": "ok"}))
            }
            other => Err(DeviceError::ActuationRejected(format!("HTTP 404 from {}", other))),
        }
    }
}

fn build(device: &Arc<SimDevice>, config: &Config) -> (AutoLevelController, SensorAccessor) {
    let transport: Arc<dyn HttpTransport> = device.clone();
    let accessor = SensorAccessor::new(Arc::clone(&transport), &config.sensors);
    let controller = AutoLevelController::new(
        Arc::new(accessor.clone()),
        Arc::new(ActuatorClient::new(Arc::clone(&transport))),
        Arc::new(DeviceClient::new(transport)),
        config.leveling.clone(),
    );
    (controller, accessor)
}

#[tokio::test(start_paused = true)]
async fn test_session_detects_polarity_and_levels() {
    let config = Config::default();
    config.validate().unwrap();

    let device = SimDevice::with_inverted_front_right(10.0, 0.0);
    let (controller, accessor) = build(&device, &config);

    let report = controller.trigger().await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Succeeded);
    assert_eq!(report.iterations, 5);
    assert!(report.detected_polarity[&ActuatorKey::FrontRight]);

    let s = device.state.lock().unwrap();
    assert!(s.servos.front_right.reversed);
    assert!(!s.servos.rear_right.reversed);
    let (roll, pitch) = SimDevice::orientation(&s);
    assert!(roll.abs() < 1.5 && pitch.abs() < 1.5);

    // Every trim the rig ever saw was a whole degree within ±20
    assert!(s.trim_writes.iter().all(|(_, t)| (-20..=20).contains(t)));

    // Each decision used a fresh device read: 8 detection reads, one per
    // iteration and the final level check
    assert_eq!(s.sensor_reads, 8 + 5 + 1);
    assert_eq!(accessor.stats().cache_hits, 0);

    assert_eq!(controller.status().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_session_gives_up_on_unresponsive_rig() {
    let config = Config::default();
    let device = SimDevice::new(6.0, -4.0);
    let (controller, _) = build(&device, &config);

    let report = controller.trigger().await.unwrap();

    match report.outcome {
        SessionOutcome::Failed(reason) => assert!(reason.contains("too far out of level")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.iterations, 15);
    assert_eq!(device.state.lock().unwrap().sensor_reads, 8 + 15);
}

#[tokio::test(start_paused = true)]
async fn test_set_level_posts_calibration() {
    let config = Config::default();
    let device = SimDevice::new(3.0, 0.0);
    let (controller, _) = build(&device, &config);

    controller.set_level().await.unwrap();

    let s = device.state.lock().unwrap();
    assert_eq!(s.calibrations, 1);
    assert!(s.trim_writes.is_empty());
}

/// Connector for a stream that is down for the whole test.
#[derive(Default)]
struct DeadLink {
    attempts: AtomicUsize,
}

#[async_trait]
impl StreamConnector for DeadLink {
    async fn connect(&self) -> Result<FrameStream, DeviceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DeviceError::TransportUnreachable("connection refused".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_stream_outage_does_not_affect_session() {
    let config = Config::default();
    let device = SimDevice::with_inverted_front_right(-8.0, 0.0);
    let (controller, _) = build(&device, &config);

    let link = Arc::new(DeadLink::default());
    let channel = TelemetryChannel::new(link.clone(), config.telemetry.reconnect_delay());
    let _dashboard = channel.subscribe("telemetry", |_| {});
    channel.connect();

    let report = controller.trigger().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Succeeded);

    // The channel kept retrying on its own schedule the whole time
    assert!(link.attempts.load(Ordering::SeqCst) > 2);
    assert_ne!(channel.state(), LinkState::Open);

    channel.shutdown();
}
