//! # Sensor Snapshot Accessor
//!
//! Point-in-time reads of orientation and battery state over HTTP.
//!
//! ```text
//!   caller A ─┐
//!   caller B ─┼──► SensorAccessor ──► fresh cache? ──► return cached sample
//!   caller C ─┘         │
//!                       ├── request in flight? ──► wait on its broadcast
//!                       │
//!                       └── otherwise ──► spawn one GET /api/sensors
//!                                          (bounded by request timeout)
//! ```
//!
//! All callers inside one coalescing window observe the same outcome, value
//! or error. Errors are not cached and are never retried here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SensorConfig;
use crate::device::types::{SensorReading, TelemetrySample};
use crate::device::{decode, HttpTransport};
use crate::error::DeviceError;

const SENSORS_PATH: &str = "/api/sensors";

type Outcome = Result<TelemetrySample, DeviceError>;

/// Anything that can produce one fresh orientation sample.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrientationSource: Send + Sync {
    async fn snapshot(&self) -> Result<TelemetrySample, DeviceError>;
}

/// Counters for monitoring how often reads hit the network.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessorStats {
    /// Total `snapshot()` calls
    pub calls: u64,
    /// Calls answered from the cache
    pub cache_hits: u64,
    /// Calls that joined an in-flight request
    pub coalesced: u64,
    /// Requests actually sent to the device
    pub requests: u64,
}

#[derive(Default)]
struct State {
    cached: Option<(Instant, TelemetrySample)>,
    in_flight: Option<broadcast::Sender<Outcome>>,
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    min_interval: Duration,
    request_timeout: Duration,
    state: Mutex<State>,
    calls: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    requests: AtomicU64,
}

/// Rate-limited, request-coalescing sensor reader.
#[derive(Clone)]
pub struct SensorAccessor {
    inner: Arc<Inner>,
}

fn lock(mutex: &Mutex<State>) -> MutexGuard<'_, State> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Clears the in-flight slot if a fetch dies before publishing its outcome.
/// Dropping the sender wakes every waiter with `RecvError::Closed`.
struct InFlightReset<'a> {
    state: &'a Mutex<State>,
    armed: bool,
}

impl Drop for InFlightReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.state).in_flight = None;
        }
    }
}

impl SensorAccessor {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &SensorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                min_interval: config.min_interval(),
                request_timeout: config.request_timeout(),
                state: Mutex::new(State::default()),
                calls: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                requests: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the most recent reading.
    ///
    /// The device request runs on its own task, so a caller that gives up
    /// waiting does not strand the other waiters.
    ///
    /// # Errors
    ///
    /// Returns the request's [`DeviceError`]: a timeout, an unreachable
    /// device, or an undecodable body.
    pub async fn snapshot(&self) -> Outcome {
        self.inner.calls.fetch_add(1, Ordering::Relaxed);

        let mut rx = {
            let mut state = lock(&self.inner.state);

            if let Some((at, sample)) = &state.cached {
                if at.elapsed() < self.inner.min_interval {
                    self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(sample.clone());
                }
            }

            match &state.in_flight {
                Some(tx) => {
                    self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!("joining in-flight sensor request");
                    tx.subscribe()
                }
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    state.in_flight = Some(tx);
                    tokio::spawn(Inner::fetch(Arc::clone(&self.inner)));
                    rx
                }
            }
        };

        rx.recv()
            .await
            .map_err(|e| DeviceError::TransportUnreachable(format!("sensor request abandoned: {}", e)))?
    }

    pub fn stats(&self) -> AccessorStats {
        AccessorStats {
            calls: self.inner.calls.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            requests: self.inner.requests.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn fetch(self: Arc<Self>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut reset = InFlightReset {
            state: &self.state,
            armed: true,
        };

        let outcome = match tokio::time::timeout(self.request_timeout, self.transport.get_json(SENSORS_PATH)).await {
            Ok(Ok(body)) => decode::<SensorReading>(SENSORS_PATH, body)
                .map(|reading| TelemetrySample::capture(reading, Utc::now())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::TransportTimeout {
                path: SENSORS_PATH.to_string(),
                timeout: self.request_timeout,
            }),
        };

        if let Err(e) = &outcome {
            warn!(error = %e, "sensor read failed");
        }

        let tx = {
            let mut state = lock(&self.state);
            if let Ok(sample) = &outcome {
                state.cached = Some((Instant::now(), sample.clone()));
            }
            reset.armed = false;
            state.in_flight.take()
        };

        if let Some(tx) = tx {
            // No receivers left is fine; the cache is already updated
            let _ = tx.send(outcome);
        }
    }
}

#[async_trait]
impl OrientationSource for SensorAccessor {
    async fn snapshot(&self) -> Outcome {
        SensorAccessor::snapshot(self).await
    }
}

impl std::fmt::Debug for SensorAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorAccessor")
            .field("min_interval", &self.inner.min_interval)
            .field("request_timeout", &self.inner.request_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}
