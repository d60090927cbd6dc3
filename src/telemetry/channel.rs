//! # Telemetry Channel
//!
//! Owns the single streaming connection to the device and fans decoded
//! messages out to subscribers keyed by message type.
//!
//! ## Connection lifecycle
//!
//! ```text
//!   connect() ──► Connecting ──► Open ──► (close / error) ──► Closed
//!                     │                                         │
//!                     └──────── (connect error) ────────────────┤
//!                                                               ▼
//!                                        one reconnect after a fixed delay
//!                                        (only while subscribers exist)
//! ```
//!
//! `connect()` is idempotent: it does nothing while a connection is
//! connecting or open. At most one reconnect is ever pending. Opening a
//! connection cancels any reconnect that is still waiting.
//!
//! Errors never reach callers. Transport failures are logged and feed the
//! reconnect loop. A frame that fails to decode is logged and dropped
//! without affecting later frames.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::message::{decode_frame, TelemetryMessage};
use crate::error::DeviceError;

/// Subscriber callback. Invoked synchronously on the connection task.
pub type Callback = Arc<dyn Fn(&TelemetryMessage) + Send + Sync>;

/// A raw frame as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Stream of frames from one open connection.
pub type FrameStream = BoxStream<'static, Result<Frame, DeviceError>>;

/// Opens streaming connections to the device.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<FrameStream, DeviceError>;
}

/// WebSocket connector for the device's `/ws` endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<FrameStream, DeviceError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| DeviceError::TransportUnreachable(format!("{}: {}", self.url, e)))?;

        let frames = socket.filter_map(|item| async move {
            match item {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(_) => None,
                Err(e) => Some(Err(DeviceError::TransportUnreachable(e.to_string()))),
            }
        });

        Ok(frames.boxed())
    }
}

/// Connection state as seen by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Connecting,
    Open,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<String, Vec<(u64, Callback)>>,
}

impl Registry {
    fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }
}

struct Link {
    state: LinkState,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn StreamConnector>,
    reconnect_delay: Duration,
    registry: Mutex<Registry>,
    link: Mutex<Link>,
}

/// Handle to the telemetry connection manager. Cheap to clone; all clones
/// share one connection and one subscriber table.
#[derive(Clone)]
pub struct TelemetryChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TelemetryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryChannel")
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// Registration returned by [`TelemetryChannel::subscribe`]. Dropping it (or
/// calling [`Subscription::unsubscribe`]) removes exactly that registration.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    inner: Weak<Inner>,
    kind: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut registry = lock(&inner.registry);
            if let Some(list) = registry.by_kind.get_mut(&self.kind) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    registry.by_kind.remove(&self.kind);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Callbacks run outside these locks, so poisoning can only come from a
    // panic in our own bookkeeping; the data is still consistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TelemetryChannel {
    /// Creates a channel. No connection is opened until [`connect`](Self::connect).
    pub fn new(connector: Arc<dyn StreamConnector>, reconnect_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect_delay,
                registry: Mutex::new(Registry::default()),
                link: Mutex::new(Link {
                    state: LinkState::Closed,
                    reader: None,
                    reconnect: None,
                }),
            }),
        }
    }

    /// Registers `callback` for messages whose `type` equals `kind`.
    ///
    /// Callbacks for one type run in registration order.
    pub fn subscribe<F>(&self, kind: &str, callback: F) -> Subscription
    where
        F: Fn(&TelemetryMessage) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .by_kind
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        debug!(kind, id, "telemetry subscriber added");

        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind: kind.to_string(),
            id,
        }
    }

    /// Opens the connection unless one is already connecting or open.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        Inner::connect(&self.inner);
    }

    /// Closes the connection and cancels any pending reconnect.
    pub fn shutdown(&self) {
        let mut link = lock(&self.inner.link);
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        if let Some(reconnect) = link.reconnect.take() {
            reconnect.abort();
        }
        link.state = LinkState::Closed;
        info!("telemetry channel shut down");
    }

    pub fn state(&self) -> LinkState {
        lock(&self.inner.link).state
    }

    /// Whether a reconnect attempt is scheduled and has not fired yet.
    pub fn reconnect_pending(&self) -> bool {
        lock(&self.inner.link)
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    /// Feeds one frame through decoding and fan-out, as if it had arrived on
    /// the connection.
    pub fn handle_frame(&self, frame: Frame) {
        self.inner.handle_frame(frame);
    }
}

impl Inner {
    fn connect(this: &Arc<Self>) {
        let mut link = lock(&this.link);
        if link.state != LinkState::Closed {
            debug!(state = ?link.state, "connect ignored, connection already active");
            return;
        }

        link.state = LinkState::Connecting;
        let inner = Arc::clone(this);
        link.reader = Some(tokio::spawn(async move { inner.run_connection().await }));
    }

    async fn run_connection(self: Arc<Self>) {
        match self.connector.connect().await {
            Ok(mut frames) => {
                self.on_open();
                while let Some(item) = frames.next().await {
                    match item {
                        Ok(Frame::Close) => {
                            info!("telemetry stream closed by device");
                            break;
                        }
                        Ok(frame) => self.handle_frame(frame),
                        Err(e) => {
                            warn!(error = %e, "telemetry stream error");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "telemetry connect failed"),
        }

        Inner::on_lost(&self);
    }

    fn on_open(&self) {
        let mut link = lock(&self.link);
        link.state = LinkState::Open;
        if let Some(pending) = link.reconnect.take() {
            pending.abort();
        }
        info!("telemetry stream connected");
    }

    fn on_lost(this: &Arc<Self>) {
        let subscribers = lock(&this.registry).len();
        let mut link = lock(&this.link);
        link.state = LinkState::Closed;
        link.reader = None;

        if link.reconnect.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("reconnect already pending");
            return;
        }
        if subscribers == 0 {
            debug!("no subscribers, not reconnecting");
            return;
        }

        let delay = this.reconnect_delay;
        info!(delay_ms = delay.as_millis() as u64, "scheduling telemetry reconnect");

        let weak = Arc::downgrade(this);
        link.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };

            lock(&inner.link).reconnect = None;
            if lock(&inner.registry).len() == 0 {
                debug!("subscribers gone, reconnect abandoned");
                return;
            }
            debug!("attempting telemetry reconnect");
            Inner::connect(&inner);
        }));
    }

    fn handle_frame(&self, frame: Frame) {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "dropping binary frame that is not UTF-8");
                    return;
                }
            },
            Frame::Close => return,
        };

        match decode_frame(&text) {
            Ok(Some(message)) => self.dispatch(&message),
            Ok(None) => debug!(frame = %text.trim(), "ignoring non-JSON frame"),
            Err(e) => warn!(error = %e, "dropping undecodable telemetry frame"),
        }
    }

    fn dispatch(&self, message: &TelemetryMessage) {
        let callbacks: Vec<Callback> = lock(&self.registry)
            .by_kind
            .get(&message.kind)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        // A panicking subscriber must not take the reader task down with it
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                warn!(kind = %message.kind, "telemetry subscriber panicked, frame skipped for it");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// What the next `connect()` call should do.
    pub enum Script {
        Fail,
        Open(mpsc::UnboundedReceiver<Result<Frame, DeviceError>>),
    }

    /// Connector that replays scripted outcomes and records when it was called.
    /// Once the script runs out every attempt fails.
    #[derive(Clone, Default)]
    pub struct ScriptedConnector {
        pub script: Arc<Mutex<VecDeque<Script>>>,
        pub attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedConnector {
        pub fn push(&self, step: Script) {
            self.script.lock().unwrap().push_back(step);
        }

        /// Scripts an open connection and returns the sender that feeds it.
        pub fn push_open(&self) -> mpsc::UnboundedSender<Result<Frame, DeviceError>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.push(Script::Open(rx));
            tx
        }

        pub fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self) -> Result<FrameStream, DeviceError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Script::Open(rx)) => {
                    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|item| (item, rx))
                    });
                    Ok(stream.boxed())
                }
                Some(Script::Fail) | None => {
                    Err(DeviceError::TransportUnreachable("scripted failure".to_string()))
                }
            }
        }
    }
}
