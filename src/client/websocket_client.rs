//! WebSocket client for the Moonraker JSON-RPC channel
//!
//! This module owns the single duplex channel to the machine-control
//! service and correlates asynchronous responses with outstanding requests.
//!
//! Features:
//! - Monotonic request identifiers and a keyed pending-request table
//! - Optional per-request deadline with first-class timeout outcome
//! - Synchronous fan-out of unsolicited notifications, in registration order
//! - Channel lifecycle state published through a `watch` channel
//! - Remote errors and firmware lifecycle changes published as alerts

use crate::client::protocol::{ConnectionStats, InboundMessage, Notification, RpcRequest};
use crate::client::{normalize_address, ChannelState, RpcSender};
use crate::error::{Result, SyncError, METHOD_NOT_FOUND};
use crate::services::alerts::{Alert, SystemStatus};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Default deadline applied to every request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ALERT_CHANNEL_CAPACITY: usize = 64;

type InlineCallback = Box<dyn FnOnce(Result<Value>) + Send>;

/// Where the outcome of a request goes
enum Responder {
    /// A caller awaiting the response
    Channel(oneshot::Sender<Result<Value>>),
    /// Runs on the reader before any later frame is dispatched
    Inline(InlineCallback),
}

impl Responder {
    /// Deliver `outcome`; false when nobody is waiting any more
    fn respond(self, outcome: Result<Value>) -> bool {
        match self {
            Responder::Channel(sender) => sender.send(outcome).is_ok(),
            Responder::Inline(callback) => {
                callback(outcome);
                true
            }
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Responder::Channel(_) => f.write_str("Channel"),
            Responder::Inline(_) => f.write_str("Inline"),
        }
    }
}

/// A request waiting for its response
#[derive(Debug)]
struct PendingRequest {
    method: String,
    responder: Responder,
    created_at: Instant,
}

#[derive(Default)]
struct IoTasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct Shared {
    state: watch::Sender<ChannelState>,
    last_error: Mutex<Option<String>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    generation: AtomicU64,
    tasks: Mutex<IoTasks>,
    alerts: broadcast::Sender<Alert>,
    stats: Mutex<ConnectionStats>,
    request_timeout: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client for one Moonraker server.
///
/// Cloning is cheap; all clones share the same channel, pending table and
/// listener list.
#[derive(Clone)]
pub struct MoonrakerClient {
    shared: Arc<Shared>,
}

/// Handle returned by [`MoonrakerClient::on_notification`]
#[derive(Debug)]
pub struct NotificationSubscription {
    id: u64,
    shared: Weak<Shared>,
}

impl NotificationSubscription {
    /// Remove the listener; later notifications are no longer delivered to it
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("state", &*self.state.borrow())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for MoonrakerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MoonrakerClient {
    /// Create a disconnected client with the default request deadline
    pub fn new() -> Self {
        Self::with_request_timeout(Some(DEFAULT_REQUEST_TIMEOUT))
    }

    /// Create a disconnected client; `None` waits for responses forever
    pub fn with_request_timeout(request_timeout: Option<Duration>) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state,
                last_error: Mutex::new(None),
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                outbound: Mutex::new(None),
                generation: AtomicU64::new(0),
                tasks: Mutex::new(IoTasks::default()),
                alerts,
                stats: Mutex::new(ConnectionStats::default()),
                request_timeout,
            }),
        }
    }

    /// Open a channel to `address`, replacing any existing one
    pub async fn connect(&self, address: &str) -> Result<()> {
        let url = normalize_address(address)?;

        self.shutdown_channel();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.shared.last_error) = None;
        self.shared.set_state(ChannelState::Connecting);

        info!("Connecting to Moonraker at {}", url);
        match connect_async(url.as_str()).await {
            Ok((stream, response)) => {
                if self.shared.generation.load(Ordering::SeqCst) != generation {
                    debug!("Connection to {} superseded before it opened", url);
                    return Err(SyncError::connection(
                        "Connection attempt superseded by a newer one",
                    ));
                }
                debug!("WebSocket handshake completed: {:?}", response.status());
                self.attach(stream, generation);
                info!("Connected to Moonraker at {}", url);
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to connect to {url}: {e}");
                if self.shared.generation.load(Ordering::SeqCst) == generation {
                    *lock(&self.shared.last_error) = Some(message.clone());
                    self.shared.set_state(ChannelState::Error);
                }
                warn!("{}", message);
                Err(SyncError::connection(message))
            }
        }
    }

    /// Close the channel. Outstanding requests fail with `ChannelClosed`.
    pub fn disconnect(&self) {
        if self.shutdown_channel() {
            info!("Disconnected from Moonraker");
        }
        self.shared.set_state(ChannelState::Disconnected);
    }

    /// Send a request and wait for the matching response
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let (response_sender, receiver) = oneshot::channel();
        let id = self.enqueue(method, params, Responder::Channel(response_sender))?;

        match self.shared.request_timeout {
            Some(limit) => match timeout(limit, receiver).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(SyncError::ChannelClosed(id)),
                Err(_) => {
                    lock(&self.shared.pending).remove(&id);
                    lock(&self.shared.stats).requests_timed_out += 1;
                    warn!("Request {} ({}) timed out after {:?}", id, method, limit);
                    Err(SyncError::timeout(format!(
                        "{method} (id {id}) after {limit:?}"
                    )))
                }
            },
            None => receiver
                .await
                .unwrap_or(Err(SyncError::ChannelClosed(id))),
        }
    }

    /// Send a request and hand its outcome to `on_response` on the reader
    /// task. The callback runs before any frame received after the response
    /// reaches the notification listeners, so work it queues stays ordered
    /// with notifications. It also runs with `ChannelClosed` or `Timeout`.
    pub fn send_inline<F>(&self, method: &str, params: Value, on_response: F) -> Result<u64>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let id = self.enqueue(method, params, Responder::Inline(Box::new(on_response)))?;

        if let Some(limit) = self.shared.request_timeout {
            let weak = Arc::downgrade(&self.shared);
            let method = method.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let expired = lock(&shared.pending).remove(&id);
                if let Some(pending) = expired {
                    lock(&shared.stats).requests_timed_out += 1;
                    warn!("Request {} ({}) timed out after {:?}", id, method, limit);
                    pending.responder.respond(Err(SyncError::timeout(format!(
                        "{method} (id {id}) after {limit:?}"
                    ))));
                }
            });
        }

        Ok(id)
    }

    /// Register a listener for unsolicited notifications
    pub fn on_notification<F>(&self, callback: F) -> NotificationSubscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.listeners).push((id, Arc::new(callback)));
        NotificationSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every channel state change
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Message of the last transport failure, cleared on reconnect
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Subscribe to remote errors and firmware lifecycle alerts
    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.shared.alerts.subscribe()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Snapshot of the connection counters
    pub fn stats(&self) -> ConnectionStats {
        lock(&self.shared.stats).clone()
    }

    /// Allocate an id, record the pending entry and write the envelope
    fn enqueue(&self, method: &str, params: Value, responder: Responder) -> Result<u64> {
        let outbound = lock(&self.shared.outbound);
        let sender = match outbound.as_ref() {
            Some(sender) if self.state() == ChannelState::Connected => sender,
            _ => return Err(SyncError::NotConnected),
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = serde_json::to_string(&RpcRequest::new(id, method, &params))?;

        lock(&self.shared.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                responder,
                created_at: Instant::now(),
            },
        );

        if sender.send(Message::Text(payload)).is_err() {
            lock(&self.shared.pending).remove(&id);
            return Err(SyncError::NotConnected);
        }

        if method == "printer.gcode.script" {
            if let Some(script) = params.get("script").and_then(|s| s.as_str()) {
                debug!(request_id = id, script, "Sending G-code");
            }
        } else {
            debug!(request_id = id, method, "Sending request");
        }
        lock(&self.shared.stats).requests_sent += 1;

        Ok(id)
    }

    /// Install a freshly opened stream and start its reader/writer tasks
    fn attach(&self, stream: WsStream, generation: u64) {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        *lock(&self.shared.outbound) = Some(tx);
        lock(&self.shared.stats).connection_start = Some(chrono::Utc::now());
        self.shared.set_state(ChannelState::Connected);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("Failed to write to WebSocket: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let weak = Arc::downgrade(&self.shared);
        let reader = tokio::spawn(async move {
            let failure = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => match weak.upgrade() {
                        Some(shared) => shared.dispatch_text(&text),
                        None => break None,
                    },
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring binary frame of {} bytes", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(frame) => info!(
                                "WebSocket closed by server: {} - {}",
                                frame.code, frame.reason
                            ),
                            None => info!("WebSocket closed by server"),
                        }
                        break None;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break Some(e.to_string());
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break None;
                    }
                }
            };

            if let Some(shared) = weak.upgrade() {
                shared.handle_channel_closed(generation, failure);
            }
        });

        let mut tasks = lock(&self.shared.tasks);
        tasks.reader = Some(reader);
        tasks.writer = Some(writer);
    }

    /// Tear down the current channel without touching the published state.
    /// Returns whether a channel was open.
    fn shutdown_channel(&self) -> bool {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let had_channel = lock(&self.shared.outbound).take().is_some();

        let reader = lock(&self.shared.tasks).reader.take();
        if let Some(reader) = reader {
            reader.abort();
        }
        lock(&self.shared.tasks).writer.take();

        self.shared.fail_pending();
        lock(&self.shared.stats).connection_start = None;
        had_channel
    }

    /// Install an in-memory channel; returns the frames the client writes
    #[cfg(test)]
    pub(crate) fn attach_loopback(&self) -> mpsc::UnboundedReceiver<Message> {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outbound) = Some(tx);
        self.shared.set_state(ChannelState::Connected);
        rx
    }

    /// Feed one inbound text frame through the dispatcher
    #[cfg(test)]
    pub(crate) fn dispatch_text(&self, text: &str) {
        self.shared.dispatch_text(text);
    }

    /// Simulate the channel dropping underneath the client
    #[cfg(test)]
    pub(crate) fn simulate_close(&self, failure: Option<String>) {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.handle_channel_closed(generation, failure);
    }
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Channel state {} -> {}", previous, state);
        }
    }

    /// Route one inbound frame: resolve a pending request or fan out a
    /// notification. Malformed frames are dropped.
    fn dispatch_text(&self, text: &str) {
        {
            let mut stats = lock(&self.stats);
            stats.messages_received += 1;
            stats.last_message = Some(chrono::Utc::now());
        }

        let message: InboundMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                lock(&self.stats).malformed_dropped += 1;
                return;
            }
        };

        if let Some(id) = message.id {
            let pending = lock(&self.pending).remove(&id);
            if let Some(pending) = pending {
                let outcome = match message.error {
                    Some(err) => {
                        if err.code != METHOD_NOT_FOUND {
                            let _ = self.alerts.send(Alert::RemoteError {
                                code: err.code,
                                message: err.message.clone(),
                            });
                        }
                        debug!(
                            "Request {} ({}) failed after {:?}: {} {}",
                            id,
                            pending.method,
                            pending.created_at.elapsed(),
                            err.code,
                            err.message
                        );
                        Err(SyncError::remote(err.code, err.message))
                    }
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                if !pending.responder.respond(outcome) {
                    debug!("Caller for request {} is no longer waiting", id);
                }
                return;
            }
        }

        match message.method {
            Some(method) => {
                let notification = Notification::new(method, message.params);
                if let Some(status) = SystemStatus::from_notification(&notification.method) {
                    info!("Firmware status changed: {:?}", status);
                    let _ = self.alerts.send(Alert::SystemStatus { status });
                }

                let listeners: Vec<Listener> = lock(&self.listeners)
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect();
                for listener in listeners {
                    listener(&notification);
                }
                lock(&self.stats).notifications_dispatched += 1;
            }
            None => match message.id {
                Some(id) => debug!("Dropping response for unknown request id {}", id),
                None => debug!("Dropping message without id or method"),
            },
        }
    }

    fn handle_channel_closed(&self, generation: u64, failure: Option<String>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring close of a superseded channel");
            return;
        }

        lock(&self.outbound).take();
        {
            let mut tasks = lock(&self.tasks);
            tasks.reader.take();
            tasks.writer.take();
        }
        self.fail_pending();
        lock(&self.stats).connection_start = None;

        match failure {
            Some(message) => {
                *lock(&self.last_error) = Some(message);
                self.set_state(ChannelState::Error);
            }
            None => {
                info!("Disconnected from Moonraker");
                self.set_state(ChannelState::Disconnected);
            }
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<(u64, PendingRequest)> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!("Failing {} outstanding requests: channel closed", drained.len());
        }
        for (id, pending) in drained {
            pending.responder.respond(Err(SyncError::ChannelClosed(id)));
        }
    }
}

#[async_trait]
impl RpcSender for MoonrakerClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.send(method, params).await
    }
}
