//! Per-server synchronization session
//!
//! A [`Session`] owns one [`MoonrakerClient`] and one [`StateEngine`]. A
//! single event loop task is the only place the engine is touched: the
//! transport's notification callback only enqueues, and discovery,
//! subscription and metadata round-trips run in their own tasks and post
//! their results back. The snapshot query is answered on the reader task,
//! so it is queued ahead of any push that arrived after it. Consumers read
//! the model and the power devices through `watch` channels.

use crate::client::{ChannelState, MoonrakerClient, Notification, NotificationSubscription};
use crate::commands::CommandEmitter;
use crate::config::{MacroSettings, SyncConfig};
use crate::discovery::{self, ObjectCatalog};
use crate::error::{Result, SyncError};
use crate::services::alerts::Alert;
use crate::services::power::{PowerDevice, PowerRegistry, PowerService, POWER_CHANGED};
use crate::services::subscription::{self, SubscriptionPlan};
use crate::state::{FileMetadata, Increments, MachineModel, StateEngine};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notification carrying status fragments
pub const STATUS_UPDATE: &str = "notify_status_update";
const GCODE_RESPONSE: &str = "notify_gcode_response";

enum Event {
    Notification(Notification),
    Catalog {
        generation: u64,
        catalog: ObjectCatalog,
    },
    Snapshot {
        generation: u64,
        result: Result<Value>,
    },
    Metadata {
        generation: u64,
        filename: String,
        result: Result<FileMetadata>,
    },
    PowerDevices {
        devices: Vec<PowerDevice>,
        reply: oneshot::Sender<PowerRegistry>,
    },
    SetIncrements(Increments),
    SelectExtruder {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Synchronized view of one Moonraker server
pub struct Session {
    client: MoonrakerClient,
    model: watch::Receiver<MachineModel>,
    synced: watch::Receiver<bool>,
    power: watch::Receiver<PowerRegistry>,
    events: mpsc::UnboundedSender<Event>,
    listener: Option<NotificationSubscription>,
    task: Option<JoinHandle<()>>,
    macros: MacroSettings,
}

impl Session {
    /// Build a session from configuration; it starts disconnected
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_client(
            MoonrakerClient::with_request_timeout(config.request_timeout()),
            config.increments,
            config.macros.clone(),
        )
    }

    /// Build a session around an existing client
    pub fn with_client(
        client: MoonrakerClient,
        increments: Increments,
        macros: MacroSettings,
    ) -> Self {
        let engine = StateEngine::with_increments(increments);
        let (model_tx, model_rx) = watch::channel(engine.model().clone());
        let (synced_tx, synced_rx) = watch::channel(false);
        let (power_tx, power_rx) = watch::channel(PowerRegistry::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let listener = client.on_notification({
            let events = events_tx.clone();
            move |notification: &Notification| {
                let _ = events.send(Event::Notification(notification.clone()));
            }
        });

        let event_loop = EventLoop {
            client: client.clone(),
            engine,
            model: model_tx,
            synced: synced_tx,
            power: power_tx,
            events: events_tx.clone(),
            generation: 0,
            init_task: None,
        };
        let task = tokio::spawn(event_loop.run(events_rx, client.watch_state()));

        Self {
            client,
            model: model_rx,
            synced: synced_rx,
            power: power_rx,
            events: events_tx,
            listener: Some(listener),
            task: Some(task),
            macros,
        }
    }

    /// Connect (or reconnect) to `address`
    pub async fn connect(&self, address: &str) -> Result<()> {
        self.client.connect(address).await
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn client(&self) -> &MoonrakerClient {
        &self.client
    }

    pub fn channel_state(&self) -> ChannelState {
        self.client.state()
    }

    /// Latest published model
    pub fn model(&self) -> MachineModel {
        self.model.borrow().clone()
    }

    /// Receiver notified after every merge
    pub fn watch_model(&self) -> watch::Receiver<MachineModel> {
        self.model.clone()
    }

    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.client.alerts()
    }

    /// Wait until the snapshot of the current connection has been merged
    pub async fn wait_synced(&self, limit: Duration) -> Result<()> {
        let mut synced = self.synced.clone();
        let wait = async move { synced.wait_for(|done| *done).await.map(|_| ()) };
        match tokio::time::timeout(limit, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SyncError::connection("Session stopped")),
            Err(_) => Err(SyncError::timeout(format!("initial snapshot after {limit:?}"))),
        }
    }

    pub fn commands(&self) -> CommandEmitter<MoonrakerClient> {
        CommandEmitter::new(self.client.clone(), self.model.clone(), self.macros.clone())
    }

    pub fn power(&self) -> PowerService<MoonrakerClient> {
        PowerService::new(self.client.clone())
    }

    /// Power devices as last listed or pushed; empty until either happens
    pub fn power_devices(&self) -> PowerRegistry {
        self.power.borrow().clone()
    }

    /// Receiver notified whenever a power device changes
    pub fn watch_power(&self) -> watch::Receiver<PowerRegistry> {
        self.power.clone()
    }

    /// List the server's power devices and replace the session's registry
    pub async fn refresh_power(&self) -> Result<PowerRegistry> {
        let devices = self.power().list_devices().await?;
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::PowerDevices { devices, reply })
            .map_err(|_| SyncError::connection("Session stopped"))?;
        response
            .await
            .map_err(|_| SyncError::connection("Session stopped"))
    }

    pub fn set_increments(&self, increments: Increments) -> Result<()> {
        self.events
            .send(Event::SetIncrements(increments))
            .map_err(|_| SyncError::connection("Session stopped"))
    }

    /// Choose the extruder used by extrude, retract and filament macros
    pub async fn select_extruder(&self, name: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::SelectExtruder {
                name: name.to_string(),
                reply,
            })
            .map_err(|_| SyncError::connection("Session stopped"))?;
        response
            .await
            .unwrap_or_else(|_| Err(SyncError::connection("Session stopped")))
    }

    /// Disconnect and stop the event loop
    pub async fn shutdown(mut self) {
        if let Some(task) = self.stop() {
            let _ = task.await;
        }
    }

    fn stop(&mut self) -> Option<JoinHandle<()>> {
        if let Some(listener) = self.listener.take() {
            listener.unsubscribe();
        }
        self.client.disconnect();
        let task = self.task.take()?;
        task.abort();
        Some(task)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventLoop {
    client: MoonrakerClient,
    engine: StateEngine,
    model: watch::Sender<MachineModel>,
    synced: watch::Sender<bool>,
    power: watch::Sender<PowerRegistry>,
    events: mpsc::UnboundedSender<Event>,
    /// Bumped on every connect and disconnect; results tagged with an
    /// older value belong to a closed connection
    generation: u64,
    init_task: Option<JoinHandle<()>>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut channel: watch::Receiver<ChannelState>,
    ) {
        let initial = *channel.borrow_and_update();
        if initial == ChannelState::Connected {
            self.on_connected();
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                changed = channel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *channel.borrow_and_update();
                    self.on_channel_state(state);
                }
            }
        }

        if let Some(task) = self.init_task.take() {
            task.abort();
        }
        debug!("Session event loop stopped");
    }

    fn publish(&self) {
        self.model.send_replace(self.engine.model().clone());
    }

    fn on_channel_state(&mut self, state: ChannelState) {
        match state {
            ChannelState::Connected => self.on_connected(),
            ChannelState::Disconnected | ChannelState::Error => {
                self.generation += 1;
                if let Some(task) = self.init_task.take() {
                    task.abort();
                }
                self.engine.reset_connection();
                self.synced.send_replace(false);
                self.power.send_replace(PowerRegistry::default());
                self.publish();
            }
            ChannelState::Connecting => {}
        }
    }

    fn on_connected(&mut self) {
        self.generation += 1;
        if let Some(task) = self.init_task.take() {
            task.abort();
        }
        self.engine.reset_connection();
        self.synced.send_replace(false);
        self.publish();

        info!("Channel ready, discovering objects");
        self.init_task = Some(tokio::spawn(initialize(
            self.client.clone(),
            self.generation,
            self.events.clone(),
        )));
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Notification(notification) => self.on_notification(notification),
            Event::Catalog {
                generation,
                catalog,
            } if generation == self.generation => {
                self.engine.apply_catalog(&catalog);
                self.publish();
            }
            Event::Snapshot { generation, result } if generation == self.generation => {
                match result {
                    Ok(status) => {
                        self.merge(&status);
                        self.synced.send_replace(true);
                        info!("Initial snapshot applied");
                    }
                    Err(e) => warn!("Failed to query printer objects: {}", e),
                }
            }
            Event::Metadata {
                generation,
                filename,
                result,
            } if generation == self.generation => match result {
                Ok(metadata) => {
                    if self.engine.apply_file_metadata(&filename, metadata) {
                        self.publish();
                    }
                }
                Err(e) => warn!("Failed to fetch metadata for '{}': {}", filename, e),
            },
            Event::Catalog { .. } | Event::Snapshot { .. } | Event::Metadata { .. } => {
                debug!("Dropping result from a closed connection");
            }
            Event::PowerDevices { devices, reply } => {
                let registry = PowerRegistry::new(devices);
                self.power.send_replace(registry.clone());
                let _ = reply.send(registry);
            }
            Event::SetIncrements(increments) => {
                self.engine.set_increments(increments);
                self.publish();
            }
            Event::SelectExtruder { name, reply } => {
                let result = self.engine.select_extruder(&name);
                if result.is_ok() {
                    self.publish();
                }
                let _ = reply.send(result);
            }
        }
    }

    fn on_notification(&mut self, notification: Notification) {
        match notification.method.as_str() {
            STATUS_UPDATE => match notification.payload() {
                Some(status) => self.merge(status),
                None => debug!("Status update without payload"),
            },
            POWER_CHANGED => {
                self.power
                    .send_if_modified(|registry| registry.apply_power_changed(&notification));
            }
            GCODE_RESPONSE => {
                if let Some(line) = notification.payload().and_then(Value::as_str) {
                    debug!(target: "gcode", "{}", line);
                }
            }
            _ => {}
        }
    }

    fn merge(&mut self, status: &Value) {
        let outcome = self.engine.merge(status);
        self.publish();

        if let Some(filename) = outcome.fetch_metadata {
            let client = self.client.clone();
            let events = self.events.clone();
            let generation = self.generation;
            tokio::spawn(async move {
                let result = fetch_metadata(&client, &filename).await;
                let _ = events.send(Event::Metadata {
                    generation,
                    filename,
                    result,
                });
            });
        }
    }
}

/// Discovery, then subscription and snapshot, for one connection
async fn initialize(
    client: MoonrakerClient,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    let catalog = match discovery::discover(&client).await {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!("Object discovery failed, subscribing core objects only: {}", e);
            ObjectCatalog::default()
        }
    };
    let plan = SubscriptionPlan::build(&catalog);
    let _ = events.send(Event::Catalog {
        generation,
        catalog,
    });

    if let Err(e) = client
        .send("printer.objects.subscribe", plan.subscribe_params())
        .await
    {
        warn!("Failed to subscribe to printer objects: {}", e);
        return;
    }
    debug!("Subscribed to {} objects", plan.len());

    // Pushes dispatched after the query response must merge after it
    let sent = client.send_inline("printer.objects.query", plan.query_params(), move |outcome| {
        let _ = events.send(Event::Snapshot {
            generation,
            result: outcome.and_then(subscription::snapshot_status),
        });
    });
    if let Err(e) = sent {
        warn!("Failed to query printer objects: {}", e);
    }
}

async fn fetch_metadata(client: &MoonrakerClient, filename: &str) -> Result<FileMetadata> {
    let response = client
        .send("server.files.metadata", json!({ "filename": filename }))
        .await?;
    Ok(serde_json::from_value(response)?)
}
