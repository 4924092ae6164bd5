use crate::{
    components::greenhouse::{
        actuating::relay::{Band, HysteresisController, HysteresisPolicy, WriteFailurePolicy},
        archiving::frame_archive::{ArchiveConfig, FrameArchiver},
        sensing::telemetry_router::{Routed, TelemetryRouter, TelemetrySource, TopicConfig},
    },
    devices::hardware::output_line::{OutputDevice, OutputLineConfig},
    error::{ConfigError, StartupError},
    state::{Channel, FusedState, StateStore, Transition},
    utils::ordering::ordered_map,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use static_assertions::assert_impl_all;
use std::{
    collections::HashMap,
    ffi::OsStr,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use strum::IntoEnumIterator;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
};
use uuid::Uuid;

/// Shortest period between re-evaluations for expired readings.
const MIN_EXPIRY_CHECK: Duration = Duration::from_millis(100);

/// Connection settings for the publish/subscribe broker.
#[serde_as]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    #[serde(default = "TransportConfig::default_host")]
    pub host: String,
    #[serde(default = "TransportConfig::default_port")]
    pub port: u16,
    #[serde(default = "TransportConfig::default_client_id")]
    pub client_id: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "keep_alive_secs", default = "TransportConfig::default_keep_alive")]
    pub keep_alive: Duration,
    /// Pause between failed polls of the broker connection.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "reconnect_backoff_ms",
        default = "TransportConfig::default_reconnect_backoff"
    )]
    pub reconnect_backoff: Duration,
    /// Messages buffered per topic before new ones are dropped.
    #[serde(default = "TransportConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    /// Largest accepted packet, camera frames need far more than the
    /// client default.
    #[serde(default = "TransportConfig::default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    #[serde(default)]
    pub topics: TopicConfig,
}

impl TransportConfig {
    fn default_host() -> String {
        String::from("localhost")
    }

    fn default_port() -> u16 {
        1883
    }

    fn default_client_id() -> String {
        String::from("verdant-climate-control")
    }

    fn default_keep_alive() -> Duration {
        Duration::from_secs(60)
    }

    fn default_reconnect_backoff() -> Duration {
        Duration::from_millis(1000)
    }

    fn default_queue_capacity() -> usize {
        64
    }

    fn default_max_packet_bytes() -> usize {
        8 * 1024 * 1024
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            client_id: Self::default_client_id(),
            keep_alive: Self::default_keep_alive(),
            reconnect_backoff: Self::default_reconnect_backoff(),
            queue_capacity: Self::default_queue_capacity(),
            max_packet_bytes: Self::default_max_packet_bytes(),
            topics: TopicConfig::default(),
        }
    }
}

/// Configuration for the climate control component. Device level
/// settings for the relay and alert lines live in their own files.
#[serde_as]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ClimateControlConfig {
    /// Site name attached to log lines.
    site_id: String,
    #[serde(default)]
    transport: TransportConfig,
    /// Safe band per monitored channel.
    #[serde(
        default = "ClimateControlConfig::default_bands",
        serialize_with = "ordered_map"
    )]
    bands: HashMap<Channel, Band>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "alert_pulse_ms",
        default = "ClimateControlConfig::default_alert_pulse"
    )]
    alert_pulse: Duration,
    /// Readings older than this stop voting. Absent means never. While set,
    /// the relay is also re-evaluated periodically so expiry takes effect
    /// when producers go quiet.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(rename = "max_reading_age_secs")]
    max_reading_age: Option<Duration>,
    #[serde(default)]
    on_write_failure: WriteFailurePolicy,
    relay_config_file: PathBuf,
    alert_config_file: PathBuf,
    #[serde(default)]
    archive: ArchiveConfig,
}

impl ClimateControlConfig {
    fn default_bands() -> HashMap<Channel, Band> {
        HashMap::from([
            (Channel::Temperature, Band::new(21.0, 26.0)),
            (Channel::Humidity, Band::new(50.0, 80.0)),
            (Channel::Co2, Band::new(400.0, 800.0)),
        ])
    }

    fn default_alert_pulse() -> Duration {
        Duration::from_millis(1000)
    }

    /// Climate control configuration with default bands and transport.
    ///
    /// * `site_id`: name of the site for logs.
    /// * `relay_config_file`: path to the relay line config.
    /// * `alert_config_file`: path to the alert line config.
    pub fn new<F: AsRef<OsStr>>(site_id: String, relay_config_file: F, alert_config_file: F) -> Self {
        Self {
            site_id,
            transport: TransportConfig::default(),
            bands: Self::default_bands(),
            alert_pulse: Self::default_alert_pulse(),
            max_reading_age: None,
            on_write_failure: WriteFailurePolicy::default(),
            relay_config_file: (&relay_config_file).into(),
            alert_config_file: (&alert_config_file).into(),
            archive: ArchiveConfig::default(),
        }
    }

    /// Monitor `channel` with `band`, replacing any existing band.
    pub fn with_band(mut self, channel: Channel, band: Band) -> Self {
        self.bands.insert(channel, band);
        self
    }

    pub fn with_archive(mut self, archive: ArchiveConfig) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_alert_pulse(mut self, alert_pulse: Duration) -> Self {
        self.alert_pulse = alert_pulse;
        self
    }

    pub fn with_max_reading_age(mut self, max_reading_age: Option<Duration>) -> Self {
        self.max_reading_age = max_reading_age;
        self
    }

    pub fn with_write_failure_policy(mut self, policy: WriteFailurePolicy) -> Self {
        self.on_write_failure = policy;
        self
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Build the config by reading a file and checking the bands.
    ///
    /// * `filepath`: path to config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        let file = Path::new(&filepath);
        if !file.is_file() {
            return Err(ConfigError::NotFound(file.to_path_buf()));
        }
        let config_file = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .build()?;
        let config = config_file.try_deserialize::<Self>()?;
        config.policy()?;
        Ok(config)
    }

    /// Hysteresis policy described by this config.
    pub fn policy(&self) -> Result<HysteresisPolicy, ConfigError> {
        for (channel, band) in &self.bands {
            band.validate(*channel)?;
        }
        let max_reading_age = self
            .max_reading_age
            .map(chrono::Duration::from_std)
            .transpose()
            .map_err(|_| ConfigError::OutOfRange {
                field: "max_reading_age_secs",
            })?;
        Ok(HysteresisPolicy::new(self.bands.clone(), max_reading_age))
    }
}

/// Outcome of delivering one message.
#[derive(Debug, PartialEq)]
pub enum Delivery {
    /// Malformed or unroutable, logged and discarded.
    Dropped,
    /// Readings were stored and the controller re-evaluated.
    Updated {
        readings: usize,
        transition: Option<Transition>,
    },
    /// A frame was handed to the archive.
    Frame,
}

/// Component that fuses the sensor channels and drives the relay. The
/// router, store and controller run inline in whichever task delivers a
/// message, frames are handed off to the archive writer.
pub struct ClimateControl {
    uuid: Uuid,
    site_id: String,
    transport: TransportConfig,
    router: TelemetryRouter,
    store: Arc<StateStore>,
    controller: HysteresisController,
    archiver: FrameArchiver,
    /// Period of the re-evaluation that expires stale readings.
    expiry_check: Option<Duration>,
}

assert_impl_all!(ClimateControl: Send, Sync);

impl ClimateControl {
    /// Generate a new component by consuming a config. The relay and
    /// alert lines are acquired here, failure aborts startup.
    ///
    /// * `config`: `ClimateControlConfig`
    pub fn new(config: ClimateControlConfig) -> Result<Self, StartupError> {
        let relay = OutputDevice::open(OutputLineConfig::from_file(&config.relay_config_file)?)?;
        let alert = OutputDevice::open(OutputLineConfig::from_file(&config.alert_config_file)?)?;
        Self::with_outputs(config, relay, alert)
    }

    /// Generate a new component by consuming the config stored in a file.
    ///
    /// * `filepath`: filepath to a config.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, StartupError> {
        Self::new(ClimateControlConfig::from_file(filepath)?)
    }

    /// Build the component around already opened output lines.
    pub fn with_outputs(
        config: ClimateControlConfig,
        relay: OutputDevice,
        alert: OutputDevice,
    ) -> Result<Self, StartupError> {
        let store = Arc::new(StateStore::new());
        let controller = HysteresisController::new(
            config.policy()?,
            store.clone(),
            relay,
            alert,
            config.alert_pulse,
            config.on_write_failure,
        );
        let component = Self {
            uuid: Uuid::new_v4(),
            router: TelemetryRouter::new(config.transport.topics.clone()),
            archiver: FrameArchiver::start(&config.archive)?,
            site_id: config.site_id,
            transport: config.transport,
            store,
            controller,
            expiry_check: config
                .max_reading_age
                .map(|age| (age / 2).max(MIN_EXPIRY_CHECK)),
        };
        tracing::info!(
            component = %component.uuid,
            site_id = %component.site_id,
            bands = ?config.bands,
            archive = ?config.archive.database_path,
            "Climate control ready"
        );
        Ok(component)
    }

    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub async fn snapshot(&self) -> FusedState {
        self.store.snapshot().await
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Route, store and evaluate one message. Never fails.
    ///
    /// * `topic`: topic the message arrived on.
    /// * `payload`: raw message bytes.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Delivery {
        let observed_at = Utc::now();
        match self.router.route(topic, payload, observed_at) {
            None => Delivery::Dropped,
            Some(Routed::Frame(frame)) => {
                self.archiver.store(frame);
                Delivery::Frame
            }
            Some(Routed::Readings(readings)) if readings.is_empty() => {
                tracing::debug!(site_id = %self.site_id, topic, "Message carried no readings");
                Delivery::Updated {
                    readings: 0,
                    transition: None,
                }
            }
            Some(Routed::Readings(readings)) => {
                for reading in &readings {
                    tracing::debug!(
                        site_id = %self.site_id,
                        channel = %reading.channel(),
                        value = reading.value(),
                        "Reading"
                    );
                }
                let count = readings.len();
                self.store.update_group(readings).await;
                let transition = self.controller.evaluate(observed_at).await;
                Delivery::Updated {
                    readings: count,
                    transition,
                }
            }
        }
    }

    /// Re-evaluate the relay with no new reading, so readings that have
    /// aged out stop holding it engaged.
    pub async fn expire_stale(&self) -> Option<Transition> {
        let transition = self.controller.evaluate(Utc::now()).await;
        if let Some(transition) = &transition {
            tracing::info!(
                site_id = %self.site_id,
                to = %transition.to,
                "Relay re-evaluated after readings expired"
            );
        }
        transition
    }

    /// Drive the outputs to their safe state.
    pub async fn safe_off(&self) {
        self.controller.safe_off().await;
    }

    /// Consume the component and wait for queued frames to be written.
    pub async fn flush_archive(self) {
        let archiver = self.archiver;
        if tokio::task::spawn_blocking(move || archiver.shutdown())
            .await
            .is_err()
        {
            tracing::error!(component = %self.uuid, "Frame archive did not shut down cleanly");
        }
    }
}

/// Unit struct for running the climate control component against the
/// broker.
pub struct ClimateControlController;

impl ClimateControlController {
    /// Subscribe to every producer topic and deliver messages until
    /// `shutdown` resolves, then drive the outputs safe and flush the
    /// archive.
    ///
    /// * `component`: consumed climate control component.
    /// * `shutdown`: resolves when the process should stop.
    pub async fn start<S>(component: ClimateControl, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let transport = component.transport.clone();
        let component = Arc::new(component);

        let mut options = MqttOptions::new(
            transport.client_id.clone(),
            transport.host.clone(),
            transport.port,
        );
        options.set_keep_alive(transport.keep_alive);
        options.set_max_packet_size(transport.max_packet_bytes, transport.max_packet_bytes);
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        // One delivery task per topic keeps per channel ordering while
        // letting producers proceed independently.
        let mut deliveries = JoinSet::new();
        let mut queues = HashMap::new();
        for source in TelemetrySource::iter() {
            let (sender, receiver) = mpsc::channel(transport.queue_capacity.max(1));
            queues.insert(transport.topics.topic(source).to_string(), sender);
            deliveries.spawn(deliver(component.clone(), source, receiver));
        }
        if let Some(period) = component.expiry_check {
            deliveries.spawn(expire(component.clone(), period));
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(host = %transport.host, port = transport.port, "Connected to broker");
                        for topic in queues.keys() {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                                tracing::error!(topic = %topic, error = %e, "Failed to subscribe");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(&queues, publish);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Broker connection error");
                        tokio::select! {
                            _ = tokio::time::sleep(transport.reconnect_backoff) => {}
                            _ = &mut shutdown => break,
                        }
                    }
                }
            }
        }

        tracing::info!(component = %component.uuid, "Shutting down");
        component.safe_off().await;

        drop(queues);
        deliveries.shutdown().await;
        if let Err(e) = client.try_disconnect() {
            tracing::debug!(error = %e, "Disconnect not sent");
        }

        match Arc::try_unwrap(component) {
            Ok(component) => component.flush_archive().await,
            Err(_) => tracing::warn!("Component still shared, archive not flushed"),
        }
    }
}

/// Hand a message to the delivery task for its topic without waiting.
/// Returns false when the message was dropped.
fn dispatch(queues: &HashMap<String, mpsc::Sender<Publish>>, publish: Publish) -> bool {
    let Some(queue) = queues.get(&publish.topic) else {
        tracing::warn!(topic = %publish.topic, "Message on unsubscribed topic");
        return false;
    };
    match queue.try_send(publish) {
        Ok(()) => true,
        Err(TrySendError::Full(publish)) => {
            tracing::warn!(topic = %publish.topic, "Delivery queue full, message dropped");
            false
        }
        Err(TrySendError::Closed(publish)) => {
            tracing::warn!(topic = %publish.topic, "Delivery task stopped, message dropped");
            false
        }
    }
}

/// Periodically re-evaluate so expired readings release the relay.
async fn expire(component: Arc<ClimateControl>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        component.expire_stale().await;
    }
}

/// Deliver messages for one topic in arrival order.
async fn deliver(
    component: Arc<ClimateControl>,
    source: TelemetrySource,
    mut receiver: mpsc::Receiver<Publish>,
) {
    while let Some(publish) = receiver.recv().await {
        let delivery = component
            .handle_message(&publish.topic, &publish.payload)
            .await;
        tracing::debug!(%source, ?delivery, "Delivered message");
    }
}
