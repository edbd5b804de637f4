use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::owntracks::OwntracksLocation;

const APPNAME: &str = "mqtt-aprs";
const KEEP_ALIVE: Duration = Duration::from_secs(60);

// How long to back off after an event-loop error before polling again;
// rumqttc re-dials the broker on the next poll.
const EVENT_LOOP_RETRY: Duration = Duration::from_secs(5);

// How long stop() waits for the event loop to flush the offline presence
// marker and the disconnect before giving up on an unreachable broker.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler invoked for each inbound Owntracks location message.
#[async_trait]
pub trait LocationHandler: Send + Sync {
    async fn handle_location(&self, location: OwntracksLocation);

    /// Invoked for payloads that are not JSON but look like preformatted
    /// TNC2 packets. Default: drop them.
    async fn handle_raw_packet(&self, _packet: String) {}
}

/// Configuration for the MQTT connection manager
#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic pattern to subscribe to for MQTT->APRS traffic
    pub subscribe_topic: String,
    /// Whether to subscribe at all (the MQTT->APRS direction)
    pub outgoing_enabled: bool,
}

impl Default for MqttClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            subscribe_topic: "owntracks/+/+".to_string(),
            outgoing_enabled: true,
        }
    }
}

/// MQTT connection manager: broker connection, retained presence marker,
/// inbound location dispatch, and fire-and-forget publishing.
///
/// Broker reconnection after the initial connect is owned by the transport:
/// the event loop re-dials on poll, and this manager only reacts to the
/// resulting `ConnAck` by restoring presence and subscriptions.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    task: Option<tokio::task::JoinHandle<()>>,
    presence_topic: String,
    config: MqttClientConfig,
    cancel: CancellationToken,
}

impl MqttClient {
    pub fn new(config: MqttClientConfig) -> Self {
        let fqdn = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let presence_topic = format!("clients/{fqdn}/{APPNAME}/state");

        let client_id = format!("{}_{}", APPNAME, chrono::Utc::now().timestamp());
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        // Broker publishes us as offline if the connection dies uncleanly
        options.set_last_will(LastWill::new(
            &presence_topic,
            "0".as_bytes().to_vec(),
            QoS::AtMostOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 64);

        Self {
            client,
            event_loop: Some(event_loop),
            task: None,
            presence_topic,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Topic carrying this client's retained presence marker.
    pub fn presence_topic(&self) -> &str {
        &self.presence_topic
    }

    /// Drive the connection until the broker acknowledges it.
    ///
    /// Any failure before the first `ConnAck` is fatal and propagated: the
    /// gateway has no purpose without its broker.
    pub async fn connect(&mut self) -> Result<()> {
        let event_loop = self
            .event_loop
            .as_mut()
            .context("MQTT event loop already taken; connect() must precede start()")?;

        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.host, self.config.port
        );
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(anyhow!("MQTT broker refused connection: {:?}", ack.code));
                    }
                    info!(
                        "Connected to MQTT broker at {}:{}",
                        self.config.host, self.config.port
                    );
                    metrics::counter!("mqtt.connection.established_total").increment(1);
                    self.announce_online().await;
                    return Ok(());
                }
                Ok(event) => trace!("MQTT event before ConnAck: {:?}", event),
                Err(e) => {
                    return Err(e).context(format!(
                        "initial connection to MQTT broker {}:{} failed",
                        self.config.host, self.config.port
                    ));
                }
            }
        }
    }

    /// Publish the retained online marker and (when the MQTT->APRS direction
    /// is enabled) subscribe to the configured topic. Runs on every ConnAck
    /// so broker reconnects restore both.
    async fn announce_online(&self) {
        if let Err(e) = self
            .client
            .publish(self.presence_topic.as_str(), QoS::AtMostOnce, true, "1")
            .await
        {
            warn!("Failed to publish online presence: {}", e);
        }

        if self.config.outgoing_enabled {
            match self
                .client
                .subscribe(self.config.subscribe_topic.as_str(), QoS::AtMostOnce)
                .await
            {
                Ok(()) => info!("Subscribed to {}", self.config.subscribe_topic),
                Err(e) => error!(
                    "Failed to subscribe to {}: {}",
                    self.config.subscribe_topic, e
                ),
            }
        } else {
            info!("MQTT outgoing (subscription) is disabled");
        }
    }

    /// Spawn the receive loop as a background task. `connect()` must have
    /// succeeded first.
    pub fn start(&mut self, handler: Arc<dyn LocationHandler>) -> Result<()> {
        let mut event_loop = self
            .event_loop
            .take()
            .context("MQTT event loop already taken; start() may only be called once")?;

        let client = self.client.clone();
        let presence_topic = self.presence_topic.clone();
        let subscribe_topic = self.config.subscribe_topic.clone();
        let outgoing_enabled = self.config.outgoing_enabled;
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_loop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        // Reconnect: restore retained presence and subscription
                        info!("MQTT broker reconnected: {:?}", ack.code);
                        metrics::counter!("mqtt.connection.established_total").increment(1);
                        if let Err(e) = client
                            .publish(presence_topic.as_str(), QoS::AtMostOnce, true, "1")
                            .await
                        {
                            warn!("Failed to publish online presence: {}", e);
                        }
                        if outgoing_enabled {
                            if let Err(e) =
                                client.subscribe(subscribe_topic.as_str(), QoS::AtMostOnce).await
                            {
                                error!("Failed to resubscribe to {}: {}", subscribe_topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        trace!("MQTT message on {}", publish.topic);
                        metrics::counter!("mqtt.message.received_total").increment(1);
                        Self::handle_message(&publish.topic, &publish.payload, &handler).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT broker sent disconnect");
                        metrics::counter!("mqtt.connection.lost_total").increment(1);
                    }
                    // Our own DISCONNECT went over the wire: deliberate
                    // shutdown, and everything queued before it (the offline
                    // presence marker included) has already been written.
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect flushed");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {}", e);
                        metrics::counter!("mqtt.connection.error_total").increment(1);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(EVENT_LOOP_RETRY) => {}
                        }
                    }
                }
            }
            debug!("MQTT event loop stopped");
        });
        self.task = Some(task);

        Ok(())
    }

    /// Parse one inbound payload and forward location messages to the
    /// handler. Payloads shaped like raw TNC2 packets take the pass-through
    /// path; everything else malformed or non-location is dropped here,
    /// never raised.
    async fn handle_message(topic: &str, payload: &[u8], handler: &Arc<dyn LocationHandler>) {
        let location: OwntracksLocation = match serde_json::from_slice(payload) {
            Ok(location) => location,
            Err(e) => {
                if let Ok(text) = std::str::from_utf8(payload) {
                    if crate::translator::is_raw_packet(text) {
                        debug!("Raw packet payload on {}", topic);
                        metrics::counter!("mqtt.raw_packet.received_total").increment(1);
                        handler.handle_raw_packet(text.trim().to_string()).await;
                        return;
                    }
                }
                warn!("Discarding unparseable payload on {}: {}", topic, e);
                metrics::counter!("mqtt.message.parse_error_total").increment(1);
                return;
            }
        };
        if !location.is_location() {
            debug!(
                "Ignoring non-location message on {} (_type = {:?})",
                topic, location.message_type
            );
            return;
        }
        metrics::counter!("mqtt.location.received_total").increment(1);
        handler.handle_location(location).await;
    }

    /// Publish the retained offline marker, then tear the connection down.
    ///
    /// The publish and the disconnect are queued in that order and the event
    /// loop is left running until it has written both to the broker, so the
    /// offline marker goes out over the live connection rather than relying
    /// on the broker-side last will. An unreachable broker bounds the wait
    /// at `SHUTDOWN_TIMEOUT`, after which the loop is cancelled outright.
    pub async fn stop(&mut self) {
        if let Err(e) = self
            .client
            .publish(self.presence_topic.as_str(), QoS::AtMostOnce, true, "0")
            .await
        {
            warn!("Failed to publish offline presence: {}", e);
        }
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }

        match self.task.take() {
            Some(task) => {
                if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                    warn!("MQTT event loop did not drain before shutdown timeout");
                    self.cancel.cancel();
                }
            }
            None => self.cancel.cancel(),
        }
        info!("MQTT client stopped");
    }

    /// Cheap clonable publish handle for the APRS->MQTT path.
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }
}

/// Fire-and-forget publisher handed to the APRS side of the gateway.
///
/// Publish failures are logged and counted, never surfaced: the gateway
/// offers no delivery guarantees beyond the transport's own.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub async fn publish(&self, topic: &str, payload: String) {
        match self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
        {
            Ok(()) => {
                metrics::counter!("mqtt.published_total").increment(1);
            }
            Err(e) => {
                error!("Failed to publish to {}: {}", topic, e);
                metrics::counter!("mqtt.publish_error_total").increment(1);
            }
        }
    }
}
