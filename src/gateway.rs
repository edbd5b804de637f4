use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::aprs_client::{AprsClient, AprsClientConfigBuilder, PositionHandler};
use crate::config::Settings;
use crate::mqtt_client::{LocationHandler, MqttClient, MqttClientConfig, MqttPublisher};
use crate::owntracks::OwntracksLocation;
use crate::position::PositionReport;
use crate::translator::{self, StationIdentity};

/// A message headed for APRS-IS: either a structured location still to be
/// rendered, or an already-formatted TNC2 packet passed through verbatim.
#[derive(Debug, Clone)]
pub enum Outbound {
    Location(OwntracksLocation),
    Raw(String),
}

/// Render an outbound message as a wire packet. `Location` goes through the
/// format translator; `Raw` passes through with only line termination
/// guaranteed.
pub fn render_outbound(
    outbound: &Outbound,
    station: &StationIdentity,
    table: char,
    symbol: char,
) -> Result<String, crate::translator::ConvertError> {
    match outbound {
        Outbound::Location(location) => translator::to_aprs_packet(location, station, table, symbol),
        Outbound::Raw(packet) if packet.ends_with('\n') => Ok(packet.clone()),
        Outbound::Raw(packet) => Ok(format!("{packet}\n")),
    }
}

/// APRS->MQTT leg: converts each position report to Owntracks JSON and
/// publishes it under `{topic_prefix}/{sender}`.
struct MqttForwarder {
    publisher: MqttPublisher,
    topic_prefix: String,
}

#[async_trait]
impl PositionHandler for MqttForwarder {
    async fn handle_position(&self, report: PositionReport) {
        let location = translator::to_owntracks(&report);
        let payload = match serde_json::to_string(&location) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize location from {}: {}", report.sender, e);
                return;
            }
        };
        let topic = format!("{}/{}", self.topic_prefix, report.sender);
        debug!("Publishing to {}: {}", topic, payload);
        self.publisher.publish(&topic, payload).await;
    }
}

/// MQTT->APRS leg: renders each outbound message and hands it to the APRS
/// client's best-effort send path.
struct AprsForwarder {
    aprs: Arc<AprsClient>,
    station: StationIdentity,
    table: char,
    symbol: char,
}

impl AprsForwarder {
    async fn deliver(&self, outbound: Outbound) {
        match render_outbound(&outbound, &self.station, self.table, self.symbol) {
            Ok(packet) => {
                debug!("Sending packet: {}", packet.trim());
                self.aprs.send_packet(&packet).await;
            }
            Err(crate::translator::ConvertError::NotLocation(kind)) => {
                debug!("Skipping non-location payload (_type = {:?})", kind);
            }
            Err(e) => {
                error!("Dropping unconvertible location: {}", e);
            }
        }
    }
}

#[async_trait]
impl LocationHandler for AprsForwarder {
    async fn handle_location(&self, location: OwntracksLocation) {
        self.deliver(Outbound::Location(location)).await;
    }

    async fn handle_raw_packet(&self, packet: String) {
        self.deliver(Outbound::Raw(packet)).await;
    }
}

/// Construct both connection managers with their forwarders injected, bring
/// the connections up, and block until a termination signal arrives.
///
/// Startup order: MQTT connect (fatal on failure) and start, then the APRS
/// listener. Shutdown order: MQTT first so the offline presence marker goes
/// out over a live connection, then the APRS loop.
pub async fn run(settings: Settings) -> Result<()> {
    let aprs_config = AprsClientConfigBuilder::new()
        .server(settings.aprs.server.clone())
        .port(settings.aprs.port)
        .callsign(settings.aprs.callsign.clone())
        .password(Some(settings.aprs.password.clone()))
        .filter(settings.aprs_incoming.filter.clone())
        .incoming_enabled(settings.aprs_incoming.enabled)
        .build();
    let aprs = Arc::new(AprsClient::new(aprs_config));

    let mut mqtt = MqttClient::new(MqttClientConfig {
        host: settings.mqtt.host.clone(),
        port: settings.mqtt.port,
        username: settings.mqtt.user.clone(),
        password: settings.mqtt.pass.clone(),
        subscribe_topic: settings.mqtt_outgoing.topic.clone(),
        outgoing_enabled: settings.mqtt_outgoing.enabled,
    });

    mqtt.connect()
        .await
        .context("could not connect to MQTT broker")?;

    let aprs_forwarder = Arc::new(AprsForwarder {
        aprs: aprs.clone(),
        station: StationIdentity {
            callsign: settings.aprs.callsign.clone(),
            ssid: settings.aprs.ssid.clone(),
        },
        table: settings.aprs.table,
        symbol: settings.aprs.symbol,
    });
    mqtt.start(aprs_forwarder)?;

    let mqtt_forwarder = Arc::new(MqttForwarder {
        publisher: mqtt.publisher(),
        topic_prefix: settings.aprs_incoming.topic_prefix.clone(),
    });
    aprs.start(mqtt_forwarder);

    info!("Gateway running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    mqtt.stop().await;
    aprs.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owntracks::LOCATION_TYPE;

    fn station() -> StationIdentity {
        StationIdentity {
            callsign: "M0TEST".to_string(),
            ssid: "7".to_string(),
        }
    }

    #[test]
    fn test_render_structured_location() {
        let location = OwntracksLocation {
            message_type: LOCATION_TYPE.to_string(),
            lat: 51.5,
            lon: -0.12,
            tst: None,
            tid: None,
            alt: None,
            vel: None,
            cog: None,
        };
        let packet =
            render_outbound(&Outbound::Location(location), &station(), '/', '>').unwrap();
        assert_eq!(packet, "M0TEST-7>APRS,TCPIP*:=5130.00N/00007.20W> mqtt-aprs\n");
    }

    #[test]
    fn test_render_raw_packet_passes_through() {
        let raw = "M0TEST-7>APRS,TCPIP*:=5130.00N/00007.20W> mqtt-aprs\n".to_string();
        let packet = render_outbound(&Outbound::Raw(raw.clone()), &station(), '/', '[').unwrap();
        assert_eq!(packet, raw);
    }

    #[test]
    fn test_render_raw_packet_gains_line_termination() {
        let raw = "M0TEST-7>APRS,TCPIP*:>status".to_string();
        let packet = render_outbound(&Outbound::Raw(raw), &station(), '/', '[').unwrap();
        assert_eq!(packet, "M0TEST-7>APRS,TCPIP*:>status\n");
    }

    #[test]
    fn test_render_rejects_non_location() {
        let payload = OwntracksLocation {
            message_type: "cmd".to_string(),
            lat: 0.0,
            lon: 0.0,
            tst: None,
            tid: None,
            alt: None,
            vel: None,
            cog: None,
        };
        assert!(render_outbound(&Outbound::Location(payload), &station(), '/', '[').is_err());
    }
}
