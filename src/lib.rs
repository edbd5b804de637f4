//! mqtt-aprs - bidirectional gateway between APRS-IS and an Owntracks MQTT
//! broker.
//!
//! Position packets received from APRS-IS are published to the broker as
//! Owntracks location JSON; Owntracks locations received from the broker are
//! transmitted to APRS-IS as TNC2 position packets. Each direction runs its
//! own reconnecting receive loop.

pub mod aprs_client;
pub mod aprs_filters;
pub mod config;
pub mod coordinate;
pub mod gateway;
pub mod mqtt_client;
pub mod owntracks;
pub mod position;
pub mod translator;

pub use aprs_client::{AprsClient, AprsClientConfig, AprsClientConfigBuilder, PositionHandler};
pub use config::Settings;
pub use gateway::Outbound;
pub use mqtt_client::{LocationHandler, MqttClient, MqttClientConfig, MqttPublisher};
pub use owntracks::OwntracksLocation;
pub use position::PositionReport;
