use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Gateway configuration, assembled once at startup and read-only afterwards.
///
/// Sections mirror the config file layout; every option has a default so a
/// missing file or missing option degrades to documented behavior rather than
/// an error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub global: GlobalSection,
    pub mqtt: MqttSection,
    pub mqtt_outgoing: MqttOutgoingSection,
    pub aprs: AprsSection,
    pub aprs_incoming: AprsIncomingSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GlobalSection {
    pub debug: bool,
    pub logfile: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: None,
            pass: None,
        }
    }
}

/// "Outgoing" here means the MQTT->APRS direction: whether the gateway
/// subscribes to broker topics and relays locations out to APRS-IS.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttOutgoingSection {
    pub enabled: bool,
    pub topic: String,
}

impl Default for MqttOutgoingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "owntracks/+/+".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AprsSection {
    pub server: String,
    pub port: u16,
    pub callsign: String,
    pub ssid: String,
    /// APRS-IS passcode; "-1" is the conventional receive-only passcode
    pub password: String,
    pub symbol: char,
    pub table: char,
}

impl Default for AprsSection {
    fn default() -> Self {
        Self {
            server: "rotate.aprs2.net".to_string(),
            port: 14580,
            callsign: "N0CALL".to_string(),
            ssid: "0".to_string(),
            password: "-1".to_string(),
            symbol: '[',
            table: '/',
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AprsIncomingSection {
    pub enabled: bool,
    pub filter: Option<String>,
    pub topic_prefix: String,
}

impl Default for AprsIncomingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            filter: None,
            topic_prefix: "owntracks/aprs".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file is not an error: the
    /// gateway runs on defaults, with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
