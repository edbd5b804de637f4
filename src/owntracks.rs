use serde::{Deserialize, Serialize};

/// Discriminator value for location payloads. Anything else on the wire is
/// ignored by the gateway.
pub const LOCATION_TYPE: &str = "location";

/// An Owntracks location payload as carried over MQTT.
///
/// Outbound records (built from an APRS position) always carry `tst` and
/// `tid`; inbound broker payloads frequently omit them, so both are optional
/// in the model. Optional telemetry fields are skipped entirely when absent
/// rather than serialized as null, matching what Owntracks apps emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwntracksLocation {
    #[serde(rename = "_type")]
    pub message_type: String,
    pub lat: f64,
    pub lon: f64,
    /// Unix timestamp of the fix, seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tst: Option<i64>,
    /// Two-character tracker id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    /// Altitude, meters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<i32>,
    /// Velocity, km/h
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vel: Option<i32>,
    /// Course over ground, degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cog: Option<i32>,
}

impl OwntracksLocation {
    pub fn is_location(&self) -> bool {
        self.message_type == LOCATION_TYPE
    }
}
