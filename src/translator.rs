use std::fmt::{Display, Formatter};

use crate::coordinate::{self, Axis};
use crate::owntracks::{LOCATION_TYPE, OwntracksLocation};
use crate::position::PositionReport;

/// Free-text comment appended to every outbound position packet, identifying
/// the gateway as the originator.
pub const PACKET_COMMENT: &str = "mqtt-aprs";

/// The station this gateway transmits as.
#[derive(Debug, Clone)]
pub struct StationIdentity {
    pub callsign: String,
    pub ssid: String,
}

impl Display for StationIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.callsign, self.ssid)
    }
}

#[derive(Debug)]
pub enum ConvertError {
    /// The payload's `_type` discriminator is not `location`. Callers treat
    /// this as a silent skip, not a failure.
    NotLocation(String),
    /// Latitude or longitude could not be encoded
    Position(String),
}

impl Display for ConvertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertError::NotLocation(kind) => {
                write!(f, "payload is not a location message (_type = {kind:?})")
            }
            ConvertError::Position(reason) => write!(f, "unusable position: {reason}"),
        }
    }
}
impl std::error::Error for ConvertError {}

/// Convert an APRS position report to an Owntracks location payload.
///
/// The tracker id is the first two characters of the sender callsign, per the
/// Owntracks convention of short display ids.
pub fn to_owntracks(report: &PositionReport) -> OwntracksLocation {
    OwntracksLocation {
        message_type: LOCATION_TYPE.to_string(),
        lat: report.latitude,
        lon: report.longitude,
        tst: Some(report.timestamp.timestamp()),
        tid: Some(report.sender.chars().take(2).collect()),
        alt: report.altitude_meters,
        vel: report.speed_kmh,
        cog: report.course_degrees,
    }
}

/// Whether a payload looks like a preformatted TNC2 packet rather than JSON:
/// a `SENDER>PATH:payload` line. Used to route raw packets around the
/// translator so they can be transmitted verbatim.
pub fn is_raw_packet(payload: &str) -> bool {
    let line = payload.trim();
    if line.is_empty() || line.starts_with('{') {
        return false;
    }
    match line.find('>') {
        Some(gt) if gt > 0 => line[gt..].contains(':'),
        _ => false,
    }
}

/// Render an Owntracks location as a TNC2 position packet:
/// `CALL-SSID>APRS,TCPIP*:=<lat><table><lon><symbol> mqtt-aprs\n`
pub fn to_aprs_packet(
    location: &OwntracksLocation,
    station: &StationIdentity,
    table: char,
    symbol: char,
) -> Result<String, ConvertError> {
    if !location.is_location() {
        return Err(ConvertError::NotLocation(location.message_type.clone()));
    }

    let latitude = coordinate::encode(location.lat, Axis::Latitude)
        .map_err(|e| ConvertError::Position(e.to_string()))?;
    let longitude = coordinate::encode(location.lon, Axis::Longitude)
        .map_err(|e| ConvertError::Position(e.to_string()))?;

    Ok(format!(
        "{station}>APRS,TCPIP*:={latitude}{table}{longitude}{symbol} {PACKET_COMMENT}\n"
    ))
}
