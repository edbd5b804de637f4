use anyhow::{Result, anyhow};
use chrono::{DateTime, Datelike, Duration, Utc};
use num_traits::AsPrimitive;
use ogn_parser::{AprsPacket, Timestamp};

const FEET_TO_METERS: f64 = 0.3048;
const KNOTS_TO_KMH: f64 = 1.852;

/// A location report parsed from an APRS packet.
///
/// This is the gateway's APRS-side domain record: immutable once built,
/// produced only from a parsed packet, consumed by the format translator.
/// Units are normalized at construction (meters, km/h) to match what the
/// Owntracks side expects.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    /// Source callsign-SSID from the packet header
    pub sender: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_meters: Option<i32>,
    pub speed_kmh: Option<i32>,
    /// Course over ground, degrees; values >= 360 are discarded upstream
    pub course_degrees: Option<i32>,
    /// Fix timestamp from the packet, resolved against the receipt date;
    /// receipt time when the packet carries none
    pub timestamp: DateTime<Utc>,
}

/// Resolve a packet's partial timestamp against the receipt time. APRS
/// timestamps carry no date, so the missing fields come from `received_at`;
/// a stamp that lands in the future belongs to the previous day. Absent or
/// unusable stamps fall back to the receipt time.
fn resolve_timestamp(timestamp: Option<&Timestamp>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    let date = received_at.date_naive();
    let candidate = match timestamp {
        Some(Timestamp::HHMMSS(hour, minute, second)) => date
            .and_hms_opt(u32::from(*hour), u32::from(*minute), u32::from(*second))
            .map(|naive| naive.and_utc())
            .map(|ts| {
                // A packet stamped just before midnight can arrive just after
                if ts > received_at + Duration::hours(1) {
                    ts - Duration::days(1)
                } else {
                    ts
                }
            }),
        Some(Timestamp::DDHHMM(day, hour, minute)) => date
            .with_day(u32::from(*day))
            .and_then(|d| d.and_hms_opt(u32::from(*hour), u32::from(*minute), 0))
            .map(|naive| naive.and_utc()),
        _ => None,
    };
    match candidate {
        Some(ts) if ts <= received_at + Duration::hours(1) => ts,
        _ => received_at,
    }
}

impl PositionReport {
    /// Extract a position report from a parsed APRS packet.
    ///
    /// Returns `Ok(None)` for packets that are not position reports.
    /// Out-of-range coordinates indicate an upstream parse fault and are
    /// rejected rather than forwarded.
    pub fn from_aprs_packet(
        packet: AprsPacket,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        let sender = packet.from.to_string();

        let position = match packet.data {
            ogn_parser::AprsData::Position(position) => position,
            _ => return Ok(None),
        };

        let timestamp = resolve_timestamp(position.timestamp.as_ref(), received_at);

        let latitude: f64 = position.latitude.as_();
        let longitude: f64 = position.longitude.as_();
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(anyhow!(
                "packet from {} has latitude {} outside [-90, 90]",
                sender,
                latitude
            ));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(anyhow!(
                "packet from {} has longitude {} outside [-180, 180]",
                sender,
                longitude
            ));
        }

        let altitude_meters = position
            .comment
            .altitude
            .map(|feet| (feet as f64 * FEET_TO_METERS).round() as i32);
        let speed_kmh = position
            .comment
            .speed
            .map(|knots| (knots as f64 * KNOTS_TO_KMH).round() as i32);
        let course_degrees = position
            .comment
            .course
            .filter(|&course| course < 360)
            .map(|course| course as i32);

        Ok(Some(PositionReport {
            sender,
            latitude,
            longitude,
            altitude_meters,
            speed_kmh,
            course_degrees,
            timestamp,
        }))
    }
}
