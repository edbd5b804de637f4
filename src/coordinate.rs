use std::fmt::{Display, Formatter};

/// Which axis a decimal-degree value belongs to. APRS renders the two
/// differently: latitude degrees are two digits, longitude degrees three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    fn max_degrees(self) -> f64 {
        match self {
            Axis::Latitude => 90.0,
            Axis::Longitude => 180.0,
        }
    }

    fn degree_width(self) -> usize {
        match self {
            Axis::Latitude => 2,
            Axis::Longitude => 3,
        }
    }

    /// Hemisphere suffix for a value of the given sign. Exactly zero is
    /// rendered as the positive hemisphere (N / E).
    fn suffix(self, positive: bool) -> char {
        match (self, positive) {
            (Axis::Latitude, true) => 'N',
            (Axis::Latitude, false) => 'S',
            (Axis::Longitude, true) => 'E',
            (Axis::Longitude, false) => 'W',
        }
    }
}

#[derive(Debug)]
pub struct EncodeError {
    pub message: String,
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for EncodeError {}

#[derive(Debug)]
pub struct DecodeError {
    pub message: String,
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for DecodeError {}

/// Encode a decimal-degree coordinate as the fixed-width APRS DMS form:
/// `DDMM.HHx` for latitude (`5130.00N`), `DDDMM.HHx` for longitude
/// (`00007.20W`). Minutes are rounded to hundredths in integer arithmetic and
/// `60.00'` carries into the degree field, so the minutes field is always
/// below 60.
pub fn encode(value: f64, axis: Axis) -> Result<String, EncodeError> {
    if !value.is_finite() {
        return Err(EncodeError {
            message: format!("cannot encode non-finite coordinate {value}"),
        });
    }
    if value.abs() > axis.max_degrees() {
        return Err(EncodeError {
            message: format!(
                "coordinate {} out of range for {:?} (max {})",
                value,
                axis,
                axis.max_degrees()
            ),
        });
    }

    let positive = value >= 0.0;
    let magnitude = value.abs();
    let mut degrees = magnitude.trunc() as u32;
    // Hundredths of a minute, rounded once
    let mut hundredths = (magnitude.fract() * 6000.0).round() as u32;
    if hundredths >= 6000 {
        degrees += 1;
        hundredths -= 6000;
    }
    let minutes = hundredths / 100;
    let fraction = hundredths % 100;

    Ok(format!(
        "{:0width$}{:02}.{:02}{}",
        degrees,
        minutes,
        fraction,
        axis.suffix(positive),
        width = axis.degree_width()
    ))
}

/// Decode the fixed-width DMS form back to signed decimal degrees. Accepts
/// both the 8-character latitude and 9-character longitude layouts; the
/// hemisphere suffix determines both axis and sign.
pub fn decode(text: &str) -> Result<f64, DecodeError> {
    let malformed = |reason: &str| DecodeError {
        message: format!("malformed DMS coordinate {text:?}: {reason}"),
    };

    let suffix = text.chars().last().ok_or_else(|| malformed("empty"))?;
    let sign = match suffix {
        'N' | 'E' => 1.0,
        'S' | 'W' => -1.0,
        _ => return Err(malformed("unknown hemisphere suffix")),
    };

    let body = &text[..text.len() - 1];
    // The minutes field is the fixed-width "MM.HH" tail; degrees are whatever
    // precedes it.
    if body.len() < 6 {
        return Err(malformed("too short"));
    }
    let (degrees_part, minutes_part) = body.split_at(body.len() - 5);
    let degrees: f64 = degrees_part
        .parse()
        .map_err(|_| malformed("bad degrees field"))?;
    let minutes: f64 = minutes_part
        .parse()
        .map_err(|_| malformed("bad minutes field"))?;
    if !(0.0..60.0).contains(&minutes) {
        return Err(malformed("minutes out of range"));
    }

    Ok(sign * (degrees + minutes / 60.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    // One hundredth of a minute in decimal degrees
    const RESOLUTION: f64 = 1.0 / 6000.0;

    #[test]
    fn test_latitude_encoding() {
        assert_eq!(encode(51.5, Axis::Latitude).unwrap(), "5130.00N");
        assert_eq!(encode(-33.8675, Axis::Latitude).unwrap(), "3352.05S");
    }

    #[test]
    fn test_longitude_encoding() {
        assert_eq!(encode(-0.12, Axis::Longitude).unwrap(), "00007.20W");
        assert_eq!(encode(151.2070, Axis::Longitude).unwrap(), "15112.42E");
    }

    #[test]
    fn test_zero_maps_to_positive_hemisphere() {
        assert_eq!(encode(0.0, Axis::Latitude).unwrap(), "0000.00N");
        assert_eq!(encode(0.0, Axis::Longitude).unwrap(), "00000.00E");
        // Negative zero is still zero
        assert_eq!(encode(-0.0, Axis::Latitude).unwrap(), "0000.00N");
    }

    #[test]
    fn test_degree_field_widths() {
        let mut lon = -179.999;
        while lon < 180.0 {
            let encoded = encode(lon, Axis::Longitude).unwrap();
            assert_eq!(encoded.len(), 9, "{encoded}");
            lon += 13.77;
        }
        let mut lat = -89.999;
        while lat < 90.0 {
            let encoded = encode(lat, Axis::Latitude).unwrap();
            assert_eq!(encoded.len(), 8, "{encoded}");
            lat += 7.13;
        }
    }

    #[test]
    fn test_minutes_carry_into_degrees() {
        // 0.99999 * 60 = 59.9994' rounds to 60.00' and must carry
        assert_eq!(encode(51.99999, Axis::Latitude).unwrap(), "5200.00N");
        assert_eq!(encode(-0.99999, Axis::Longitude).unwrap(), "00100.00W");
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(encode(90.001, Axis::Latitude).is_err());
        assert!(encode(-180.5, Axis::Longitude).is_err());
        assert!(encode(f64::NAN, Axis::Latitude).is_err());
        assert!(encode(f64::INFINITY, Axis::Longitude).is_err());
    }

    #[test]
    fn test_round_trip_within_resolution() {
        let mut lat = -89.999;
        while lat < 90.0 {
            let decoded = decode(&encode(lat, Axis::Latitude).unwrap()).unwrap();
            assert!(
                (decoded - lat).abs() <= RESOLUTION,
                "lat {lat} decoded as {decoded}"
            );
            lat += 0.337;
        }
        let mut lon = -179.999;
        while lon < 180.0 {
            let decoded = decode(&encode(lon, Axis::Longitude).unwrap()).unwrap();
            assert!(
                (decoded - lon).abs() <= RESOLUTION,
                "lon {lon} decoded as {decoded}"
            );
            lon += 0.733;
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("").is_err());
        assert!(decode("5130.00X").is_err());
        assert!(decode("99.0N").is_err());
        assert!(decode("5199.00N").is_err());
    }
}
