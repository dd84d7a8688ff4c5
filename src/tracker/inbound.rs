//! Normalisation of loosely-typed broadcast records.
//!
//! Different server DTOs spell the same field differently, so every field is
//! looked up under a list of aliases and the first usable value wins.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::{error::InboundError, models::GeoPoint};

const DEVICE_ID_KEYS: &[&str] = &["deviceId", "DeviceID", "DeviceId", "deviceID", "Device", "device"];
const NAME_KEYS: &[&str] = &["userName", "UserName", "Title", "title", "username"];
const LATITUDE_KEYS: &[&str] = &["latitude", "Latitude", "Lat", "lat", "LatitudeValue"];
const LONGITUDE_KEYS: &[&str] = &["longitude", "Longitude", "Lng", "lng", "lon", "LongitudeValue"];
const TIMESTAMP_KEYS: &[&str] = &[
    "timestamp",
    "Timestamp",
    "RecordDate",
    "RecordDateTime",
    "recordDate",
    "recordedAt",
    "time",
];

/// Numbers below this are epoch seconds, anything else epoch milliseconds.
///
/// Heuristic kept for compatibility with existing producers: a millisecond
/// value below 1e10 (early 1970) would be read as seconds.
pub const EPOCH_SECONDS_THRESHOLD: f64 = 1e10;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    EpochMillis,
    EpochSeconds,
    Text,
    /// Missing or unparseable; local receipt time used instead.
    ReceiptTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTimestamp {
    pub at: DateTime<Utc>,
    pub source: TimestampSource,
}

impl ParsedTimestamp {
    fn fallback(now: DateTime<Utc>) -> Self {
        Self {
            at: now,
            source: TimestampSource::ReceiptTime,
        }
    }
}

/// A validated location update for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub device_id: String,
    pub display_name: Option<String>,
    pub position: GeoPoint,
    pub timestamp: ParsedTimestamp,
}

pub fn normalize_event(raw: &Value, received_at: DateTime<Utc>) -> Result<InboundEvent, InboundError> {
    let record = raw.as_object().ok_or(InboundError::NotAnObject)?;

    let device_id = first_usable(record, DEVICE_ID_KEYS, identity_text)
        .ok_or(InboundError::MissingIdentity)?;

    let lat = coordinate(record, LATITUDE_KEYS, "latitude", &device_id)?;
    let lon = coordinate(record, LONGITUDE_KEYS, "longitude", &device_id)?;
    let position = GeoPoint::new(lat, lon);
    if !position.is_valid() {
        return Err(InboundError::InvalidCoordinate {
            device_id,
            field: "position",
            value: format!("({lat}, {lon})"),
        });
    }

    let display_name = first_usable(record, NAME_KEYS, |value| {
        let name = value.as_str()?.trim();
        (!name.is_empty()).then(|| name.to_string())
    });

    let timestamp = parse_timestamp(first_present(record, TIMESTAMP_KEYS), received_at);

    Ok(InboundEvent {
        device_id,
        display_name,
        position,
        timestamp,
    })
}

/// Accepts epoch milliseconds, epoch seconds, numeric strings and RFC 3339 or
/// zone-less ISO date-times (read as UTC). Never fails: anything else maps to `now`.
pub fn parse_timestamp(raw: Option<&Value>, now: DateTime<Utc>) -> ParsedTimestamp {
    match raw {
        Some(Value::Number(number)) => number
            .as_f64()
            .and_then(from_epoch_number)
            .unwrap_or_else(|| ParsedTimestamp::fallback(now)),
        Some(Value::String(text)) => parse_timestamp_text(text.trim())
            .unwrap_or_else(|| ParsedTimestamp::fallback(now)),
        _ => ParsedTimestamp::fallback(now),
    }
}

fn parse_timestamp_text(text: &str) -> Option<ParsedTimestamp> {
    if text.is_empty() {
        return None;
    }
    if let Ok(number) = text.parse::<f64>() {
        return from_epoch_number(number);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(ParsedTimestamp {
            at: at.with_timezone(&Utc),
            source: TimestampSource::Text,
        });
    }
    NAIVE_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(text, format)
            .ok()
            .map(|naive| ParsedTimestamp {
                at: Utc.from_utc_datetime(&naive),
                source: TimestampSource::Text,
            })
    })
}

fn from_epoch_number(value: f64) -> Option<ParsedTimestamp> {
    if !value.is_finite() {
        return None;
    }
    let (millis, source) = if value > 0.0 && value < EPOCH_SECONDS_THRESHOLD {
        (value * 1000.0, TimestampSource::EpochSeconds)
    } else {
        (value, TimestampSource::EpochMillis)
    };
    if millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_millis_opt(millis.round() as i64)
        .single()
        .map(|at| ParsedTimestamp { at, source })
}

fn first_present<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
}

/// Like `first_present`, but an alias whose value `parse` rejects is skipped
/// in favour of the next one.
fn first_usable<T>(
    record: &Map<String, Value>,
    keys: &[&str],
    parse: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .filter(|value| !value.is_null())
        .find_map(parse)
}

fn identity_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn coordinate(
    record: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
    device_id: &str,
) -> Result<f64, InboundError> {
    if let Some(parsed) = first_usable(record, keys, coordinate_value) {
        return Ok(parsed);
    }

    // Nothing usable: report the first value that was there, if any.
    match first_present(record, keys) {
        Some(value) => Err(InboundError::InvalidCoordinate {
            device_id: device_id.to_string(),
            field,
            value: value.to_string(),
        }),
        None => Err(InboundError::MissingCoordinate {
            device_id: device_id.to_string(),
            field,
        }),
    }
}

fn coordinate_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}
