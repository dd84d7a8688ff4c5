//! Producer-side location samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Finite and inside the latitude/longitude ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// One location sample emitted by the sampler. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: Uuid,
    pub device_id: String,
    pub title: Option<String>,
    pub display_name: Option<String>,
    pub position: GeoPoint,
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        device_id: impl Into<String>,
        title: Option<String>,
        display_name: Option<String>,
        position: GeoPoint,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            title,
            display_name,
            position,
            captured_at,
        }
    }
}

/// A reading that has not been confirmed delivered yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedItem {
    /// Row id in `pending_readings`; monotonically increasing, so FIFO order.
    pub queue_id: i64,
    pub reading: Reading,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}
