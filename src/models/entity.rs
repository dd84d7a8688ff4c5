//! Dashboard-side view of one producer.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::reading::GeoPoint;
use crate::settings::LivenessSettings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Lost,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Lost => "lost",
        }
    }

    /// `elapsed <= fresh` is fresh, `elapsed <= lost` is stale, anything older is lost.
    /// Negative elapsed (producer clock ahead of ours) counts as fresh.
    pub fn classify(elapsed: Duration, settings: &LivenessSettings) -> Self {
        let fresh = Duration::seconds(settings.fresh_secs as i64);
        let lost = Duration::seconds(settings.lost_secs as i64);
        if elapsed <= fresh {
            Freshness::Fresh
        } else if elapsed <= lost {
            Freshness::Stale
        } else {
            Freshness::Lost
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrailPoint {
    pub position: GeoPoint,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub device_id: String,
    pub display_name: Option<String>,
    pub position: GeoPoint,
    /// Producer clock, not local receipt time.
    pub last_seen: DateTime<Utc>,
    pub freshness: Freshness,
    pub visible: bool,
    /// Arrival order, oldest first.
    pub trail: VecDeque<TrailPoint>,
    /// Set while lost; the entity is forgotten once this passes.
    pub removal_deadline: Option<DateTime<Utc>>,
}

impl EntityState {
    pub fn new(
        device_id: String,
        display_name: Option<String>,
        position: GeoPoint,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            display_name,
            position,
            last_seen,
            freshness: Freshness::Fresh,
            visible: true,
            trail: VecDeque::new(),
            removal_deadline: None,
        }
    }

    pub fn push_trail(&mut self, point: TrailPoint, capacity: usize) {
        self.trail.push_back(point);
        while self.trail.len() > capacity {
            self.trail.pop_front();
        }
    }

    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.device_id)
    }

    /// `"<name> • HH:MM:SS"` shown above the marker.
    pub fn label(&self) -> String {
        format!("{} • {}", self.name(), self.last_seen.format("%H:%M:%S"))
    }
}
