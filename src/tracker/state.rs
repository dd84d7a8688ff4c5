//! Entity registry: the liveness state machine, with no timers or I/O.
//!
//! Time is always passed in, so the controller's sweep and the tests drive
//! the same code. Every mutation returns the side effects it implies and the
//! caller dispatches them.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::{
    display::{DisplayCommand, ListEntry},
    inbound::InboundEvent,
    viewport::ViewportReason,
};
use crate::{
    models::{EntityState, Freshness, GeoPoint, TrailPoint},
    settings::LivenessSettings,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Display(DisplayCommand),
    Viewport(ViewportReason),
    ScheduleSnapshot,
}

pub struct Registry {
    settings: LivenessSettings,
    entities: BTreeMap<String, EntityState>,
}

impl Registry {
    pub fn new(settings: LivenessSettings) -> Self {
        Self {
            settings,
            entities: BTreeMap::new(),
        }
    }

    pub fn settings(&self) -> &LivenessSettings {
        &self.settings
    }

    pub fn get(&self, device_id: &str) -> Option<&EntityState> {
        self.entities.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Applies one validated event.
    ///
    /// An entity whose removal deadline has already passed is removed first
    /// and then recreated from scratch, so a late sweep can never race the
    /// event into a half-deleted entity.
    pub fn ingest(&mut self, event: InboundEvent, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut list_changed = false;

        let expired = self
            .entities
            .get(&event.device_id)
            .and_then(|entity| entity.removal_deadline)
            .is_some_and(|deadline| deadline <= now);
        if expired {
            self.remove(&event.device_id, &mut effects);
            list_changed = true;
        }

        let grace = self.grace();
        let settings = &self.settings;
        let is_new = !self.entities.contains_key(&event.device_id);
        let timestamp = event.timestamp.at;

        let entity = self
            .entities
            .entry(event.device_id.clone())
            .or_insert_with(|| {
                EntityState::new(
                    event.device_id.clone(),
                    event.display_name.clone(),
                    event.position,
                    timestamp,
                )
            });

        if !is_new {
            if let Some(name) = &event.display_name {
                if entity.display_name.as_ref() != Some(name) {
                    entity.display_name = Some(name.clone());
                    list_changed = true;
                }
            }
            // Out-of-order events extend the trail but never move the marker back in time.
            if timestamp >= entity.last_seen {
                entity.position = event.position;
                entity.last_seen = timestamp;
            }
        }

        let point = TrailPoint {
            position: event.position,
            timestamp,
        };
        entity.push_trail(point.clone(), settings.trail_capacity);

        let previous = entity.freshness;
        if is_new {
            entity.freshness = Freshness::classify(now - entity.last_seen, settings);
            entity.removal_deadline = (entity.freshness == Freshness::Lost).then(|| now + grace);
        } else {
            // Any event for a known entity cancels a pending removal, whatever
            // its producer timestamp says. The next sweep reclassifies it.
            entity.freshness = Freshness::Fresh;
            entity.removal_deadline = None;
        }
        if is_new || previous != entity.freshness {
            list_changed = true;
        }

        effects.push(Effect::Display(upsert_command(entity)));
        effects.push(Effect::Display(DisplayCommand::AppendTrail {
            device_id: entity.device_id.clone(),
            point,
        }));
        if list_changed {
            effects.push(self.refresh_list());
        }
        effects.push(Effect::Viewport(if is_new {
            ViewportReason::New
        } else {
            ViewportReason::Update
        }));
        effects.push(Effect::ScheduleSnapshot);
        effects
    }

    /// Re-evaluates every entity that is not lost and removes the ones whose
    /// grace period has run out.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let grace = self.grace();

        let expired: Vec<String> = self
            .entities
            .values()
            .filter(|entity| entity.removal_deadline.is_some_and(|deadline| deadline <= now))
            .map(|entity| entity.device_id.clone())
            .collect();
        for device_id in &expired {
            self.remove(device_id, &mut effects);
        }

        let mut changed = false;
        for entity in self.entities.values_mut() {
            if entity.freshness == Freshness::Lost {
                continue;
            }
            let next = Freshness::classify(now - entity.last_seen, &self.settings);
            if next == entity.freshness {
                continue;
            }
            log::info!(
                "{} is now {} (last seen {})",
                entity.device_id,
                next.as_str(),
                entity.last_seen.to_rfc3339()
            );
            entity.freshness = next;
            if next == Freshness::Lost {
                entity.removal_deadline = Some(now + grace);
            }
            effects.push(Effect::Display(DisplayCommand::SetFreshness {
                device_id: entity.device_id.clone(),
                freshness: next,
                label: entity.label(),
            }));
            changed = true;
        }

        if changed || !expired.is_empty() {
            effects.push(self.refresh_list());
        }
        if !expired.is_empty() {
            effects.push(Effect::ScheduleSnapshot);
        }
        effects
    }

    /// Unknown identities and no-op toggles produce no effects.
    pub fn set_visibility(&mut self, device_id: &str, visible: bool) -> Vec<Effect> {
        let Some(entity) = self.entities.get_mut(device_id) else {
            log::warn!("Visibility change for unknown entity {device_id}");
            return Vec::new();
        };
        if entity.visible == visible {
            return Vec::new();
        }
        entity.visible = visible;

        vec![
            Effect::Display(DisplayCommand::SetVisibility {
                device_id: device_id.to_string(),
                visible,
            }),
            self.refresh_list(),
            Effect::Viewport(ViewportReason::Toggle),
            Effect::ScheduleSnapshot,
        ]
    }

    /// Loads entities from a snapshot. Freshness is always recomputed and a
    /// lost entity gets its removal deadline armed right away.
    pub fn restore(&mut self, entities: Vec<EntityState>, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let grace = self.grace();

        for mut entity in entities {
            entity.freshness = Freshness::classify(now - entity.last_seen, &self.settings);
            entity.removal_deadline = (entity.freshness == Freshness::Lost).then(|| now + grace);
            while entity.trail.len() > self.settings.trail_capacity {
                entity.trail.pop_front();
            }

            effects.push(Effect::Display(upsert_command(&entity)));
            effects.push(Effect::Display(DisplayCommand::SetTrail {
                device_id: entity.device_id.clone(),
                points: entity.trail.iter().cloned().collect(),
            }));
            self.entities.insert(entity.device_id.clone(), entity);
        }

        if !effects.is_empty() {
            effects.push(self.refresh_list());
        }
        effects
    }

    pub fn snapshot(&self) -> Vec<EntityState> {
        self.entities.values().cloned().collect()
    }

    /// Positions of visible entities that are not lost.
    pub fn active_positions(&self) -> Vec<GeoPoint> {
        self.entities
            .values()
            .filter(|entity| entity.visible && entity.freshness != Freshness::Lost)
            .map(|entity| entity.position)
            .collect()
    }

    /// Positions of every visible entity, lost ones included.
    pub fn visible_positions(&self) -> Vec<GeoPoint> {
        self.entities
            .values()
            .filter(|entity| entity.visible)
            .map(|entity| entity.position)
            .collect()
    }

    pub fn list_entries(&self) -> Vec<ListEntry> {
        self.entities
            .values()
            .map(|entity| ListEntry {
                device_id: entity.device_id.clone(),
                name: entity.name().to_string(),
                freshness: entity.freshness,
                visible: entity.visible,
            })
            .collect()
    }

    fn remove(&mut self, device_id: &str, effects: &mut Vec<Effect>) {
        if self.entities.remove(device_id).is_some() {
            log::info!("Removed {device_id} after grace period");
            effects.push(Effect::Display(DisplayCommand::RemoveEntity {
                device_id: device_id.to_string(),
            }));
        }
    }

    fn refresh_list(&self) -> Effect {
        Effect::Display(DisplayCommand::RefreshList {
            entries: self.list_entries(),
        })
    }

    fn grace(&self) -> Duration {
        Duration::seconds(self.settings.grace_secs as i64)
    }
}

fn upsert_command(entity: &EntityState) -> DisplayCommand {
    DisplayCommand::UpsertMarker {
        device_id: entity.device_id.clone(),
        position: entity.position,
        label: entity.label(),
        freshness: entity.freshness,
        visible: entity.visible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::inbound::{ParsedTimestamp, TimestampSource};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn event(device_id: &str, lat: f64, secs: i64) -> InboundEvent {
        InboundEvent {
            device_id: device_id.into(),
            display_name: None,
            position: GeoPoint::new(lat, 106.7),
            timestamp: ParsedTimestamp {
                at: at(secs),
                source: TimestampSource::EpochMillis,
            },
        }
    }

    fn registry() -> Registry {
        Registry::new(LivenessSettings::default())
    }

    /// Sweeps every 5s from `from` up to and including `to`.
    fn sweep_range(registry: &mut Registry, from: i64, to: i64) {
        let mut secs = from;
        while secs <= to {
            registry.sweep(at(secs));
            secs += 5;
        }
    }

    fn freshness(registry: &Registry, id: &str) -> Option<Freshness> {
        registry.get(id).map(|entity| entity.freshness)
    }

    #[test]
    fn first_event_is_new_then_update() {
        let mut registry = registry();
        let effects = registry.ingest(event("dev-1", 10.0, 0), at(0));
        assert!(effects.contains(&Effect::Viewport(ViewportReason::New)));
        assert!(effects.contains(&Effect::ScheduleSnapshot));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Display(DisplayCommand::RefreshList { .. }))));

        let effects = registry.ingest(event("dev-1", 10.1, 30), at(30));
        assert!(effects.contains(&Effect::Viewport(ViewportReason::Update)));
        assert_eq!(freshness(&registry, "dev-1"), Some(Freshness::Fresh));
        assert_eq!(registry.get("dev-1").unwrap().trail.len(), 2);
    }

    #[test]
    fn silence_moves_fresh_to_stale_to_lost() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 0), at(0));

        sweep_range(&mut registry, 5, 60);
        assert_eq!(freshness(&registry, "dev-1"), Some(Freshness::Fresh));

        let effects = registry.sweep(at(61));
        assert_eq!(freshness(&registry, "dev-1"), Some(Freshness::Stale));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Display(DisplayCommand::SetFreshness { freshness: Freshness::Stale, .. })
        )));

        sweep_range(&mut registry, 65, 180);
        assert_eq!(freshness(&registry, "dev-1"), Some(Freshness::Stale));
        registry.sweep(at(181));
        assert_eq!(freshness(&registry, "dev-1"), Some(Freshness::Lost));
        assert_eq!(registry.get("dev-1").unwrap().removal_deadline, Some(at(241)));
    }

    #[test]
    fn lost_entity_is_removed_after_grace() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 0), at(0));
        registry.sweep(at(181));

        registry.sweep(at(240));
        assert!(registry.get("dev-1").is_some());

        let effects = registry.sweep(at(241));
        assert!(registry.get("dev-1").is_none());
        assert!(effects.contains(&Effect::Display(DisplayCommand::RemoveEntity {
            device_id: "dev-1".into()
        })));
        assert!(effects.contains(&Effect::ScheduleSnapshot));
    }

    #[test]
    fn event_before_removal_cancels_it() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 0), at(0));
        registry.sweep(at(181));
        assert!(registry.get("dev-1").unwrap().removal_deadline.is_some());

        let effects = registry.ingest(event("dev-1", 10.2, 200), at(200));
        let entity = registry.get("dev-1").unwrap();
        assert_eq!(entity.freshness, Freshness::Fresh);
        assert_eq!(entity.removal_deadline, None);
        assert_eq!(entity.trail.len(), 2);
        assert!(effects.contains(&Effect::Viewport(ViewportReason::Update)));

        registry.sweep(at(300));
        assert!(registry.get("dev-1").is_some());
    }

    #[test]
    fn lagging_clock_events_keep_a_lost_entity_alive() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 0), at(0));
        registry.sweep(at(181));
        assert_eq!(freshness(&registry, "dev-1"), Some(Freshness::Lost));

        let mut removals = 0;
        let mut secs = 185;
        while secs <= 400 {
            // Producer clock runs 200s behind the dashboard.
            let effects = registry.ingest(event("dev-1", 10.0, secs - 200), at(secs));
            let entity = registry.get("dev-1").unwrap();
            assert_eq!(entity.freshness, Freshness::Fresh);
            assert_eq!(entity.removal_deadline, None);

            let sweep = registry.sweep(at(secs + 1));
            removals += effects
                .iter()
                .chain(sweep.iter())
                .filter(|e| matches!(e, Effect::Display(DisplayCommand::RemoveEntity { .. })))
                .count();
            secs += 5;
        }

        assert_eq!(removals, 0);
        let entity = registry.get("dev-1").unwrap();
        assert_eq!(entity.trail.len(), 1 + 44);
        // Reclassified by the sweep, with a fresh grace window from that sweep.
        assert_eq!(entity.freshness, Freshness::Lost);
        assert_eq!(entity.removal_deadline, Some(at(401 + 60)));
    }

    #[test]
    fn event_after_removal_creates_fresh_entity_with_empty_history() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 0), at(0));
        registry.ingest(event("dev-1", 10.1, 10), at(10));
        registry.sweep(at(191));
        registry.sweep(at(251));
        assert!(registry.get("dev-1").is_none());

        let effects = registry.ingest(event("dev-1", 11.0, 400), at(400));
        let entity = registry.get("dev-1").unwrap();
        assert_eq!(entity.freshness, Freshness::Fresh);
        assert_eq!(entity.trail.len(), 1);
        assert!(effects.contains(&Effect::Viewport(ViewportReason::New)));
    }

    #[test]
    fn expired_deadline_at_ingest_recreates_instead_of_reviving() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 0), at(0));
        registry.sweep(at(181));

        // No sweep ran at the deadline; the event arrives after it.
        let effects = registry.ingest(event("dev-1", 12.0, 245), at(245));
        assert_eq!(
            effects.first(),
            Some(&Effect::Display(DisplayCommand::RemoveEntity {
                device_id: "dev-1".into()
            }))
        );
        assert!(effects.contains(&Effect::Viewport(ViewportReason::New)));
        assert_eq!(registry.get("dev-1").unwrap().trail.len(), 1);
    }

    #[test]
    fn trail_is_capped() {
        let mut registry = registry();
        for i in 0..520 {
            registry.ingest(event("dev-1", (i % 80) as f64, i), at(i));
        }
        let entity = registry.get("dev-1").unwrap();
        assert_eq!(entity.trail.len(), 500);
        assert_eq!(entity.trail.front().unwrap().timestamp, at(20));
    }

    #[test]
    fn stale_timestamps_classify_immediately() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 0), at(100));
        assert_eq!(freshness(&registry, "dev-1"), Some(Freshness::Stale));
    }

    #[test]
    fn older_event_does_not_move_marker_back() {
        let mut registry = registry();
        registry.ingest(event("dev-1", 10.0, 50), at(50));
        registry.ingest(event("dev-1", 20.0, 40), at(51));
        let entity = registry.get("dev-1").unwrap();
        assert_eq!(entity.position.lat, 10.0);
        assert_eq!(entity.last_seen, at(50));
        assert_eq!(entity.trail.len(), 2);
    }

    #[test]
    fn visibility_changes_positions_and_emits_toggle() {
        let mut registry = registry();
        registry.ingest(event("a", 10.0, 0), at(0));
        registry.ingest(event("b", 11.0, 0), at(0));
        assert_eq!(registry.active_positions().len(), 2);

        let effects = registry.set_visibility("a", false);
        assert!(effects.contains(&Effect::Viewport(ViewportReason::Toggle)));
        assert_eq!(registry.active_positions(), vec![GeoPoint::new(11.0, 106.7)]);

        assert!(registry.set_visibility("a", false).is_empty());
        assert!(registry.set_visibility("missing", true).is_empty());
    }

    #[test]
    fn restore_recomputes_freshness() {
        let mut registry = registry();
        let mut old = EntityState::new("old".into(), None, GeoPoint::new(1.0, 2.0), at(0));
        old.freshness = Freshness::Fresh;
        let recent = EntityState::new("recent".into(), None, GeoPoint::new(3.0, 4.0), at(150));

        registry.restore(vec![old, recent], at(200));

        let old = registry.get("old").unwrap();
        assert_eq!(old.freshness, Freshness::Lost);
        assert_eq!(old.removal_deadline, Some(at(260)));
        assert_eq!(freshness(&registry, "recent"), Some(Freshness::Fresh));

        // Lost entities stay out of the live fit but remain in the restore fit.
        assert_eq!(registry.active_positions().len(), 1);
        assert_eq!(registry.visible_positions().len(), 2);
    }
}
