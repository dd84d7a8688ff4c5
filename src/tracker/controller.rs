use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{
    display::DisplaySink,
    inbound::{normalize_event, InboundEvent},
    snapshot::{SnapshotSource, SnapshotStore},
    state::{Effect, Registry},
    viewport::{PositionSource, ViewportController},
};
use crate::{
    db::Database,
    error::InboundError,
    models::{EntityState, GeoPoint},
    settings::{AppSettings, LivenessSettings, ViewportSettings},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Shared, lock-guarded registry. Other tasks only ever read through it.
#[derive(Clone)]
pub struct RegistryHandle(Arc<Mutex<Registry>>);

impl RegistryHandle {
    fn new(registry: Registry) -> Self {
        Self(Arc::new(Mutex::new(registry)))
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PositionSource for RegistryHandle {
    fn active_positions(&self) -> Vec<GeoPoint> {
        self.lock().active_positions()
    }

    fn visible_positions(&self) -> Vec<GeoPoint> {
        self.lock().visible_positions()
    }
}

impl SnapshotSource for RegistryHandle {
    fn snapshot_entities(&self) -> Vec<EntityState> {
        self.lock().snapshot()
    }
}

struct TrackerCore {
    registry: RegistryHandle,
    /// Serializes writers so effects reach the sinks in mutation order while
    /// readers of the registry never wait on display output.
    dispatch: Mutex<()>,
    display: Arc<dyn DisplaySink>,
    viewport: ViewportController,
    snapshots: Option<SnapshotStore>,
}

impl TrackerCore {
    /// Runs one registry mutation, then dispatches its effects after the
    /// registry lock is released. A sweep and an event are never observed
    /// interleaved because both hold `dispatch` until their effects are out.
    fn apply<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Registry) -> Vec<Effect>,
    {
        let _dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let effects = {
            let mut registry = self.registry.lock();
            mutate(&mut *registry)
        };

        for effect in effects {
            match effect {
                Effect::Display(command) => self.display.apply(command),
                Effect::Viewport(reason) => self.viewport.on_reason(reason),
                Effect::ScheduleSnapshot => {
                    if let Some(snapshots) = &self.snapshots {
                        snapshots.schedule_write();
                    }
                }
            }
        }
    }
}

/// Dashboard-side owner of the entity registry, its sweep, the viewport and
/// the snapshot writer.
pub struct LivenessTracker {
    core: Arc<TrackerCore>,
    liveness: LivenessSettings,
    sweep_handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl LivenessTracker {
    /// Without a database the tracker runs purely in memory.
    pub fn new(settings: &AppSettings, db: Option<Database>, display: Arc<dyn DisplaySink>) -> Self {
        let registry = RegistryHandle::new(Registry::new(settings.liveness.clone()));
        let viewport = ViewportController::spawn(
            settings.viewport.clone(),
            Arc::new(registry.clone()),
            display.clone(),
        );
        let snapshots = db.map(|db| {
            SnapshotStore::spawn(
                db,
                Arc::new(registry.clone()),
                settings.liveness.clone(),
                Duration::from_millis(settings.snapshot.debounce_ms),
            )
        });

        Self {
            core: Arc::new(TrackerCore {
                registry,
                dispatch: Mutex::new(()),
                display,
                viewport,
                snapshots,
            }),
            liveness: settings.liveness.clone(),
            sweep_handle: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Starts the periodic re-evaluation sweep.
    pub fn start(&mut self) {
        if self.sweep_handle.is_some() {
            log_warn!("liveness sweep already running");
            return;
        }

        let core = self.core.clone();
        let cancel_token = self.cancel_token.clone();
        let tick = self.liveness.tick();
        self.sweep_handle = Some(tokio::spawn(async move {
            let mut ticker = time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        core.apply(|registry| registry.sweep(now));
                    }
                }
            }
        }));
        log_info!("liveness sweep started (every {}s)", tick.as_secs());
    }

    /// Normalizes and applies one broadcast record. Rejected records are
    /// logged and leave every entity untouched.
    pub fn ingest_raw(&self, raw: &Value) -> Result<(), InboundError> {
        let now = Utc::now();
        match normalize_event(raw, now) {
            Ok(event) => {
                self.ingest_event(event, now);
                Ok(())
            }
            Err(err) => {
                log_warn!("rejected inbound record: {err} ({raw})");
                Err(err)
            }
        }
    }

    pub fn ingest_event(&self, event: InboundEvent, now: DateTime<Utc>) {
        self.core.apply(|registry| registry.ingest(event, now));
    }

    /// Consumes records until the channel closes.
    pub async fn run_inbound(&self, mut inbound: mpsc::Receiver<Value>) {
        while let Some(raw) = inbound.recv().await {
            // Already logged; a bad record never stops the stream.
            let _ = self.ingest_raw(&raw);
        }
        log_info!("inbound channel closed");
    }

    /// Runs one sweep at `now`, outside the periodic ticker.
    pub fn sweep_at(&self, now: DateTime<Utc>) {
        self.core.apply(|registry| registry.sweep(now));
    }

    /// Returns false when the identity is unknown.
    pub fn set_visibility(&self, device_id: &str, visible: bool) -> bool {
        let known = self.core.registry.lock().get(device_id).is_some();
        if known {
            self.core
                .apply(|registry| registry.set_visibility(device_id, visible));
        }
        known
    }

    pub fn set_viewport_policy(&self, settings: ViewportSettings) {
        self.core.viewport.set_policy(settings);
    }

    pub fn entities(&self) -> Vec<EntityState> {
        self.core.registry.lock().snapshot()
    }

    pub fn entity(&self, device_id: &str) -> Option<EntityState> {
        self.core.registry.lock().get(device_id).cloned()
    }

    /// Reloads the last snapshot and frames everything restored.
    pub async fn restore(&self) -> Result<usize> {
        let Some(snapshots) = &self.core.snapshots else {
            return Ok(0);
        };
        let now = Utc::now();
        let entities = snapshots.restore(now, &self.liveness).await?;
        Ok(self.restore_entities(entities, now))
    }

    pub fn restore_entities(&self, entities: Vec<EntityState>, now: DateTime<Utc>) -> usize {
        let count = entities.len();
        if count == 0 {
            return 0;
        }
        self.core.apply(|registry| registry.restore(entities, now));
        self.core.viewport.fit_to_all();
        log_info!("restored {count} entities");
        count
    }

    pub fn snapshot_writes(&self) -> usize {
        self.core
            .snapshots
            .as_ref()
            .map_or(0, SnapshotStore::write_count)
    }

    /// Stops the sweep and viewport and flushes a final snapshot.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.cancel_token.cancel();
        if let Some(handle) = self.sweep_handle.take() {
            if let Err(err) = handle.await {
                log_error!("liveness sweep failed to join: {err}");
            }
        }
        self.core.viewport.stop().await;

        match &self.core.snapshots {
            Some(snapshots) => snapshots.shutdown().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::Freshness,
        tracker::display::{ChannelDisplaySink, DisplayCommand},
    };
    use serde_json::json;
    use tempfile::tempdir;

    fn collect(rx: &mut mpsc::UnboundedReceiver<DisplayCommand>) -> Vec<DisplayCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    #[tokio::test]
    async fn malformed_records_touch_nothing() {
        let (sink, mut rx) = ChannelDisplaySink::new();
        let mut tracker = LivenessTracker::new(&AppSettings::default(), None, Arc::new(sink));

        assert!(tracker.ingest_raw(&json!({"lat": 1.0, "lon": 2.0})).is_err());
        assert!(tracker.ingest_raw(&json!("text")).is_err());
        assert!(tracker.entities().is_empty());
        assert!(collect(&mut rx).is_empty());

        tracker
            .ingest_raw(&json!({"deviceId": "dev-1", "lat": 10.0, "lng": 106.0}))
            .expect("valid");
        assert_eq!(tracker.entities().len(), 1);
        let commands = collect(&mut rx);
        assert!(matches!(commands.first(), Some(DisplayCommand::UpsertMarker { .. })));

        tracker.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn run_inbound_survives_bad_records() {
        let (sink, _rx) = ChannelDisplaySink::new();
        let mut tracker = LivenessTracker::new(&AppSettings::default(), None, Arc::new(sink));
        let (tx, inbound) = mpsc::channel(8);

        tx.send(json!({"deviceId": "a", "lat": 1.0, "lon": 1.0})).await.unwrap();
        tx.send(json!({"deviceId": "b"})).await.unwrap();
        tx.send(json!({"deviceId": "c", "lat": 2.0, "lon": 2.0})).await.unwrap();
        drop(tx);
        tracker.run_inbound(inbound).await;

        let ids: Vec<String> = tracker.entities().into_iter().map(|e| e.device_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
        tracker.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn visibility_toggle_reaches_the_display() {
        let (sink, mut rx) = ChannelDisplaySink::new();
        let mut tracker = LivenessTracker::new(&AppSettings::default(), None, Arc::new(sink));
        tracker
            .ingest_raw(&json!({"deviceId": "a", "lat": 1.0, "lon": 1.0}))
            .expect("valid");
        collect(&mut rx);

        assert!(tracker.set_visibility("a", false));
        assert!(!tracker.set_visibility("ghost", false));
        let commands = collect(&mut rx);
        assert!(commands.contains(&DisplayCommand::SetVisibility {
            device_id: "a".into(),
            visible: false
        }));
        assert!(!tracker.entity("a").unwrap().visible);
        tracker.shutdown().await.expect("shutdown");
    }

    /// Blocks inside the first `apply` until released.
    struct GatedSink {
        gated: std::sync::atomic::AtomicBool,
        entered: std::sync::mpsc::SyncSender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl DisplaySink for GatedSink {
        fn apply(&self, _command: DisplayCommand) {
            if self.gated.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.entered.send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
        }
    }

    #[tokio::test]
    async fn slow_display_does_not_hold_the_registry() {
        use std::sync::mpsc::sync_channel;

        let (entered_tx, entered_rx) = sync_channel(1);
        let (release_tx, release_rx) = sync_channel(1);
        let sink = GatedSink {
            gated: std::sync::atomic::AtomicBool::new(true),
            entered: entered_tx,
            release: Mutex::new(release_rx),
        };
        let tracker = Arc::new(LivenessTracker::new(&AppSettings::default(), None, Arc::new(sink)));

        let writer = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                tracker
                    .ingest_raw(&json!({"deviceId": "a", "lat": 1.0, "lon": 1.0}))
                    .expect("valid");
            })
        };

        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("display reached");
        // The display is stuck mid-dispatch; readers still get through.
        assert_eq!(tracker.entities().len(), 1);
        assert_eq!(tracker.core.registry.active_positions().len(), 1);

        release_tx.send(()).unwrap();
        writer.join().unwrap();

        let mut tracker = Arc::into_inner(tracker).expect("sole owner");
        tracker.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn snapshot_survives_a_restart() {
        let dir = tempdir().expect("tempdir");
        let db = Database::new(dir.path().join("dashboard.sqlite3")).expect("db");
        let settings = AppSettings::default();

        let (sink, _rx) = ChannelDisplaySink::new();
        let mut tracker = LivenessTracker::new(&settings, Some(db.clone()), Arc::new(sink));
        tracker
            .ingest_raw(&json!({"deviceId": "a", "userName": "Lan", "lat": 1.0, "lon": 1.0}))
            .expect("valid");
        tracker.set_visibility("a", false);
        tracker.shutdown().await.expect("shutdown flush");
        assert!(tracker.snapshot_writes() >= 1);

        let (sink, _rx) = ChannelDisplaySink::new();
        let mut restarted = LivenessTracker::new(&settings, Some(db), Arc::new(sink));
        assert_eq!(restarted.restore().await.expect("restore"), 1);
        let entity = restarted.entity("a").expect("restored");
        assert_eq!(entity.display_name.as_deref(), Some("Lan"));
        assert_eq!(entity.freshness, Freshness::Fresh);
        assert!(!entity.visible);
        assert_eq!(entity.trail.len(), 1);
        restarted.shutdown().await.expect("shutdown");
    }
}
