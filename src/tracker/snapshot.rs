//! Debounced persistence of the tracked entities.
//!
//! Writes go through one task fed by a channel, so the inbound path never
//! waits on SQLite. A burst of requests inside the debounce window collapses
//! into a single write of whatever the registry holds when it fires.

use std::{
    collections::{BTreeMap, VecDeque},
    future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::Database,
    models::{EntityState, Freshness, GeoPoint, TrailPoint},
    settings::LivenessSettings,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub const SNAPSHOT_KEY: &str = "entity_snapshot";

/// Read access to the entities that should be persisted.
pub trait SnapshotSource: Send + Sync + 'static {
    fn snapshot_entities(&self) -> Vec<EntityState>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoordRecord {
    pub latitude: f64,
    pub longitude: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub device_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub coords: Vec<CoordRecord>,
}

fn default_visible() -> bool {
    true
}

impl EntityRecord {
    pub fn from_entity(entity: &EntityState, trail_capacity: usize) -> Self {
        let skip = entity.trail.len().saturating_sub(trail_capacity);
        Self {
            device_id: entity.device_id.clone(),
            user_name: entity.display_name.clone(),
            latitude: entity.position.lat,
            longitude: entity.position.lon,
            timestamp: entity.last_seen.timestamp_millis(),
            visible: entity.visible,
            coords: entity
                .trail
                .iter()
                .skip(skip)
                .map(|point| CoordRecord {
                    latitude: point.position.lat,
                    longitude: point.position.lon,
                    timestamp: point.timestamp.timestamp_millis(),
                })
                .collect(),
        }
    }

    /// Rebuilds the entity with freshness recomputed against `now`; a lost
    /// entity comes back with its removal deadline already armed.
    pub fn into_entity(self, now: DateTime<Utc>, liveness: &LivenessSettings) -> Result<EntityState> {
        let position = GeoPoint::new(self.latitude, self.longitude);
        if !position.is_valid() {
            return Err(anyhow!(
                "invalid position ({}, {}) for {}",
                self.latitude,
                self.longitude,
                self.device_id
            ));
        }
        let last_seen = from_millis(self.timestamp)
            .ok_or_else(|| anyhow!("invalid timestamp {} for {}", self.timestamp, self.device_id))?;

        let mut trail: VecDeque<TrailPoint> = self
            .coords
            .into_iter()
            .filter_map(|coord| {
                let position = GeoPoint::new(coord.latitude, coord.longitude);
                if !position.is_valid() {
                    return None;
                }
                Some(TrailPoint {
                    position,
                    timestamp: from_millis(coord.timestamp).unwrap_or(now),
                })
            })
            .collect();
        while trail.len() > liveness.trail_capacity {
            trail.pop_front();
        }

        let freshness = Freshness::classify(now - last_seen, liveness);
        let removal_deadline = (freshness == Freshness::Lost)
            .then(|| now + chrono::Duration::seconds(liveness.grace_secs as i64));

        Ok(EntityState {
            device_id: self.device_id,
            display_name: self.user_name,
            position,
            last_seen,
            freshness,
            visible: self.visible,
            trail,
            removal_deadline,
        })
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

enum SnapshotRequest {
    Schedule,
    WriteNow(oneshot::Sender<Result<()>>),
}

pub struct SnapshotStore {
    db: Database,
    tx: mpsc::UnboundedSender<SnapshotRequest>,
    write_count: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl SnapshotStore {
    pub fn spawn(
        db: Database,
        source: Arc<dyn SnapshotSource>,
        liveness: LivenessSettings,
        debounce: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let write_count = Arc::new(AtomicUsize::new(0));
        let cancel_token = CancellationToken::new();

        let writer = SnapshotWriter {
            db: db.clone(),
            source,
            trail_capacity: liveness.trail_capacity,
            write_count: write_count.clone(),
        };
        let handle = tokio::spawn(run_snapshot_loop(rx, writer, debounce, cancel_token.clone()));

        Self {
            db,
            tx,
            write_count,
            handle: Mutex::new(Some(handle)),
            cancel_token,
        }
    }

    /// Requests a write within the debounce window. Never blocks.
    pub fn schedule_write(&self) {
        if self.tx.send(SnapshotRequest::Schedule).is_err() {
            log_warn!("snapshot writer stopped; write request dropped");
        }
    }

    /// Writes immediately, superseding any pending debounced write.
    pub async fn write_now(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SnapshotRequest::WriteNow(reply_tx))
            .map_err(|_| anyhow!("snapshot writer is not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("snapshot writer stopped before replying"))?
    }

    /// Number of snapshots successfully written since spawn.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Loads the last snapshot. A missing snapshot is empty; an unreadable
    /// one is logged and treated as empty, as are individual bad records.
    pub async fn restore(&self, now: DateTime<Utc>, liveness: &LivenessSettings) -> Result<Vec<EntityState>> {
        let Some(raw) = self
            .db
            .get_value(SNAPSHOT_KEY)
            .await
            .context("failed to load entity snapshot")?
        else {
            return Ok(Vec::new());
        };

        let records: BTreeMap<String, EntityRecord> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(err) => {
                log_warn!("entity snapshot is unreadable, starting empty: {err}");
                return Ok(Vec::new());
            }
        };

        let mut entities = Vec::with_capacity(records.len());
        for (key, record) in records {
            match record.into_entity(now, liveness) {
                Ok(entity) => entities.push(entity),
                Err(err) => log_warn!("skipping snapshot entry {key}: {err:#}"),
            }
        }
        log_info!("restored {} entities from snapshot", entities.len());
        Ok(entities)
    }

    /// Flushes a final snapshot and stops the writer.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.write_now().await;
        self.cancel_token.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log_error!("snapshot writer failed to join: {err}");
            }
        }
        flushed
    }
}

struct SnapshotWriter {
    db: Database,
    source: Arc<dyn SnapshotSource>,
    trail_capacity: usize,
    write_count: Arc<AtomicUsize>,
}

impl SnapshotWriter {
    async fn write(&self) -> Result<()> {
        let records: BTreeMap<String, EntityRecord> = self
            .source
            .snapshot_entities()
            .iter()
            .map(|entity| {
                (
                    entity.device_id.clone(),
                    EntityRecord::from_entity(entity, self.trail_capacity),
                )
            })
            .collect();
        let serialized = serde_json::to_string(&records).context("failed to serialize snapshot")?;

        self.db.put_value(SNAPSHOT_KEY, serialized).await?;
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn run_snapshot_loop(
    mut rx: mpsc::UnboundedReceiver<SnapshotRequest>,
    writer: SnapshotWriter,
    debounce: Duration,
    cancel_token: CancellationToken,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let pending = deadline;
        let flush = async move {
            match pending {
                Some(at) => time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = flush => {
                deadline = None;
                if let Err(err) = writer.write().await {
                    // State in memory stays authoritative; the next request retries.
                    log_error!("snapshot write failed: {err:#}");
                }
            }
            request = rx.recv() => {
                let Some(request) = request else { break };
                match request {
                    SnapshotRequest::Schedule => {
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + debounce);
                        }
                    }
                    SnapshotRequest::WriteNow(reply) => {
                        deadline = None;
                        let result = writer.write().await;
                        if let Err(err) = &result {
                            log_error!("snapshot write failed: {err:#}");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
        }
    }
}
