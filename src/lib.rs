pub mod db;
pub mod error;
pub mod models;
pub mod producer;
pub mod settings;
pub mod tracker;
mod utils;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::mpsc;

use db::Database;
use producer::{
    HttpSink, ProducerController, ProducerStatus, ReachabilityProbe, RetryPolicy,
    StdinPositionProvider, Uplink,
};
use settings::{DeviceIdentity, SettingsStore};
use tracker::{spawn_stdin_feed, LivenessTracker, LogDisplaySink};

pub const DATA_DIR_ENV: &str = "FLEETBEACON_DATA_DIR";

/// Initialize logging (reads RUST_LOG env var).
pub fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}

/// `--data-dir`, else `$FLEETBEACON_DATA_DIR`, else `./data`.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Identity fields given on the command line; each one overrides and
/// persists the stored value.
#[derive(Debug, Default, Clone)]
pub struct IdentityOverrides {
    pub device_id: Option<String>,
    pub title: Option<String>,
    pub user_name: Option<String>,
}

impl IdentityOverrides {
    fn apply(self, current: &DeviceIdentity) -> Option<DeviceIdentity> {
        if self.device_id.is_none() && self.title.is_none() && self.user_name.is_none() {
            return None;
        }
        Some(DeviceIdentity {
            device_id: self.device_id.unwrap_or_else(|| current.device_id.clone()),
            title: self.title.or_else(|| current.title.clone()),
            user_name: self.user_name.or_else(|| current.user_name.clone()),
        })
    }
}

fn open_stores(data_dir: &Path, db_file: &str) -> Result<(Database, SettingsStore)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let database = Database::new(data_dir.join(db_file))?;
    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    Ok((database, settings))
}

/// Samples positions from stdin and delivers them, queueing while offline.
pub async fn run_producer(data_dir: PathBuf, overrides: IdentityOverrides) -> Result<()> {
    info!("fleetbeacon producer starting (data in {})", data_dir.display());
    let (database, settings_store) = open_stores(&data_dir, "producer.sqlite3")?;

    if let Some(identity) = overrides.apply(&settings_store.identity()) {
        settings_store.update_identity(identity)?;
    }
    let settings = settings_store.current();

    let sink = HttpSink::new(
        settings.uplink.endpoint.clone(),
        Duration::from_millis(settings.uplink.request_timeout_ms),
    )?;
    let uplink = Arc::new(Uplink::new(
        Arc::new(sink),
        RetryPolicy::from_settings(&settings.uplink),
    ));
    let provider = Arc::new(StdinPositionProvider::spawn());

    let (reachability_tx, reachability_rx) = mpsc::channel(16);
    let probe = ReachabilityProbe::spawn(
        &settings.uplink.endpoint,
        Duration::from_millis(settings.connectivity.probe_interval_ms),
        reachability_tx,
    )?;

    let mut controller = ProducerController::new(settings, database, uplink, provider);
    if controller.start(reachability_rx).await? == ProducerStatus::AwaitingIdentity {
        probe.stop().await;
        info!("Set --title and --user-name to start tracking");
        return Ok(());
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Failed to listen for Ctrl-C: {err}");
            }
            info!("Shutting down producer");
        }
        _ = controller.closed() => warn!("Sampler stopped on its own"),
    }

    let result = controller.stop().await;
    probe.stop().await;
    if let Err(err) = &result {
        error!("Producer stopped with error: {err:#}");
    }
    result
}

/// Tracks inbound records from stdin and renders display commands on stdout.
pub async fn run_dashboard(data_dir: PathBuf, fit_on_update: Option<bool>) -> Result<()> {
    info!("fleetbeacon dashboard starting (data in {})", data_dir.display());
    let (database, settings_store) = open_stores(&data_dir, "dashboard.sqlite3")?;

    if let Some(fit_on_update) = fit_on_update {
        let mut viewport = settings_store.viewport();
        viewport.fit_on_update = fit_on_update;
        settings_store.update_viewport(viewport)?;
    }
    let settings = settings_store.current();

    let mut tracker = LivenessTracker::new(&settings, Some(database), Arc::new(LogDisplaySink));
    match tracker.restore().await {
        Ok(count) => info!("Restored {count} entities from the last session"),
        Err(err) => warn!("Snapshot restore failed, starting empty: {err:#}"),
    }
    tracker.start();

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let feed = spawn_stdin_feed(inbound_tx);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Failed to listen for Ctrl-C: {err}");
            }
            info!("Shutting down dashboard");
        }
        _ = tracker.run_inbound(inbound_rx) => info!("Inbound feed ended"),
    }

    feed.abort();
    tracker.shutdown().await
}
