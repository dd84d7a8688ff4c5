use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// Who this producer reports as. Sampling only runs once `title` and
/// `user_name` are both set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub title: Option<String>,
    pub user_name: Option<String>,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            device_id: "UnknownDevice".into(),
            title: None,
            user_name: None,
        }
    }
}

impl DeviceIdentity {
    pub fn is_complete(&self) -> bool {
        let filled = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        filled(&self.title) && filled(&self.user_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UplinkSettings {
    pub endpoint: String,
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5089/api/GPS_DeviceTracking".into(),
            attempts: 3,
            initial_delay_ms: 1500,
            max_delay_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerSettings {
    pub interval_ms: u64,
    pub reregister_delay_ms: u64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            reregister_delay_ms: 2000,
        }
    }
}

impl SamplerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn reregister_delay(&self) -> Duration {
        Duration::from_millis(self.reregister_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivitySettings {
    /// A second `Available` inside this window is ignored.
    pub debounce_ms: u64,
    /// Delay between an accepted `Available` and the drain it triggers.
    pub settle_delay_ms: u64,
    pub probe_interval_ms: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            debounce_ms: 3000,
            settle_delay_ms: 1000,
            probe_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LivenessSettings {
    pub fresh_secs: u64,
    pub lost_secs: u64,
    pub tick_secs: u64,
    pub grace_secs: u64,
    pub trail_capacity: usize,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            fresh_secs: 60,
            lost_secs: 180,
            tick_secs: 5,
            grace_secs: 60,
            trail_capacity: 500,
        }
    }
}

impl LivenessSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewportSettings {
    /// When false, `update` reasons never move the viewport.
    pub fit_on_update: bool,
    pub toggle_delay_ms: u64,
    /// At or below this many positions the view centers instead of fitting bounds.
    pub min_entities: usize,
    pub single_entity_zoom: u8,
    pub padding: [u32; 2],
}

impl Default for ViewportSettings {
    fn default() -> Self {
        Self {
            fit_on_update: false,
            toggle_delay_ms: 2000,
            min_entities: 1,
            single_entity_zoom: 16,
            padding: [50, 50],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SnapshotSettings {
    pub debounce_ms: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub identity: DeviceIdentity,
    pub uplink: UplinkSettings,
    pub sampler: SamplerSettings,
    pub connectivity: ConnectivitySettings,
    pub liveness: LivenessSettings,
    pub viewport: ViewportSettings,
    pub snapshot: SnapshotSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AppSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Settings at {} are unreadable ({err}); using defaults",
                    path.display()
                );
                AppSettings::default()
            })
        } else {
            AppSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn current(&self) -> AppSettings {
        self.read().clone()
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.read().identity.clone()
    }

    pub fn update_identity(&self, identity: DeviceIdentity) -> Result<()> {
        let mut guard = self.write();
        guard.identity = identity;
        self.persist(&guard)
    }

    pub fn viewport(&self) -> ViewportSettings {
        self.read().viewport.clone()
    }

    pub fn update_viewport(&self, viewport: ViewportSettings) -> Result<()> {
        let mut guard = self.write();
        guard.viewport = viewport;
        self.persist(&guard)
    }

    fn read(&self) -> RwLockReadGuard<'_, AppSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &AppSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = SettingsStore::new(dir.path().join("settings.json")).expect("store");
        let settings = store.current();
        assert_eq!(settings.uplink.attempts, 3);
        assert_eq!(settings.liveness.lost_secs, 180);
        assert!(!settings.viewport.fit_on_update);
    }

    #[test]
    fn partial_file_fills_remaining_fields() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"liveness":{"fresh_secs":30}}"#).expect("write");

        let store = SettingsStore::new(path).expect("store");
        let liveness = store.current().liveness;
        assert_eq!(liveness.fresh_secs, 30);
        assert_eq!(liveness.grace_secs, 60);
    }

    #[test]
    fn viewport_update_survives_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).expect("store");

        let mut viewport = store.viewport();
        viewport.fit_on_update = true;
        store.update_viewport(viewport).expect("update");

        let reloaded = SettingsStore::new(path).expect("reload");
        assert!(reloaded.viewport().fit_on_update);
    }

    #[test]
    fn identity_needs_title_and_user() {
        let mut identity = DeviceIdentity::default();
        assert!(!identity.is_complete());
        identity.title = Some("Truck 7".into());
        identity.user_name = Some("  ".into());
        assert!(!identity.is_complete());
        identity.user_name = Some("Lan".into());
        assert!(identity.is_complete());
    }
}
