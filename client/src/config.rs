use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::syncer::SyncConfig;

/// Persisted client settings. Missing keys fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub display_name: String,
    pub follow_url: bool,
    pub tick_ms: u64,
    pub hard_seek_threshold_ms: i64,
    pub deadzone_ms: i64,
    pub soft_rate_enabled: bool,
    pub soft_rate_threshold_ms: i64,
    pub soft_rate_adjust: f64,
    pub soft_rate_max_ms: i64,
    /// Static offset added to every target position (and published by hosts).
    pub offset_ms: i64,
    pub time_sync_interval_sec: u64,
    pub player_idle_timeout_sec: i64,
    pub host_idle_report_sec: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9012/ws".to_string(),
            display_name: String::new(),
            follow_url: true,
            tick_ms: 500,
            hard_seek_threshold_ms: 1000,
            deadzone_ms: 200,
            soft_rate_enabled: true,
            soft_rate_threshold_ms: 600,
            soft_rate_adjust: 0.02,
            soft_rate_max_ms: 3000,
            offset_ms: 0,
            time_sync_interval_sec: 600,
            player_idle_timeout_sec: 30,
            host_idle_report_sec: 5,
        }
    }
}

impl ClientConfig {
    /// `config.json` under the platform config directory.
    pub fn default_path() -> PathBuf {
        match ProjectDirs::from("com", "tandem", "Tandem") {
            Some(dirs) => dirs.config_dir().join("config.json"),
            None => env::temp_dir().join("tandem-config.json"),
        }
    }

    /// Reads the config at `path`, writing the defaults there first if the file does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }
        let data = fs::read(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let payload = serde_json::to_vec_pretty(self)?;
        fs::write(path, payload)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            hard_seek_threshold_ms: self.hard_seek_threshold_ms,
            deadzone_ms: self.deadzone_ms,
            soft_rate_enabled: self.soft_rate_enabled,
            soft_rate_threshold_ms: self.soft_rate_threshold_ms,
            soft_rate_adjust: self.soft_rate_adjust,
            soft_rate_max_ms: self.soft_rate_max_ms,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(50))
    }

    pub fn time_sync_interval(&self) -> Duration {
        Duration::from_secs(self.time_sync_interval_sec.max(1))
    }

    /// `None` when the player liveness check is disabled.
    pub fn player_idle_timeout(&self) -> Option<Duration> {
        positive_secs(self.player_idle_timeout_sec)
    }

    /// `None` when page-only host reports are disabled.
    pub fn host_idle_report(&self) -> Option<Duration> {
        positive_secs(self.host_idle_report_sec)
    }
}

fn positive_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
