use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::backoff::BackoffPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: f64,
    pub max_connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub top_level_fetch_limit: u32,
    pub mutation_timeout_secs: u64,
    pub maintenance_tick_ms: u64,
    pub signal_ttl_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            backoff_jitter: 0.2,
            max_connect_attempts: 8,
            connect_timeout_ms: 10_000,
            sweep_interval_secs: 60,
            top_level_fetch_limit: 50,
            mutation_timeout_secs: 15,
            maintenance_tick_ms: 1_000,
            signal_ttl_ms: 5_000,
        }
    }
}

impl SyncSettings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms.max(self.backoff_base_ms)),
            jitter: self.backoff_jitter.clamp(0.0, 1.0),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_secs(self.mutation_timeout_secs)
    }

    pub fn maintenance_tick(&self) -> Duration {
        Duration::from_millis(self.maintenance_tick_ms.max(10))
    }

    pub fn signal_ttl(&self) -> Duration {
        Duration::from_millis(self.signal_ttl_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    backoff_jitter: Option<f64>,
    max_connect_attempts: Option<u32>,
    connect_timeout_ms: Option<u64>,
    sweep_interval_secs: Option<u64>,
    top_level_fetch_limit: Option<u32>,
    mutation_timeout_secs: Option<u64>,
    maintenance_tick_ms: Option<u64>,
    signal_ttl_ms: Option<u64>,
}

/// Defaults, then `sync.toml` in the working directory, then `SYNC__*` environment overrides.
pub fn load_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();

    match load_settings_file(Path::new(DEFAULT_SETTINGS_FILE)) {
        Ok(Some(file_cfg)) => apply_file_settings(&mut settings, file_cfg),
        Ok(None) => {}
        Err(err) => tracing::warn!(error = %err, "ignoring unreadable sync settings file"),
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<SyncSettings> {
    let mut settings = SyncSettings::default();
    if let Some(file_cfg) = load_settings_file(path)? {
        apply_file_settings(&mut settings, file_cfg);
    }
    Ok(settings)
}

fn load_settings_file(path: &Path) -> anyhow::Result<Option<FileSettings>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let parsed = toml::from_str::<FileSettings>(&raw)
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(Some(parsed))
}

fn apply_file_settings(settings: &mut SyncSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.backoff_base_ms {
        settings.backoff_base_ms = v;
    }
    if let Some(v) = file_cfg.backoff_cap_ms {
        settings.backoff_cap_ms = v;
    }
    if let Some(v) = file_cfg.backoff_jitter {
        settings.backoff_jitter = v;
    }
    if let Some(v) = file_cfg.max_connect_attempts {
        settings.max_connect_attempts = v;
    }
    if let Some(v) = file_cfg.connect_timeout_ms {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = file_cfg.sweep_interval_secs {
        settings.sweep_interval_secs = v;
    }
    if let Some(v) = file_cfg.top_level_fetch_limit {
        settings.top_level_fetch_limit = v;
    }
    if let Some(v) = file_cfg.mutation_timeout_secs {
        settings.mutation_timeout_secs = v;
    }
    if let Some(v) = file_cfg.maintenance_tick_ms {
        settings.maintenance_tick_ms = v;
    }
    if let Some(v) = file_cfg.signal_ttl_ms {
        settings.signal_ttl_ms = v;
    }
}

fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable sync setting");
                None
            }
        }
    }

    if let Some(v) = parsed(&lookup, "SYNC__BACKOFF_BASE_MS") {
        settings.backoff_base_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__BACKOFF_CAP_MS") {
        settings.backoff_cap_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__BACKOFF_JITTER") {
        settings.backoff_jitter = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__MAX_CONNECT_ATTEMPTS") {
        settings.max_connect_attempts = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__CONNECT_TIMEOUT_MS") {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__SWEEP_INTERVAL_SECS") {
        settings.sweep_interval_secs = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__TOP_LEVEL_FETCH_LIMIT") {
        settings.top_level_fetch_limit = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__MUTATION_TIMEOUT_SECS") {
        settings.mutation_timeout_secs = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__MAINTENANCE_TICK_MS") {
        settings.maintenance_tick_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SYNC__SIGNAL_TTL_MS") {
        settings.signal_ttl_ms = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
