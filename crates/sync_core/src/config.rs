use std::{fs, io, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub database_url: String,
    pub attachment_dir: String,
    pub server_url: Option<String>,
    pub attachment_concurrency: usize,
    pub attachment_tick_secs: u64,
    pub attachment_retry_budget: u32,
    pub attachment_backoff_secs: u64,
    pub pull_window: i64,
    pub batch_wait_ms: u64,
    pub batch_target_flush_ms: u64,
    pub batch_max_size: usize,
    pub batch_initial_size: usize,
    pub stuck_unread_recount_secs: u64,
    pub receipt_history_page: u32,
    pub receipt_batch_cap: usize,
    pub store_timeout_secs: u64,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/sync.db".into(),
            attachment_dir: "./data/attachments".into(),
            server_url: None,
            attachment_concurrency: 15,
            attachment_tick_secs: 60,
            attachment_retry_budget: 3,
            attachment_backoff_secs: 30,
            pull_window: 50,
            batch_wait_ms: 150,
            batch_target_flush_ms: 300,
            batch_max_size: 50,
            batch_initial_size: 50,
            stuck_unread_recount_secs: 3,
            receipt_history_page: 50,
            receipt_batch_cap: 100,
            store_timeout_secs: 10,
            event_buffer: 1024,
        }
    }
}

impl SyncSettings {
    pub fn attachment_tick(&self) -> Duration {
        Duration::from_secs(self.attachment_tick_secs)
    }

    pub fn attachment_backoff(&self) -> Duration {
        Duration::from_secs(self.attachment_backoff_secs)
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn batch_target_flush(&self) -> Duration {
        Duration::from_millis(self.batch_target_flush_ms)
    }

    pub fn stuck_unread_recount(&self) -> Duration {
        Duration::from_secs(self.stuck_unread_recount_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

/// Defaults, then `sync.toml` from the working directory, then `APP__*` variables.
pub fn load_settings() -> anyhow::Result<SyncSettings> {
    let mut settings = load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

/// Defaults overlaid with a settings file; a missing file is not an error.
pub fn load_settings_from(path: &Path) -> anyhow::Result<SyncSettings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<SyncSettings>(&raw)
            .with_context(|| format!("invalid settings file '{}'", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => SyncSettings::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    };
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__ATTACHMENT_DIR") {
        settings.attachment_dir = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = Some(v);
    }

    if let Some(parsed) = lookup("APP__ATTACHMENT_CONCURRENCY").and_then(|v| v.parse().ok()) {
        settings.attachment_concurrency = parsed;
    }
    if let Some(parsed) = lookup("APP__ATTACHMENT_RETRY_BUDGET").and_then(|v| v.parse().ok()) {
        settings.attachment_retry_budget = parsed;
    }
    if let Some(parsed) = lookup("APP__ATTACHMENT_BACKOFF_SECS").and_then(|v| v.parse().ok()) {
        settings.attachment_backoff_secs = parsed;
    }
    if let Some(parsed) = lookup("APP__BATCH_MAX_SIZE").and_then(|v| v.parse().ok()) {
        settings.batch_max_size = parsed;
    }
    if let Some(parsed) = lookup("APP__STORE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.store_timeout_secs = parsed;
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SyncSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
