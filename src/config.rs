//! Layered configuration (A3): defaults → TOML file → environment.
//!
//! Grounded on this codebase's existing config stack (`directories`,
//! `toml`, `shellexpand`, `schemars`); no concrete `config.rs` survived
//! retrieval, so this module is authored fresh in that stack's idiom.

use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Maintenance cutoff for `delete_resolved_before`: 30 days, in seconds.
pub const DEFAULT_MAX_EVENT_AGE_RESOLVED_SECS: i64 = 30 * 24 * 60 * 60;
/// `sync_status(...).healthy` requires `last_sync_at` within this window.
pub const DEFAULT_HEALTHY_SYNC_WINDOW_MS: i64 = 3_600_000;
/// `batch_record` processes events in arrays of this size.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default per-request deadline the coordinator imposes on every port call.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyncConfig {
    /// Maintenance cutoff for deleting resolved events, in seconds.
    #[serde(default = "default_max_event_age_resolved_secs")]
    pub max_event_age_resolved_secs: i64,
    /// `sync_status` healthy window, in milliseconds.
    #[serde(default = "default_healthy_sync_window_ms")]
    pub healthy_sync_window_ms: i64,
    /// `batch_record` batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Per-request deadline, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Path to the SQLite database file backing the default store
    /// adapters. Relative paths and `~` are resolved against the
    /// platform data directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_max_event_age_resolved_secs() -> i64 {
    DEFAULT_MAX_EVENT_AGE_RESOLVED_SECS
}
fn default_healthy_sync_window_ms() -> i64 {
    DEFAULT_HEALTHY_SYNC_WINDOW_MS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_database_path() -> String {
    "sync.db".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_event_age_resolved_secs: default_max_event_age_resolved_secs(),
            healthy_sync_window_ms: default_healthy_sync_window_ms(),
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
            database_path: default_database_path(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolve `database_path` against the platform data directory when
    /// relative, expanding a leading `~`.
    pub fn resolved_database_path(&self) -> SyncResult<PathBuf> {
        let expanded = shellexpand::tilde(&self.database_path).into_owned();
        let path = Path::new(&expanded);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let dirs = directories::ProjectDirs::from("dev", "zeroclaw-labs", "syncmesh").ok_or_else(|| {
            SyncError::Validation {
                detail: "could not determine platform data directory".to_string(),
            }
        })?;
        Ok(dirs.data_dir().join(path))
    }

    /// Load defaults, overlay a TOML file if present at `path`, then
    /// overlay `SYNCMESH_*` environment variables.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = path {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|e| SyncError::Validation {
                    detail: format!("failed to read config file {}: {e}", path.display()),
                })?;
                config = toml::from_str(&text).map_err(|e| SyncError::Validation {
                    detail: format!("failed to parse config file {}: {e}", path.display()),
                })?;
            }
        }

        if let Ok(v) = std::env::var("SYNCMESH_MAX_EVENT_AGE_RESOLVED_SECS") {
            config.max_event_age_resolved_secs = parse_env("SYNCMESH_MAX_EVENT_AGE_RESOLVED_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("SYNCMESH_HEALTHY_SYNC_WINDOW_MS") {
            config.healthy_sync_window_ms = parse_env("SYNCMESH_HEALTHY_SYNC_WINDOW_MS", &v)?;
        }
        if let Ok(v) = std::env::var("SYNCMESH_BATCH_SIZE") {
            config.batch_size = parse_env("SYNCMESH_BATCH_SIZE", &v)?;
        }
        if let Ok(v) = std::env::var("SYNCMESH_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_env("SYNCMESH_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("SYNCMESH_DATABASE_PATH") {
            config.database_path = v;
        }

        Ok(config)
    }

    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(SyncConfig)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> SyncResult<T> {
    value.parse().map_err(|_| SyncError::Validation {
        detail: format!("{name} must be a number, got {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let config = SyncConfig::default();
        assert_eq!(config.max_event_age_resolved_secs, 30 * 24 * 60 * 60);
        assert_eq!(config.healthy_sync_window_ms, 3_600_000);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let config = SyncConfig::load(None).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn env_override_takes_precedence_over_defaults() {
        std::env::set_var("SYNCMESH_BATCH_SIZE", "50");
        let config = SyncConfig::load(None).unwrap();
        std::env::remove_var("SYNCMESH_BATCH_SIZE");
        assert_eq!(config.batch_size, 50);
    }
}
