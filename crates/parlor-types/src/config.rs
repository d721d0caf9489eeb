//! Settings types for Parlor.
//!
//! `Settings` mirrors the `config.toml` in the data directory. The storage
//! drivers receive the `database` and `cache` sections as opaque values; the
//! loader in `parlor-infra` is the only place that parses them.

use serde::{Deserialize, Serialize};

/// Top-level configuration. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    /// Number of previous question/answer pairs fed back as chat history.
    #[serde(default = "default_history_window")]
    pub history_window: u32,
}

fn default_history_window() -> u32 {
    20
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            cache: CacheSettings::default(),
            history_window: default_history_window(),
        }
    }
}

/// Connection factory settings for the SQLite session drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// DSN, e.g. `sqlite:///home/me/.parlor/parlor.db?mode=rwc`.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Upper bound on pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Validate pooled connections before handing them out.
    #[serde(default)]
    pub pre_ping: bool,

    /// How long SQLite waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long acquiring a pooled connection may take.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_database_url() -> String {
    "sqlite://parlor.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            pre_ping: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl DatabaseSettings {
    /// Settings pointing at the given DSN, everything else defaulted.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Settings for the in-process cache store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL applied to `set` commands that do not carry their own.
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
}
