//! Settings loader for Parlor.
//!
//! Reads `config.toml` from the data directory (`~/.parlor/` in production)
//! and deserializes it into [`Settings`]. Falls back to defaults when the file
//! is missing or malformed. The storage drivers only ever see the resulting
//! settings structs.

use std::path::{Path, PathBuf};

use parlor_types::config::{DatabaseSettings, Settings};

/// Overrides the data directory.
pub const DATA_DIR_ENV: &str = "PARLOR_DATA_DIR";

/// Overrides `[database] url`.
pub const DATABASE_URL_ENV: &str = "PARLOR_DATABASE_URL";

/// The data directory: `PARLOR_DATA_DIR`, falling back to `~/.parlor`.
pub fn resolve_data_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".parlor")
        }
    }
}

/// DSN of the database file inside `data_dir`.
pub fn default_database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join("parlor.db").display())
}

/// Load settings from `{data_dir}/config.toml`.
///
/// - A missing file yields the defaults.
/// - An unreadable or unparsable file logs a warning and yields the defaults.
/// - A database URL left at its default points into `data_dir`.
/// - `PARLOR_DATABASE_URL` wins over everything else.
pub async fn load_settings(data_dir: &Path) -> Settings {
    let mut settings = read_config_file(data_dir).await;

    if settings.database.url == DatabaseSettings::default().url {
        settings.database.url = default_database_url(data_dir);
    }
    if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
        if !url.is_empty() {
            tracing::debug!("Database URL taken from {DATABASE_URL_ENV}");
            settings.database.url = url;
        }
    }

    settings
}

async fn read_config_file(data_dir: &Path) -> Settings {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return Settings::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return Settings::default();
        }
    };

    match toml::from_str::<Settings>(&content) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            Settings::default()
        }
    }
}
