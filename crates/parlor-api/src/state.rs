//! Application state: the resources every command runs against.
//!
//! `init` is the startup hook (settings, database pool, schema, cache) and
//! `shutdown` the matching teardown. Repositories hold clones of the
//! database facade, so they join whatever session or transaction the
//! calling task has open.

use std::path::PathBuf;

use anyhow::Context;
use parlor_infra::cache::AsyncCache;
use parlor_infra::config::{load_settings, resolve_data_dir};
use parlor_infra::sqlite::Database;
use parlor_infra::sqlite::chat::SqliteChatRepository;
use parlor_infra::sqlite::user::SqliteUserRepository;
use parlor_types::config::Settings;

/// Shared state used by every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub data_dir: PathBuf,
    pub db: Database,
    pub cache: AsyncCache,
    pub users: SqliteUserRepository,
    pub chat: SqliteChatRepository,
}

impl AppState {
    /// Load settings, connect to the database, apply migrations and open
    /// the cache.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();

        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let settings = load_settings(&data_dir).await;

        let db = Database::connect(&settings.database)
            .await
            .context("Failed to open the database")?;
        db.migrate().await.context("Failed to apply migrations")?;

        let cache = AsyncCache::new(&settings.cache);

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self {
            users: SqliteUserRepository::new(db.clone()),
            chat: SqliteChatRepository::new(db.clone()),
            settings,
            data_dir,
            db,
            cache,
        })
    }

    /// Close the cache and the database pool.
    pub async fn shutdown(&self) {
        if let Err(err) = self.cache.close().await {
            tracing::warn!("Failed to close cache: {err}");
        }
        self.db.close().await;
    }
}
