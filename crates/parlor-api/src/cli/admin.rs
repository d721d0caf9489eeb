//! Maintenance commands: schema migration and connectivity checks.

use std::time::Duration;

use anyhow::Result;
use console::style;

use parlor_infra::cache::Cache;
use parlor_infra::sqlite::BlockingDatabase;
use parlor_types::error::{DriverError, UnitOfWorkError};

use crate::state::AppState;

const CHECK_KEY: &str = "parlor:check";

/// Apply pending migrations. `AppState::init` already did, so this reports
/// the schema as current unless something changed underneath.
pub async fn migrate(state: &AppState, json: bool) -> Result<()> {
    state.db.migrate().await?;

    if json {
        let out = serde_json::json!({ "migrated": true });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  {} Database schema is up to date", style("✓").green().bold());
        println!();
    }
    Ok(())
}

/// Ping the async and blocking database drivers and round-trip a key through
/// both cache facades.
pub async fn check(state: &AppState, json: bool) -> Result<()> {
    let mut checks: Vec<(&str, Result<(), String>)> = Vec::new();

    checks.push(("database", state.db.ping().await.map_err(|e| e.to_string())));

    let settings = state.settings.database.clone();
    let blocking = tokio::task::spawn_blocking(move || -> Result<(), DriverError> {
        let db = BlockingDatabase::connect(&settings)?;
        let result = db.ping();
        db.close()?;
        result
    })
    .await?;
    checks.push(("database (blocking)", blocking.map_err(|e| e.to_string())));

    checks.push(("cache", cache_roundtrip(state).await.map_err(|e| e.to_string())));

    let cache = Cache::with_store(state.cache.store().clone());
    let blocking = tokio::task::spawn_blocking(move || -> Result<(), UnitOfWorkError> {
        cache.transaction(|pipe| -> Result<(), UnitOfWorkError> {
            pipe.resource()?.delete(CHECK_KEY);
            Ok(())
        })
    })
    .await?;
    checks.push(("cache (blocking)", blocking.map_err(|e| e.to_string())));

    let failed = checks.iter().filter(|(_, result)| result.is_err()).count();

    if json {
        let out: serde_json::Map<String, serde_json::Value> = checks
            .iter()
            .map(|(name, result)| {
                let value = match result {
                    Ok(()) => serde_json::json!({ "ok": true }),
                    Err(err) => serde_json::json!({ "ok": false, "error": err }),
                };
                (name.to_string(), value)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        for (name, result) in &checks {
            match result {
                Ok(()) => println!("  {} {name}", style("✓").green()),
                Err(err) => println!("  {} {name}: {}", style("✗").red(), style(err).dim()),
            }
        }
        println!();
    }

    if failed > 0 {
        anyhow::bail!("{failed} check(s) failed");
    }
    Ok(())
}

async fn cache_roundtrip(state: &AppState) -> Result<()> {
    state.cache.ping().await?;
    state
        .cache
        .transaction(|pipe| async move {
            pipe.resource()
                .await?
                .set(CHECK_KEY, "ok", Some(Duration::from_secs(5)));
            Ok::<(), UnitOfWorkError>(())
        })
        .await?;

    match state.cache.get(CHECK_KEY).await? {
        Some(value) if value == b"ok" => Ok(()),
        _ => anyhow::bail!("written key was not readable"),
    }
}
