//! In-process cache store backed by `DashMap`.
//!
//! Batches are applied under the write side of a gate lock and single reads
//! take the read side, so a reader sees either none or all of a batch.
//! Values are cloned on read; no `DashMap` guard outlives a call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parlor_core::cache::{AsyncCacheStore, CacheStore};
use parlor_types::cache::CacheCommand;
use parlor_types::config::CacheSettings;
use parlor_types::error::DriverError;

/// Every this many applied batches, expired keys are swept out.
const SWEEP_EVERY: u64 = 64;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Key/value store with per-key expiry. Expired keys are dropped when they
/// are read and by a periodic sweep while batches are applied.
pub struct MemoryCacheStore {
    entries: DashMap<String, Entry>,
    gate: RwLock<()>,
    default_ttl: Option<Duration>,
    batches: AtomicU64,
}

impl MemoryCacheStore {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            gate: RwLock::new(()),
            default_ttl: settings.default_ttl_secs.map(Duration::from_secs),
            batches: AtomicU64::new(0),
        }
    }

    fn read_gate(&self) -> Result<RwLockReadGuard<'_, ()>, DriverError> {
        self.gate
            .read()
            .map_err(|_| DriverError::other("cache store lock poisoned"))
    }

    fn write_gate(&self) -> Result<RwLockWriteGuard<'_, ()>, DriverError> {
        self.gate
            .write()
            .map_err(|_| DriverError::other("cache store lock poisoned"))
    }

    /// Number of stored keys, expired ones included until they are read or
    /// swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every key.
    pub fn clear(&self) -> Result<(), DriverError> {
        let _gate = self.write_gate()?;
        self.entries.clear();
        Ok(())
    }
}

impl CacheStore for MemoryCacheStore {
    fn apply(&self, batch: Vec<CacheCommand>) -> Result<(), DriverError> {
        let _gate = self.write_gate()?;
        let now = Instant::now();
        let commands = batch.len();

        for command in batch {
            match command {
                CacheCommand::Set { key, value, ttl } => {
                    let expires_at = ttl.or(self.default_ttl).map(|ttl| now + ttl);
                    self.entries.insert(key, Entry { value, expires_at });
                }
                CacheCommand::Delete { key } => {
                    self.entries.remove(&key);
                }
                CacheCommand::Expire { key, ttl } => {
                    if let Some(mut entry) = self.entries.get_mut(&key) {
                        if !entry.is_expired(now) {
                            entry.expires_at = Some(now + ttl);
                        }
                    }
                }
            }
        }

        if (self.batches.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            let before = self.entries.len();
            self.entries.retain(|_, entry| !entry.is_expired(now));
            tracing::debug!(swept = before - self.entries.len(), "expired cache keys swept");
        }

        tracing::debug!(commands, "cache batch applied");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        let _gate = self.read_gate()?;
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    fn ping(&self) -> Result<(), DriverError> {
        self.read_gate().map(|_| ())
    }
}

impl AsyncCacheStore for MemoryCacheStore {
    async fn apply(&self, batch: Vec<CacheCommand>) -> Result<(), DriverError> {
        CacheStore::apply(self, batch)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        CacheStore::get(self, key)
    }

    async fn ping(&self) -> Result<(), DriverError> {
        CacheStore::ping(self)
    }
}
