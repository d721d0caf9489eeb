//! Cache store ports.
//!
//! A store applies whole command batches atomically: readers see either none
//! or all of a batch. Pipelines in parlor-infra queue commands and hand them
//! to the store when their outermost frame commits.

use std::future::Future;

use parlor_types::cache::CacheCommand;
use parlor_types::error::DriverError;

/// Blocking access to a cache store. Shared process-wide.
pub trait CacheStore: Send + Sync {
    /// Apply `batch` as one atomic unit.
    fn apply(&self, batch: Vec<CacheCommand>) -> Result<(), DriverError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError>;

    /// Check that the store is reachable.
    fn ping(&self) -> Result<(), DriverError>;
}

/// Async access to a cache store.
pub trait AsyncCacheStore: Send + Sync {
    fn apply(&self, batch: Vec<CacheCommand>) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, DriverError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), DriverError>> + Send;
}
