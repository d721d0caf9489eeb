//! Cache command types queued on a pipeline.

use std::time::Duration;

/// A single write command. Pipelines queue these and hand them to the store
/// as one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

impl CacheCommand {
    /// The key this command touches.
    pub fn key(&self) -> &str {
        match self {
            CacheCommand::Set { key, .. }
            | CacheCommand::Delete { key }
            | CacheCommand::Expire { key, .. } => key,
        }
    }
}
