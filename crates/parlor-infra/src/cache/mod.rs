//! Cache units of work.
//!
//! [`Cache`] binds pipelines to the calling thread, [`AsyncCache`] to the
//! calling tokio task. Both queue commands on a [`Pipeline`] and apply them
//! to a shared [`MemoryCacheStore`] in one batch when the outermost frame
//! commits.

pub mod pipeline;
pub mod store;

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use parlor_core::cache::{AsyncCacheStore, CacheStore};
use parlor_core::unit_of_work::{
    AsyncHandle, AsyncUnitOfWork, Bindings, ScopeFailure, SyncHandle, SyncUnitOfWork, TaskSlot,
    ThreadSlot,
};
use parlor_types::cache::CacheCommand;
use parlor_types::config::CacheSettings;
use parlor_types::error::{DriverError, ResourceKind, TransactionPhase, UnitOfWorkError};

pub use pipeline::{Pipeline, PipelineSource};
pub use store::MemoryCacheStore;

/// Pipeline over the in-process store.
pub type MemoryPipeline = Pipeline<MemoryCacheStore>;

thread_local! {
    static CURRENT_PIPELINE: RefCell<Bindings<SyncHandle<MemoryPipeline>>> = const { RefCell::new(Bindings::new()) };
}

tokio::task_local! {
    static CURRENT_ASYNC_PIPELINE: Bindings<AsyncHandle<MemoryPipeline>>;
}

/// Idle commands could not be written when their pipeline scope ended.
fn flush_failed(source: DriverError) -> UnitOfWorkError {
    UnitOfWorkError::Transaction {
        kind: ResourceKind::Cache,
        phase: TransactionPhase::Commit,
        depth: 0,
        source,
    }
}

fn log_flush(batch: &[CacheCommand]) {
    tracing::debug!(commands = batch.len(), "flushing idle cache pipeline");
}

// ---------------------------------------------------------------------------
// Blocking facade
// ---------------------------------------------------------------------------

/// Blocking cache with thread-scoped pipelines.
#[derive(Clone)]
pub struct Cache {
    uow: Arc<SyncUnitOfWork<PipelineSource<MemoryCacheStore>>>,
}

impl Cache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self::with_store(Arc::new(MemoryCacheStore::new(settings)))
    }

    /// A cache over an existing store, e.g. one shared with an [`AsyncCache`].
    pub fn with_store(store: Arc<MemoryCacheStore>) -> Self {
        Self {
            uow: Arc::new(SyncUnitOfWork::new(
                PipelineSource::new(store),
                ThreadSlot::new(&CURRENT_PIPELINE),
            )),
        }
    }

    pub fn store(&self) -> &Arc<MemoryCacheStore> {
        self.uow.source().store()
    }

    /// The pipeline bound to the calling thread, if any.
    pub fn current(&self) -> Option<SyncHandle<MemoryPipeline>> {
        self.uow.current()
    }

    /// Run `body` with the thread's pipeline, opening one if needed. A scope
    /// that opened the pipeline flushes the commands queued outside any
    /// transaction when `body` succeeds.
    pub fn pipeline<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: From<UnitOfWorkError>,
        F: FnOnce(&SyncHandle<MemoryPipeline>) -> Result<T, E>,
    {
        let opens = self.uow.current().is_none();
        self.uow.with_resource(|handle| {
            let value = body(handle)?;
            if opens {
                let batch = handle.resource()?.take_idle();
                if !batch.is_empty() {
                    log_flush(&batch);
                    CacheStore::apply(self.store().as_ref(), batch).map_err(flush_failed)?;
                }
            }
            Ok(value)
        })
    }

    /// Run `body` in a pipeline transaction, or a nested frame inside one.
    pub fn transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<MemoryPipeline>) -> Result<T, E>,
    {
        self.uow.with_transaction(body)
    }

    /// Queue into the open transaction, starting one only if there is none.
    pub fn current_pipeline<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<MemoryPipeline>) -> Result<T, E>,
    {
        self.uow.with_ambient_transaction(body)
    }

    /// Run `body` on a private pipeline that is applied on its own.
    pub fn isolated_pipeline<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<MemoryPipeline>) -> Result<T, E>,
    {
        self.uow.with_isolated_transaction(body)
    }

    /// Read a key straight from the store. Queued commands are not visible.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        CacheStore::get(self.store().as_ref(), key)
    }

    pub fn ping(&self) -> Result<(), DriverError> {
        CacheStore::ping(self.store().as_ref())
    }

    /// Drop every cached key.
    pub fn close(&self) -> Result<(), DriverError> {
        self.store().clear()?;
        tracing::info!("cache closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Async facade
// ---------------------------------------------------------------------------

/// Async cache with task-scoped pipelines.
#[derive(Clone)]
pub struct AsyncCache {
    uow: Arc<AsyncUnitOfWork<PipelineSource<MemoryCacheStore>>>,
}

impl AsyncCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self::with_store(Arc::new(MemoryCacheStore::new(settings)))
    }

    pub fn with_store(store: Arc<MemoryCacheStore>) -> Self {
        Self {
            uow: Arc::new(AsyncUnitOfWork::new(
                PipelineSource::new(store),
                TaskSlot::new(&CURRENT_ASYNC_PIPELINE),
            )),
        }
    }

    pub fn store(&self) -> &Arc<MemoryCacheStore> {
        self.uow.source().store()
    }

    /// The pipeline bound to the calling task, if any.
    pub fn current(&self) -> Option<AsyncHandle<MemoryPipeline>> {
        self.uow.current()
    }

    /// Run `body` with the task's pipeline, opening one if needed. A scope
    /// that opened the pipeline flushes the commands queued outside any
    /// transaction when `body` succeeds.
    pub async fn pipeline<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: From<UnitOfWorkError>,
        F: FnOnce(AsyncHandle<MemoryPipeline>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let opens = self.uow.current().is_none();
        let store = Arc::clone(self.store());
        self.uow
            .with_resource(|handle| async move {
                let value = body(handle.clone()).await?;
                if opens {
                    let batch = handle.resource().await?.take_idle();
                    if !batch.is_empty() {
                        log_flush(&batch);
                        AsyncCacheStore::apply(store.as_ref(), batch)
                            .await
                            .map_err(flush_failed)?;
                    }
                }
                Ok(value)
            })
            .await
    }

    /// Run `body` in a pipeline transaction, or a nested frame inside one.
    pub async fn transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<MemoryPipeline>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.uow.with_transaction(body).await
    }

    /// Queue into the open transaction, starting one only if there is none.
    pub async fn current_pipeline<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<MemoryPipeline>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.uow.with_ambient_transaction(body).await
    }

    /// Run `body` on a private pipeline that is applied on its own.
    pub async fn isolated_pipeline<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<MemoryPipeline>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.uow.with_isolated_transaction(body).await
    }

    /// Read a key straight from the store. Queued commands are not visible.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        AsyncCacheStore::get(self.store().as_ref(), key).await
    }

    pub async fn ping(&self) -> Result<(), DriverError> {
        AsyncCacheStore::ping(self.store().as_ref()).await
    }

    /// Drop every cached key.
    pub async fn close(&self) -> Result<(), DriverError> {
        self.store().clear()?;
        tracing::info!("async cache closed");
        Ok(())
    }
}
