//! Cache command pipelines.
//!
//! A pipeline only queues commands; nothing reaches the store until the
//! outermost frame commits. Each open frame has its own buffer, so rolling
//! back a nested frame drops exactly the commands queued inside it.
//! Commands queued while no frame is open go to an idle buffer that rides
//! along with the next outermost commit, or is flushed by the scope that
//! created the pipeline.

use std::sync::Arc;
use std::time::Duration;

use parlor_core::cache::{AsyncCacheStore, CacheStore};
use parlor_core::unit_of_work::{
    AsyncResourceSource, AsyncTransactional, ResourceSource, Transactional,
};
use parlor_types::cache::CacheCommand;
use parlor_types::error::{DriverError, ResourceKind};

/// Buffered commands bound for one store.
pub struct Pipeline<S> {
    store: Arc<S>,
    idle: Vec<CacheCommand>,
    frames: Vec<Vec<CacheCommand>>,
}

impl<S> Pipeline<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            idle: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Option<Duration>) {
        self.queue(CacheCommand::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.queue(CacheCommand::Delete { key: key.into() });
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) {
        self.queue(CacheCommand::Expire {
            key: key.into(),
            ttl,
        });
    }

    /// Queue into the innermost open frame, or the idle buffer.
    pub fn queue(&mut self, command: CacheCommand) {
        match self.frames.last_mut() {
            Some(frame) => frame.push(command),
            None => self.idle.push(command),
        }
    }

    /// Number of commands waiting, across all buffers.
    pub fn queued(&self) -> usize {
        self.idle.len() + self.frames.iter().map(Vec::len).sum::<usize>()
    }

    /// True when no frame is open.
    pub fn is_clean(&self) -> bool {
        self.frames.is_empty()
    }

    /// Take the commands queued outside any frame.
    pub fn take_idle(&mut self) -> Vec<CacheCommand> {
        std::mem::take(&mut self.idle)
    }

    /// Everything an outermost commit sends: idle commands first, then the
    /// frames from outermost to innermost.
    fn batch(&self) -> Vec<CacheCommand> {
        self.idle
            .iter()
            .chain(self.frames.iter().flatten())
            .cloned()
            .collect()
    }

    fn committed(&mut self) {
        self.idle.clear();
        self.frames.clear();
    }

    fn open_frame(&mut self, depth: u32) {
        self.frames.truncate(depth as usize - 1);
        self.frames.push(Vec::new());
    }

    fn fold_frame(&mut self, depth: u32) -> Result<(), DriverError> {
        let index = depth as usize - 1;
        if index == 0 || self.frames.len() <= index {
            return Err(DriverError::other(format!("no open pipeline frame at depth {depth}")));
        }
        let folded: Vec<CacheCommand> = self.frames.drain(index..).flatten().collect();
        self.frames[index - 1].extend(folded);
        Ok(())
    }

    fn drop_frames(&mut self, depth: u32) {
        self.frames.truncate(depth as usize - 1);
    }
}

impl<S: CacheStore> Transactional for Pipeline<S> {
    fn begin(&mut self) -> Result<(), DriverError> {
        self.open_frame(1);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.store.apply(self.batch())?;
        self.committed();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.drop_frames(1);
        Ok(())
    }

    fn begin_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.open_frame(depth);
        Ok(())
    }

    fn commit_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.fold_frame(depth)
    }

    fn rollback_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.drop_frames(depth);
        Ok(())
    }
}

impl<S: AsyncCacheStore + 'static> AsyncTransactional for Pipeline<S> {
    async fn begin(&mut self) -> Result<(), DriverError> {
        self.open_frame(1);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        let batch = self.batch();
        self.store.apply(batch).await?;
        self.committed();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.drop_frames(1);
        Ok(())
    }

    async fn begin_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.open_frame(depth);
        Ok(())
    }

    async fn commit_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.fold_frame(depth)
    }

    async fn rollback_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.drop_frames(depth);
        Ok(())
    }
}

/// Opens pipelines on a shared store. Pipelines are not pooled: releasing
/// one drops it together with anything still queued.
pub struct PipelineSource<S> {
    store: Arc<S>,
}

impl<S> PipelineSource<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

fn discard<S>(pipeline: Pipeline<S>, reusable: bool) {
    let queued = pipeline.queued();
    if queued > 0 || !reusable {
        tracing::debug!(queued, reusable, "discarding cache pipeline");
    }
}

impl<S: CacheStore> ResourceSource for PipelineSource<S> {
    type Resource = Pipeline<S>;

    const KIND: ResourceKind = ResourceKind::Cache;

    fn open(&self) -> Result<Pipeline<S>, DriverError> {
        Ok(Pipeline::new(Arc::clone(&self.store)))
    }

    fn release(&self, pipeline: Pipeline<S>, reusable: bool) {
        discard(pipeline, reusable);
    }
}

impl<S: AsyncCacheStore + 'static> AsyncResourceSource for PipelineSource<S> {
    type Resource = Pipeline<S>;

    const KIND: ResourceKind = ResourceKind::Cache;

    async fn open(&self) -> Result<Pipeline<S>, DriverError> {
        Ok(Pipeline::new(Arc::clone(&self.store)))
    }

    fn release(&self, pipeline: Pipeline<S>, reusable: bool) {
        discard(pipeline, reusable);
    }
}
