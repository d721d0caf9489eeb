//! Async unit of work: one resource per tokio task call chain.
//!
//! Scopes take a closure that receives an owned handle and returns the body
//! future. The handle is visible to every future awaited inside the body
//! through the task-local slot, and to nothing else.
//!
//! Cleanup cannot await inside `Drop`, so a frame dropped while still open
//! (the owning future was cancelled or panicked) only records its depth on
//! the handle. The rollback of exactly that frame runs before the resource is
//! used again, so enclosing frames keep their own work. If the chain ends
//! first, the resource goes back to its source as non-reusable and the
//! backend discards the open work.

use std::future::Future;

use parlor_types::error::UnitOfWorkError;

use super::backend::{AsyncResourceSource, AsyncTransactional};
use super::failure::ScopeFailure;
use super::frame::{Step, abandoned_inner_frame, with_rollback_outcome};
use super::handle::{Acquired, AsyncHandle, FramePosition};
use super::slot::{SourceId, TaskSlot};

/// Binds resources opened from `S` to the current task's call chain.
pub struct AsyncUnitOfWork<S: AsyncResourceSource> {
    id: SourceId,
    source: S,
    slot: TaskSlot<AsyncHandle<S::Resource>>,
}

impl<S: AsyncResourceSource> AsyncUnitOfWork<S> {
    pub fn new(source: S, slot: TaskSlot<AsyncHandle<S::Resource>>) -> Self {
        Self {
            id: SourceId::next(),
            source,
            slot,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// The handle bound to this task's chain by an enclosing scope, if any.
    pub fn current(&self) -> Option<AsyncHandle<S::Resource>> {
        self.slot.get(self.id)
    }

    async fn acquire(&self) -> Result<Acquired<AsyncHandle<S::Resource>>, UnitOfWorkError> {
        if let Some(handle) = self.current() {
            return Ok(Acquired::Reused(handle));
        }
        let resource = self.open().await?;
        Ok(Acquired::Created(AsyncHandle::new(S::KIND, resource)))
    }

    async fn open(&self) -> Result<S::Resource, UnitOfWorkError> {
        let resource = self
            .source
            .open()
            .await
            .map_err(|source| UnitOfWorkError::Acquisition {
                kind: S::KIND,
                source,
            })?;
        tracing::debug!(kind = %S::KIND, "resource acquired");
        Ok(resource)
    }

    /// Run `body` with the chain's resource, opening one if the chain has
    /// none. Only the scope that opened the resource releases it.
    pub async fn with_resource<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: From<UnitOfWorkError>,
        F: FnOnce(AsyncHandle<S::Resource>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.acquire().await? {
            Acquired::Reused(handle) => body(handle).await,
            Acquired::Created(handle) => {
                let _release = AsyncRelease {
                    source: &self.source,
                    handle: handle.clone(),
                };
                self.slot.scope(self.id, handle.clone(), body(handle)).await
            }
        }
    }

    /// Run `body` inside a transaction frame: the real transaction when the
    /// chain has none open, a savepoint (or nested buffer) otherwise.
    pub async fn with_transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<S::Resource>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_resource(|handle| run_frame(handle, body)).await
    }

    /// Join the chain's open transaction without a new frame, or open the
    /// outermost one if there is none.
    pub async fn with_ambient_transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<S::Resource>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_resource(|handle| async move {
            if handle.in_transaction() {
                body(handle).await
            } else {
                run_frame(handle, body).await
            }
        })
        .await
    }

    /// Run `body` in an outermost frame on a freshly opened resource that is
    /// never bound to the chain.
    pub async fn with_isolated_transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<S::Resource>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let handle = AsyncHandle::new(S::KIND, self.open().await?);
        let _release = AsyncRelease {
            source: &self.source,
            handle: handle.clone(),
        };
        run_frame(handle, body).await
    }
}

struct AsyncRelease<'a, S: AsyncResourceSource> {
    source: &'a S,
    handle: AsyncHandle<S::Resource>,
}

impl<S: AsyncResourceSource> Drop for AsyncRelease<'_, S> {
    fn drop(&mut self) {
        let reusable = !self.handle.is_aborted()
            && !self.handle.in_transaction()
            && !self.handle.has_abandoned_frame();
        match self.handle.take_resource() {
            Some(resource) => {
                tracing::debug!(kind = %S::KIND, reusable, "resource released");
                self.source.release(resource, reusable);
            }
            None => {
                tracing::warn!(kind = %S::KIND, "resource still borrowed at release, dropping it");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

async fn run_frame<R, T, E, F, Fut>(handle: AsyncHandle<R>, body: F) -> Result<T, E>
where
    R: AsyncTransactional,
    E: ScopeFailure,
    F: FnOnce(AsyncHandle<R>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let frame = AsyncFrame::enter(handle.clone()).await?;
    let result = body(handle).await;
    frame.exit(result).await
}

async fn step<R: AsyncTransactional>(
    handle: &AsyncHandle<R>,
    position: FramePosition,
    step: Step,
) -> Result<(), UnitOfWorkError> {
    let mut resource = handle.resource().await?;
    let result = match (step, position) {
        (Step::Begin, FramePosition::Outermost) => resource.begin().await,
        (Step::Begin, FramePosition::Nested(depth)) => resource.begin_nested(depth).await,
        (Step::Commit, FramePosition::Outermost) => resource.commit().await,
        (Step::Commit, FramePosition::Nested(depth)) => resource.commit_nested(depth).await,
        (Step::Rollback, FramePosition::Outermost) => resource.rollback().await,
        (Step::Rollback, FramePosition::Nested(depth)) => resource.rollback_nested(depth).await,
    };
    result.map_err(|source| step.error(handle.kind(), position, source))
}

/// One open frame. The guard exists before `begin` is awaited and stays open
/// until commit or rollback has finished, so a cancellation at any await
/// point is seen by `Drop`.
struct AsyncFrame<R: AsyncTransactional> {
    handle: AsyncHandle<R>,
    position: FramePosition,
    open: bool,
}

impl<R: AsyncTransactional> AsyncFrame<R> {
    async fn enter(handle: AsyncHandle<R>) -> Result<Self, UnitOfWorkError> {
        if !handle.in_transaction() {
            // Roll back frames abandoned by cancellation first.
            drop(handle.resource().await?);
            if handle.is_aborted() {
                // Leftovers of a transaction whose rollback failed earlier.
                step(&handle, FramePosition::Outermost, Step::Rollback).await?;
                handle.set_aborted(false);
            }
        }

        let position = handle.push_frame();
        let frame = AsyncFrame {
            handle,
            position,
            open: true,
        };
        if let Err(err) = step(&frame.handle, position, Step::Begin).await {
            frame.close();
            return Err(err);
        }
        tracing::debug!(kind = %frame.handle.kind(), depth = position.depth(), "transaction frame opened");
        Ok(frame)
    }

    async fn exit<T, E: ScopeFailure>(self, result: Result<T, E>) -> Result<T, E> {
        let kind = self.handle.kind();
        match result {
            Ok(value) if !self.handle.is_aborted() => {
                match step(&self.handle, self.position, Step::Commit).await {
                    Ok(()) => {
                        tracing::debug!(kind = %kind, depth = self.position.depth(), "transaction frame committed");
                        self.close();
                        Ok(value)
                    }
                    Err(commit) => {
                        let rollback = self.roll_back().await;
                        self.close();
                        Err(with_rollback_outcome(E::from(commit), rollback))
                    }
                }
            }
            Ok(_) => {
                let rollback = self.roll_back().await;
                self.close();
                Err(with_rollback_outcome(
                    E::from(abandoned_inner_frame(kind)),
                    rollback,
                ))
            }
            Err(err) => {
                let rollback = self.roll_back().await;
                self.close();
                Err(with_rollback_outcome(err, rollback))
            }
        }
    }

    async fn roll_back(&self) -> Result<(), UnitOfWorkError> {
        let result = step(&self.handle, self.position, Step::Rollback).await;
        match &result {
            Ok(()) => {
                tracing::debug!(kind = %self.handle.kind(), depth = self.position.depth(), "transaction frame rolled back");
                if self.position == FramePosition::Outermost {
                    self.handle.set_aborted(false);
                }
            }
            Err(err) => {
                tracing::warn!(kind = %self.handle.kind(), depth = self.position.depth(), error = %err, "rollback failed");
                self.handle.set_aborted(true);
            }
        }
        result
    }

    fn close(mut self) {
        self.open = false;
        self.handle.pop_frame();
    }
}

impl<R: AsyncTransactional> Drop for AsyncFrame<R> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        tracing::warn!(
            kind = %self.handle.kind(),
            depth = self.position.depth(),
            "transaction frame abandoned before it finished, rollback deferred"
        );
        self.handle.abandon_frame(self.position.depth());
        self.handle.pop_frame();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
