//! Blocking unit of work: one resource per thread call chain.
//!
//! Every scope takes a closure. The closure receives the current handle and
//! runs while the scope is open; cleanup is done by drop guards so it also
//! runs while a panic unwinds through the scope.

use parlor_types::error::UnitOfWorkError;

use super::backend::{ResourceSource, Transactional};
use super::failure::ScopeFailure;
use super::frame::{Step, abandoned_inner_frame, with_rollback_outcome};
use super::handle::{Acquired, FramePosition, SyncHandle};
use super::slot::{SourceId, ThreadSlot};

/// Binds resources opened from `S` to the current thread's call chain.
pub struct SyncUnitOfWork<S: ResourceSource>
where
    S::Resource: 'static,
{
    id: SourceId,
    source: S,
    slot: ThreadSlot<SyncHandle<S::Resource>>,
}

impl<S> SyncUnitOfWork<S>
where
    S: ResourceSource,
    S::Resource: 'static,
{
    pub fn new(source: S, slot: ThreadSlot<SyncHandle<S::Resource>>) -> Self {
        Self {
            id: SourceId::next(),
            source,
            slot,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// The handle bound to this call chain by an enclosing scope, if any.
    pub fn current(&self) -> Option<SyncHandle<S::Resource>> {
        self.slot.get(self.id)
    }

    fn acquire(&self) -> Result<Acquired<SyncHandle<S::Resource>>, UnitOfWorkError> {
        if let Some(handle) = self.current() {
            return Ok(Acquired::Reused(handle));
        }
        let resource = self.open()?;
        Ok(Acquired::Created(SyncHandle::new(S::KIND, resource)))
    }

    fn open(&self) -> Result<S::Resource, UnitOfWorkError> {
        let resource = self
            .source
            .open()
            .map_err(|source| UnitOfWorkError::Acquisition {
                kind: S::KIND,
                source,
            })?;
        tracing::debug!(kind = %S::KIND, "resource acquired");
        Ok(resource)
    }

    /// Run `body` with the chain's resource, opening one if the chain has
    /// none. Only the scope that opened the resource releases it.
    pub fn with_resource<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: From<UnitOfWorkError>,
        F: FnOnce(&SyncHandle<S::Resource>) -> Result<T, E>,
    {
        match self.acquire()? {
            Acquired::Reused(handle) => body(&handle),
            Acquired::Created(handle) => {
                let _release = Release {
                    source: &self.source,
                    handle: handle.clone(),
                };
                let _binding = self.slot.bind(self.id, handle.clone());
                body(&handle)
            }
        }
    }

    /// Run `body` inside a transaction frame: the real transaction when the
    /// chain has none open, a savepoint (or nested buffer) otherwise.
    pub fn with_transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<S::Resource>) -> Result<T, E>,
    {
        self.with_resource(|handle| run_frame(handle, body))
    }

    /// Join the chain's open transaction without a new frame, or open the
    /// outermost one if there is none.
    pub fn with_ambient_transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<S::Resource>) -> Result<T, E>,
    {
        self.with_resource(|handle| {
            if handle.in_transaction() {
                body(handle)
            } else {
                run_frame(handle, body)
            }
        })
    }

    /// Run `body` in an outermost frame on a freshly opened resource that is
    /// never bound to the chain. It commits on its own, whatever the
    /// enclosing scopes do afterwards.
    pub fn with_isolated_transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<S::Resource>) -> Result<T, E>,
    {
        let handle = SyncHandle::new(S::KIND, self.open()?);
        let _release = Release {
            source: &self.source,
            handle: handle.clone(),
        };
        run_frame(&handle, body)
    }
}

/// Hands the resource back to its source when the creating scope exits.
struct Release<'a, S: ResourceSource> {
    source: &'a S,
    handle: SyncHandle<S::Resource>,
}

impl<S: ResourceSource> Drop for Release<'_, S> {
    fn drop(&mut self) {
        let reusable = !self.handle.is_aborted() && !self.handle.in_transaction();
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

fn run_frame<R, T, E, F>(handle: &SyncHandle<R>, body: F) -> Result<T, E>
where
    R: Transactional,
    E: ScopeFailure,
    F: FnOnce(&SyncHandle<R>) -> Result<T, E>,
{
    let frame = SyncFrame::enter(handle)?;
    let result = body(handle);
    frame.exit(result)
}

fn step<R: Transactional>(
    handle: &SyncHandle<R>,
    position: FramePosition,
    step: Step,
) -> Result<(), UnitOfWorkError> {
    let mut resource = handle.resource()?;
    let result = match (step, position) {
        (Step::Begin, FramePosition::Outermost) => resource.begin(),
        (Step::Begin, FramePosition::Nested(depth)) => resource.begin_nested(depth),
        (Step::Commit, FramePosition::Outermost) => resource.commit(),
        (Step::Commit, FramePosition::Nested(depth)) => resource.commit_nested(depth),
        (Step::Rollback, FramePosition::Outermost) => resource.rollback(),
        (Step::Rollback, FramePosition::Nested(depth)) => resource.rollback_nested(depth),
    };
    result.map_err(|source| step.error(handle.kind(), position, source))
}

/// One open frame. Dropping it while still open (a panic unwinding through
/// the body) rolls the frame back on a best-effort basis.
struct SyncFrame<'h, R: Transactional> {
    handle: &'h SyncHandle<R>,
    position: FramePosition,
    open: bool,
}

impl<'h, R: Transactional> SyncFrame<'h, R> {
    fn enter(handle: &'h SyncHandle<R>) -> Result<Self, UnitOfWorkError> {
        if !handle.in_transaction() && handle.is_aborted() {
            // Leftovers of a transaction whose rollback failed earlier.
            step(handle, FramePosition::Outermost, Step::Rollback)?;
            handle.set_aborted(false);
        }

        let position = handle.push_frame();
        let frame = SyncFrame {
            handle,
            position,
            open: true,
        };
        if let Err(err) = step(handle, position, Step::Begin) {
            frame.close();
            return Err(err);
        }
        tracing::debug!(kind = %handle.kind(), depth = position.depth(), "transaction frame opened");
        Ok(frame)
    }

    fn exit<T, E: ScopeFailure>(self, result: Result<T, E>) -> Result<T, E> {
        let kind = self.handle.kind();
        match result {
            Ok(value) if !self.handle.is_aborted() => {
                match step(self.handle, self.position, Step::Commit) {
                    Ok(()) => {
                        tracing::debug!(kind = %kind, depth = self.position.depth(), "transaction frame committed");
                        self.close();
                        Ok(value)
                    }
                    Err(commit) => {
                        let rollback = self.roll_back();
                        self.close();
                        Err(with_rollback_outcome(E::from(commit), rollback))
                    }
                }
            }
            Ok(_) => {
                let rollback = self.roll_back();
                self.close();
                Err(with_rollback_outcome(
                    E::from(abandoned_inner_frame(kind)),
                    rollback,
                ))
            }
            Err(err) => {
                let rollback = self.roll_back();
                self.close();
                Err(with_rollback_outcome(err, rollback))
            }
        }
    }

    fn roll_back(&self) -> Result<(), UnitOfWorkError> {
        let result = step(self.handle, self.position, Step::Rollback);
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

impl<R: Transactional> Drop for SyncFrame<'_, R> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        tracing::warn!(
            kind = %self.handle.kind(),
            depth = self.position.depth(),
            "transaction frame abandoned by a panic, rolling back"
        );
        let _ = self.roll_back();
        self.handle.pop_frame();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
