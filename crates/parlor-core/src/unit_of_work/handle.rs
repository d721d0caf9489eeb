//! Resource handles: an opened backend resource plus its frame depth.
//!
//! Handles are cheap to clone; every clone refers to the same resource. The
//! resource itself sits behind a borrow check (`RefCell` for the blocking
//! handle, a `try_lock`-only mutex for the async one) so that overlapping use
//! within one chain is reported as [`UnitOfWorkError::Misuse`] instead of
//! interleaving commands. `SyncHandle` is `!Send`, so the compiler keeps it on
//! the thread that opened it.

use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parlor_types::error::{ResourceKind, UnitOfWorkError};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use super::backend::AsyncTransactional;
use super::frame::Step;

/// Where a newly entered frame sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePosition {
    /// Depth 1: owns the real transaction or batch.
    Outermost,
    /// Depth >= 2: a savepoint or nested pipeline buffer.
    Nested(u32),
}

impl FramePosition {
    pub(crate) fn at(depth: u32) -> Self {
        if depth <= 1 {
            FramePosition::Outermost
        } else {
            FramePosition::Nested(depth)
        }
    }

    pub fn depth(self) -> u32 {
        match self {
            FramePosition::Outermost => 1,
            FramePosition::Nested(depth) => depth,
        }
    }
}

/// Result of get-or-create acquisition. Only the `Created` branch carries
/// the obligation to release.
#[derive(Debug)]
pub enum Acquired<H> {
    Reused(H),
    Created(H),
}

impl<H> Acquired<H> {
    pub fn handle(&self) -> &H {
        match self {
            Acquired::Reused(handle) | Acquired::Created(handle) => handle,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Acquired::Created(_))
    }
}

// ---------------------------------------------------------------------------
// Blocking handle
// ---------------------------------------------------------------------------

struct SyncInner<R> {
    kind: ResourceKind,
    depth: Cell<u32>,
    aborted: Cell<bool>,
    resource: RefCell<Option<R>>,
}

/// Handle to a blocking resource, shared by every scope of one call chain.
pub struct SyncHandle<R> {
    inner: Rc<SyncInner<R>>,
}

impl<R> Clone for SyncHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<R> SyncHandle<R> {
    pub(crate) fn new(kind: ResourceKind, resource: R) -> Self {
        Self {
            inner: Rc::new(SyncInner {
                kind,
                depth: Cell::new(0),
                aborted: Cell::new(false),
                resource: RefCell::new(Some(resource)),
            }),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    /// Number of open transaction frames; 0 means no transaction.
    pub fn depth(&self) -> u32 {
        self.inner.depth.get()
    }

    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    /// False once the owning scope has released the resource.
    pub fn is_active(&self) -> bool {
        self.inner
            .resource
            .try_borrow()
            .map(|resource| resource.is_some())
            .unwrap_or(true)
    }

    /// Whether both handles refer to the same opened resource.
    pub fn same_handle(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrow the resource. Fails with `Misuse` while another borrow is alive
    /// or after release.
    pub fn resource(&self) -> Result<RefMut<'_, R>, UnitOfWorkError> {
        let kind = self.kind();
        let slot = self
            .inner
            .resource
            .try_borrow_mut()
            .map_err(|_| UnitOfWorkError::handle_busy(kind))?;
        RefMut::filter_map(slot, Option::as_mut).map_err(|_| UnitOfWorkError::handle_released(kind))
    }

    pub(crate) fn push_frame(&self) -> FramePosition {
        let depth = self.inner.depth.get() + 1;
        self.inner.depth.set(depth);
        FramePosition::at(depth)
    }

    pub(crate) fn pop_frame(&self) {
        let depth = self.inner.depth.get();
        debug_assert!(depth > 0, "frame popped at depth 0");
        self.inner.depth.set(depth.saturating_sub(1));
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    pub(crate) fn set_aborted(&self, aborted: bool) {
        self.inner.aborted.set(aborted);
    }

    /// Take the resource out for release. Returns `None` if it is borrowed
    /// or already gone.
    pub(crate) fn take_resource(&self) -> Option<R> {
        self.inner
            .resource
            .try_borrow_mut()
            .ok()
            .and_then(|mut slot| slot.take())
    }
}

impl<R> std::fmt::Debug for SyncHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("kind", &self.inner.kind)
            .field("depth", &self.inner.depth.get())
            .field("aborted", &self.inner.aborted.get())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Async handle
// ---------------------------------------------------------------------------

struct AsyncInner<R> {
    kind: ResourceKind,
    depth: AtomicU32,
    aborted: AtomicBool,
    /// Depth of the outermost frame dropped before it finished, 0 if none.
    abandoned: AtomicU32,
    resource: Mutex<Option<R>>,
}

/// Handle to an async resource, shared by every scope of one task.
pub struct AsyncHandle<R> {
    inner: Arc<AsyncInner<R>>,
}

impl<R> Clone for AsyncHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> AsyncHandle<R> {
    pub(crate) fn new(kind: ResourceKind, resource: R) -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                kind,
                depth: AtomicU32::new(0),
                aborted: AtomicBool::new(false),
                abandoned: AtomicU32::new(0),
                resource: Mutex::new(Some(resource)),
            }),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    /// Number of open transaction frames; 0 means no transaction.
    pub fn depth(&self) -> u32 {
        self.inner.depth.load(Ordering::Acquire)
    }

    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    /// False once the owning scope has released the resource.
    pub fn is_active(&self) -> bool {
        self.inner
            .resource
            .try_lock()
            .map(|resource| resource.is_some())
            .unwrap_or(true)
    }

    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Lock the resource without settling abandoned frames. Never waits: a
    /// handle is owned by one chain, so a held lock means the chain
    /// overlapped its own operations (or leaked the handle to another task),
    /// which is reported as `Misuse`.
    pub(crate) fn lock(&self) -> Result<MappedMutexGuard<'_, R>, UnitOfWorkError> {
        let kind = self.kind();
        let guard = self
            .inner
            .resource
            .try_lock()
            .map_err(|_| UnitOfWorkError::handle_busy(kind))?;
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| UnitOfWorkError::handle_released(kind))
    }

    pub(crate) fn push_frame(&self) -> FramePosition {
        let depth = self.inner.depth.fetch_add(1, Ordering::AcqRel) + 1;
        FramePosition::at(depth)
    }

    pub(crate) fn pop_frame(&self) {
        let previous = self.inner.depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "frame popped at depth 0");
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn set_aborted(&self, aborted: bool) {
        self.inner.aborted.store(aborted, Ordering::Release);
    }

    /// Record that the frame at `depth` was dropped before it finished. Its
    /// rollback runs the next time the resource is used. Keeps the outermost
    /// such frame, whose rollback covers every frame inside it.
    pub(crate) fn abandon_frame(&self, depth: u32) {
        let _ = self
            .inner
            .abandoned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current == 0 || depth < current).then_some(depth)
            });
    }

    /// True while an abandoned frame still waits for its rollback.
    pub(crate) fn has_abandoned_frame(&self) -> bool {
        self.inner.abandoned.load(Ordering::Acquire) != 0
    }

    fn take_abandoned_frame(&self) -> Option<FramePosition> {
        match self.inner.abandoned.swap(0, Ordering::AcqRel) {
            0 => None,
            depth => Some(FramePosition::at(depth)),
        }
    }

    pub(crate) fn take_resource(&self) -> Option<R> {
        self.inner
            .resource
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }
}

impl<R: AsyncTransactional> AsyncHandle<R> {
    /// Borrow the resource for a sequence of operations.
    ///
    /// Frames abandoned by cancellation are rolled back first, so work done
    /// through the returned guard never lands in a transaction nobody owns.
    /// Fails with `Misuse` while another borrow is alive or after release.
    pub async fn resource(&self) -> Result<MappedMutexGuard<'_, R>, UnitOfWorkError> {
        let mut resource = self.lock()?;
        self.settle(&mut resource).await?;
        Ok(resource)
    }

    async fn settle(&self, resource: &mut R) -> Result<(), UnitOfWorkError> {
        let Some(position) = self.take_abandoned_frame() else {
            return Ok(());
        };
        let result = match position {
            FramePosition::Outermost => resource.rollback().await,
            FramePosition::Nested(depth) => resource.rollback_nested(depth).await,
        };
        match result {
            Ok(()) => {
                tracing::debug!(kind = %self.kind(), depth = position.depth(), "abandoned frame rolled back");
                if position == FramePosition::Outermost {
                    self.set_aborted(false);
                }
                Ok(())
            }
            Err(source) => {
                tracing::warn!(kind = %self.kind(), depth = position.depth(), error = %source, "rollback of abandoned frame failed");
                self.set_aborted(true);
                Err(Step::Rollback.error(self.kind(), position, source))
            }
        }
    }
}

impl<R> std::fmt::Debug for AsyncHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("kind", &self.inner.kind)
            .field("depth", &self.depth())
            .field("aborted", &self.is_aborted())
            .field("abandoned", &self.has_abandoned_frame())
            .finish()
    }
}
