//! Call-chain-local slots holding the current handle of one resource kind.
//!
//! A slot keeps at most one handle per unit of work ([`SourceId`]), so scopes
//! of different databases can nest in any order and each still finds its own
//! handle. The blocking variant is backed by a `thread_local!` key and
//! exposes the explicit `set`/`reset` token protocol plus an RAII binding.
//! The async variant is backed by a `tokio::task_local!` key: a value is only
//! visible inside the future passed to [`TaskSlot::scope`], survives every
//! `.await` in it, and is never visible to spawned tasks.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::LocalKey;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the unit of work a slot entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub fn next() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The handles bound to one call chain, one per unit of work.
#[derive(Debug)]
pub struct Bindings<H> {
    entries: Vec<(SourceId, H)>,
}

impl<H> Bindings<H> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, id: SourceId) -> Option<&H> {
        self.entries
            .iter()
            .find(|(source, _)| *source == id)
            .map(|(_, handle)| handle)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set or clear the entry for `id`, returning what it held before.
    fn replace(&mut self, id: SourceId, handle: Option<H>) -> Option<H> {
        let index = self.entries.iter().position(|(source, _)| *source == id);
        match (index, handle) {
            (Some(index), Some(handle)) => {
                Some(std::mem::replace(&mut self.entries[index].1, handle))
            }
            (Some(index), None) => Some(self.entries.swap_remove(index).1),
            (None, Some(handle)) => {
                self.entries.push((id, handle));
                None
            }
            (None, None) => None,
        }
    }
}

impl<H> Default for Bindings<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> Clone for Bindings<H> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

/// Slot bound to the current thread's call stack.
pub struct ThreadSlot<H: 'static> {
    key: &'static LocalKey<RefCell<Bindings<H>>>,
}

impl<H: 'static> Clone for ThreadSlot<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: 'static> Copy for ThreadSlot<H> {}

/// The value an entry held before a [`ThreadSlot::set`]; hand it back to
/// [`ThreadSlot::reset`] to restore it.
#[must_use = "dropping a token leaves the slot set; pass it to reset()"]
pub struct SlotToken<H> {
    id: SourceId,
    previous: Option<H>,
}

impl<H: Clone + 'static> ThreadSlot<H> {
    pub const fn new(key: &'static LocalKey<RefCell<Bindings<H>>>) -> Self {
        Self { key }
    }

    pub fn get(&self, id: SourceId) -> Option<H> {
        self.key
            .try_with(|cell| cell.borrow().get(id).cloned())
            .ok()
            .flatten()
    }

    pub fn set(&self, id: SourceId, handle: H) -> SlotToken<H> {
        let previous = self.key.with(|cell| cell.borrow_mut().replace(id, Some(handle)));
        SlotToken { id, previous }
    }

    pub fn reset(&self, token: SlotToken<H>) {
        // The key may already be gone during thread teardown.
        let _ = self
            .key
            .try_with(|cell| cell.borrow_mut().replace(token.id, token.previous));
    }

    /// Set the entry for `id` until the returned binding is dropped.
    pub fn bind(&self, id: SourceId, handle: H) -> SlotBinding<H> {
        SlotBinding {
            slot: *self,
            token: Some(self.set(id, handle)),
        }
    }
}

/// Restores the entry's previous value when dropped, including while a panic
/// unwinds through the owning scope.
pub struct SlotBinding<H: Clone + 'static> {
    slot: ThreadSlot<H>,
    token: Option<SlotToken<H>>,
}

impl<H: Clone + 'static> Drop for SlotBinding<H> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.slot.reset(token);
        }
    }
}

/// Slot bound to the current tokio task.
pub struct TaskSlot<H: 'static> {
    key: &'static tokio::task::LocalKey<Bindings<H>>,
}

impl<H: 'static> Clone for TaskSlot<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: 'static> Copy for TaskSlot<H> {}

impl<H: Clone + 'static> TaskSlot<H> {
    pub const fn new(key: &'static tokio::task::LocalKey<Bindings<H>>) -> Self {
        Self { key }
    }

    /// The handle `id` bound in the innermost enclosing [`TaskSlot::scope`].
    pub fn get(&self, id: SourceId) -> Option<H> {
        self.key
            .try_with(|bindings| bindings.get(id).cloned())
            .ok()
            .flatten()
    }

    /// Run `fut` with the entry for `id` set to `handle`. Entries of other
    /// units stay visible; everything reverts when `fut` completes or is
    /// dropped.
    pub async fn scope<F: Future>(&self, id: SourceId, handle: H, fut: F) -> F::Output {
        let mut bindings = self.key.try_with(Bindings::clone).unwrap_or_default();
        bindings.replace(id, Some(handle));
        self.key.scope(bindings, fut).await
    }
}
