//! Scoped units of work.
//!
//! A unit of work binds one backend resource to the logical call chain (a
//! thread's call stack or a tokio task) and layers transaction frames on top:
//!
//! - `with_resource` reuses the chain's resource or opens one for the scope.
//! - `with_transaction` opens the outermost transaction, or a nested frame
//!   (savepoint / per-frame buffer) when one is already open.
//! - `with_ambient_transaction` joins the open transaction without a frame.
//! - `with_isolated_transaction` runs on a private resource outside the chain.
//!
//! Callers never pass the resource around; code further down the chain calls
//! the same scope functions and picks up the enclosing handle.

pub mod async_scope;
pub mod backend;
pub mod failure;
mod frame;
pub mod handle;
pub mod slot;
pub mod sync_scope;

#[cfg(test)]
pub(crate) mod testing;

pub use async_scope::AsyncUnitOfWork;
pub use backend::{AsyncResourceSource, AsyncTransactional, ResourceSource, Transactional};
pub use failure::ScopeFailure;
pub use handle::{Acquired, AsyncHandle, FramePosition, SyncHandle};
pub use slot::{Bindings, SlotBinding, SlotToken, SourceId, TaskSlot, ThreadSlot};
pub use sync_scope::SyncUnitOfWork;
