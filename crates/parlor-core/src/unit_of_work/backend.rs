//! Driver ports consumed by the unit-of-work scopes.
//!
//! A resource source opens resources (pooled connections, pipelines) and
//! takes them back. A resource exposes transaction control. `depth` is always
//! the depth of the frame being opened or closed, so nested calls receive
//! `depth >= 2` and backends can derive savepoint names from it.

use std::future::Future;

use parlor_types::error::{DriverError, ResourceKind};

/// Transaction control of a blocking resource.
pub trait Transactional {
    fn begin(&mut self) -> Result<(), DriverError>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Open a sub-unit (savepoint or frame buffer) at `depth`.
    fn begin_nested(&mut self, depth: u32) -> Result<(), DriverError>;

    /// Fold the sub-unit at `depth` into its parent.
    fn commit_nested(&mut self, depth: u32) -> Result<(), DriverError>;

    /// Discard the sub-unit at `depth` and everything opened inside it.
    fn rollback_nested(&mut self, depth: u32) -> Result<(), DriverError>;
}

/// Opens and reclaims blocking resources. Shared process-wide; implementations
/// do their own locking.
pub trait ResourceSource {
    type Resource: Transactional;

    const KIND: ResourceKind;

    fn open(&self) -> Result<Self::Resource, DriverError>;

    /// Take a resource back. `reusable` is false when a frame was abandoned
    /// and the resource may still carry uncommitted work.
    fn release(&self, resource: Self::Resource, reusable: bool);
}

/// Transaction control of an async resource.
///
/// Uses native async fn in traits (RPITIT) with explicit `Send` futures.
pub trait AsyncTransactional: Send {
    fn begin(&mut self) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn begin_nested(&mut self, depth: u32)
    -> impl Future<Output = Result<(), DriverError>> + Send;

    fn commit_nested(&mut self, depth: u32)
    -> impl Future<Output = Result<(), DriverError>> + Send;

    fn rollback_nested(
        &mut self,
        depth: u32,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;
}

/// Opens and reclaims async resources.
///
/// `release` is synchronous so it can run from a drop guard when the owning
/// future is cancelled.
pub trait AsyncResourceSource: Send + Sync {
    type Resource: AsyncTransactional + 'static;

    const KIND: ResourceKind;

    fn open(&self) -> impl Future<Output = Result<Self::Resource, DriverError>> + Send;

    fn release(&self, resource: Self::Resource, reusable: bool);
}
