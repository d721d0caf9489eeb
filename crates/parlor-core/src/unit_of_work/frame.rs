//! Pieces of transaction-frame bookkeeping shared by the blocking and async
//! scopes.

use parlor_types::error::{DriverError, ResourceKind, TransactionPhase, UnitOfWorkError};

use super::failure::ScopeFailure;
use super::handle::FramePosition;

/// One transaction-control call against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Begin,
    Commit,
    Rollback,
}

impl Step {
    pub(crate) fn error(
        self,
        kind: ResourceKind,
        position: FramePosition,
        source: DriverError,
    ) -> UnitOfWorkError {
        match (self, position) {
            (Step::Begin, position) => UnitOfWorkError::Transaction {
                kind,
                phase: TransactionPhase::Begin,
                depth: position.depth(),
                source,
            },
            (Step::Commit, position) => UnitOfWorkError::Transaction {
                kind,
                phase: TransactionPhase::Commit,
                depth: position.depth(),
                source,
            },
            (Step::Rollback, FramePosition::Outermost) => {
                UnitOfWorkError::Rollback { kind, source }
            }
            (Step::Rollback, FramePosition::Nested(depth)) => {
                UnitOfWorkError::NestedRollback {
                    kind,
                    depth,
                    source,
                }
            }
        }
    }
}

/// The error a frame reports instead of committing when an inner frame was
/// abandoned (panic or cancellation) or failed to roll back, so its work can
/// no longer be accounted for.
pub(crate) fn abandoned_inner_frame(kind: ResourceKind) -> UnitOfWorkError {
    UnitOfWorkError::Aborted {
        kind,
        reason: "an inner frame was abandoned or failed to roll back".to_string(),
    }
}

/// Report `error`, attaching the rollback failure if the rollback failed too.
pub(crate) fn with_rollback_outcome<E: ScopeFailure>(
    error: E,
    rollback: Result<(), UnitOfWorkError>,
) -> E {
    match rollback {
        Ok(()) => error,
        Err(rollback) => error.attach_rollback_failure(rollback),
    }
}
