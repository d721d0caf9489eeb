use parlor_types::error::{ChatError, RepositoryError, UnitOfWorkError};

/// Error types a scope body may fail with.
///
/// The scopes convert their own failures through `From<UnitOfWorkError>`.
/// When a rollback fails after the body (or a commit) already failed, the
/// rollback error is attached to the original instead of replacing it.
pub trait ScopeFailure: From<UnitOfWorkError> {
    fn attach_rollback_failure(self, rollback: UnitOfWorkError) -> Self;
}

impl ScopeFailure for UnitOfWorkError {
    fn attach_rollback_failure(self, rollback: UnitOfWorkError) -> Self {
        UnitOfWorkError::RollbackFailed {
            error: Box::new(self),
            rollback: Box::new(rollback),
        }
    }
}

impl ScopeFailure for RepositoryError {
    fn attach_rollback_failure(self, rollback: UnitOfWorkError) -> Self {
        RepositoryError::RollbackFailed {
            error: Box::new(self),
            rollback,
        }
    }
}

impl ScopeFailure for ChatError {
    fn attach_rollback_failure(self, rollback: UnitOfWorkError) -> Self {
        ChatError::RollbackFailed {
            error: Box::new(self),
            rollback,
        }
    }
}
