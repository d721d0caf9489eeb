use std::fmt;

use thiserror::Error;

/// The kind of resource a unit of work is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A database session (one pooled connection).
    Database,
    /// A cache command pipeline.
    Cache,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Database => write!(f, "database session"),
            ResourceKind::Cache => write!(f, "cache pipeline"),
        }
    }
}

/// Broad classification of a backend driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The backend could not be reached (pool exhausted, connection refused, IO).
    Connectivity,
    /// The backend rejected the operation (unique/foreign key/check violation).
    Constraint,
    /// Anything else reported by the driver.
    Other,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverErrorKind::Connectivity => write!(f, "connectivity"),
            DriverErrorKind::Constraint => write!(f, "constraint"),
            DriverErrorKind::Other => write!(f, "backend"),
        }
    }
}

/// Structured error reported by a backend driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Connectivity,
            message: message.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Constraint,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Other,
            message: message.into(),
        }
    }
}

/// Which step of transaction control failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Begin,
    Commit,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPhase::Begin => write!(f, "begin"),
            TransactionPhase::Commit => write!(f, "commit"),
        }
    }
}

/// Errors raised by the scoped unit-of-work machinery.
///
/// `depth` is the frame depth the failure happened at: `1` is the outermost
/// transaction, anything greater is a savepoint or nested pipeline frame.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// No handle could be obtained from the backend.
    #[error("could not acquire {kind}: {source}")]
    Acquisition {
        kind: ResourceKind,
        #[source]
        source: DriverError,
    },

    /// Beginning or committing a frame failed.
    #[error("failed to {phase} {kind} transaction at depth {depth}: {source}")]
    Transaction {
        kind: ResourceKind,
        phase: TransactionPhase,
        depth: u32,
        #[source]
        source: DriverError,
    },

    /// Rolling back the outermost transaction failed.
    #[error("failed to roll back {kind} transaction: {source}")]
    Rollback {
        kind: ResourceKind,
        #[source]
        source: DriverError,
    },

    /// Rolling back a savepoint or nested frame failed.
    #[error("failed to roll back nested {kind} frame at depth {depth}: {source}")]
    NestedRollback {
        kind: ResourceKind,
        depth: u32,
        #[source]
        source: DriverError,
    },

    /// The handle was used in a way its backend or its scope does not allow.
    #[error("misuse of {kind}: {reason}")]
    Misuse { kind: ResourceKind, reason: String },

    /// The transaction can no longer commit because an inner frame was abandoned.
    #[error("{kind} transaction aborted: {reason}")]
    Aborted { kind: ResourceKind, reason: String },

    /// The original failure, plus the rollback failure that followed it.
    #[error("{error} (rollback also failed: {rollback})")]
    RollbackFailed {
        error: Box<UnitOfWorkError>,
        rollback: Box<UnitOfWorkError>,
    },
}

impl UnitOfWorkError {
    /// The resource kind the error originated from.
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            UnitOfWorkError::Acquisition { kind, .. }
            | UnitOfWorkError::Transaction { kind, .. }
            | UnitOfWorkError::Rollback { kind, .. }
            | UnitOfWorkError::NestedRollback { kind, .. }
            | UnitOfWorkError::Misuse { kind, .. }
            | UnitOfWorkError::Aborted { kind, .. } => *kind,
            UnitOfWorkError::RollbackFailed { error, .. } => error.resource_kind(),
        }
    }

    /// The rollback failure attached to this error, if any.
    pub fn rollback_failure(&self) -> Option<&UnitOfWorkError> {
        match self {
            UnitOfWorkError::RollbackFailed { rollback, .. } => Some(rollback),
            _ => None,
        }
    }

    /// The primary failure, looking through an attached rollback failure.
    pub fn original(&self) -> &UnitOfWorkError {
        match self {
            UnitOfWorkError::RollbackFailed { error, .. } => error.original(),
            other => other,
        }
    }

    pub fn misuse(kind: ResourceKind, reason: impl Into<String>) -> Self {
        UnitOfWorkError::Misuse {
            kind,
            reason: reason.into(),
        }
    }

    /// A handle was borrowed while another borrow of it was still alive.
    pub fn handle_busy(kind: ResourceKind) -> Self {
        Self::misuse(kind, "handle is already borrowed in this call chain")
    }

    /// A handle was used after its owning scope released it.
    pub fn handle_released(kind: ResourceKind) -> Self {
        Self::misuse(kind, "handle was used after its scope released it")
    }
}

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),

    /// The operation failed and the rollback that followed failed too.
    #[error("{error} (rollback also failed: {rollback})")]
    RollbackFailed {
        error: Box<RepositoryError>,
        rollback: UnitOfWorkError,
    },
}

impl From<DriverError> for RepositoryError {
    fn from(err: DriverError) -> Self {
        match err.kind {
            DriverErrorKind::Connectivity => RepositoryError::Connection,
            DriverErrorKind::Constraint => RepositoryError::Conflict(err.message),
            DriverErrorKind::Other => RepositoryError::Query(err.message),
        }
    }
}

/// Errors from the chat service.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The answer generator could not produce an answer.
    #[error("answer generation failed: {0}")]
    Generation(String),

    #[error("user {0} not found")]
    UnknownUser(i64),

    /// The operation failed and the rollback that followed failed too.
    #[error("{error} (rollback also failed: {rollback})")]
    RollbackFailed {
        error: Box<ChatError>,
        rollback: UnitOfWorkError,
    },
}

impl From<UnitOfWorkError> for ChatError {
    fn from(err: UnitOfWorkError) -> Self {
        ChatError::Repository(RepositoryError::UnitOfWork(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::constraint("UNIQUE constraint failed: users.telegram_user_id");
        assert_eq!(
            err.to_string(),
            "constraint error: UNIQUE constraint failed: users.telegram_user_id"
        );
    }

    #[test]
    fn test_transaction_error_display() {
        let err = UnitOfWorkError::Transaction {
            kind: ResourceKind::Database,
            phase: TransactionPhase::Commit,
            depth: 1,
            source: DriverError::other("disk I/O error"),
        };
        assert_eq!(
            err.to_string(),
            "failed to commit database session transaction at depth 1: backend error: disk I/O error"
        );
    }

    #[test]
    fn test_rollback_failed_keeps_original() {
        let original = UnitOfWorkError::Transaction {
            kind: ResourceKind::Cache,
            phase: TransactionPhase::Commit,
            depth: 1,
            source: DriverError::connectivity("store unavailable"),
        };
        let rollback = UnitOfWorkError::Rollback {
            kind: ResourceKind::Cache,
            source: DriverError::connectivity("store unavailable"),
        };
        let err = UnitOfWorkError::RollbackFailed {
            error: Box::new(original),
            rollback: Box::new(rollback),
        };

        assert!(matches!(
            err.original(),
            UnitOfWorkError::Transaction {
                phase: TransactionPhase::Commit,
                ..
            }
        ));
        assert!(matches!(
            err.rollback_failure(),
            Some(UnitOfWorkError::Rollback { .. })
        ));
        assert_eq!(err.resource_kind(), ResourceKind::Cache);
        assert!(err.to_string().contains("rollback also failed"));
    }

    #[test]
    fn test_repository_error_from_driver_error() {
        let err: RepositoryError = DriverError::constraint("duplicate").into();
        assert!(matches!(err, RepositoryError::Conflict(ref m) if m == "duplicate"));

        let err: RepositoryError = DriverError::connectivity("refused").into();
        assert!(matches!(err, RepositoryError::Connection));
    }

    #[test]
    fn test_chat_error_wraps_unit_of_work_error() {
        let err: ChatError = UnitOfWorkError::misuse(ResourceKind::Database, "busy").into();
        assert!(matches!(
            err,
            ChatError::Repository(RepositoryError::UnitOfWork(UnitOfWorkError::Misuse { .. }))
        ));
        assert_eq!(err.to_string(), "misuse of database session: busy");
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
