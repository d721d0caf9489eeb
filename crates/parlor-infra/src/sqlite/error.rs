//! Classification of SQLite driver errors.

use parlor_types::error::DriverError;
use sqlx::error::ErrorKind;

pub(crate) fn from_sqlx(err: sqlx::Error) -> DriverError {
    match &err {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => DriverError::constraint(db.message()),
            _ => DriverError::other(db.message()),
        },
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => DriverError::connectivity(err.to_string()),
        _ => DriverError::other(err.to_string()),
    }
}

pub(crate) fn from_rusqlite(err: rusqlite::Error) -> DriverError {
    use rusqlite::ErrorCode;

    match &err {
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            ErrorCode::ConstraintViolation => DriverError::constraint(err.to_string()),
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure => DriverError::connectivity(err.to_string()),
            _ => DriverError::other(err.to_string()),
        },
        _ => DriverError::other(err.to_string()),
    }
}
