//! SQLite storage layer.
//!
//! Task-scoped (sqlx) and thread-scoped (rusqlite) database units of work, plus
//! the repository implementations running on the async one.

pub mod blocking;
pub mod chat;
mod error;
pub mod session;
pub mod user;

pub use blocking::{BlockingDatabase, BlockingSession};
pub use session::{Database, SqliteSession};
