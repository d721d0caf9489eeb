//! Repository trait definitions (ports).
//!
//! The SQLite implementations in parlor-infra run every method inside the
//! database unit of work: reads use the chain's session, writes open a
//! transaction frame. A caller that wraps several repository calls in one
//! outer transaction therefore gets them committed or rolled back together.

pub mod chat;
pub mod user;

pub use chat::ChatRepository;
pub use user::UserRepository;
