//! User repository trait definition.

use std::future::Future;

use parlor_types::chat::{NewUser, User, UserId, UserUpdate};
use parlor_types::error::RepositoryError;

/// Repository trait for user persistence.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait UserRepository: Send + Sync {
    /// Register a new user. Fails with `Conflict` when the Telegram id is
    /// already taken.
    fn create(&self, user: &NewUser) -> impl Future<Output = Result<User, RepositoryError>> + Send;

    fn get_or_none(
        &self,
        id: UserId,
    ) -> impl Future<Output = Result<Option<User>, RepositoryError>> + Send;

    /// Like `get_or_none`, but a missing user is `NotFound`.
    fn get(&self, id: UserId) -> impl Future<Output = Result<User, RepositoryError>> + Send;

    /// All users ordered by id.
    fn all(&self) -> impl Future<Output = Result<Vec<User>, RepositoryError>> + Send;

    /// Apply a partial update and return the stored user.
    fn update(
        &self,
        id: UserId,
        update: &UserUpdate,
    ) -> impl Future<Output = Result<User, RepositoryError>> + Send;

    /// Delete a user together with their questions and answers. Deleting a
    /// missing user is not an error.
    fn delete_by_id(&self, id: UserId) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
