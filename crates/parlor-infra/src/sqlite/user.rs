//! SQLite user repository implementation.
//!
//! Reads run on the calling task's session; writes run in a transaction
//! frame, so they become savepoints when the caller already has a transaction
//! open. Uses raw queries with a private row struct like the other repositories.

use chrono::{DateTime, Utc};
use parlor_core::repository::UserRepository;
use parlor_types::chat::{NewUser, User, UserId, UserUpdate};
use parlor_types::error::RepositoryError;
use sqlx::Row;

use super::error::from_sqlx;
use super::session::Database;

/// SQLite-backed implementation of `UserRepository`.
#[derive(Clone)]
pub struct SqliteUserRepository {
    db: Database,
}

impl SqliteUserRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct UserRow {
    id: i64,
    name: String,
    telegram_user_id: Option<i64>,
    telegram_username: Option<String>,
    is_admin: bool,
    created_at: String,
    updated_at: String,
}

impl UserRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            telegram_user_id: row.try_get("telegram_user_id")?,
            telegram_username: row.try_get("telegram_username")?,
            is_admin: row.try_get("is_admin")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_user(self) -> Result<User, RepositoryError> {
        Ok(User {
            id: self.id,
            name: self.name,
            telegram_user_id: self.telegram_user_id,
            telegram_username: self.telegram_username,
            is_admin: self.is_admin,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, RepositoryError> {
    UserRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_user()
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// UserRepository implementation
// ---------------------------------------------------------------------------

impl UserRepository for SqliteUserRepository {
    async fn create(&self, user: &NewUser) -> Result<User, RepositoryError> {
        self.db
            .transaction(|session| async move {
                let mut session = session.resource().await?;
                let now = format_datetime(&Utc::now());
                let row = sqlx::query(
                    r#"INSERT INTO users (name, telegram_user_id, telegram_username, is_admin, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?)
                       RETURNING *"#,
                )
                .bind(&user.name)
                .bind(user.telegram_user_id)
                .bind(&user.telegram_username)
                .bind(user.is_admin)
                .bind(&now)
                .bind(&now)
                .fetch_one(session.connection()?)
                .await
                .map_err(from_sqlx)?;

                let created = to_user(&row)?;
                tracing::debug!(user_id = created.id, "user created");
                Ok(created)
            })
            .await
    }

    async fn get_or_none(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        self.db
            .session(|session| async move {
                let mut session = session.resource().await?;
                let row = sqlx::query("SELECT * FROM users WHERE id = ?")
                    .bind(id)
                    .fetch_optional(session.connection()?)
                    .await
                    .map_err(from_sqlx)?;
                row.as_ref().map(to_user).transpose()
            })
            .await
    }

    async fn get(&self, id: UserId) -> Result<User, RepositoryError> {
        self.get_or_none(id).await?.ok_or(RepositoryError::NotFound)
    }

    async fn all(&self) -> Result<Vec<User>, RepositoryError> {
        self.db
            .session(|session| async move {
                let mut session = session.resource().await?;
                let rows = sqlx::query("SELECT * FROM users ORDER BY id")
                    .fetch_all(session.connection()?)
                    .await
                    .map_err(from_sqlx)?;
                rows.iter().map(to_user).collect()
            })
            .await
    }

    async fn update(&self, id: UserId, update: &UserUpdate) -> Result<User, RepositoryError> {
        self.db
            .transaction(|session| async move {
                let mut session = session.resource().await?;
                let row = sqlx::query("SELECT * FROM users WHERE id = ?")
                    .bind(id)
                    .fetch_optional(session.connection()?)
                    .await
                    .map_err(from_sqlx)?
                    .ok_or(RepositoryError::NotFound)?;
                let mut user = to_user(&row)?;

                if let Some(name) = &update.name {
                    user.name = name.clone();
                }
                if let Some(username) = &update.telegram_username {
                    user.telegram_username = username.clone();
                }
                if let Some(is_admin) = update.is_admin {
                    user.is_admin = is_admin;
                }
                user.updated_at = Utc::now();

                sqlx::query(
                    r#"UPDATE users
                       SET name = ?, telegram_username = ?, is_admin = ?, updated_at = ?
                       WHERE id = ?"#,
                )
                .bind(&user.name)
                .bind(&user.telegram_username)
                .bind(user.is_admin)
                .bind(format_datetime(&user.updated_at))
                .bind(id)
                .execute(session.connection()?)
                .await
                .map_err(from_sqlx)?;

                Ok(user)
            })
            .await
    }

    async fn delete_by_id(&self, id: UserId) -> Result<(), RepositoryError> {
        self.db
            .transaction(|session| async move {
                let mut session = session.resource().await?;
                let result = sqlx::query("DELETE FROM users WHERE id = ?")
                    .bind(id)
                    .execute(session.connection()?)
                    .await
                    .map_err(from_sqlx)?;
                tracing::debug!(user_id = id, deleted = result.rows_affected(), "user deleted");
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_types::config::DatabaseSettings;

    async fn test_db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        let db = Database::connect(&DatabaseSettings::with_url(url)).await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn make_user(name: &str, telegram_user_id: Option<i64>) -> NewUser {
        NewUser {
            name: name.to_string(),
            telegram_user_id,
            telegram_username: Some(format!("@{name}")),
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let repo = SqliteUserRepository::new(test_db().await);

        let created = repo.create(&make_user("ada", Some(100))).await.unwrap();
        assert_eq!(created.name, "ada");
        assert_eq!(created.telegram_user_id, Some(100));

        let found = repo.get(created.id).await.unwrap();
        assert_eq!(found, created);
        assert!(repo.get_or_none(created.id + 1).await.unwrap().is_none());
        assert!(matches!(
            repo.get(created.id + 1).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_telegram_id_is_conflict() {
        let repo = SqliteUserRepository::new(test_db().await);

        repo.create(&make_user("ada", Some(100))).await.unwrap();
        let err = repo.create(&make_user("eve", Some(100))).await.unwrap_err();

        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_applies_only_given_fields() {
        let repo = SqliteUserRepository::new(test_db().await);
        let created = repo.create(&make_user("ada", None)).await.unwrap();

        let updated = repo
            .update(
                created.id,
                &UserUpdate {
                    telegram_username: Some(None),
                    is_admin: Some(true),
                    ..UserUpdate::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "ada");
        assert_eq!(updated.telegram_username, None);
        assert!(updated.is_admin);
        assert_eq!(repo.get(created.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_update_missing_user_is_not_found() {
        let repo = SqliteUserRepository::new(test_db().await);
        let err = repo.update(42, &UserUpdate::default()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_writes_join_the_callers_transaction() {
        let db = test_db().await;
        let repo = SqliteUserRepository::new(db.clone());

        let result = db
            .transaction(|_| {
                let repo = repo.clone();
                async move {
                    let user = repo.create(&make_user("ada", None)).await?;
                    // Visible inside the transaction...
                    assert_eq!(repo.all().await?.len(), 1);
                    repo.delete_by_id(user.id).await?;
                    repo.create(&make_user("bob", None)).await?;
                    Err::<(), RepositoryError>(RepositoryError::Query("abort".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        // ...and gone with it.
        assert!(repo.all().await.unwrap().is_empty());
    }
}
