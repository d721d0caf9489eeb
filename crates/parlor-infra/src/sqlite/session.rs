//! Async database unit of work over a sqlx SQLite pool.
//!
//! A [`SqliteSession`] is one pooled connection. Transactions are driven with
//! plain SQL (`BEGIN IMMEDIATE`, `SAVEPOINT sp_N`, ...) so that the frame depth
//! maps directly onto savepoint names. A session that is dropped or released
//! while a transaction is still open is detached from the pool; closing the
//! connection makes SQLite roll the transaction back.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parlor_core::unit_of_work::{
    AsyncHandle, AsyncResourceSource, AsyncTransactional, AsyncUnitOfWork, Bindings, ScopeFailure,
    TaskSlot,
};
use parlor_types::config::DatabaseSettings;
use parlor_types::error::{DriverError, ResourceKind, UnitOfWorkError};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection};

use super::error::from_sqlx;

tokio::task_local! {
    static CURRENT_SESSION: Bindings<AsyncHandle<SqliteSession>>;
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One pooled connection plus the number of transaction frames open on it.
pub struct SqliteSession {
    conn: Option<PoolConnection<Sqlite>>,
    open_frames: u32,
}

impl SqliteSession {
    fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            conn: Some(conn),
            open_frames: 0,
        }
    }

    /// The connection to run queries on.
    pub fn connection(&mut self) -> Result<&mut SqliteConnection, DriverError> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| DriverError::connectivity("session connection was closed"))
    }

    /// True when no transaction or savepoint is open on the connection.
    pub fn is_clean(&self) -> bool {
        self.open_frames == 0
    }

    async fn run(&mut self, sql: &str) -> Result<(), DriverError> {
        sqlx::query(sql)
            .execute(self.connection()?)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }

    /// Close the connection instead of returning it to the pool.
    fn detach(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

impl AsyncTransactional for SqliteSession {
    async fn begin(&mut self) -> Result<(), DriverError> {
        self.run("BEGIN IMMEDIATE").await?;
        self.open_frames = 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.run("COMMIT").await?;
        self.open_frames = 0;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.run("ROLLBACK").await?;
        self.open_frames = 0;
        Ok(())
    }

    async fn begin_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.run(&format!("SAVEPOINT sp_{depth}")).await?;
        self.open_frames = depth;
        Ok(())
    }

    async fn commit_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.run(&format!("RELEASE SAVEPOINT sp_{depth}")).await?;
        self.open_frames = depth - 1;
        Ok(())
    }

    async fn rollback_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        // ROLLBACK TO keeps the savepoint on the stack; release it as well.
        self.run(&format!("ROLLBACK TO SAVEPOINT sp_{depth}")).await?;
        self.run(&format!("RELEASE SAVEPOINT sp_{depth}")).await?;
        self.open_frames = depth - 1;
        Ok(())
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if !self.is_clean() {
            tracing::warn!(open_frames = self.open_frames, "session dropped inside a transaction, closing connection");
            self.detach();
        }
    }
}

/// Hands out pooled connections as sessions.
pub struct SessionSource {
    pool: SqlitePool,
}

impl AsyncResourceSource for SessionSource {
    type Resource = SqliteSession;

    const KIND: ResourceKind = ResourceKind::Database;

    async fn open(&self) -> Result<SqliteSession, DriverError> {
        let conn = self.pool.acquire().await.map_err(from_sqlx)?;
        Ok(SqliteSession::new(conn))
    }

    fn release(&self, mut session: SqliteSession, reusable: bool) {
        if !reusable || !session.is_clean() {
            tracing::debug!("discarding session connection");
            session.open_frames = 0;
            session.detach();
        }
    }
}

// ---------------------------------------------------------------------------
// Database facade
// ---------------------------------------------------------------------------

/// Async SQLite database with task-scoped sessions.
///
/// Cheap to clone; clones share the pool and the session binding, so a
/// repository holding a clone joins whatever session or transaction the
/// calling task has open.
#[derive(Clone)]
pub struct Database {
    uow: Arc<AsyncUnitOfWork<SessionSource>>,
}

impl Database {
    /// Create the connection pool. Connections use WAL journaling, enforce
    /// foreign keys and wait `busy_timeout_ms` on a locked database.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&settings.url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_millis(settings.acquire_timeout_ms))
            .test_before_acquire(settings.pre_ping)
            .connect_with(options)
            .await?;

        tracing::info!(
            max_connections = settings.max_connections,
            pre_ping = settings.pre_ping,
            "database pool ready"
        );
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            uow: Arc::new(AsyncUnitOfWork::new(
                SessionSource { pool },
                TaskSlot::new(&CURRENT_SESSION),
            )),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.uow.source().pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(self.pool()).await
    }

    /// The session bound to the calling task, if any.
    pub fn current(&self) -> Option<AsyncHandle<SqliteSession>> {
        self.uow.current()
    }

    /// Run `body` with the task's session, opening one if needed.
    pub async fn session<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: From<UnitOfWorkError>,
        F: FnOnce(AsyncHandle<SqliteSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.uow.with_resource(body).await
    }

    /// Run `body` in a transaction, or in a savepoint inside an open one.
    pub async fn transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<SqliteSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.uow.with_transaction(body).await
    }

    /// Run `body` in the open transaction, starting one only if there is none.
    pub async fn current_transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<SqliteSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.uow.with_ambient_transaction(body).await
    }

    /// Run `body` in its own transaction on a separate connection.
    pub async fn isolated_transaction<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(AsyncHandle<SqliteSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.uow.with_isolated_transaction(body).await
    }

    /// Check that a connection can be acquired and used.
    pub async fn ping(&self) -> Result<(), DriverError> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }

    /// Close every pooled connection. Sessions still open keep working until
    /// they are released.
    pub async fn close(&self) {
        self.pool().close().await;
        tracing::info!("database pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_types::error::TransactionPhase;

    async fn test_db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        let db = Database::connect(&DatabaseSettings::with_url(url)).await.unwrap();
        db.migrate().await.unwrap();
        sqlx::query("CREATE TABLE notes (body TEXT NOT NULL UNIQUE)")
            .execute(db.pool())
            .await
            .unwrap();
        db
    }

    async fn insert(session: &AsyncHandle<SqliteSession>, body: &str) -> Result<(), UnitOfWorkError> {
        let mut guard = session.resource().await?;
        let conn = guard.connection().map_err(|source| UnitOfWorkError::Acquisition {
            kind: ResourceKind::Database,
            source,
        })?;
        sqlx::query("INSERT INTO notes (body) VALUES (?)")
            .bind(body)
            .execute(conn)
            .await
            .map_err(|err| UnitOfWorkError::misuse(ResourceKind::Database, err.to_string()))?;
        Ok(())
    }

    async fn notes(db: &Database) -> Vec<String> {
        sqlx::query_scalar("SELECT body FROM notes ORDER BY rowid")
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_nested_failure_rolls_back_savepoint_only() {
        let db = test_db().await;

        db.transaction(|outer| {
            let db = db.clone();
            async move {
                insert(&outer, "X").await?;
                let nested = db
                    .transaction(|inner| async move {
                        insert(&inner, "Y").await?;
                        Err::<(), UnitOfWorkError>(UnitOfWorkError::misuse(
                            ResourceKind::Database,
                            "nested failure",
                        ))
                    })
                    .await;
                assert!(nested.is_err());
                Ok::<(), UnitOfWorkError>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(notes(&db).await, vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn test_outer_failure_discards_committed_savepoints() {
        let db = test_db().await;

        let result = db
            .transaction(|outer| {
                let db = db.clone();
                async move {
                    insert(&outer, "A").await?;
                    db.transaction(|inner| async move { insert(&inner, "B").await })
                        .await?;
                    db.current_transaction(|joined| async move { insert(&joined, "Z").await })
                        .await?;
                    Err::<(), UnitOfWorkError>(UnitOfWorkError::misuse(ResourceKind::Database, "late"))
                }
            })
            .await;

        assert!(result.is_err());
        assert!(notes(&db).await.is_empty());
    }

    #[tokio::test]
    async fn test_session_outside_transaction_autocommits() {
        let db = test_db().await;

        let result = db
            .session(|session| async move {
                insert(&session, "kept").await?;
                Err::<(), UnitOfWorkError>(UnitOfWorkError::misuse(ResourceKind::Database, "after write"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(notes(&db).await, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_transaction_leaves_no_trace() {
        let db = test_db().await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            db.transaction(|session| async move {
                insert(&session, "never").await?;
                std::future::pending::<()>().await;
                Ok::<(), UnitOfWorkError>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        // The detached connection took the open transaction with it, so the
        // write lock is free again.
        db.transaction(|session| async move { insert(&session, "after").await })
            .await
            .unwrap();
        assert_eq!(notes(&db).await, vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn test_write_after_cancelled_transaction_in_session_is_kept() {
        let db = test_db().await;

        db.session(|session| {
            let db = db.clone();
            async move {
                let cancelled = tokio::time::timeout(
                    Duration::from_millis(50),
                    db.transaction(|tx| async move {
                        insert(&tx, "cancelled").await?;
                        std::future::pending::<()>().await;
                        Ok::<(), UnitOfWorkError>(())
                    }),
                )
                .await;
                assert!(cancelled.is_err());
                assert!(!session.in_transaction());

                insert(&session, "after-cancel").await
            }
        })
        .await
        .unwrap();

        assert_eq!(notes(&db).await, vec!["after-cancel".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_savepoint_keeps_outer_work() {
        let db = test_db().await;

        db.transaction(|outer| {
            let db = db.clone();
            async move {
                insert(&outer, "X").await?;
                let nested = tokio::time::timeout(
                    Duration::from_millis(50),
                    db.transaction(|inner| async move {
                        insert(&inner, "Y").await?;
                        std::future::pending::<()>().await;
                        Ok::<(), UnitOfWorkError>(())
                    }),
                )
                .await;
                assert!(nested.is_err());
                Ok::<(), UnitOfWorkError>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(notes(&db).await, vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn test_interleaved_databases_reuse_their_own_session() {
        let db = test_db().await;
        let other = Database::from_pool(db.pool().clone());

        db.transaction(|outer| {
            let db = db.clone();
            let other = other.clone();
            async move {
                other
                    .session(|_| async move {
                        db.transaction(|inner| async move {
                            assert!(inner.same_handle(&outer));
                            insert(&inner, "nested").await
                        })
                        .await
                    })
                    .await
            }
        })
        .await
        .unwrap();

        assert_eq!(notes(&db).await, vec!["nested".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_tasks_use_separate_sessions() {
        let db = test_db().await;

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let db = db.clone();
                tokio::spawn(async move {
                    db.transaction(|session| {
                        let db = db.clone();
                        async move {
                            assert!(db.current().is_some_and(|h| h.same_handle(&session)));
                            insert(&session, &format!("task-{i}")).await
                        }
                    })
                    .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(notes(&db).await.len(), 4);
        assert!(db.current().is_none());
    }

    #[tokio::test]
    async fn test_isolated_transaction_survives_outer_rollback() {
        let db = test_db().await;

        let result = db
            .transaction(|outer| {
                let db = db.clone();
                async move {
                    insert(&outer, "rolled back").await?;
                    db.isolated_transaction(|own| async move { insert(&own, "audit").await })
                        .await?;
                    Err::<(), UnitOfWorkError>(UnitOfWorkError::misuse(ResourceKind::Database, "outer"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(notes(&db).await, vec!["audit".to_string()]);
    }

    #[tokio::test]
    async fn test_acquire_timeout_surfaces_as_acquisition_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("one.db").display());
        let settings = DatabaseSettings {
            max_connections: 1,
            acquire_timeout_ms: 100,
            ..DatabaseSettings::with_url(url)
        };
        let db = Database::connect(&settings).await.unwrap();

        let result = db
            .session(|_held| {
                let other = db.clone();
                async move {
                    // A second task cannot get a connection while this one holds it.
                    tokio::spawn(async move {
                        other
                            .session(|_| async { Ok::<(), UnitOfWorkError>(()) })
                            .await
                    })
                    .await
                    .unwrap()
                }
            })
            .await;

        assert!(matches!(result, Err(UnitOfWorkError::Acquisition { .. })));
    }

    #[tokio::test]
    async fn test_commit_failure_is_a_commit_error() {
        let db = test_db().await;
        for ddl in [
            "CREATE TABLE parents (id INTEGER PRIMARY KEY)",
            "CREATE TABLE children (parent_id INTEGER REFERENCES parents (id) DEFERRABLE INITIALLY DEFERRED)",
        ] {
            sqlx::query(ddl).execute(db.pool()).await.unwrap();
        }

        let err = db
            .transaction(|session| async move {
                let mut guard = session.resource().await?;
                let conn = guard.connection().map_err(|source| UnitOfWorkError::Acquisition {
                    kind: ResourceKind::Database,
                    source,
                })?;
                sqlx::query("INSERT INTO children (parent_id) VALUES (42)")
                    .execute(conn)
                    .await
                    .map_err(|err| UnitOfWorkError::misuse(ResourceKind::Database, err.to_string()))?;
                Ok::<(), UnitOfWorkError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err.original(),
            UnitOfWorkError::Transaction {
                phase: TransactionPhase::Commit,
                depth: 1,
                ..
            }
        ));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM children")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
