//! Blocking database unit of work over rusqlite.
//!
//! Mirrors [`super::session`] for code that runs on plain threads: sessions
//! are bound to the calling thread, transactions use the same `BEGIN
//! IMMEDIATE` / `SAVEPOINT sp_N` statements, and connections come from a
//! small bounded pool guarded by a mutex and a condvar.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use parlor_core::unit_of_work::{
    Bindings, ResourceSource, ScopeFailure, SyncHandle, SyncUnitOfWork, ThreadSlot, Transactional,
};
use parlor_types::config::DatabaseSettings;
use parlor_types::error::{DriverError, RepositoryError, ResourceKind, UnitOfWorkError};
use rusqlite::{Connection, OpenFlags};
use sqlx::ConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;

use super::error::{from_rusqlite, from_sqlx};

const SCHEMA: &str = include_str!("../../../../migrations/0001_initial.sql");

thread_local! {
    static CURRENT_SESSION: RefCell<Bindings<SyncHandle<BlockingSession>>> = const { RefCell::new(Bindings::new()) };
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One pooled rusqlite connection plus the number of frames open on it.
pub struct BlockingSession {
    conn: Option<Connection>,
    open_frames: u32,
}

impl BlockingSession {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            open_frames: 0,
        }
    }

    /// The connection to run statements on.
    pub fn connection(&self) -> Result<&Connection, DriverError> {
        self.conn
            .as_ref()
            .ok_or_else(|| DriverError::connectivity("session connection was closed"))
    }

    /// True when no transaction or savepoint is open on the connection.
    pub fn is_clean(&self) -> bool {
        self.open_frames == 0
    }

    fn run(&self, sql: &str) -> Result<(), DriverError> {
        self.connection()?.execute_batch(sql).map_err(from_rusqlite)
    }
}

impl Transactional for BlockingSession {
    fn begin(&mut self) -> Result<(), DriverError> {
        self.run("BEGIN IMMEDIATE")?;
        self.open_frames = 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.run("COMMIT")?;
        self.open_frames = 0;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.run("ROLLBACK")?;
        self.open_frames = 0;
        Ok(())
    }

    fn begin_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.run(&format!("SAVEPOINT sp_{depth}"))?;
        self.open_frames = depth;
        Ok(())
    }

    fn commit_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.run(&format!("RELEASE SAVEPOINT sp_{depth}"))?;
        self.open_frames = depth - 1;
        Ok(())
    }

    fn rollback_nested(&mut self, depth: u32) -> Result<(), DriverError> {
        self.run(&format!(
            "ROLLBACK TO SAVEPOINT sp_{depth}; RELEASE SAVEPOINT sp_{depth}"
        ))?;
        self.open_frames = depth - 1;
        Ok(())
    }
}

impl Drop for BlockingSession {
    fn drop(&mut self) {
        if self.conn.is_some() && !self.is_clean() {
            tracing::warn!(open_frames = self.open_frames, "session dropped inside a transaction, closing connection");
        }
    }
}

fn ping(conn: &Connection) -> Result<(), DriverError> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(from_rusqlite)
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

static NEXT_MEMORY_DATABASE: AtomicU64 = AtomicU64::new(0);

/// Where connections are opened, parsed from a `sqlite:` DSN with sqlx's
/// option parser so both drivers accept the same URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    File { path: PathBuf, read_only: bool },
    /// A named shared-cache in-memory database. It exists while at least
    /// one connection to it is open.
    Memory { uri: String },
}

impl Target {
    fn parse(url: &str) -> Result<Self, DriverError> {
        if !url.starts_with("sqlite:") {
            return Err(DriverError::other(format!("not a sqlite url: {url}")));
        }
        let options = SqliteConnectOptions::from_str(url).map_err(from_sqlx)?;
        let mode = options
            .to_url_lossy()
            .query_pairs()
            .find(|(key, _)| key == "mode")
            .map(|(_, value)| value.into_owned());

        Ok(match mode.as_deref() {
            Some("memory") => {
                let n = NEXT_MEMORY_DATABASE.fetch_add(1, Ordering::Relaxed);
                Target::Memory {
                    uri: format!("file:parlor-mem-{n}?mode=memory&cache=shared"),
                }
            }
            mode => Target::File {
                path: options.get_filename().to_path_buf(),
                read_only: mode == Some("ro"),
            },
        })
    }

    fn is_read_only(&self) -> bool {
        matches!(self, Target::File { read_only: true, .. })
    }

    /// Writable file targets are created when missing, like the async pool.
    fn open(&self) -> Result<Connection, DriverError> {
        let (path, access) = match self {
            Target::File {
                path,
                read_only: true,
            } => (path.as_path(), OpenFlags::SQLITE_OPEN_READ_ONLY),
            Target::File { path, .. } => (
                path.as_path(),
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            ),
            Target::Memory { uri } => (
                Path::new(uri.as_str()),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            ),
        };
        Connection::open_with_flags(path, access | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .map_err(from_rusqlite)
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Connection>,
    /// Keeps an in-memory database alive while the pool is open.
    anchor: Option<Connection>,
    /// Connections handed out or idle.
    open: u32,
    closed: bool,
}

/// Bounded pool of blocking connections.
pub struct BlockingSource {
    target: Target,
    max_connections: u32,
    acquire_timeout: Duration,
    busy_timeout: Duration,
    pre_ping: bool,
    state: Mutex<PoolState>,
    available: Condvar,
}

fn poisoned() -> DriverError {
    DriverError::other("connection pool lock poisoned")
}

impl BlockingSource {
    fn new(settings: &DatabaseSettings) -> Result<Self, DriverError> {
        let target = Target::parse(&settings.url)?;
        let anchor = match target {
            Target::Memory { .. } => Some(target.open()?),
            Target::File { .. } => None,
        };
        Ok(Self {
            target,
            max_connections: settings.max_connections.max(1),
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            busy_timeout: Duration::from_millis(settings.busy_timeout_ms),
            pre_ping: settings.pre_ping,
            state: Mutex::new(PoolState {
                anchor,
                ..PoolState::default()
            }),
            available: Condvar::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>, DriverError> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Open a new connection with WAL journaling and foreign keys enforced.
    fn connect(&self) -> Result<Connection, DriverError> {
        let conn = self.target.open()?;

        conn.busy_timeout(self.busy_timeout).map_err(from_rusqlite)?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(from_rusqlite)?;
        if !self.target.is_read_only() {
            let mode = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })
                .map_err(from_rusqlite)?;
            tracing::debug!(journal_mode = %mode, "connection opened");
        }
        Ok(conn)
    }

    fn forget_one(&self) {
        if let Ok(mut state) = self.lock() {
            state.open = state.open.saturating_sub(1);
        }
        self.available.notify_one();
    }

    /// Drop every idle connection and refuse new acquisitions.
    fn close(&self) -> Result<(), DriverError> {
        let (idle, anchor) = {
            let mut state = self.lock()?;
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.open = state.open.saturating_sub(idle.len() as u32);
            (idle, state.anchor.take())
        };
        drop(idle);
        drop(anchor);
        self.available.notify_all();
        Ok(())
    }
}

impl ResourceSource for BlockingSource {
    type Resource = BlockingSession;

    const KIND: ResourceKind = ResourceKind::Database;

    fn open(&self) -> Result<BlockingSession, DriverError> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut state = self.lock()?;
        loop {
            if state.closed {
                return Err(DriverError::connectivity("connection pool is closed"));
            }
            if let Some(conn) = state.idle.pop() {
                if !self.pre_ping || ping(&conn).is_ok() {
                    return Ok(BlockingSession::new(conn));
                }
                tracing::debug!("discarding connection that failed pre-ping");
                state.open -= 1;
                continue;
            }
            if state.open < self.max_connections {
                state.open += 1;
                drop(state);
                return match self.connect() {
                    Ok(conn) => Ok(BlockingSession::new(conn)),
                    Err(err) => {
                        self.forget_one();
                        Err(err)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::connectivity(format!(
                    "timed out after {}ms waiting for one of {} connections",
                    self.acquire_timeout.as_millis(),
                    self.max_connections
                )));
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| poisoned())?;
            state = guard;
        }
    }

    fn release(&self, mut session: BlockingSession, reusable: bool) {
        let keep = reusable && session.is_clean();
        let Some(conn) = session.conn.take() else {
            self.forget_one();
            return;
        };
        if !keep {
            tracing::debug!("discarding session connection");
            // Closing the connection rolls back whatever it still has open.
            drop(conn);
            self.forget_one();
            return;
        }

        match self.state.lock() {
            Ok(mut state) if !state.closed => state.idle.push(conn),
            Ok(mut state) => state.open = state.open.saturating_sub(1),
            Err(_) => {}
        }
        self.available.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Database facade
// ---------------------------------------------------------------------------

/// Blocking SQLite database with thread-scoped sessions.
///
/// Cheap to clone and safe to share between threads; every thread gets its
/// own session chain.
#[derive(Clone)]
pub struct BlockingDatabase {
    uow: Arc<SyncUnitOfWork<BlockingSource>>,
}

impl BlockingDatabase {
    /// Build the pool. File databases open no connection until the first
    /// session; an in-memory database opens one up front and holds it until
    /// [`BlockingDatabase::close`] so every pooled connection sees the same
    /// data.
    pub fn connect(settings: &DatabaseSettings) -> Result<Self, DriverError> {
        let source = BlockingSource::new(settings)?;
        tracing::info!(
            max_connections = source.max_connections,
            pre_ping = source.pre_ping,
            "blocking database pool ready"
        );
        Ok(Self {
            uow: Arc::new(SyncUnitOfWork::new(
                source,
                ThreadSlot::new(&CURRENT_SESSION),
            )),
        })
    }

    /// Create the schema if it does not exist yet.
    pub fn migrate(&self) -> Result<(), RepositoryError> {
        self.session(|session| {
            session
                .resource()?
                .connection()?
                .execute_batch(SCHEMA)
                .map_err(from_rusqlite)?;
            Ok(())
        })
    }

    /// The session bound to the calling thread, if any.
    pub fn current(&self) -> Option<SyncHandle<BlockingSession>> {
        self.uow.current()
    }

    /// Run `body` with the thread's session, opening one if needed.
    pub fn session<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: From<UnitOfWorkError>,
        F: FnOnce(&SyncHandle<BlockingSession>) -> Result<T, E>,
    {
        self.uow.with_resource(body)
    }

    /// Run `body` in a transaction, or in a savepoint inside an open one.
    pub fn transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<BlockingSession>) -> Result<T, E>,
    {
        self.uow.with_transaction(body)
    }

    /// Run `body` in the open transaction, starting one only if there is none.
    pub fn current_transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<BlockingSession>) -> Result<T, E>,
    {
        self.uow.with_ambient_transaction(body)
    }

    /// Run `body` in its own transaction on a separate connection.
    pub fn isolated_transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: ScopeFailure,
        F: FnOnce(&SyncHandle<BlockingSession>) -> Result<T, E>,
    {
        self.uow.with_isolated_transaction(body)
    }

    /// Check that a connection can be acquired and used.
    pub fn ping(&self) -> Result<(), DriverError> {
        let source = self.uow.source();
        let session = source.open()?;
        let result = session.connection().and_then(ping);
        source.release(session, result.is_ok());
        result
    }

    /// Close idle connections and refuse new sessions. Sessions still open
    /// keep working until they are released.
    pub fn close(&self) -> Result<(), DriverError> {
        self.uow.source().close()?;
        tracing::info!("blocking database pool closed");
        Ok(())
    }
}
