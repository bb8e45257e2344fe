//! SQLite storage for snapshot rows.
//!
//! Reads go through a small multi-connection pool; every write goes through a
//! dedicated single-connection pool inside a `BEGIN IMMEDIATE` transaction.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Pool used for range reads and aggregates.
pub type DbPool = Pool<Sqlite>;

/// Single-connection pool that owns the SQLite write lock.
pub type WritePool = Pool<Sqlite>;

/// Upper bound on read connections.
const MAX_READ_CONNECTIONS: u32 = 8;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pragmas run on every new connection.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA wal_autocheckpoint = 1000",
    // Snapshot tables grow and shrink daily; cap the WAL at 64 MiB.
    "PRAGMA journal_size_limit = 67108864",
    "PRAGMA cache_size = -8000",
    "PRAGMA temp_store = MEMORY",
];

/// Which of the two pools is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolRole {
    Read,
    Write,
}

impl PoolRole {
    fn name(self) -> &'static str {
        match self {
            Self::Read => "read_pool",
            Self::Write => "write_pool",
        }
    }

    fn max_connections(self) -> u32 {
        match self {
            Self::Read => read_pool_size(),
            Self::Write => 1,
        }
    }

    fn acquire_timeout(self) -> Duration {
        match self {
            Self::Read => Duration::from_secs(30),
            // Writers queue behind a whole batch or a retention delete.
            Self::Write => Duration::from_secs(60),
        }
    }
}

async fn apply_connection_pragmas(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Make sure the pool really ended up in WAL mode; re-issue the pragma if not.
async fn ensure_wal_mode(pool: &DbPool, role: PoolRole) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let mode: String = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?
        .get(0);

    // In-memory databases report "memory" and cannot switch.
    if mode != "wal" && mode != "memory" {
        tracing::warn!(pool = role.name(), mode = %mode, "Journal mode is not WAL; re-setting");
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        // Readers keep going while the collector holds the write lock
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true))
}

/// Build a `sqlite:` URL for a database file path.
pub fn sqlite_url(path: impl AsRef<Path>) -> String {
    format!("sqlite:{}?mode=rwc", path.as_ref().display())
}

/// Create the parent directory of a database file if it does not exist yet.
pub fn ensure_parent_dir(path: impl AsRef<Path>) -> std::io::Result<()> {
    match path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Two connections per core, capped at [`MAX_READ_CONNECTIONS`].
pub fn read_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32 * 2)
        .unwrap_or(4)
        .min(MAX_READ_CONNECTIONS)
}

async fn build_pool(database_url: &str, role: PoolRole) -> Result<DbPool, sqlx::Error> {
    let max_connections = role.max_connections();
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(role.acquire_timeout())
        .after_connect(|conn, _meta| Box::pin(async move { apply_connection_pragmas(conn).await }))
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, role).await?;
    tracing::debug!(pool = role.name(), max_connections, "SQLite pool ready");
    Ok(pool)
}

/// Open the read pool.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    build_pool(database_url, PoolRole::Read).await
}

/// Open the write pool (`max_connections = 1`).
///
/// Snapshot batches and retention deletes both go through this pool, so only
/// one connection ever attempts to take the SQLite write lock.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    build_pool(database_url, PoolRole::Write).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Snapshot schema is up to date");
    Ok(())
}

/// Read and write pools opened against the same database file.
#[derive(Clone)]
pub struct Database {
    pub pool: DbPool,
    pub write_pool: WritePool,
}

impl Database {
    /// Open both pools and bring the schema up to date.
    pub async fn open(database_url: &str) -> crate::Result<Self> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        let write_pool = init_write_pool(database_url).await?;
        Ok(Self { pool, write_pool })
    }

    /// Open a database file, creating its directory first.
    pub async fn open_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        ensure_parent_dir(&path)?;
        Self::open(&sqlite_url(path)).await
    }

    pub async fn close(&self) {
        self.write_pool.close().await;
        self.pool.close().await;
    }
}

/// Take the write lock on a connection from `pool`.
///
/// The guard exists before `BEGIN IMMEDIATE` is sent, so dropping this future
/// while it waits on the lock discards the connection instead of handing it
/// back to the pool with a transaction that opens behind our back.
pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut tx = ImmediateTransaction::new(pool.acquire().await?);
    match sqlx::query("BEGIN IMMEDIATE").execute(&mut *tx.conn).await {
        Ok(_) => Ok(tx),
        Err(e) => {
            // BEGIN itself failed, so no transaction is open on this connection
            tx.finished = true;
            Err(e)
        }
    }
}

/// Wrapper for a manual immediate transaction.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, so a sampling batch and a
/// retention delete never both hold a read lock and then race to upgrade it.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        // Closing the connection makes SQLite discard the open transaction.
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}
