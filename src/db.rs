//! Database connection and schema management.
//!
//! This module provides SQLite connectivity for the history store with:
//! - Connection pool management
//! - WAL mode for concurrent reads
//! - Automatic migration execution
//! - Freelist pre-allocation so a disk-full condition does not corrupt a run
//! - A schema-version gate that refuses to open databases older than the
//!   minimum supported version

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest schema version this build can open.
pub const MIN_REQUIRED_SCHEMA_VERSION: &str = "0.1.0";

/// Freelist page count below which space is pre-allocated.
const PRE_ALLOCATE_FREELIST_FLOOR: i64 = 1024;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database or run a query.
    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The on-disk schema predates the minimum supported version.
    #[error(
        "unsupported database schema version {installed:?} (minimum {MIN_REQUIRED_SCHEMA_VERSION}); \
         delete the database file or upgrade it with a newer release first"
    )]
    UnsupportedSchema {
        /// Version recorded in the database, if any.
        installed: Option<String>,
    },
}

/// Database connection wrapper with connection pool.
///
/// Handles SQLite connection pooling, WAL mode configuration,
/// migration execution, and the schema-version gate.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Creates a new database connection to the specified path.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode for concurrent reads
    /// 3. Refuse to run when an existing database reports a schema version
    ///    below [`MIN_REQUIRED_SCHEMA_VERSION`]
    /// 4. Run any pending migrations
    /// 5. Pre-allocate freelist pages and record the current version
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the connection fails,
    /// [`DbError::Migration`] if migrations fail, or
    /// [`DbError::UnsupportedSchema`] when the version gate rejects the file.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let existed = db_path.exists();
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        // Enable WAL mode for concurrent reads
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        // Set busy timeout to avoid immediate lock errors
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        let db = Self { pool };

        if existed {
            db.check_schema_version().await?;
        }

        sqlx::migrate!("./migrations").run(&db.pool).await?;

        db.pre_allocate().await?;
        db.record_schema_version().await?;

        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the connection fails,
    /// or [`DbError::Migration`] if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let db = Self { pool };
        db.record_schema_version().await?;
        Ok(db)
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Reads the newest recorded schema version, if any.
    async fn installed_version(&self) -> Result<Option<String>, DbError> {
        // The table may not exist yet on databases created before migrations ran.
        let table: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        )
        .fetch_optional(&self.pool)
        .await?;
        if table.is_none() {
            return Ok(None);
        }

        let row: Option<(String,)> =
            sqlx::query_as("SELECT version FROM schema_version ORDER BY ROWID DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(version,)| version))
    }

    /// Refuses to run against a schema older than the supported minimum.
    async fn check_schema_version(&self) -> Result<(), DbError> {
        info!(
            expected = CURRENT_SCHEMA_VERSION,
            "checking database schema version"
        );
        let installed = self.installed_version().await?;
        info!(?installed, "database reports installed version");

        match installed
            .as_deref()
            .map(|version| version_at_least(version, MIN_REQUIRED_SCHEMA_VERSION))
        {
            Some(true) => Ok(()),
            _ => Err(DbError::UnsupportedSchema { installed }),
        }
    }

    /// Writes the current application version row when it is newer.
    async fn record_schema_version(&self) -> Result<(), DbError> {
        let installed = self.installed_version().await?;
        if installed
            .as_deref()
            .is_some_and(|version| version_at_least(version, CURRENT_SCHEMA_VERSION))
        {
            return Ok(());
        }

        info!(version = CURRENT_SCHEMA_VERSION, "recording schema version");
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pre-allocates ~100 MB of freelist pages.
    ///
    /// Keeps the database writable when the disk fills mid-run: updates then
    /// reuse freelist pages instead of failing on file growth.
    async fn pre_allocate(&self) -> Result<(), DbError> {
        let (freelist,): (i64,) = sqlx::query_as("PRAGMA freelist_count")
            .fetch_one(&self.pool)
            .await?;

        if freelist > PRE_ALLOCATE_FREELIST_FLOOR {
            return Ok(());
        }

        debug!(freelist, "pre-allocating database freelist pages");
        sqlx::query("CREATE TABLE IF NOT EXISTS t(x)")
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO t VALUES (zeroblob(100 * 1024 * 1024))")
            .execute(&self.pool)
            .await?;
        sqlx::query("DROP TABLE t").execute(&self.pool).await?;
        Ok(())
    }
}

/// Compares two dotted numeric versions; true when `version >= minimum`.
///
/// Non-numeric segments compare as zero; missing segments compare as zero.
fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (version, minimum) = (parse(version), parse(minimum));
    let len = version.len().max(minimum.len());
    for i in 0..len {
        let a = version.get(i).copied().unwrap_or(0);
        let b = minimum.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}
