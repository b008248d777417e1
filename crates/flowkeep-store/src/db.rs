//! SQLite database setup with WAL mode, mmap, and tuning pragmas.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Connection tuning applied when a database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pragmas {
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout_ms: u32,
    /// Bytes of the database file mapped into memory; 0 disables mmap.
    pub mmap_size: i64,
}

impl Default for Pragmas {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            mmap_size: 268_435_456,
        }
    }
}

/// Thread-safe handle to a SQLite database.
///
/// All read/write operations go through [`Database::execute`] which
/// dispatches onto the blocking thread pool via `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path` with default pragmas.
    ///
    /// This call blocks briefly (file I/O), so call it during startup before
    /// entering the main async loop, or wrap it in `spawn_blocking` yourself.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(path, Pragmas::default())
    }

    /// Open (or create) a database at `path` with explicit pragmas.
    pub fn open_with(path: impl AsRef<Path>, pragmas: Pragmas) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn, pragmas)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn, Pragmas::default())?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and run all pending migrations.
    pub async fn open_and_migrate(
        path: impl AsRef<Path> + Send + 'static,
        pragmas: Pragmas,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open_with(&path, pragmas)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(|conn| migration::run_all(conn)).await
    }

    /// Execute a closure against the connection on the blocking pool.
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM process_instances", [], |row| row.get(0))?;
    ///     Ok(count)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection, pragmas: Pragmas) -> StoreResult<()> {
        debug!(?pragmas, "applying SQLite pragmas");

        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL sync is safe with WAL: a power failure loses at most the
        // last transaction, never the file.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.pragma_update(None, "mmap_size", pragmas.mmap_size)?;

        // Negative value means KiB: -64000 = ~62 MiB page cache.
        conn.pragma_update(None, "cache_size", -64_000_i32)?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;

        conn.pragma_update(None, "busy_timeout", pragmas.busy_timeout_ms)?;

        info!(
            busy_timeout_ms = pragmas.busy_timeout_ms,
            mmap_size = pragmas.mmap_size,
            "database pragmas applied"
        );
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
