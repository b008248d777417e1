//! Embedded SQLite backend.
//!
//! Stores framed instance bytes in the `process_instances` table keyed by
//! `(process_id, id)`.  Entries carry no version stamp, so updates are
//! last-writer-wins.  `create` is still atomic: a single
//! `INSERT .. ON CONFLICT DO NOTHING` decides the winner when two callers
//! race on one id.
//!
//! Intended for one process owning the database file.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, instrument};

use super::{CursorGuard, CursorTracker, Page, RecordCursor, StorageBackend, StoredRecord};
use crate::concurrency::WriteCondition;
use crate::db::{Database, Pragmas};
use crate::error::{StoreError, StoreResult};

/// SQLite-backed strategy without versioning.
#[derive(Clone)]
pub struct EmbeddedBackend {
    db: Database,
    cursors: CursorTracker,
}

impl EmbeddedBackend {
    /// Wrap an already migrated database.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cursors: CursorTracker::new(),
        }
    }

    /// Open (or create) the database file at `path` and migrate it.
    pub async fn open(path: impl AsRef<Path>, pragmas: Pragmas) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = Database::open_and_migrate(path, pragmas).await?;
        Ok(Self::new(db))
    }

    /// Fresh in-memory database, migrated.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let db = Database::open_in_memory()?;
        db.run_migrations().await?;
        Ok(Self::new(db))
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl StorageBackend for EmbeddedBackend {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn supports_versioning(&self) -> bool {
        false
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn insert_if_absent(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> StoreResult<Option<u64>> {
        let ns = namespace.to_string();
        let k = key.to_string();
        let inserted = self
            .db
            .execute(move |conn| {
                let now = chrono::Utc::now().timestamp_millis();
                let changed = conn.execute(
                    "INSERT INTO process_instances (process_id, id, payload, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(process_id, id) DO NOTHING",
                    params![ns, k, payload, now],
                )?;
                Ok(changed == 1)
            })
            .await?;

        if !inserted {
            return Err(StoreError::DuplicateId {
                process_id: namespace.to_string(),
                id: key.to_string(),
            });
        }
        debug!("row inserted");
        Ok(None)
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn write(
        &self,
        namespace: &str,
        key: &str,
        payload: Vec<u8>,
        condition: WriteCondition,
    ) -> StoreResult<Option<u64>> {
        if let WriteCondition::ExpectVersion(version) = condition {
            debug!(version, "no versioning, writing unconditionally");
        }
        let ns = namespace.to_string();
        let k = key.to_string();
        self.db
            .execute(move |conn| {
                let now = chrono::Utc::now().timestamp_millis();
                conn.execute(
                    "INSERT INTO process_instances (process_id, id, payload, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(process_id, id)
                     DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                    params![ns, k, payload, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(None)
    }

    async fn read(&self, namespace: &str, key: &str) -> StoreResult<Option<StoredRecord>> {
        let ns = namespace.to_string();
        let k = key.to_string();
        self.db
            .execute(move |conn| {
                let payload: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT payload FROM process_instances WHERE process_id = ?1 AND id = ?2",
                        params![ns, k],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(payload.map(|payload| StoredRecord {
                    payload,
                    version: None,
                }))
            })
            .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let ns = namespace.to_string();
        let k = key.to_string();
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM process_instances WHERE process_id = ?1 AND id = ?2",
                    params![ns, k],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn contains(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let ns = namespace.to_string();
        let k = key.to_string();
        self.db
            .execute(move |conn| {
                let found: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM process_instances WHERE process_id = ?1 AND id = ?2)",
                    params![ns, k],
                    |row| row.get(0),
                )?;
                Ok(found)
            })
            .await
    }

    async fn count(&self, namespace: &str) -> StoreResult<u64> {
        let ns = namespace.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM process_instances WHERE process_id = ?1",
                    params![ns],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    async fn scan(&self, namespace: &str, page_size: usize) -> StoreResult<Box<dyn RecordCursor>> {
        if page_size == 0 {
            return Err(StoreError::InvalidArgument("page size must be positive".into()));
        }
        debug!(namespace, page_size, "embedded scan opened");
        Ok(Box::new(EmbeddedCursor {
            db: self.db.clone(),
            namespace: namespace.to_string(),
            after: None,
            page_size,
            exhausted: false,
            _guard: self.cursors.acquire(),
        }))
    }

    fn open_cursors(&self) -> usize {
        self.cursors.open()
    }
}

// ── cursor ───────────────────────────────────────────────────────────

/// Keyset-paged cursor ordered by instance id.
///
/// Each page is its own query, so no statement or lock is held between
/// pages.  Rows inserted behind the cursor's position are not visited.
struct EmbeddedCursor {
    db: Database,
    namespace: String,
    after: Option<String>,
    page_size: usize,
    exhausted: bool,
    _guard: CursorGuard,
}

#[async_trait]
impl RecordCursor for EmbeddedCursor {
    async fn next_page(&mut self) -> StoreResult<Page> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let ns = self.namespace.clone();
        let after = self.after.clone();
        let limit = self.page_size as i64;

        let page: Page = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, payload FROM process_instances
                     WHERE process_id = ?1 AND (?2 IS NULL OR id > ?2)
                     ORDER BY id
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![ns, after, limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        StoredRecord {
                            payload: row.get(1)?,
                            version: None,
                        },
                    ))
                })?;
                let mut page = Vec::new();
                for row in rows {
                    page.push(row?);
                }
                Ok(page)
            })
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.after = Some(last.clone());
        }
        Ok(page)
    }
}

// ── tests ────────────────────────────────────────────────────────────
