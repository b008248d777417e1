//! Schema versioning for the embedded backend.
//!
//! The schema version lives in SQLite's `user_version` header field.  Each
//! step below runs in its own transaction together with the version bump,
//! so a crash leaves the database at the last completed step.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Schema steps, indexed by the version they produce (step `i` yields
/// version `i + 1`).
const STEPS: &[&str] = &[r#"
    CREATE TABLE process_instances (
        process_id TEXT NOT NULL,
        id         TEXT NOT NULL,
        payload    BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (process_id, id)
    ) WITHOUT ROWID;
"#];

/// Version a fully migrated database reports.
pub const SCHEMA_VERSION: u32 = STEPS.len() as u32;

/// Bring `conn` up to [`SCHEMA_VERSION`].  Synchronous; call it from the
/// blocking pool.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Migration {
            version: current,
            message: format!("database schema is newer than this build ({SCHEMA_VERSION})"),
        });
    }
    if current == SCHEMA_VERSION {
        debug!(version = current, "schema up to date");
        return Ok(());
    }

    for (version, sql) in (1..).zip(STEPS.iter()).skip(current as usize) {
        let fail = |e: rusqlite::Error| StoreError::Migration {
            version,
            message: e.to_string(),
        };
        let tx = conn.unchecked_transaction().map_err(fail)?;
        tx.execute_batch(sql).map_err(fail)?;
        tx.pragma_update(None, "user_version", version).map_err(fail)?;
        tx.commit().map_err(fail)?;
        info!(version, "schema migrated");
    }
    Ok(())
}

/// Schema version recorded in the database; 0 for a fresh file.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("cannot read schema version: {e}"),
        })
}

// ── tests ────────────────────────────────────────────────────────────
