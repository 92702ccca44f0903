//! Connection management for the metadata store.

use crate::error::{StoreError, StoreResult};
use crate::migrations;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// File name of the store inside a cache root directory.
pub const STORE_FILE_NAME: &str = "metadata.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent metadata store backed by a single SQLite file.
///
/// All writes go through one connection, so writes within a process are
/// serialized. Each write method holds the connection only for its own
/// transaction, which lets reads interleave with a long-running sync.
pub struct MetadataStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl MetadataStore {
    /// Opens (or creates) the store file inside `cache_root`.
    pub fn open_in_dir(cache_root: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(cache_root).map_err(|e| {
            StoreError::Unavailable(format!(
                "failed to create cache root {}: {e}",
                cache_root.display()
            ))
        })?;
        Self::open(&cache_root.join(STORE_FILE_NAME))
    }

    /// Opens (or creates) a store at the given file path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("failed to open store {}: {e}", path.display()))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, path = %path.display(), "opened metadata store");

        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "metadata store ready");
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Unavailable(format!("failed to open in-memory store: {e}"))
        })?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store connection lock poisoned".to_string()))
    }

    /// Runs `f` inside an immediate write transaction and commits it.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
