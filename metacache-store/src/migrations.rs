//! Additive schema migrations.
//!
//! The store format is tracked in `PRAGMA user_version` as
//! `major * 1000 + minor`. Minor steps only add tables, columns or indexes,
//! so a binary that knows fewer minor steps can still read a newer file.
//! A newer major format is refused.

use crate::error::{StoreError, StoreResult};
use rusqlite::Connection;
use tracing::{info, warn};

pub(crate) const FORMAT_MAJOR: i64 = 1;

/// Minor migration steps, applied in order. Step `n` brings the minor
/// version to `n + 1`.
const MIGRATIONS: &[&str] = &[
    // 1: environments, versions and schema facts
    "
    CREATE TABLE IF NOT EXISTS global_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL UNIQUE,
        reference_count INTEGER NOT NULL DEFAULT 0 CHECK (reference_count >= 0),
        first_seen_at INTEGER NOT NULL,
        last_used_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS global_version_modules (
        global_version_id INTEGER NOT NULL REFERENCES global_versions(id),
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        module TEXT,
        publisher TEXT,
        display_name TEXT,
        PRIMARY KEY (global_version_id, name)
    );

    CREATE TABLE IF NOT EXISTS environments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        base_url TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        current_version_id INTEGER REFERENCES global_versions(id),
        created_at INTEGER NOT NULL,
        last_sync_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS environment_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        environment_id INTEGER NOT NULL REFERENCES environments(id),
        global_version_id INTEGER NOT NULL REFERENCES global_versions(id),
        bound_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_environment_versions_env
        ON environment_versions(environment_id, id);

    CREATE TABLE IF NOT EXISTS data_entities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        global_version_id INTEGER NOT NULL REFERENCES global_versions(id),
        name TEXT NOT NULL,
        public_entity_name TEXT,
        public_collection_name TEXT,
        label_id TEXT,
        label_text TEXT,
        category TEXT NOT NULL,
        data_service_enabled INTEGER NOT NULL,
        data_management_enabled INTEGER NOT NULL,
        is_read_only INTEGER NOT NULL,
        UNIQUE (global_version_id, name)
    );

    CREATE TABLE IF NOT EXISTS public_entities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        global_version_id INTEGER NOT NULL REFERENCES global_versions(id),
        name TEXT NOT NULL,
        entity_set_name TEXT,
        label_id TEXT,
        label_text TEXT,
        is_read_only INTEGER NOT NULL,
        configuration_enabled INTEGER NOT NULL,
        UNIQUE (global_version_id, name)
    );

    CREATE TABLE IF NOT EXISTS entity_properties (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id INTEGER NOT NULL REFERENCES public_entities(id) ON DELETE CASCADE,
        global_version_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        type_name TEXT NOT NULL,
        data_type TEXT NOT NULL,
        label_id TEXT,
        label_text TEXT,
        is_key INTEGER NOT NULL,
        is_mandatory INTEGER NOT NULL,
        allow_edit INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        UNIQUE (entity_id, name)
    );

    CREATE TABLE IF NOT EXISTS entity_actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id INTEGER NOT NULL REFERENCES public_entities(id) ON DELETE CASCADE,
        global_version_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        binding_kind TEXT NOT NULL,
        return_type TEXT,
        return_is_collection INTEGER NOT NULL DEFAULT 0,
        parameters_json TEXT NOT NULL,
        UNIQUE (entity_id, name)
    );

    CREATE TABLE IF NOT EXISTS enumerations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        global_version_id INTEGER NOT NULL REFERENCES global_versions(id),
        name TEXT NOT NULL,
        label_id TEXT,
        label_text TEXT,
        UNIQUE (global_version_id, name)
    );

    CREATE TABLE IF NOT EXISTS enumeration_members (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        enumeration_id INTEGER NOT NULL REFERENCES enumerations(id) ON DELETE CASCADE,
        global_version_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        value INTEGER NOT NULL,
        label_id TEXT,
        label_text TEXT,
        configuration_enabled INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        UNIQUE (enumeration_id, name)
    );

    CREATE TABLE IF NOT EXISTS labels (
        label_id TEXT NOT NULL,
        language TEXT NOT NULL,
        global_version_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        hit_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        last_hit_at INTEGER,
        PRIMARY KEY (label_id, language, global_version_id)
    );
    CREATE INDEX IF NOT EXISTS idx_labels_expires_at ON labels(expires_at);
    ",
    // 2: phase completion markers
    "
    CREATE TABLE IF NOT EXISTS global_version_phases (
        global_version_id INTEGER NOT NULL REFERENCES global_versions(id),
        phase TEXT NOT NULL,
        item_count INTEGER NOT NULL,
        completed_at INTEGER NOT NULL,
        PRIMARY KEY (global_version_id, phase)
    );
    ",
    // 3: full-text search index
    "
    CREATE TABLE IF NOT EXISTS search_documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        global_version_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        owner TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL,
        category TEXT,
        binding_kind TEXT,
        is_read_only INTEGER,
        UNIQUE (global_version_id, kind, owner, name)
    );

    CREATE VIRTUAL TABLE IF NOT EXISTS metadata_search USING fts5(
        name,
        terms,
        label,
        tokenize = 'unicode61'
    );
    ",
];

/// Current minor format known to this build.
pub(crate) fn format_minor() -> i64 {
    MIGRATIONS.len() as i64
}

/// Brings the store up to the current format.
pub(crate) fn apply(conn: &Connection) -> StoreResult<()> {
    let stored: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let (major, minor) = (stored / 1000, stored % 1000);

    if stored != 0 && major != FORMAT_MAJOR {
        return Err(StoreError::Migration(format!(
            "store format {major}.{minor} is not supported (expected major {FORMAT_MAJOR})"
        )));
    }

    if minor > format_minor() {
        warn!(
            stored_minor = minor,
            known_minor = format_minor(),
            "store written by a newer minor format; opening read-compatible"
        );
        return Ok(());
    }

    for (step, sql) in MIGRATIONS.iter().enumerate().skip(minor as usize) {
        let target = step as i64 + 1;
        conn.execute_batch(&format!(
            "BEGIN;\n{sql}\nPRAGMA user_version = {};\nCOMMIT;",
            FORMAT_MAJOR * 1000 + target
        ))
        .map_err(|e| {
            let _ = conn.execute_batch("ROLLBACK;");
            StoreError::Migration(format!("step {target} failed: {e}"))
        })?;
        info!(minor = target, "applied store migration");
    }
    Ok(())
}
