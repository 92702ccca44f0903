//! Label rows: TTL-bounded translated texts keyed by
//! (label id, language, global version).
//!
//! A row is live while `expires_at > now`. Expired rows stay on disk until
//! [`MetadataStore::sweep_expired_labels`] removes them.

use crate::error::StoreResult;
use crate::store::{now_millis, to_datetime, MetadataStore};
use chrono::{DateTime, Utc};
use metacache_types::GlobalVersionId;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// A cached label text with its accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub label_id: String,
    pub language: String,
    pub global_version_id: GlobalVersionId,
    pub text: String,
    pub expires_at: DateTime<Utc>,
    /// Number of read hits, including the one that returned this entry.
    pub hit_count: i64,
    pub created_at: DateTime<Utc>,
}

const LABEL_COLUMNS: &str =
    "label_id, language, global_version_id, text, expires_at, hit_count, created_at";

fn label_from_row(row: &Row<'_>) -> rusqlite::Result<LabelEntry> {
    Ok(LabelEntry {
        label_id: row.get(0)?,
        language: row.get(1)?,
        global_version_id: GlobalVersionId::new(row.get(2)?),
        text: row.get(3)?,
        expires_at: to_datetime(row.get(4)?),
        hit_count: row.get(5)?,
        created_at: to_datetime(row.get(6)?),
    })
}

fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Counts a hit on a live row and returns it.
fn hit(
    conn: &Connection,
    version: GlobalVersionId,
    label_id: &str,
    language: &str,
    now: i64,
) -> StoreResult<Option<LabelEntry>> {
    Ok(conn
        .prepare_cached(&format!(
            "UPDATE labels SET hit_count = hit_count + 1, last_hit_at = ?4
             WHERE label_id = ?1 AND language = ?2 AND global_version_id = ?3
               AND expires_at > ?4
             RETURNING {LABEL_COLUMNS}"
        ))?
        .query_row(
            params![label_id, language, version.get(), now],
            label_from_row,
        )
        .optional()?)
}

fn upsert(
    conn: &Connection,
    version: GlobalVersionId,
    label_id: &str,
    language: &str,
    text: &str,
    now: i64,
    ttl: Duration,
) -> StoreResult<()> {
    conn.prepare_cached(
        "INSERT INTO labels (label_id, language, global_version_id, text, expires_at,
             hit_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
         ON CONFLICT (label_id, language, global_version_id) DO UPDATE SET
             text = excluded.text,
             expires_at = excluded.expires_at",
    )?
    .execute(params![
        label_id,
        language,
        version.get(),
        text,
        expiry(now, ttl),
        now
    ])?;
    Ok(())
}

impl MetadataStore {
    /// Reads a live label, counting the hit. Expired rows read as a miss.
    pub fn get_label(
        &self,
        version: GlobalVersionId,
        label_id: &str,
        language: &str,
    ) -> StoreResult<Option<LabelEntry>> {
        self.write(|tx| hit(tx, version, label_id, language, now_millis()))
    }

    /// Reads several live labels in one transaction. Misses are omitted.
    pub fn get_labels(
        &self,
        version: GlobalVersionId,
        label_ids: &[String],
        language: &str,
    ) -> StoreResult<Vec<LabelEntry>> {
        self.write(|tx| {
            let now = now_millis();
            let mut found = Vec::with_capacity(label_ids.len());
            for id in label_ids {
                if let Some(entry) = hit(tx, version, id, language, now)? {
                    found.push(entry);
                }
            }
            Ok(found)
        })
    }

    /// Reads a label row regardless of expiry without counting a hit.
    pub fn peek_label(
        &self,
        version: GlobalVersionId,
        label_id: &str,
        language: &str,
    ) -> StoreResult<Option<LabelEntry>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {LABEL_COLUMNS} FROM labels
                     WHERE label_id = ?1 AND language = ?2 AND global_version_id = ?3"
                ),
                params![label_id, language, version.get()],
                label_from_row,
            )
            .optional()?)
    }

    /// Stores a label that stays live for `ttl`. Rewriting a label refreshes
    /// its text and deadline and keeps its hit count.
    pub fn set_label(
        &self,
        version: GlobalVersionId,
        label_id: &str,
        language: &str,
        text: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.write(|tx| upsert(tx, version, label_id, language, text, now_millis(), ttl))
    }

    /// Stores `(label id, text)` pairs in one transaction.
    pub fn set_labels(
        &self,
        version: GlobalVersionId,
        labels: &[(String, String)],
        language: &str,
        ttl: Duration,
    ) -> StoreResult<usize> {
        self.write(|tx| {
            let now = now_millis();
            for (id, text) in labels {
                upsert(tx, version, id, language, text, now, ttl)?;
            }
            Ok(labels.len())
        })
    }

    /// Deletes expired label rows. Returns the number removed.
    pub fn sweep_expired_labels(&self) -> StoreResult<usize> {
        let removed = self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM labels WHERE expires_at <= ?1",
                params![now_millis()],
            )?)
        })?;
        if removed > 0 {
            debug!(removed, "swept expired labels");
        }
        Ok(removed)
    }

    /// Moves live temporary labels under `version`. Labels the version
    /// already holds win. Returns the number of rows promoted.
    pub fn promote_temporary_labels(&self, version: GlobalVersionId) -> StoreResult<usize> {
        if version.is_temporary() {
            return Ok(0);
        }
        let promoted = self.write(|tx| promote_temporary(tx, version))?;
        if promoted > 0 {
            debug!(version = %version, promoted, "promoted temporary labels");
        }
        Ok(promoted)
    }

    /// Label ids referenced by the version's facts (`@`-prefixed references)
    /// that have no live row for `language`, sorted.
    pub fn uncached_label_ids(
        &self,
        version: GlobalVersionId,
        language: &str,
    ) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "WITH referenced(label_id) AS (
                 SELECT label_id FROM data_entities WHERE global_version_id = ?1
                 UNION SELECT label_id FROM public_entities WHERE global_version_id = ?1
                 UNION SELECT label_id FROM entity_properties WHERE global_version_id = ?1
                 UNION SELECT label_id FROM enumerations WHERE global_version_id = ?1
                 UNION SELECT label_id FROM enumeration_members WHERE global_version_id = ?1
             )
             SELECT r.label_id FROM referenced r
             WHERE r.label_id LIKE '@%'
               AND NOT EXISTS (SELECT 1 FROM labels l
                               WHERE l.label_id = r.label_id AND l.language = ?2
                                 AND l.global_version_id = ?1 AND l.expires_at > ?3)
             ORDER BY r.label_id",
        )?;
        let rows = stmt.query_map(params![version.get(), language, now_millis()], |row| {
            row.get(0)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Promotion inside an open transaction, so it commits or rolls back with
/// the caller's other writes.
pub(crate) fn promote_temporary(tx: &Transaction<'_>, version: GlobalVersionId) -> StoreResult<usize> {
    let promoted = tx.execute(
        "INSERT OR IGNORE INTO labels (label_id, language, global_version_id, text,
             expires_at, hit_count, created_at, last_hit_at)
         SELECT label_id, language, ?1, text, expires_at, hit_count, created_at,
             last_hit_at
         FROM labels WHERE global_version_id = ?2 AND expires_at > ?3",
        params![version.get(), GlobalVersionId::TEMPORARY.get(), now_millis()],
    )?;
    tx.execute(
        "DELETE FROM labels WHERE global_version_id = ?1",
        params![GlobalVersionId::TEMPORARY.get()],
    )?;
    Ok(promoted)
}
