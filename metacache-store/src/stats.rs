//! Store statistics.

use crate::error::StoreResult;
use crate::store::{now_millis, to_datetime, MetadataStore};
use chrono::{DateTime, Utc};
use metacache_types::{EnvironmentId, Fingerprint, GlobalVersionId};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// Whole-store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub environments: u64,
    pub global_versions: u64,
    pub data_entities: u64,
    pub public_entities: u64,
    pub entity_properties: u64,
    pub entity_actions: u64,
    pub enumerations: u64,
    pub enumeration_members: u64,
    pub live_labels: u64,
    pub expired_labels: u64,
    pub temporary_labels: u64,
    pub label_hits: u64,
    pub search_documents: u64,
    /// Size of the database pages in bytes.
    pub storage_bytes: u64,
    pub versions: Vec<VersionUsage>,
}

/// Per-version usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionUsage {
    pub id: GlobalVersionId,
    pub fingerprint: Fingerprint,
    pub reference_count: i64,
    pub bound_environments: u64,
    pub data_entities: u64,
    pub public_entities: u64,
    pub enumerations: u64,
    pub labels: u64,
    pub last_used_at: DateTime<Utc>,
}

/// Per-environment view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStatistics {
    pub id: EnvironmentId,
    pub base_url: String,
    pub name: String,
    pub current_version: Option<GlobalVersionId>,
    pub bindings: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl MetadataStore {
    pub fn statistics(&self) -> StoreResult<StoreStatistics> {
        let conn = self.conn()?;
        let count = |sql: &str| -> StoreResult<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };

        let now = now_millis();
        let (live_labels, expired_labels, temporary_labels, label_hits): (i64, i64, i64, i64) =
            conn.query_row(
                "SELECT COALESCE(SUM(expires_at > ?1), 0),
                        COALESCE(SUM(expires_at <= ?1), 0),
                        COALESCE(SUM(global_version_id = ?2), 0),
                        COALESCE(SUM(hit_count), 0)
                 FROM labels",
                params![now, GlobalVersionId::TEMPORARY.get()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
        let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT g.id, g.fingerprint, g.reference_count, g.last_used_at,
                    (SELECT COUNT(*) FROM environments e WHERE e.current_version_id = g.id),
                    (SELECT COUNT(*) FROM data_entities d WHERE d.global_version_id = g.id),
                    (SELECT COUNT(*) FROM public_entities p WHERE p.global_version_id = g.id),
                    (SELECT COUNT(*) FROM enumerations n WHERE n.global_version_id = g.id),
                    (SELECT COUNT(*) FROM labels l WHERE l.global_version_id = g.id)
             FROM global_versions g ORDER BY g.id",
        )?;
        let versions = stmt
            .query_map([], |row| {
                Ok(VersionUsage {
                    id: GlobalVersionId::new(row.get(0)?),
                    fingerprint: Fingerprint::new(row.get::<_, String>(1)?),
                    reference_count: row.get(2)?,
                    last_used_at: to_datetime(row.get(3)?),
                    bound_environments: row.get::<_, i64>(4)? as u64,
                    data_entities: row.get::<_, i64>(5)? as u64,
                    public_entities: row.get::<_, i64>(6)? as u64,
                    enumerations: row.get::<_, i64>(7)? as u64,
                    labels: row.get::<_, i64>(8)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreStatistics {
            environments: count("SELECT COUNT(*) FROM environments")?,
            global_versions: count("SELECT COUNT(*) FROM global_versions")?,
            data_entities: count("SELECT COUNT(*) FROM data_entities")?,
            public_entities: count("SELECT COUNT(*) FROM public_entities")?,
            entity_properties: count("SELECT COUNT(*) FROM entity_properties")?,
            entity_actions: count("SELECT COUNT(*) FROM entity_actions")?,
            enumerations: count("SELECT COUNT(*) FROM enumerations")?,
            enumeration_members: count("SELECT COUNT(*) FROM enumeration_members")?,
            live_labels: live_labels as u64,
            expired_labels: expired_labels as u64,
            temporary_labels: temporary_labels as u64,
            label_hits: label_hits as u64,
            search_documents: count("SELECT COUNT(*) FROM search_documents")?,
            storage_bytes: (page_count * page_size).max(0) as u64,
            versions,
        })
    }

    pub fn environment_statistics(&self) -> StoreResult<Vec<EnvironmentStatistics>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.base_url, e.name, e.current_version_id, e.last_sync_at,
                    (SELECT COUNT(*) FROM environment_versions ev WHERE ev.environment_id = e.id)
             FROM environments e ORDER BY e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EnvironmentStatistics {
                id: EnvironmentId::new(row.get(0)?),
                base_url: row.get(1)?,
                name: row.get(2)?,
                current_version: row.get::<_, Option<i64>>(3)?.map(GlobalVersionId::new),
                last_sync_at: row.get::<_, Option<i64>>(4)?.map(to_datetime),
                bindings: row.get::<_, i64>(5)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
