//! Environments, fingerprint-keyed global versions and their bindings.

use crate::error::{StoreError, StoreResult};
use crate::labels;
use crate::search;
use crate::store::{now_millis, to_datetime, MetadataStore};
use chrono::{DateTime, Utc};
use metacache_types::{EnvironmentId, Fingerprint, GlobalVersionId, ModuleVersion, SyncPhase};
use rusqlite::{params, ErrorCode, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A cached remote environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub base_url: String,
    pub name: String,
    /// Version the environment is currently bound to.
    pub current_version: Option<GlobalVersionId>,
    pub created_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A fingerprint-keyed, shareable bundle of cached facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVersion {
    pub id: GlobalVersionId,
    pub fingerprint: Fingerprint,
    /// Number of environment bindings (and in-flight syncs) holding this version.
    pub reference_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Result of [`MetadataStore::acquire_version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredVersion {
    pub version: GlobalVersion,
    /// `true` when this call inserted the version row.
    pub created: bool,
}

/// One row of an environment's binding history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVersion {
    pub environment_id: EnvironmentId,
    pub global_version_id: GlobalVersionId,
    pub bound_at: DateTime<Utc>,
}

const ENVIRONMENT_COLUMNS: &str = "id, base_url, name, current_version_id, created_at, last_sync_at";
const VERSION_COLUMNS: &str = "id, fingerprint, reference_count, first_seen_at, last_used_at";

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: EnvironmentId::new(row.get(0)?),
        base_url: row.get(1)?,
        name: row.get(2)?,
        current_version: row.get::<_, Option<i64>>(3)?.map(GlobalVersionId::new),
        created_at: to_datetime(row.get(4)?),
        last_sync_at: row.get::<_, Option<i64>>(5)?.map(to_datetime),
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<GlobalVersion> {
    Ok(GlobalVersion {
        id: GlobalVersionId::new(row.get(0)?),
        fingerprint: Fingerprint::new(row.get::<_, String>(1)?),
        reference_count: row.get(2)?,
        first_seen_at: to_datetime(row.get(3)?),
        last_used_at: to_datetime(row.get(4)?),
    })
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

fn version_by_fingerprint(
    tx: &Transaction<'_>,
    fingerprint: &Fingerprint,
) -> StoreResult<Option<GlobalVersion>> {
    Ok(tx
        .query_row(
            &format!("SELECT {VERSION_COLUMNS} FROM global_versions WHERE fingerprint = ?1"),
            params![fingerprint.as_str()],
            version_from_row,
        )
        .optional()?)
}

impl MetadataStore {
    // ── Environments ─────────────────────────────────────────────

    /// Returns the environment for `base_url`, creating it on first use.
    /// The name given on creation is kept; later names are ignored.
    pub fn get_or_create_environment(&self, base_url: &str, name: &str) -> StoreResult<Environment> {
        let base_url = normalize_base_url(base_url);
        if base_url.is_empty() {
            return Err(StoreError::InvalidData("environment base URL is empty".into()));
        }
        self.write(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO environments (base_url, name, created_at) VALUES (?1, ?2, ?3)",
                params![base_url, name, now_millis()],
            )?;
            if inserted == 1 {
                info!(base_url = %base_url, name, "registered environment");
            }
            Ok(tx.query_row(
                &format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE base_url = ?1"),
                params![base_url],
                environment_from_row,
            )?)
        })
    }

    /// Loads an environment by id.
    pub fn get_environment(&self, id: EnvironmentId) -> StoreResult<Option<Environment>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = ?1"),
                params![id.get()],
                environment_from_row,
            )
            .optional()?)
    }

    /// Lists all known environments.
    pub fn list_environments(&self) -> StoreResult<Vec<Environment>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments ORDER BY id"))?;
        let rows = stmt.query_map([], environment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Global versions ──────────────────────────────────────────

    /// Gets or creates the global version for `fingerprint`, taking one
    /// reference on it.
    ///
    /// A concurrent insert of the same fingerprint surfaces as a constraint
    /// violation, which is resolved by reusing the existing row.
    pub fn acquire_version(
        &self,
        fingerprint: &Fingerprint,
        modules: &[ModuleVersion],
    ) -> StoreResult<AcquiredVersion> {
        self.write(|tx| {
            let now = now_millis();
            let inserted = tx.execute(
                "INSERT INTO global_versions (fingerprint, reference_count, first_seen_at, last_used_at)
                 VALUES (?1, 1, ?2, ?2)",
                params![fingerprint.as_str(), now],
            );
            let created = match inserted {
                Ok(_) => true,
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    tx.execute(
                        "UPDATE global_versions
                         SET reference_count = reference_count + 1, last_used_at = ?2
                         WHERE fingerprint = ?1",
                        params![fingerprint.as_str(), now],
                    )?;
                    false
                }
                Err(e) => return Err(e.into()),
            };

            let version = version_by_fingerprint(tx, fingerprint)?.ok_or_else(|| {
                StoreError::NotFound(format!("global version {}", fingerprint.short()))
            })?;

            if created {
                for m in modules {
                    tx.execute(
                        "INSERT OR IGNORE INTO global_version_modules
                         (global_version_id, name, version, module, publisher, display_name)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            version.id.get(),
                            m.name,
                            m.version,
                            m.module,
                            m.publisher,
                            m.display_name
                        ],
                    )?;
                }
                info!(version = %version.id, fingerprint = %fingerprint.short(), "created global version");
            } else {
                debug!(
                    version = %version.id,
                    references = version.reference_count,
                    "reusing global version"
                );
            }
            Ok(AcquiredVersion { version, created })
        })
    }

    /// Drops one reference on a version. The row is never deleted here;
    /// see [`MetadataStore::purge_unreferenced_versions`].
    pub fn release_version(&self, id: GlobalVersionId) -> StoreResult<i64> {
        self.write(|tx| {
            tx.execute(
                "UPDATE global_versions SET reference_count = MAX(reference_count - 1, 0) WHERE id = ?1",
                params![id.get()],
            )?;
            let remaining: i64 = tx.query_row(
                "SELECT reference_count FROM global_versions WHERE id = ?1",
                params![id.get()],
                |row| row.get(0),
            )?;
            debug!(version = %id, remaining, "released global version");
            Ok(remaining)
        })
    }

    /// Looks up a version by fingerprint without touching its reference count.
    pub fn find_version(&self, fingerprint: &Fingerprint) -> StoreResult<Option<GlobalVersion>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM global_versions WHERE fingerprint = ?1"),
                params![fingerprint.as_str()],
                version_from_row,
            )
            .optional()?)
    }

    /// Looks up a version by id.
    pub fn get_version(&self, id: GlobalVersionId) -> StoreResult<Option<GlobalVersion>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM global_versions WHERE id = ?1"),
                params![id.get()],
                version_from_row,
            )
            .optional()?)
    }

    /// Lists every version, newest first.
    pub fn list_versions(&self) -> StoreResult<Vec<GlobalVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM global_versions ORDER BY id DESC"
        ))?;
        let rows = stmt.query_map([], version_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Module list a version was derived from, sorted by name.
    pub fn version_modules(&self, id: GlobalVersionId) -> StoreResult<Vec<ModuleVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, version, module, publisher, display_name
             FROM global_version_modules WHERE global_version_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![id.get()], |row| {
            Ok(ModuleVersion {
                name: row.get(0)?,
                version: row.get(1)?,
                module: row.get(2)?,
                publisher: row.get(3)?,
                display_name: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Bindings ─────────────────────────────────────────────────

    /// Binds an environment to a version the caller has already acquired,
    /// releasing the reference held by the previous binding. Live temporary
    /// labels are promoted to the version in the same transaction.
    ///
    /// Returns the previously bound version, if any.
    pub fn bind_environment(
        &self,
        environment: EnvironmentId,
        version: GlobalVersionId,
    ) -> StoreResult<Option<GlobalVersionId>> {
        self.write(|tx| {
            let references: i64 = tx
                .query_row(
                    "SELECT reference_count FROM global_versions WHERE id = ?1",
                    params![version.get()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("global version {version}")))?;
            if references < 1 {
                return Err(StoreError::ConstraintViolation(format!(
                    "global version {version} has no acquired reference to bind"
                )));
            }

            let previous: Option<i64> = tx
                .query_row(
                    "SELECT global_version_id FROM environment_versions
                     WHERE environment_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![environment.get()],
                    |row| row.get(0),
                )
                .optional()?;

            let now = now_millis();
            tx.execute(
                "INSERT INTO environment_versions (environment_id, global_version_id, bound_at)
                 VALUES (?1, ?2, ?3)",
                params![environment.get(), version.get(), now],
            )?;
            let updated = tx.execute(
                "UPDATE environments SET current_version_id = ?2, last_sync_at = ?3 WHERE id = ?1",
                params![environment.get(), version.get(), now],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("environment {environment}")));
            }
            tx.execute(
                "UPDATE global_versions SET last_used_at = ?2 WHERE id = ?1",
                params![version.get(), now],
            )?;

            if let Some(prev) = previous {
                tx.execute(
                    "UPDATE global_versions SET reference_count = MAX(reference_count - 1, 0) WHERE id = ?1",
                    params![prev],
                )?;
            }
            let promoted = labels::promote_temporary(tx, version)?;
            info!(environment = %environment, version = %version, promoted, "bound environment");
            Ok(previous.map(GlobalVersionId::new))
        })
    }

    /// Version the environment is currently bound to: the most recent row
    /// of its binding history.
    pub fn current_version(&self, environment: EnvironmentId) -> StoreResult<Option<GlobalVersion>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT g.id, g.fingerprint, g.reference_count, g.first_seen_at, g.last_used_at
                 FROM environment_versions ev
                 JOIN global_versions g ON g.id = ev.global_version_id
                 WHERE ev.environment_id = ?1
                 ORDER BY ev.id DESC LIMIT 1",
                params![environment.get()],
                version_from_row,
            )
            .optional()?)
    }

    /// Binding history of an environment, newest first.
    pub fn binding_history(
        &self,
        environment: EnvironmentId,
        limit: usize,
    ) -> StoreResult<Vec<EnvironmentVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT environment_id, global_version_id, bound_at FROM environment_versions
             WHERE environment_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![environment.get(), limit as i64], |row| {
            Ok(EnvironmentVersion {
                environment_id: EnvironmentId::new(row.get(0)?),
                global_version_id: GlobalVersionId::new(row.get(1)?),
                bound_at: to_datetime(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Phase markers ────────────────────────────────────────────

    /// Records that a populate phase finished for a version.
    pub fn mark_phase_complete(
        &self,
        version: GlobalVersionId,
        phase: SyncPhase,
        item_count: usize,
    ) -> StoreResult<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO global_version_phases
                 (global_version_id, phase, item_count, completed_at) VALUES (?1, ?2, ?3, ?4)",
                params![version.get(), phase.as_str(), item_count as i64, now_millis()],
            )?;
            Ok(())
        })
    }

    /// Phases recorded as complete for a version, in execution order.
    pub fn completed_phases(&self, version: GlobalVersionId) -> StoreResult<Vec<SyncPhase>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT phase FROM global_version_phases WHERE global_version_id = ?1")?;
        let rows = stmt.query_map(params![version.get()], |row| row.get::<_, String>(0))?;
        let mut phases = Vec::new();
        for row in rows {
            if let Ok(phase) = row?.parse::<SyncPhase>() {
                phases.push(phase);
            }
        }
        phases.sort();
        Ok(phases)
    }

    /// Whether every phase in `required` is complete for a version.
    pub fn is_populated(&self, version: GlobalVersionId, required: &[SyncPhase]) -> StoreResult<bool> {
        let done = self.completed_phases(version)?;
        Ok(required.iter().all(|p| done.contains(p)))
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Deletes unreferenced versions that no environment is bound to, with
    /// all their facts, labels and index rows. The `keep_latest` most
    /// recently used candidates are kept. Returns the number removed.
    pub fn purge_unreferenced_versions(&self, keep_latest: usize) -> StoreResult<usize> {
        self.write(|tx| {
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM global_versions
                     WHERE reference_count = 0
                       AND id NOT IN (SELECT current_version_id FROM environments
                                      WHERE current_version_id IS NOT NULL)
                     ORDER BY last_used_at DESC, id DESC
                     LIMIT -1 OFFSET ?1",
                )?;
                let rows = stmt.query_map(params![keep_latest as i64], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            for id in &ids {
                search::remove_version_documents(tx, GlobalVersionId::new(*id))?;
                for table in [
                    "entity_properties",
                    "entity_actions",
                    "public_entities",
                    "data_entities",
                    "enumeration_members",
                    "enumerations",
                    "labels",
                    "global_version_phases",
                    "global_version_modules",
                    "environment_versions",
                ] {
                    tx.execute(
                        &format!("DELETE FROM {table} WHERE global_version_id = ?1"),
                        params![id],
                    )?;
                }
                tx.execute("DELETE FROM global_versions WHERE id = ?1", params![id])?;
            }
            if !ids.is_empty() {
                info!(removed = ids.len(), "purged unreferenced global versions");
            }
            Ok(ids.len())
        })
    }
}
