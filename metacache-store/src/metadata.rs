//! Schema fact persistence: data entities, public entity schemas, actions
//! and enumerations, each scoped to one global version.
//!
//! Writes are upserts keyed by natural name, so replaying a batch never
//! duplicates rows. Every write reindexes the affected search documents in
//! the same transaction.

use crate::error::StoreResult;
use crate::search::{self, FactKind};
use crate::store::MetadataStore;
use metacache_types::{
    ActionParameter, ActionReturnType, BindingKind, DataEntityInfo, EntityAction, EntityCategory,
    EntityProperty, Enumeration, EnumerationMember, GlobalVersionId, PublicEntitySchema,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Optional filters for data entity listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub category: Option<EntityCategory>,
    pub is_read_only: Option<bool>,
    pub data_service_enabled: Option<bool>,
    pub data_management_enabled: Option<bool>,
    /// Case-insensitive substring of the entity name.
    pub name_contains: Option<String>,
}

/// Optional filters for action listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFilter {
    /// Public entity the action belongs to.
    pub entity: Option<String>,
    pub binding_kind: Option<BindingKind>,
    pub name_contains: Option<String>,
}

/// An action together with the public entity that exposes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInfo {
    pub entity_name: String,
    pub action: EntityAction,
}

const DATA_ENTITY_COLUMNS: &str = "name, public_entity_name, public_collection_name, label_id, \
     label_text, category, data_service_enabled, data_management_enabled, is_read_only";

fn data_entity_from_row(row: &Row<'_>) -> rusqlite::Result<DataEntityInfo> {
    Ok(DataEntityInfo {
        name: row.get(0)?,
        public_entity_name: row.get(1)?,
        public_collection_name: row.get(2)?,
        label_id: row.get(3)?,
        label_text: row.get(4)?,
        category: row
            .get::<_, String>(5)?
            .parse()
            .unwrap_or(EntityCategory::Miscellaneous),
        data_service_enabled: row.get(6)?,
        data_management_enabled: row.get(7)?,
        is_read_only: row.get(8)?,
    })
}

fn limit_param(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |l| l as i64)
}

// ── Write helpers ────────────────────────────────────────────────

fn write_data_entity(conn: &Connection, version: GlobalVersionId, e: &DataEntityInfo) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO data_entities (global_version_id, name, public_entity_name,
             public_collection_name, label_id, label_text, category, data_service_enabled,
             data_management_enabled, is_read_only)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (global_version_id, name) DO UPDATE SET
             public_entity_name = excluded.public_entity_name,
             public_collection_name = excluded.public_collection_name,
             label_id = excluded.label_id,
             label_text = excluded.label_text,
             category = excluded.category,
             data_service_enabled = excluded.data_service_enabled,
             data_management_enabled = excluded.data_management_enabled,
             is_read_only = excluded.is_read_only",
    )?;
    stmt.execute(params![
        version.get(),
        e.name,
        e.public_entity_name,
        e.public_collection_name,
        e.label_id,
        e.label_text,
        e.category.as_str(),
        e.data_service_enabled,
        e.data_management_enabled,
        e.is_read_only,
    ])?;
    search::index_document(conn, version, FactKind::DataEntity, "", &e.name)
}

fn write_public_entity(
    conn: &Connection,
    version: GlobalVersionId,
    schema: &PublicEntitySchema,
) -> StoreResult<()> {
    let entity_id: i64 = conn.query_row(
        "INSERT INTO public_entities (global_version_id, name, entity_set_name, label_id,
             label_text, is_read_only, configuration_enabled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (global_version_id, name) DO UPDATE SET
             entity_set_name = excluded.entity_set_name,
             label_id = excluded.label_id,
             label_text = excluded.label_text,
             is_read_only = excluded.is_read_only,
             configuration_enabled = excluded.configuration_enabled
         RETURNING id",
        params![
            version.get(),
            schema.name,
            schema.entity_set_name,
            schema.label_id,
            schema.label_text,
            schema.is_read_only,
            schema.configuration_enabled,
        ],
        |row| row.get(0),
    )?;

    // Child rows are replaced as a unit so the stored schema always matches
    // the last write.
    search::remove_owned_documents(conn, version, FactKind::Action, &schema.name)?;
    conn.execute("DELETE FROM entity_properties WHERE entity_id = ?1", params![entity_id])?;
    conn.execute("DELETE FROM entity_actions WHERE entity_id = ?1", params![entity_id])?;

    {
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO entity_properties (entity_id, global_version_id, name,
                 type_name, data_type, label_id, label_text, is_key, is_mandatory, allow_edit,
                 ordinal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for (ordinal, p) in schema.properties.iter().enumerate() {
            stmt.execute(params![
                entity_id,
                version.get(),
                p.name,
                p.type_name,
                p.data_type,
                p.label_id,
                p.label_text,
                p.is_key,
                p.is_mandatory,
                p.allow_edit,
                ordinal as i64,
            ])?;
        }
    }

    {
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO entity_actions (entity_id, global_version_id, name,
                 binding_kind, return_type, return_is_collection, parameters_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for a in &schema.actions {
            stmt.execute(params![
                entity_id,
                version.get(),
                a.name,
                a.binding_kind.as_str(),
                a.return_type.as_ref().map(|r| r.type_name.as_str()),
                a.return_type.as_ref().is_some_and(|r| r.is_collection),
                serde_json::to_string(&a.parameters)?,
            ])?;
        }
    }

    search::index_document(conn, version, FactKind::PublicEntity, "", &schema.name)?;
    for a in &schema.actions {
        search::index_document(conn, version, FactKind::Action, &schema.name, &a.name)?;
    }
    Ok(())
}

fn write_enumeration(conn: &Connection, version: GlobalVersionId, e: &Enumeration) -> StoreResult<()> {
    let enumeration_id: i64 = conn.query_row(
        "INSERT INTO enumerations (global_version_id, name, label_id, label_text)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (global_version_id, name) DO UPDATE SET
             label_id = excluded.label_id,
             label_text = excluded.label_text
         RETURNING id",
        params![version.get(), e.name, e.label_id, e.label_text],
        |row| row.get(0),
    )?;
    conn.execute(
        "DELETE FROM enumeration_members WHERE enumeration_id = ?1",
        params![enumeration_id],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO enumeration_members (enumeration_id, global_version_id, name,
             value, label_id, label_text, configuration_enabled, ordinal)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (ordinal, m) in e.members.iter().enumerate() {
        stmt.execute(params![
            enumeration_id,
            version.get(),
            m.name,
            m.value,
            m.label_id,
            m.label_text,
            m.configuration_enabled,
            ordinal as i64,
        ])?;
    }
    search::index_document(conn, version, FactKind::Enumeration, "", &e.name)
}

// ── Read helpers ─────────────────────────────────────────────────

fn load_public_entity(
    conn: &Connection,
    version: GlobalVersionId,
    name: &str,
) -> StoreResult<Option<PublicEntitySchema>> {
    let header = conn
        .query_row(
            "SELECT id, name, entity_set_name, label_id, label_text, is_read_only,
                    configuration_enabled
             FROM public_entities
             WHERE global_version_id = ?1 AND (name = ?2 OR entity_set_name = ?2)
             ORDER BY (name = ?2) DESC LIMIT 1",
            params![version.get(), name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    PublicEntitySchema {
                        name: row.get(1)?,
                        entity_set_name: row.get(2)?,
                        label_id: row.get(3)?,
                        label_text: row.get(4)?,
                        is_read_only: row.get(5)?,
                        configuration_enabled: row.get(6)?,
                        properties: Vec::new(),
                        actions: Vec::new(),
                    },
                ))
            },
        )
        .optional()?;
    let Some((entity_id, mut schema)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT name, type_name, data_type, label_id, label_text, is_key, is_mandatory, allow_edit
         FROM entity_properties WHERE entity_id = ?1 ORDER BY ordinal",
    )?;
    let rows = stmt.query_map(params![entity_id], |row| {
        Ok(EntityProperty {
            name: row.get(0)?,
            type_name: row.get(1)?,
            data_type: row.get(2)?,
            label_id: row.get(3)?,
            label_text: row.get(4)?,
            is_key: row.get(5)?,
            is_mandatory: row.get(6)?,
            allow_edit: row.get(7)?,
        })
    })?;
    schema.properties = rows.collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT name, binding_kind, return_type, return_is_collection, parameters_json
         FROM entity_actions WHERE entity_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![entity_id], |row| action_columns(row, 0))?;
    for row in rows {
        schema.actions.push(action_from_columns(row?)?);
    }
    Ok(Some(schema))
}

type ActionColumns = (String, String, Option<String>, bool, String);

fn action_columns(row: &Row<'_>, offset: usize) -> rusqlite::Result<ActionColumns> {
    Ok((
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
        row.get(offset + 3)?,
        row.get(offset + 4)?,
    ))
}

fn action_from_columns(
    (name, binding_kind, return_type, is_collection, parameters_json): ActionColumns,
) -> StoreResult<EntityAction> {
    let parameters: Vec<ActionParameter> = serde_json::from_str(&parameters_json)?;
    Ok(EntityAction {
        name,
        binding_kind: binding_kind.parse().unwrap_or_default(),
        return_type: return_type.map(|type_name| ActionReturnType {
            type_name,
            is_collection,
        }),
        parameters,
    })
}

fn load_enumeration(
    conn: &Connection,
    version: GlobalVersionId,
    name: &str,
) -> StoreResult<Option<Enumeration>> {
    let header = conn
        .query_row(
            "SELECT id, name, label_id, label_text FROM enumerations
             WHERE global_version_id = ?1 AND name = ?2",
            params![version.get(), name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Enumeration {
                        name: row.get(1)?,
                        label_id: row.get(2)?,
                        label_text: row.get(3)?,
                        members: Vec::new(),
                    },
                ))
            },
        )
        .optional()?;
    let Some((enumeration_id, mut enumeration)) = header else {
        return Ok(None);
    };
    let mut stmt = conn.prepare_cached(
        "SELECT name, value, label_id, label_text, configuration_enabled
         FROM enumeration_members WHERE enumeration_id = ?1 ORDER BY ordinal",
    )?;
    let rows = stmt.query_map(params![enumeration_id], |row| {
        Ok(EnumerationMember {
            name: row.get(0)?,
            value: row.get(1)?,
            label_id: row.get(2)?,
            label_text: row.get(3)?,
            configuration_enabled: row.get(4)?,
        })
    })?;
    enumeration.members = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(Some(enumeration))
}

impl MetadataStore {
    // ── Data entities ────────────────────────────────────────────

    /// Upserts a batch of data entities in one transaction.
    pub fn upsert_data_entities(
        &self,
        version: GlobalVersionId,
        entities: &[DataEntityInfo],
    ) -> StoreResult<usize> {
        self.write(|tx| {
            for e in entities {
                write_data_entity(tx, version, e)?;
            }
            Ok(entities.len())
        })
    }

    /// Point lookup of a data entity by name.
    pub fn get_data_entity(
        &self,
        version: GlobalVersionId,
        name: &str,
    ) -> StoreResult<Option<DataEntityInfo>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {DATA_ENTITY_COLUMNS} FROM data_entities
                     WHERE global_version_id = ?1 AND name = ?2"
                ),
                params![version.get(), name],
                data_entity_from_row,
            )
            .optional()?)
    }

    /// Batch lookup of data entities. Names that are not cached are skipped.
    pub fn get_data_entities(
        &self,
        version: GlobalVersionId,
        names: &[String],
    ) -> StoreResult<Vec<DataEntityInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {DATA_ENTITY_COLUMNS} FROM data_entities
             WHERE global_version_id = ?1 AND name = ?2"
        ))?;
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            if let Some(e) = stmt
                .query_row(params![version.get(), name], data_entity_from_row)
                .optional()?
            {
                found.push(e);
            }
        }
        Ok(found)
    }

    /// Lists data entities matching `filter`, ordered by name.
    pub fn list_data_entities(
        &self,
        version: GlobalVersionId,
        filter: &EntityFilter,
        limit: Option<usize>,
    ) -> StoreResult<Vec<DataEntityInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {DATA_ENTITY_COLUMNS} FROM data_entities
             WHERE global_version_id = ?1
               AND (?2 IS NULL OR category = ?2)
               AND (?3 IS NULL OR is_read_only = ?3)
               AND (?4 IS NULL OR data_service_enabled = ?4)
               AND (?5 IS NULL OR data_management_enabled = ?5)
               AND (?6 IS NULL OR instr(lower(name), lower(?6)) > 0)
             ORDER BY name LIMIT ?7"
        ))?;
        let rows = stmt.query_map(
            params![
                version.get(),
                filter.category.map(|c| c.as_str()),
                filter.is_read_only,
                filter.data_service_enabled,
                filter.data_management_enabled,
                filter.name_contains,
                limit_param(limit),
            ],
            data_entity_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct public entity names referenced by the version's data entities.
    pub fn public_entity_names(&self, version: GlobalVersionId) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT public_entity_name FROM data_entities
             WHERE global_version_id = ?1 AND public_entity_name IS NOT NULL
               AND public_entity_name <> ''
             ORDER BY public_entity_name",
        )?;
        let rows = stmt.query_map(params![version.get()], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Public entity names referenced by data entities whose schema has not
    /// been stored yet. Lets an interrupted schema phase resume.
    pub fn missing_public_entity_names(&self, version: GlobalVersionId) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT d.public_entity_name FROM data_entities d
             WHERE d.global_version_id = ?1 AND d.public_entity_name IS NOT NULL
               AND d.public_entity_name <> ''
               AND NOT EXISTS (SELECT 1 FROM public_entities p
                               WHERE p.global_version_id = d.global_version_id
                                 AND p.name = d.public_entity_name)
             ORDER BY d.public_entity_name",
        )?;
        let rows = stmt.query_map(params![version.get()], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Public entity schemas ────────────────────────────────────

    /// Upserts one public entity schema with its properties and actions.
    pub fn upsert_public_entity_schema(
        &self,
        version: GlobalVersionId,
        schema: &PublicEntitySchema,
    ) -> StoreResult<()> {
        self.write(|tx| write_public_entity(tx, version, schema))
    }

    /// Upserts several schemas in one transaction.
    pub fn upsert_public_entity_schemas(
        &self,
        version: GlobalVersionId,
        schemas: &[PublicEntitySchema],
    ) -> StoreResult<usize> {
        self.write(|tx| {
            for schema in schemas {
                write_public_entity(tx, version, schema)?;
            }
            Ok(schemas.len())
        })
    }

    /// Looks up a public entity schema by entity name or entity set name.
    pub fn get_public_entity_schema(
        &self,
        version: GlobalVersionId,
        name: &str,
    ) -> StoreResult<Option<PublicEntitySchema>> {
        let conn = self.conn()?;
        load_public_entity(&conn, version, name)
    }

    /// Batch lookup of schemas; names that are not cached are skipped.
    pub fn get_public_entity_schemas(
        &self,
        version: GlobalVersionId,
        names: &[String],
    ) -> StoreResult<Vec<PublicEntitySchema>> {
        let conn = self.conn()?;
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            if let Some(schema) = load_public_entity(&conn, version, name)? {
                found.push(schema);
            }
        }
        Ok(found)
    }

    // ── Actions ──────────────────────────────────────────────────

    /// Lists actions matching `filter`, ordered by entity then action name.
    pub fn list_actions(
        &self,
        version: GlobalVersionId,
        filter: &ActionFilter,
        limit: Option<usize>,
    ) -> StoreResult<Vec<ActionInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT p.name, a.name, a.binding_kind, a.return_type, a.return_is_collection,
                    a.parameters_json
             FROM entity_actions a JOIN public_entities p ON p.id = a.entity_id
             WHERE a.global_version_id = ?1
               AND (?2 IS NULL OR p.name = ?2)
               AND (?3 IS NULL OR a.binding_kind = ?3)
               AND (?4 IS NULL OR instr(lower(a.name), lower(?4)) > 0)
             ORDER BY p.name, a.name LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                version.get(),
                filter.entity,
                filter.binding_kind.map(|k| k.as_str()),
                filter.name_contains,
                limit_param(limit),
            ],
            |row| Ok((row.get::<_, String>(0)?, action_columns(row, 1)?)),
        )?;
        let mut actions = Vec::new();
        for row in rows {
            let (entity_name, columns) = row?;
            actions.push(ActionInfo {
                entity_name,
                action: action_from_columns(columns)?,
            });
        }
        Ok(actions)
    }

    /// Every action with exactly this name, across entities.
    pub fn find_actions(&self, version: GlobalVersionId, name: &str) -> StoreResult<Vec<ActionInfo>> {
        let all = self.list_actions(
            version,
            &ActionFilter {
                name_contains: Some(name.to_string()),
                ..Default::default()
            },
            None,
        )?;
        Ok(all.into_iter().filter(|a| a.action.name == name).collect())
    }

    // ── Enumerations ─────────────────────────────────────────────

    /// Upserts a batch of enumerations with their members.
    pub fn upsert_enumerations(
        &self,
        version: GlobalVersionId,
        enumerations: &[Enumeration],
    ) -> StoreResult<usize> {
        self.write(|tx| {
            for e in enumerations {
                write_enumeration(tx, version, e)?;
            }
            Ok(enumerations.len())
        })
    }

    /// Point lookup of an enumeration by name.
    pub fn get_enumeration(
        &self,
        version: GlobalVersionId,
        name: &str,
    ) -> StoreResult<Option<Enumeration>> {
        let conn = self.conn()?;
        load_enumeration(&conn, version, name)
    }

    /// Batch lookup of enumerations; names that are not cached are skipped.
    pub fn get_enumerations(
        &self,
        version: GlobalVersionId,
        names: &[String],
    ) -> StoreResult<Vec<Enumeration>> {
        let conn = self.conn()?;
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            if let Some(e) = load_enumeration(&conn, version, name)? {
                found.push(e);
            }
        }
        Ok(found)
    }

    /// Enumeration names, optionally filtered by substring, ordered by name.
    pub fn list_enumeration_names(
        &self,
        version: GlobalVersionId,
        name_contains: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT name FROM enumerations
             WHERE global_version_id = ?1 AND (?2 IS NULL OR instr(lower(name), lower(?2)) > 0)
             ORDER BY name LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![version.get(), name_contains, limit_param(limit)],
            |row| row.get(0),
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
