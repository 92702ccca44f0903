//! Full-text search over stored facts.
//!
//! Each fact (data entity, public entity, action, enumeration) has one row
//! in `search_documents` holding its filter columns and one row in the FTS5
//! table `metadata_search` sharing the same rowid. Documents are always
//! built from the stored rows, both when a fact is written and during a
//! full rebuild, so the two paths produce identical indexes.

use crate::error::{StoreError, StoreResult};
use crate::store::MetadataStore;
use metacache_types::{BindingKind, EntityCategory, GlobalVersionId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

const MAX_QUERY_TERMS: usize = 16;

/// Kind of fact a search document describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    DataEntity,
    PublicEntity,
    Action,
    Enumeration,
}

impl FactKind {
    pub const ALL: [Self; 4] = [
        Self::DataEntity,
        Self::PublicEntity,
        Self::Action,
        Self::Enumeration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataEntity => "data_entity",
            Self::PublicEntity => "public_entity",
            Self::Action => "action",
            Self::Enumeration => "enumeration",
        }
    }

    fn parse(s: &str) -> StoreResult<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown fact kind: {s}")))
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which versions a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VersionScope {
    /// Every stored version, for cross-version browsing.
    #[default]
    Any,
    Only(GlobalVersionId),
}

/// A free-text search with optional structured filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    /// Kinds to include; empty means all.
    pub kinds: Vec<FactKind>,
    pub scope: VersionScope,
    pub category: Option<EntityCategory>,
    pub binding_kind: Option<BindingKind>,
    pub is_read_only: Option<bool>,
    pub limit: usize,
}

impl SearchQuery {
    /// Default result limit.
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kinds: Vec::new(),
            scope: VersionScope::Any,
            category: None,
            binding_kind: None,
            is_read_only: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn kinds(mut self, kinds: &[FactKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn in_version(mut self, version: GlobalVersionId) -> Self {
        self.scope = VersionScope::Only(version);
        self
    }

    pub fn category(mut self, category: Option<EntityCategory>) -> Self {
        self.category = category;
        self
    }

    pub fn binding_kind(mut self, binding_kind: Option<BindingKind>) -> Self {
        self.binding_kind = binding_kind;
        self
    }

    pub fn read_only(mut self, is_read_only: Option<bool>) -> Self {
        self.is_read_only = is_read_only;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub kind: FactKind,
    pub name: String,
    /// Public entity exposing the action, for action hits.
    pub owner: Option<String>,
    pub global_version_id: GlobalVersionId,
    /// Relevance; higher is better.
    pub score: f64,
    /// Matching text with the hit terms wrapped in `[` `]`.
    pub snippet: String,
    pub category: Option<EntityCategory>,
    pub binding_kind: Option<BindingKind>,
    pub is_read_only: Option<bool>,
}

struct SearchDocument {
    terms: String,
    label: String,
    category: Option<String>,
    binding_kind: Option<String>,
    is_read_only: Option<bool>,
}

/// Splits identifiers into words: `CustomerV3Entity` → `Customer V 3 Entity`,
/// `VATNumber` → `VAT Number`.
pub(crate) fn split_words(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(prev) = current.chars().last() {
            let next = chars.get(i + 1).copied();
            let boundary = (prev.is_lowercase() && c.is_uppercase())
                || (prev.is_alphabetic() != c.is_alphabetic())
                || (prev.is_uppercase()
                    && c.is_uppercase()
                    && next.is_some_and(|n| n.is_lowercase()));
            if boundary {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn words_of<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .flat_map(split_words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turns user text into a safe FTS5 expression: every alphanumeric token
/// becomes a quoted prefix term, all terms must match.
pub(crate) fn match_expression(text: &str) -> StoreResult<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .take(MAX_QUERY_TERMS)
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        return Err(StoreError::QuerySafety(format!(
            "search pattern {text:?} contains no searchable terms"
        )));
    }
    Ok(terms.join(" "))
}

fn build_document(
    conn: &Connection,
    version: GlobalVersionId,
    kind: FactKind,
    owner: &str,
    name: &str,
) -> StoreResult<Option<SearchDocument>> {
    let v = version.get();
    let doc = match kind {
        FactKind::DataEntity => conn
            .query_row(
                "SELECT public_entity_name, public_collection_name, label_text, category,
                        is_read_only
                 FROM data_entities WHERE global_version_id = ?1 AND name = ?2",
                params![v, name],
                |row| {
                    let public: Option<String> = row.get(0)?;
                    let collection: Option<String> = row.get(1)?;
                    Ok(SearchDocument {
                        terms: words_of(
                            [Some(name), public.as_deref(), collection.as_deref()]
                                .into_iter()
                                .flatten(),
                        ),
                        label: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        category: row.get(3)?,
                        binding_kind: None,
                        is_read_only: row.get(4)?,
                    })
                },
            )
            .optional()?,
        FactKind::PublicEntity => {
            let header = conn
                .query_row(
                    "SELECT id, entity_set_name, label_text, is_read_only FROM public_entities
                     WHERE global_version_id = ?1 AND name = ?2",
                    params![v, name],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, bool>(3)?,
                        ))
                    },
                )
                .optional()?;
            match header {
                None => None,
                Some((id, entity_set, label, read_only)) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT name FROM entity_properties WHERE entity_id = ?1 ORDER BY ordinal",
                    )?;
                    let properties = stmt
                        .query_map(params![id], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut parts = vec![name];
                    parts.extend(entity_set.as_deref());
                    parts.extend(properties.iter().map(String::as_str));
                    Some(SearchDocument {
                        terms: words_of(parts),
                        label: label.unwrap_or_default(),
                        category: None,
                        binding_kind: None,
                        is_read_only: Some(read_only),
                    })
                }
            }
        }
        FactKind::Action => conn
            .query_row(
                "SELECT a.binding_kind FROM entity_actions a
                 JOIN public_entities p ON p.id = a.entity_id
                 WHERE a.global_version_id = ?1 AND p.name = ?2 AND a.name = ?3",
                params![v, owner, name],
                |row| {
                    Ok(SearchDocument {
                        terms: words_of([name, owner]),
                        label: String::new(),
                        category: None,
                        binding_kind: Some(row.get(0)?),
                        is_read_only: None,
                    })
                },
            )
            .optional()?,
        FactKind::Enumeration => {
            let header = conn
                .query_row(
                    "SELECT id, label_text FROM enumerations
                     WHERE global_version_id = ?1 AND name = ?2",
                    params![v, name],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()?;
            match header {
                None => None,
                Some((id, label)) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT name FROM enumeration_members WHERE enumeration_id = ?1
                         ORDER BY ordinal",
                    )?;
                    let members = stmt
                        .query_map(params![id], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut parts = vec![name];
                    parts.extend(members.iter().map(String::as_str));
                    Some(SearchDocument {
                        terms: words_of(parts),
                        label: label.unwrap_or_default(),
                        category: None,
                        binding_kind: None,
                        is_read_only: None,
                    })
                }
            }
        }
    };
    Ok(doc)
}

/// (Re)indexes one fact from its stored rows. A fact that no longer exists
/// loses its document.
pub(crate) fn index_document(
    conn: &Connection,
    version: GlobalVersionId,
    kind: FactKind,
    owner: &str,
    name: &str,
) -> StoreResult<()> {
    let Some(doc) = build_document(conn, version, kind, owner, name)? else {
        return remove_document(conn, version, kind, owner, name);
    };
    let doc_id: i64 = conn
        .prepare_cached(
            "INSERT INTO search_documents (global_version_id, kind, owner, name, category,
                 binding_kind, is_read_only)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (global_version_id, kind, owner, name) DO UPDATE SET
                 category = excluded.category,
                 binding_kind = excluded.binding_kind,
                 is_read_only = excluded.is_read_only
             RETURNING id",
        )?
        .query_row(
            params![
                version.get(),
                kind.as_str(),
                owner,
                name,
                doc.category,
                doc.binding_kind,
                doc.is_read_only
            ],
            |row| row.get(0),
        )?;
    conn.prepare_cached("DELETE FROM metadata_search WHERE rowid = ?1")?
        .execute(params![doc_id])?;
    conn.prepare_cached(
        "INSERT INTO metadata_search (rowid, name, terms, label) VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![doc_id, name, doc.terms, doc.label])?;
    Ok(())
}

fn remove_document(
    conn: &Connection,
    version: GlobalVersionId,
    kind: FactKind,
    owner: &str,
    name: &str,
) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM metadata_search WHERE rowid IN (
             SELECT id FROM search_documents
             WHERE global_version_id = ?1 AND kind = ?2 AND owner = ?3 AND name = ?4)",
        params![version.get(), kind.as_str(), owner, name],
    )?;
    conn.execute(
        "DELETE FROM search_documents
         WHERE global_version_id = ?1 AND kind = ?2 AND owner = ?3 AND name = ?4",
        params![version.get(), kind.as_str(), owner, name],
    )?;
    Ok(())
}

/// Drops every document of `kind` owned by `owner` (e.g. all actions of an
/// entity before its schema is rewritten).
pub(crate) fn remove_owned_documents(
    conn: &Connection,
    version: GlobalVersionId,
    kind: FactKind,
    owner: &str,
) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM metadata_search WHERE rowid IN (
             SELECT id FROM search_documents
             WHERE global_version_id = ?1 AND kind = ?2 AND owner = ?3)",
        params![version.get(), kind.as_str(), owner],
    )?;
    conn.execute(
        "DELETE FROM search_documents WHERE global_version_id = ?1 AND kind = ?2 AND owner = ?3",
        params![version.get(), kind.as_str(), owner],
    )?;
    Ok(())
}

/// Drops every document of a version.
pub(crate) fn remove_version_documents(conn: &Connection, version: GlobalVersionId) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM metadata_search WHERE rowid IN (
             SELECT id FROM search_documents WHERE global_version_id = ?1)",
        params![version.get()],
    )?;
    conn.execute(
        "DELETE FROM search_documents WHERE global_version_id = ?1",
        params![version.get()],
    )?;
    Ok(())
}

impl MetadataStore {
    /// Runs a ranked full-text search.
    pub fn search(&self, query: &SearchQuery) -> StoreResult<Vec<SearchHit>> {
        let expression = match_expression(&query.text)?;
        let version = match query.scope {
            VersionScope::Any => None,
            VersionScope::Only(v) => Some(v.get()),
        };
        let kinds = if query.kinds.is_empty() {
            None
        } else {
            let joined: Vec<&str> = query.kinds.iter().map(FactKind::as_str).collect();
            Some(format!(",{},", joined.join(",")))
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT d.kind, d.name, d.owner, d.global_version_id, d.category, d.binding_kind,
                    d.is_read_only,
                    -bm25(metadata_search, 10.0, 4.0, 2.0) AS score,
                    snippet(metadata_search, -1, '[', ']', '…', 12)
             FROM metadata_search
             CROSS JOIN search_documents d ON d.id = metadata_search.rowid
             WHERE metadata_search MATCH ?1
               AND (?2 IS NULL OR d.global_version_id = ?2)
               AND (?3 IS NULL OR instr(?3, ',' || d.kind || ',') > 0)
               AND (?4 IS NULL OR d.category = ?4)
               AND (?5 IS NULL OR d.binding_kind = ?5)
               AND (?6 IS NULL OR d.is_read_only = ?6)
             ORDER BY score DESC, d.kind, d.owner, d.name, d.global_version_id
             LIMIT ?7",
        )?;
        let rows = stmt.query_map(
            params![
                expression,
                version,
                kinds,
                query.category.map(|c| c.as_str()),
                query.binding_kind.map(|k| k.as_str()),
                query.is_read_only,
                query.limit as i64,
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<bool>>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )?;

        let mut hits = Vec::new();
        for row in rows {
            let (kind, name, owner, version, category, binding_kind, is_read_only, score, snippet) =
                row?;
            hits.push(SearchHit {
                kind: FactKind::parse(&kind)?,
                name,
                owner: (!owner.is_empty()).then_some(owner),
                global_version_id: GlobalVersionId::new(version),
                score,
                snippet,
                category: category.and_then(|c| c.parse().ok()),
                binding_kind: binding_kind.and_then(|b| b.parse().ok()),
                is_read_only,
            });
        }
        Ok(hits)
    }

    /// Rebuilds the search index from the fact tables, for one version or
    /// for the whole store. Returns the number of documents written.
    pub fn rebuild_search_index(&self, version: Option<GlobalVersionId>) -> StoreResult<usize> {
        let count = self.write(|tx| {
            match version {
                Some(v) => remove_version_documents(tx, v)?,
                None => tx.execute_batch(
                    "DELETE FROM metadata_search; DELETE FROM search_documents;",
                )?,
            }

            let keys: Vec<(i64, String, String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT global_version_id, 'data_entity', '', name FROM data_entities
                     WHERE ?1 IS NULL OR global_version_id = ?1
                     UNION ALL
                     SELECT global_version_id, 'public_entity', '', name FROM public_entities
                     WHERE ?1 IS NULL OR global_version_id = ?1
                     UNION ALL
                     SELECT a.global_version_id, 'action', p.name, a.name
                     FROM entity_actions a JOIN public_entities p ON p.id = a.entity_id
                     WHERE ?1 IS NULL OR a.global_version_id = ?1
                     UNION ALL
                     SELECT global_version_id, 'enumeration', '', name FROM enumerations
                     WHERE ?1 IS NULL OR global_version_id = ?1",
                )?;
                let rows = stmt.query_map(params![version.map(|v| v.get())], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            for (v, kind, owner, name) in &keys {
                index_document(tx, GlobalVersionId::new(*v), FactKind::parse(kind)?, owner, name)?;
            }
            tx.execute(
                "INSERT INTO metadata_search (metadata_search) VALUES ('optimize')",
                [],
            )?;
            Ok(keys.len())
        })?;
        info!(documents = count, scope = ?version, "rebuilt search index");
        Ok(count)
    }

    /// Number of indexed documents for a version.
    pub fn search_document_count(&self, version: GlobalVersionId) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM search_documents WHERE global_version_id = ?1",
            params![version.get()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}
