//! Read-side facade over the store, scoped to one environment's bound version.

use crate::error::SyncResult;
use metacache_store::{
    EnvironmentStatistics, FactKind, GlobalVersion, LabelCache, LabelEntry, LabelLookup,
    MetadataStore, QueryResult, SearchHit, SearchQuery, StoreError, StoreResult, StoreStatistics,
};
use metacache_types::{
    BindingKind, DataEntityInfo, EntityCategory, Enumeration, EnvironmentId, GlobalVersionId,
    PublicEntitySchema,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const SUGGESTION_LIMIT: usize = 5;

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Lookup<T> {
    Hit(T),
    /// Not cached under that name; these cached facts are close matches.
    Suggestions(Vec<SearchHit>),
    /// Nothing cached. The caller may fall back to the remote API.
    Miss,
}

impl<T> Lookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn hit(self) -> Option<T> {
        match self {
            Self::Hit(v) => Some(v),
            _ => None,
        }
    }
}

/// Filters for [`MetadataQuery::search_entities`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySearch {
    pub category: Option<EntityCategory>,
    pub is_read_only: Option<bool>,
    /// Only data entities or only public entities; both when `None`.
    pub kind: Option<FactKind>,
}

/// Query surface for one environment.
#[derive(Clone)]
pub struct MetadataQuery {
    store: Arc<MetadataStore>,
    labels: LabelCache,
    environment: EnvironmentId,
}

impl MetadataQuery {
    pub fn new(store: Arc<MetadataStore>, labels: LabelCache, environment: EnvironmentId) -> Self {
        Self {
            store,
            labels,
            environment,
        }
    }

    pub fn environment(&self) -> EnvironmentId {
        self.environment
    }

    async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&MetadataStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    /// Version the environment is bound to.
    pub async fn current_version(&self) -> SyncResult<Option<GlobalVersion>> {
        let env = self.environment;
        self.blocking(move |s| s.current_version(env)).await
    }

    /// Runs `query` against the bound version. An unbound environment has
    /// nothing to search.
    async fn search_bound(&self, query: SearchQuery) -> SyncResult<Vec<SearchHit>> {
        let env = self.environment;
        self.blocking(move |s| match s.current_version(env)? {
            Some(v) => s.search(&query.in_version(v.id)),
            None => Ok(Vec::new()),
        })
        .await
    }

    pub async fn search_entities(
        &self,
        text: &str,
        filter: &EntitySearch,
        limit: usize,
    ) -> SyncResult<Vec<SearchHit>> {
        let kinds = match filter.kind {
            Some(k @ (FactKind::DataEntity | FactKind::PublicEntity)) => vec![k],
            _ => vec![FactKind::DataEntity, FactKind::PublicEntity],
        };
        let query = SearchQuery::new(text)
            .kinds(&kinds)
            .category(filter.category)
            .read_only(filter.is_read_only)
            .limit(limit);
        self.search_bound(query).await
    }

    pub async fn search_actions(
        &self,
        text: &str,
        binding_kind: Option<BindingKind>,
        limit: usize,
    ) -> SyncResult<Vec<SearchHit>> {
        let query = SearchQuery::new(text)
            .kinds(&[FactKind::Action])
            .binding_kind(binding_kind)
            .limit(limit);
        self.search_bound(query).await
    }

    pub async fn search_enumerations(&self, text: &str, limit: usize) -> SyncResult<Vec<SearchHit>> {
        let query = SearchQuery::new(text)
            .kinds(&[FactKind::Enumeration])
            .limit(limit);
        self.search_bound(query).await
    }

    /// Looks a fact up by exact name in the bound version, suggesting close
    /// matches of `kinds` when it is not cached.
    async fn lookup<T, F>(&self, name: &str, kinds: &[FactKind], get: F) -> SyncResult<Lookup<T>>
    where
        F: FnOnce(&MetadataStore, GlobalVersionId, &str) -> StoreResult<Option<T>> + Send + 'static,
        T: Send + 'static,
    {
        let env = self.environment;
        let name = name.to_string();
        let kinds = kinds.to_vec();
        self.blocking(move |s| {
            let Some(version) = s.current_version(env)? else {
                return Ok(Lookup::Miss);
            };
            if let Some(found) = get(s, version.id, &name)? {
                return Ok(Lookup::Hit(found));
            }
            let query = SearchQuery::new(name.as_str())
                .kinds(&kinds)
                .in_version(version.id)
                .limit(SUGGESTION_LIMIT);
            match s.search(&query) {
                Ok(hits) if !hits.is_empty() => Ok(Lookup::Suggestions(hits)),
                Ok(_) | Err(StoreError::QuerySafety(_)) => Ok(Lookup::Miss),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Schema of a public entity, by entity name or entity set name.
    pub async fn get_entity_schema(&self, name: &str) -> SyncResult<Lookup<PublicEntitySchema>> {
        self.lookup(name, &[FactKind::PublicEntity], |s, v, n| {
            s.get_public_entity_schema(v, n)
        })
        .await
    }

    pub async fn get_data_entity(&self, name: &str) -> SyncResult<Lookup<DataEntityInfo>> {
        self.lookup(name, &[FactKind::DataEntity], |s, v, n| s.get_data_entity(v, n))
            .await
    }

    pub async fn get_enumeration_info(&self, name: &str) -> SyncResult<Lookup<Enumeration>> {
        self.lookup(name, &[FactKind::Enumeration], |s, v, n| s.get_enumeration(v, n))
            .await
    }

    /// Cached label for the bound version, falling back to labels cached
    /// before any version was bound. Counts a hit.
    pub async fn get_label(&self, label_id: &str, language: &str) -> SyncResult<LabelLookup> {
        let version = self.current_version().await?.map(|v| v.id);
        let labels = self.labels.clone();
        let (id, lang) = (label_id.to_string(), language.to_string());
        Ok(tokio::task::spawn_blocking(move || labels.get_label(version, &id, &lang)).await??)
    }

    /// Cached labels for several ids; misses are absent from the map.
    pub async fn get_labels_batch(
        &self,
        label_ids: &[String],
        language: &str,
    ) -> SyncResult<HashMap<String, LabelEntry>> {
        let version = self.current_version().await?.map(|v| v.id);
        let labels = self.labels.clone();
        let (ids, lang) = (label_ids.to_vec(), language.to_string());
        Ok(
            tokio::task::spawn_blocking(move || labels.get_labels_batch(version, &ids, &lang))
                .await??,
        )
    }

    pub async fn statistics(&self) -> SyncResult<StoreStatistics> {
        self.blocking(|s| s.statistics()).await
    }

    pub async fn environment_statistics(&self) -> SyncResult<Vec<EnvironmentStatistics>> {
        self.blocking(|s| s.environment_statistics()).await
    }

    /// Guarded read-only SQL over the whole store.
    pub async fn execute_readonly_query(
        &self,
        sql: &str,
        max_rows: usize,
    ) -> SyncResult<QueryResult> {
        let sql = sql.to_string();
        self.blocking(move |s| s.execute_readonly_query(&sql, max_rows))
            .await
    }
}
