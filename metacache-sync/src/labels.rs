//! Cache-first label resolution.

use crate::error::{SyncError, SyncResult};
use crate::source::MetadataSource;
use metacache_store::{LabelCache, LabelEntry, LabelLookup};
use metacache_types::{GlobalVersionId, SyncPhase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where a resolved label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOrigin {
    Cache,
    Remote,
}

/// A label text returned by [`LabelResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLabel {
    pub label_id: String,
    pub language: String,
    pub text: String,
    pub origin: LabelOrigin,
    /// Read hits so far; zero for a label just fetched.
    pub hit_count: i64,
}

impl From<LabelEntry> for ResolvedLabel {
    fn from(e: LabelEntry) -> Self {
        Self {
            label_id: e.label_id,
            language: e.language,
            text: e.text,
            origin: LabelOrigin::Cache,
            hit_count: e.hit_count,
        }
    }
}

/// Resolves labels from the cache, fetching and caching misses.
#[derive(Clone)]
pub struct LabelResolver {
    cache: LabelCache,
    source: Arc<dyn MetadataSource>,
}

impl LabelResolver {
    pub fn new(cache: LabelCache, source: Arc<dyn MetadataSource>) -> Self {
        Self { cache, source }
    }

    pub fn cache(&self) -> &LabelCache {
        &self.cache
    }

    /// Resolves one label. `None` when neither the cache nor the remote
    /// knows it.
    pub async fn resolve(
        &self,
        version: Option<GlobalVersionId>,
        label_id: &str,
        language: &str,
    ) -> SyncResult<Option<ResolvedLabel>> {
        let ids = [label_id.to_string()];
        let mut found = self.resolve_batch(version, &ids, language).await?;
        Ok(found.remove(label_id))
    }

    /// Resolves several labels: cache hits first, then one remote call for
    /// the misses. Labels absent remotely are left out of the map.
    pub async fn resolve_batch(
        &self,
        version: Option<GlobalVersionId>,
        label_ids: &[String],
        language: &str,
    ) -> SyncResult<HashMap<String, ResolvedLabel>> {
        let hits = {
            let cache = self.cache.clone();
            let (ids, lang) = (label_ids.to_vec(), language.to_string());
            tokio::task::spawn_blocking(move || cache.get_labels_batch(version, &ids, &lang))
                .await??
        };
        let mut resolved: HashMap<String, ResolvedLabel> = hits
            .into_iter()
            .map(|(id, entry)| (id, entry.into()))
            .collect();

        let mut misses: Vec<String> = label_ids
            .iter()
            .filter(|id| !resolved.contains_key(*id))
            .cloned()
            .collect();
        misses.sort();
        misses.dedup();
        if misses.is_empty() {
            return Ok(resolved);
        }

        let fetched = self
            .source
            .fetch_labels(&misses, language)
            .await
            .map_err(|source| SyncError::RemoteFetch {
                phase: SyncPhase::Labels,
                source,
            })?;
        debug!(
            requested = misses.len(),
            fetched = fetched.len(),
            "fetched missing labels"
        );
        if fetched.is_empty() {
            return Ok(resolved);
        }

        let pairs: Vec<(String, String)> = fetched
            .iter()
            .map(|(id, text)| (id.clone(), text.clone()))
            .collect();
        {
            let cache = self.cache.clone();
            let lang = language.to_string();
            tokio::task::spawn_blocking(move || cache.set_labels_batch(version, &pairs, &lang))
                .await??;
        }

        for (id, text) in fetched {
            resolved.insert(
                id.clone(),
                ResolvedLabel {
                    label_id: id,
                    language: language.to_string(),
                    text,
                    origin: LabelOrigin::Remote,
                    hit_count: 0,
                },
            );
        }
        Ok(resolved)
    }

    /// Cache-only lookup.
    pub async fn cached(
        &self,
        version: Option<GlobalVersionId>,
        label_id: &str,
        language: &str,
    ) -> SyncResult<LabelLookup> {
        let cache = self.cache.clone();
        let (id, lang) = (label_id.to_string(), language.to_string());
        Ok(tokio::task::spawn_blocking(move || cache.get_label(version, &id, &lang)).await??)
    }
}
