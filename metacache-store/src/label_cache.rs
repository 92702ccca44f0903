//! TTL- and hit-counted label cache over the metadata store.

use crate::error::StoreResult;
use crate::labels::LabelEntry;
use crate::store::MetadataStore;
use metacache_types::GlobalVersionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default time a label stays live.
pub const DEFAULT_LABEL_TTL: Duration = Duration::from_secs(60 * 60);

/// Outcome of a single label lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelLookup {
    Hit(LabelEntry),
    Miss,
}

impl LabelLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_entry(self) -> Option<LabelEntry> {
        match self {
            Self::Hit(entry) => Some(entry),
            Self::Miss => None,
        }
    }
}

/// Counts returned by [`LabelCache::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_removed: usize,
    pub promoted: usize,
}

/// Label cache keyed by (label id, language, version).
///
/// Methods take `Option<GlobalVersionId>`: `None` means no version has been
/// established yet and addresses the temporary sentinel. Reads against a
/// real version fall back to temporary entries.
#[derive(Clone)]
pub struct LabelCache {
    store: Arc<MetadataStore>,
    ttl: Duration,
}

fn resolve(version: Option<GlobalVersionId>) -> GlobalVersionId {
    version.unwrap_or(GlobalVersionId::TEMPORARY)
}

impl LabelCache {
    pub fn new(store: Arc<MetadataStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn get_label(
        &self,
        version: Option<GlobalVersionId>,
        label_id: &str,
        language: &str,
    ) -> StoreResult<LabelLookup> {
        let version = resolve(version);
        if let Some(entry) = self.store.get_label(version, label_id, language)? {
            return Ok(LabelLookup::Hit(entry));
        }
        if !version.is_temporary()
            && let Some(entry) =
                self.store
                    .get_label(GlobalVersionId::TEMPORARY, label_id, language)?
        {
            return Ok(LabelLookup::Hit(entry));
        }
        Ok(LabelLookup::Miss)
    }

    /// Looks up several labels. Only hits appear in the returned map.
    pub fn get_labels_batch(
        &self,
        version: Option<GlobalVersionId>,
        label_ids: &[String],
        language: &str,
    ) -> StoreResult<HashMap<String, LabelEntry>> {
        let version = resolve(version);
        let mut hits: HashMap<String, LabelEntry> = self
            .store
            .get_labels(version, label_ids, language)?
            .into_iter()
            .map(|e| (e.label_id.clone(), e))
            .collect();

        if !version.is_temporary() && hits.len() < label_ids.len() {
            let missing: Vec<String> = label_ids
                .iter()
                .filter(|id| !hits.contains_key(*id))
                .cloned()
                .collect();
            for entry in self
                .store
                .get_labels(GlobalVersionId::TEMPORARY, &missing, language)?
            {
                hits.insert(entry.label_id.clone(), entry);
            }
        }
        Ok(hits)
    }

    pub fn set_label(
        &self,
        version: Option<GlobalVersionId>,
        label_id: &str,
        language: &str,
        text: &str,
    ) -> StoreResult<()> {
        self.set_label_with_ttl(version, label_id, language, text, self.ttl)
    }

    pub fn set_label_with_ttl(
        &self,
        version: Option<GlobalVersionId>,
        label_id: &str,
        language: &str,
        text: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.store
            .set_label(resolve(version), label_id, language, text, ttl)
    }

    pub fn set_labels_batch(
        &self,
        version: Option<GlobalVersionId>,
        labels: &[(String, String)],
        language: &str,
    ) -> StoreResult<usize> {
        self.store
            .set_labels(resolve(version), labels, language, self.ttl)
    }

    /// Removes expired rows and, when a version is established, promotes
    /// temporary labels to it.
    pub fn sweep(&self, current: Option<GlobalVersionId>) -> StoreResult<SweepReport> {
        let expired_removed = self.store.sweep_expired_labels()?;
        let promoted = match current {
            Some(v) => self.store.promote_temporary_labels(v)?,
            None => 0,
        };
        let report = SweepReport {
            expired_removed,
            promoted,
        };
        debug!(?report, "label sweep finished");
        Ok(report)
    }
}
