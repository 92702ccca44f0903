//! Smart sync engine.
//!
//! One invocation detects the remote version, decides whether the bound
//! version is already current, resolves (gets or creates) the global version
//! for the fingerprint, populates it phase by phase and finally binds the
//! environment to it.
//!
//! The acquired version reference is released on any failure or
//! cancellation, so an environment only ever binds to a version whose
//! population finished.

use crate::config::CacheConfig;
use crate::detector;
use crate::error::{SyncError, SyncResult};
use crate::progress::{PhaseEvent, ProgressSink};
use crate::source::MetadataSource;
use futures::future::join_all;
use metacache_store::{AcquiredVersion, Environment, MetadataStore, StoreResult};
use metacache_types::{EnvironmentId, Fingerprint, GlobalVersionId, ModuleVersion, SyncPhase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which phases a sync runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStrategy {
    /// Every phase.
    #[default]
    Full,
    /// Data entities and the search index.
    EntitiesOnly,
    /// Labels only.
    LabelsOnly,
    /// Every phase except labels.
    FullWithoutLabels,
    /// Bind to an existing fully populated version without fetching.
    SharingMode,
}

impl SyncStrategy {
    pub const ALL: [Self; 5] = [
        Self::Full,
        Self::EntitiesOnly,
        Self::LabelsOnly,
        Self::FullWithoutLabels,
        Self::SharingMode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::EntitiesOnly => "entitiesOnly",
            Self::LabelsOnly => "labelsOnly",
            Self::FullWithoutLabels => "fullWithoutLabels",
            Self::SharingMode => "sharingMode",
        }
    }

    /// Phases in execution order.
    pub fn phases(&self) -> &'static [SyncPhase] {
        match self {
            Self::Full => &SyncPhase::ALL,
            Self::EntitiesOnly => &[SyncPhase::Entities, SyncPhase::SearchIndex],
            Self::LabelsOnly => &[SyncPhase::Labels],
            Self::FullWithoutLabels => &[
                SyncPhase::Entities,
                SyncPhase::PublicEntitySchemas,
                SyncPhase::Enumerations,
                SyncPhase::SearchIndex,
            ],
            Self::SharingMode => &[],
        }
    }

    /// Whether phases already complete on a reused version are skipped.
    pub fn skips_completed_phases(&self) -> bool {
        matches!(self, Self::Full | Self::FullWithoutLabels)
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| SyncError::Config(format!("unknown sync strategy: {s}")))
    }
}

/// Parameters of one sync invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    pub strategy: SyncStrategy,
    /// Skips detection and uses this fingerprint.
    pub target_fingerprint: Option<Fingerprint>,
    /// Re-runs phases even when the version looks current.
    pub force: bool,
}

impl SyncRequest {
    pub fn new(strategy: SyncStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.target_fingerprint = Some(fingerprint);
        self
    }
}

/// Result of a successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub environment_id: EnvironmentId,
    pub global_version_id: GlobalVersionId,
    pub fingerprint: Fingerprint,
    /// The bound version was already current; nothing was fetched.
    pub short_circuited: bool,
    /// This sync created the global version.
    pub version_created: bool,
    /// Items written per executed phase.
    pub phases_run: BTreeMap<SyncPhase, u64>,
    pub phases_skipped: Vec<SyncPhase>,
    /// Version the environment was bound to before.
    pub previous_version_id: Option<GlobalVersionId>,
}

/// Orchestrates detection, population and binding for one environment.
pub struct SmartSyncEngine {
    store: Arc<MetadataStore>,
    source: Arc<dyn MetadataSource>,
    environment: Environment,
    config: CacheConfig,
}

impl SmartSyncEngine {
    /// Creates an engine for the environment at `base_url`, registering it
    /// on first use.
    pub async fn new(
        store: Arc<MetadataStore>,
        source: Arc<dyn MetadataSource>,
        base_url: &str,
        name: &str,
        config: CacheConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        let environment = {
            let store = Arc::clone(&store);
            let (base_url, name) = (base_url.to_string(), name.to_string());
            tokio::task::spawn_blocking(move || store.get_or_create_environment(&base_url, &name))
                .await??
        };
        Ok(Self {
            store,
            source,
            environment,
            config,
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn MetadataSource> {
        &self.source
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&MetadataStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    /// Version the environment is currently bound to.
    pub async fn bound_version(&self) -> SyncResult<Option<GlobalVersionId>> {
        let env_id = self.environment.id;
        self.blocking(move |s| Ok(s.current_version(env_id)?.map(|v| v.id))).await
    }

    /// Fetches the installed modules and fingerprints them.
    pub async fn detect_version(&self) -> SyncResult<(Fingerprint, Vec<ModuleVersion>)> {
        let modules = self
            .source
            .list_installed_modules()
            .await
            .map_err(|e| SyncError::Detection(format!("failed to list installed modules: {e}")))?;
        let fingerprint = detector::fingerprint(&modules)?;
        Ok((fingerprint, modules))
    }

    /// Runs one sync. Progress goes to `progress`; `cancel` is checked at
    /// phase and sub-batch boundaries.
    pub async fn sync(
        &self,
        request: &SyncRequest,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> SyncResult<SyncOutcome> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let env_id = self.environment.id;

        // Detect
        let detected = match &request.target_fingerprint {
            Some(fp) => Some((fp.clone(), Vec::new())),
            None => match self.detect_version().await {
                Ok(found) => Some(found),
                Err(e) => {
                    warn!(environment = %env_id, error = %e, "version detection failed, running a full sync");
                    None
                }
            },
        };

        let current = self
            .blocking(move |s| s.current_version(env_id))
            .await?;

        if request.strategy == SyncStrategy::SharingMode {
            return self.share(detected, current.map(|c| c.id), progress).await;
        }

        // Decide
        let strategy = if detected.is_some() {
            request.strategy
        } else {
            SyncStrategy::Full
        };
        progress.on_plan(strategy);
        if let (Some((fp, _)), Some(bound)) = (&detected, &current)
            && strategy == SyncStrategy::Full
            && !request.force
            && &bound.fingerprint == fp
        {
            let id = bound.id;
            if self
                .blocking(move |s| s.is_populated(id, &SyncPhase::ALL))
                .await?
            {
                info!(environment = %env_id, version = %id, "bound version is current, nothing to sync");
                for phase in SyncPhase::ALL {
                    progress.on_event(&PhaseEvent::Skipped {
                        phase,
                        reason: "version unchanged".into(),
                    });
                }
                return Ok(SyncOutcome {
                    environment_id: env_id,
                    global_version_id: id,
                    fingerprint: fp.clone(),
                    short_circuited: true,
                    version_created: false,
                    phases_run: BTreeMap::new(),
                    phases_skipped: SyncPhase::ALL.to_vec(),
                    previous_version_id: Some(id),
                });
            }
        }

        // Resolve
        let (fingerprint, modules) = detected
            .unwrap_or_else(|| (Fingerprint::new(format!("unknown-{}", Uuid::new_v4())), Vec::new()));
        let acquired = {
            let (fp, modules) = (fingerprint.clone(), modules);
            self.blocking(move |s| s.acquire_version(&fp, &modules)).await?
        };
        let version = acquired.version.id;
        info!(
            environment = %env_id,
            version = %version,
            fingerprint = %fingerprint.short(),
            created = acquired.created,
            strategy = %strategy,
            "resolved global version"
        );

        // Populate, then bind
        let result = match self
            .populate(&acquired, strategy, request.force, cancel, progress)
            .await
        {
            Ok((run, skipped)) => self.bind(version).await.map(|previous| (run, skipped, previous)),
            Err(e) => Err(e),
        };

        match result {
            Ok((phases_run, phases_skipped, previous_version_id)) => Ok(SyncOutcome {
                environment_id: env_id,
                global_version_id: version,
                fingerprint,
                short_circuited: false,
                version_created: acquired.created,
                phases_run,
                phases_skipped,
                previous_version_id,
            }),
            Err(e) => {
                if let Err(release_err) = self.blocking(move |s| s.release_version(version)).await {
                    warn!(version = %version, error = %release_err, "failed to release version");
                }
                Err(e)
            }
        }
    }

    async fn share(
        &self,
        detected: Option<(Fingerprint, Vec<ModuleVersion>)>,
        current: Option<GlobalVersionId>,
        progress: &dyn ProgressSink,
    ) -> SyncResult<SyncOutcome> {
        let env_id = self.environment.id;
        let Some((fingerprint, modules)) = detected else {
            return Err(SyncError::SharingUnavailable(
                "the remote version could not be detected".into(),
            ));
        };

        let existing = {
            let fp = fingerprint.clone();
            self.blocking(move |s| {
                let Some(v) = s.find_version(&fp)? else {
                    return Ok(None);
                };
                Ok(s.is_populated(v.id, &SyncPhase::ALL)?.then_some(v))
            })
            .await?
        };
        let Some(existing) = existing else {
            return Err(SyncError::SharingUnavailable(format!(
                "no populated version for fingerprint {}",
                fingerprint.short()
            )));
        };

        for phase in SyncPhase::ALL {
            progress.on_event(&PhaseEvent::Skipped {
                phase,
                reason: "shared version".into(),
            });
        }
        if current == Some(existing.id) {
            debug!(environment = %env_id, version = %existing.id, "already bound to shared version");
            return Ok(SyncOutcome {
                environment_id: env_id,
                global_version_id: existing.id,
                fingerprint,
                short_circuited: true,
                version_created: false,
                phases_run: BTreeMap::new(),
                phases_skipped: SyncPhase::ALL.to_vec(),
                previous_version_id: current,
            });
        }

        let acquired = {
            let fp = fingerprint.clone();
            self.blocking(move |s| s.acquire_version(&fp, &modules)).await?
        };
        let version = acquired.version.id;
        match self.bind(version).await {
            Ok(previous_version_id) => {
                info!(environment = %env_id, version = %version, "bound to shared version");
                Ok(SyncOutcome {
                    environment_id: env_id,
                    global_version_id: version,
                    fingerprint,
                    short_circuited: false,
                    version_created: false,
                    phases_run: BTreeMap::new(),
                    phases_skipped: SyncPhase::ALL.to_vec(),
                    previous_version_id,
                })
            }
            Err(e) => {
                if let Err(release_err) = self.blocking(move |s| s.release_version(version)).await {
                    warn!(version = %version, error = %release_err, "failed to release shared version");
                }
                Err(e)
            }
        }
    }

    async fn bind(&self, version: GlobalVersionId) -> SyncResult<Option<GlobalVersionId>> {
        let env_id = self.environment.id;
        self.blocking(move |s| s.bind_environment(env_id, version)).await
    }

    async fn populate(
        &self,
        acquired: &AcquiredVersion,
        strategy: SyncStrategy,
        force: bool,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> SyncResult<(BTreeMap<SyncPhase, u64>, Vec<SyncPhase>)> {
        let version = acquired.version.id;
        let resumable = !acquired.created && !force;
        let completed = if resumable && strategy.skips_completed_phases() {
            self.blocking(move |s| s.completed_phases(version)).await?
        } else {
            Vec::new()
        };

        let phases = strategy.phases();
        let mut run = BTreeMap::new();
        let mut skipped = Vec::new();

        for (i, &phase) in phases.iter().enumerate() {
            if cancel.is_cancelled() {
                for &rest in &phases[i..] {
                    progress.on_event(&PhaseEvent::Cancelled { phase: rest });
                }
                info!(version = %version, phase = %phase, "sync cancelled");
                return Err(SyncError::Cancelled);
            }
            if completed.contains(&phase) {
                debug!(version = %version, phase = %phase, "phase already complete");
                progress.on_event(&PhaseEvent::Skipped {
                    phase,
                    reason: "already populated".into(),
                });
                skipped.push(phase);
                continue;
            }

            progress.on_event(&PhaseEvent::Started { phase, total: None });
            let outcome = match phase {
                SyncPhase::Entities => self.sync_entities(version, cancel, progress).await,
                SyncPhase::PublicEntitySchemas => {
                    self.sync_schemas(version, resumable, cancel, progress).await
                }
                SyncPhase::Enumerations => self.sync_enumerations(version, cancel, progress).await,
                SyncPhase::Labels => self.sync_labels(version, cancel, progress).await,
                SyncPhase::SearchIndex => self.sync_search_index(version).await,
            };

            match outcome {
                Ok(count) => {
                    self.blocking(move |s| s.mark_phase_complete(version, phase, count as usize))
                        .await?;
                    progress.on_event(&PhaseEvent::Completed {
                        phase,
                        processed: count,
                    });
                    info!(version = %version, phase = %phase, items = count, "phase complete");
                    run.insert(phase, count);
                }
                Err(SyncError::Cancelled) => {
                    for &rest in &phases[i..] {
                        progress.on_event(&PhaseEvent::Cancelled { phase: rest });
                    }
                    info!(version = %version, phase = %phase, "sync cancelled");
                    return Err(SyncError::Cancelled);
                }
                Err(e) => {
                    warn!(version = %version, phase = %phase, error = %e, "phase failed");
                    progress.on_event(&PhaseEvent::Failed {
                        phase,
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
        Ok((run, skipped))
    }

    async fn sync_entities(
        &self,
        version: GlobalVersionId,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> SyncResult<u64> {
        let phase = SyncPhase::Entities;
        let entities = self
            .source
            .fetch_data_entities()
            .await
            .map_err(|source| SyncError::RemoteFetch { phase, source })?;
        let total = entities.len() as u64;
        progress.on_event(&PhaseEvent::Progress {
            phase,
            processed: 0,
            total: Some(total),
        });

        let mut written = 0u64;
        for chunk in entities.chunks(self.config.write_batch_size) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let chunk = chunk.to_vec();
            written += self
                .blocking(move |s| s.upsert_data_entities(version, &chunk))
                .await? as u64;
            progress.on_event(&PhaseEvent::Progress {
                phase,
                processed: written,
                total: Some(total),
            });
        }
        Ok(written)
    }

    async fn sync_schemas(
        &self,
        version: GlobalVersionId,
        resumable: bool,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> SyncResult<u64> {
        let phase = SyncPhase::PublicEntitySchemas;
        let names = if resumable {
            self.blocking(move |s| s.missing_public_entity_names(version))
                .await?
        } else {
            self.blocking(move |s| s.public_entity_names(version)).await?
        };
        let total = names.len() as u64;
        progress.on_event(&PhaseEvent::Progress {
            phase,
            processed: 0,
            total: Some(total),
        });

        let mut processed = 0u64;
        let mut written = 0u64;
        for batch in names.chunks(self.config.schema_concurrency) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|name| self.source.fetch_public_entity_schema(name)),
            )
            .await;

            // Schemas fetched before a failure are still stored so a retry
            // only fetches the missing ones.
            let mut schemas = Vec::with_capacity(batch.len());
            let mut failure = None;
            for (name, result) in batch.iter().zip(results) {
                match result {
                    Ok(Some(schema)) => schemas.push(schema),
                    Ok(None) => debug!(entity = %name, "public entity not found remotely"),
                    Err(source) => {
                        warn!(entity = %name, error = %source, "public entity schema fetch failed");
                        failure.get_or_insert(SyncError::RemoteFetch { phase, source });
                    }
                }
            }
            processed += batch.len() as u64;
            if !schemas.is_empty() {
                written += self
                    .blocking(move |s| s.upsert_public_entity_schemas(version, &schemas))
                    .await? as u64;
            }
            if let Some(e) = failure {
                return Err(e);
            }
            progress.on_event(&PhaseEvent::Progress {
                phase,
                processed,
                total: Some(total),
            });
        }
        Ok(written)
    }

    async fn sync_enumerations(
        &self,
        version: GlobalVersionId,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> SyncResult<u64> {
        let phase = SyncPhase::Enumerations;
        let enumerations = self
            .source
            .fetch_enumerations()
            .await
            .map_err(|source| SyncError::RemoteFetch { phase, source })?;
        let total = enumerations.len() as u64;

        let mut written = 0u64;
        for chunk in enumerations.chunks(self.config.write_batch_size) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let chunk = chunk.to_vec();
            written += self
                .blocking(move |s| s.upsert_enumerations(version, &chunk))
                .await? as u64;
            progress.on_event(&PhaseEvent::Progress {
                phase,
                processed: written,
                total: Some(total),
            });
        }
        Ok(written)
    }

    async fn sync_labels(
        &self,
        version: GlobalVersionId,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> SyncResult<u64> {
        let phase = SyncPhase::Labels;
        let language = self.config.language.clone();
        let ttl = self.config.label_ttl();
        let ids = {
            let language = language.clone();
            self.blocking(move |s| s.uncached_label_ids(version, &language))
                .await?
        };
        let total = ids.len() as u64;
        progress.on_event(&PhaseEvent::Progress {
            phase,
            processed: 0,
            total: Some(total),
        });

        let mut processed = 0u64;
        let mut stored = 0u64;
        for batch in ids.chunks(self.config.label_batch_size) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let fetched = self
                .source
                .fetch_labels(batch, &language)
                .await
                .map_err(|source| SyncError::RemoteFetch { phase, source })?;
            processed += batch.len() as u64;

            let mut pairs: Vec<(String, String)> = fetched.into_iter().collect();
            pairs.sort();
            if !pairs.is_empty() {
                let language = language.clone();
                stored += self
                    .blocking(move |s| s.set_labels(version, &pairs, &language, ttl))
                    .await? as u64;
            }
            progress.on_event(&PhaseEvent::Progress {
                phase,
                processed,
                total: Some(total),
            });
        }
        Ok(stored)
    }

    async fn sync_search_index(&self, version: GlobalVersionId) -> SyncResult<u64> {
        let count = self
            .blocking(move |s| s.rebuild_search_index(Some(version)))
            .await?;
        Ok(count as u64)
    }
}
