//! Remote metadata source abstraction.
//!
//! The sync engine only talks to the remote system through
//! [`MetadataSource`]. [`http::HttpMetadataSource`] is the production
//! implementation; [`mock::MockMetadataSource`] backs the tests.

pub mod http;

use crate::error::RemoteResult;
use async_trait::async_trait;
use metacache_types::{DataEntityInfo, Enumeration, ModuleVersion, PublicEntitySchema};
use std::collections::HashMap;

/// Narrow interface to the remote metadata API.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Installed schema-defining modules, used for version detection.
    async fn list_installed_modules(&self) -> RemoteResult<Vec<ModuleVersion>>;

    /// The full data entity catalogue.
    async fn fetch_data_entities(&self) -> RemoteResult<Vec<DataEntityInfo>>;

    /// Schema of one public entity; `None` when the remote does not know it.
    async fn fetch_public_entity_schema(&self, name: &str)
    -> RemoteResult<Option<PublicEntitySchema>>;

    /// Every public enumeration with its members.
    async fn fetch_enumerations(&self) -> RemoteResult<Vec<Enumeration>>;

    /// Label texts for `ids` in `language`. Ids the remote does not know are
    /// absent from the map.
    async fn fetch_labels(
        &self,
        ids: &[String],
        language: &str,
    ) -> RemoteResult<HashMap<String, String>>;
}

/// In-memory source for tests.
pub mod mock {
    use super::*;
    use crate::error::RemoteError;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    /// Methods of [`MetadataSource`], for call counting and fault injection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MockMethod {
        ListInstalledModules,
        FetchDataEntities,
        FetchPublicEntitySchema,
        FetchEnumerations,
        FetchLabels,
    }

    impl MockMethod {
        const ALL: [Self; 5] = [
            Self::ListInstalledModules,
            Self::FetchDataEntities,
            Self::FetchPublicEntitySchema,
            Self::FetchEnumerations,
            Self::FetchLabels,
        ];

        fn index(self) -> usize {
            self as usize
        }
    }

    #[derive(Default)]
    struct MockState {
        modules: Vec<ModuleVersion>,
        entities: Vec<DataEntityInfo>,
        schemas: HashMap<String, PublicEntitySchema>,
        enumerations: Vec<Enumeration>,
        labels: HashMap<(String, String), String>,
        failures: HashMap<MockMethod, RemoteError>,
        failing_schemas: HashSet<String>,
        panicking: HashSet<MockMethod>,
    }

    /// A scripted metadata source.
    ///
    /// Fetch methods (everything except `list_installed_modules`) wait while
    /// the gate is closed, so tests can hold a sync mid-flight.
    pub struct MockMetadataSource {
        state: Mutex<MockState>,
        calls: [AtomicUsize; 5],
        gate: watch::Sender<bool>,
    }

    impl Default for MockMetadataSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockMetadataSource {
        pub fn new() -> Self {
            let (gate, _) = watch::channel(true);
            Self {
                state: Mutex::new(MockState::default()),
                calls: Default::default(),
                gate,
            }
        }

        pub fn with_modules(self, modules: Vec<ModuleVersion>) -> Self {
            self.set_modules(modules);
            self
        }

        pub fn with_entities(self, entities: Vec<DataEntityInfo>) -> Self {
            self.set_entities(entities);
            self
        }

        pub fn with_schemas(self, schemas: Vec<PublicEntitySchema>) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                for s in schemas {
                    state.schemas.insert(s.name.clone(), s);
                }
            }
            self
        }

        pub fn with_enumerations(self, enumerations: Vec<Enumeration>) -> Self {
            self.state.lock().unwrap().enumerations = enumerations;
            self
        }

        pub fn with_label(self, id: &str, language: &str, text: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .labels
                .insert((id.to_string(), language.to_string()), text.to_string());
            self
        }

        /// Replaces the installed modules (simulates a remote upgrade).
        pub fn set_modules(&self, modules: Vec<ModuleVersion>) {
            self.state.lock().unwrap().modules = modules;
        }

        pub fn set_entities(&self, entities: Vec<DataEntityInfo>) {
            self.state.lock().unwrap().entities = entities;
        }

        /// Makes every call of `method` fail with `error`.
        pub fn fail(&self, method: MockMethod, error: RemoteError) {
            self.state.lock().unwrap().failures.insert(method, error);
        }

        /// Makes schema fetches for one entity fail.
        pub fn fail_schema(&self, name: &str) {
            self.state
                .lock()
                .unwrap()
                .failing_schemas
                .insert(name.to_string());
        }

        /// Makes every call of `method` panic.
        pub fn panic_on(&self, method: MockMethod) {
            self.state.lock().unwrap().panicking.insert(method);
        }

        pub fn clear_failures(&self) {
            let mut state = self.state.lock().unwrap();
            state.failures.clear();
            state.failing_schemas.clear();
            state.panicking.clear();
        }

        /// Number of calls made to `method`.
        pub fn calls(&self, method: MockMethod) -> usize {
            self.calls[method.index()].load(Ordering::SeqCst)
        }

        /// Calls to every method except `list_installed_modules`.
        pub fn fetch_calls(&self) -> usize {
            MockMethod::ALL
                .into_iter()
                .filter(|m| *m != MockMethod::ListInstalledModules)
                .map(|m| self.calls(m))
                .sum()
        }

        pub fn reset_calls(&self) {
            for c in &self.calls {
                c.store(0, Ordering::SeqCst);
            }
        }

        /// Blocks fetches until [`open_gate`](Self::open_gate).
        pub fn close_gate(&self) {
            self.gate.send_replace(false);
        }

        pub fn open_gate(&self) {
            self.gate.send_replace(true);
        }

        async fn enter(&self, method: MockMethod) -> RemoteResult<()> {
            self.calls[method.index()].fetch_add(1, Ordering::SeqCst);
            if method != MockMethod::ListInstalledModules {
                let mut rx = self.gate.subscribe();
                let _ = rx.wait_for(|open| *open).await;
            }
            let panicking = self.state.lock().unwrap().panicking.contains(&method);
            if panicking {
                panic!("mock source panicked in {method:?}");
            }
            match self.state.lock().unwrap().failures.get(&method) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl MetadataSource for MockMetadataSource {
        async fn list_installed_modules(&self) -> RemoteResult<Vec<ModuleVersion>> {
            self.enter(MockMethod::ListInstalledModules).await?;
            Ok(self.state.lock().unwrap().modules.clone())
        }

        async fn fetch_data_entities(&self) -> RemoteResult<Vec<DataEntityInfo>> {
            self.enter(MockMethod::FetchDataEntities).await?;
            Ok(self.state.lock().unwrap().entities.clone())
        }

        async fn fetch_public_entity_schema(
            &self,
            name: &str,
        ) -> RemoteResult<Option<PublicEntitySchema>> {
            self.enter(MockMethod::FetchPublicEntitySchema).await?;
            let state = self.state.lock().unwrap();
            if state.failing_schemas.contains(name) {
                return Err(RemoteError::Status {
                    status: 500,
                    message: format!("schema {name} unavailable"),
                });
            }
            Ok(state.schemas.get(name).cloned())
        }

        async fn fetch_enumerations(&self) -> RemoteResult<Vec<Enumeration>> {
            self.enter(MockMethod::FetchEnumerations).await?;
            Ok(self.state.lock().unwrap().enumerations.clone())
        }

        async fn fetch_labels(
            &self,
            ids: &[String],
            language: &str,
        ) -> RemoteResult<HashMap<String, String>> {
            self.enter(MockMethod::FetchLabels).await?;
            let state = self.state.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| {
                    state
                        .labels
                        .get(&(id.clone(), language.to_string()))
                        .map(|text| (id.clone(), text.clone()))
                })
                .collect())
        }
    }
}
