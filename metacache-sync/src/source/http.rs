//! HTTP implementation of [`MetadataSource`] against the OData metadata
//! endpoints.
//!
//! Authentication is out of scope: the caller supplies an already acquired
//! bearer token.

use super::MetadataSource;
use crate::config::HttpSourceConfig;
use crate::detector;
use crate::error::{RemoteError, RemoteResult, SyncError, SyncResult};
use async_trait::async_trait;
use futures::future::join_all;
use metacache_types::{
    ActionParameter, ActionReturnType, DataEntityInfo, EntityAction, EntityProperty, Enumeration,
    EnumerationMember, ModuleVersion, PublicEntitySchema,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Service action listing installed modules.
pub const INSTALLED_MODULES_PATH: &str =
    "/api/services/SysInstalledModulesService/SysInstalledModulesServiceGroup/GetInstalledModules";

const MAX_ERROR_BODY: usize = 512;

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ODataPage<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireDataEntity {
    name: String,
    public_entity_name: Option<String>,
    public_collection_name: Option<String>,
    label_id: Option<String>,
    #[serde(default)]
    entity_category: Option<String>,
    #[serde(default)]
    data_service_enabled: bool,
    #[serde(default)]
    data_management_enabled: bool,
    #[serde(default)]
    is_read_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireProperty {
    name: String,
    #[serde(default)]
    type_name: String,
    #[serde(default)]
    data_type: String,
    label_id: Option<String>,
    #[serde(default)]
    is_key: bool,
    #[serde(default)]
    is_mandatory: bool,
    #[serde(default)]
    allow_edit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireTypeRef {
    name: String,
    #[serde(default)]
    is_collection: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireParameter {
    name: String,
    #[serde(rename = "Type")]
    type_ref: Option<WireTypeRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireAction {
    name: String,
    #[serde(default)]
    binding_kind: Option<String>,
    return_type: Option<WireTypeRef>,
    #[serde(default)]
    parameters: Vec<WireParameter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WirePublicEntity {
    name: String,
    entity_set_name: Option<String>,
    label_id: Option<String>,
    #[serde(default)]
    is_read_only: bool,
    #[serde(default)]
    configuration_enabled: bool,
    #[serde(default)]
    properties: Vec<WireProperty>,
    #[serde(default)]
    actions: Vec<WireAction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMember {
    name: String,
    #[serde(default)]
    value: i64,
    label_id: Option<String>,
    #[serde(default)]
    configuration_enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireEnumeration {
    name: String,
    label_id: Option<String>,
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireLabel {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireModules {
    Lines(Vec<String>),
    Wrapped {
        #[serde(rename = "parmVersionStrings")]
        lines: Vec<String>,
    },
}

impl From<WireDataEntity> for DataEntityInfo {
    fn from(w: WireDataEntity) -> Self {
        Self {
            name: w.name,
            public_entity_name: w.public_entity_name,
            public_collection_name: w.public_collection_name,
            label_id: w.label_id,
            label_text: None,
            category: w
                .entity_category
                .and_then(|c| c.parse().ok())
                .unwrap_or_default(),
            data_service_enabled: w.data_service_enabled,
            data_management_enabled: w.data_management_enabled,
            is_read_only: w.is_read_only,
        }
    }
}

impl From<WirePublicEntity> for PublicEntitySchema {
    fn from(w: WirePublicEntity) -> Self {
        Self {
            name: w.name,
            entity_set_name: w.entity_set_name,
            label_id: w.label_id,
            label_text: None,
            is_read_only: w.is_read_only,
            configuration_enabled: w.configuration_enabled,
            properties: w
                .properties
                .into_iter()
                .map(|p| EntityProperty {
                    name: p.name,
                    type_name: p.type_name,
                    data_type: p.data_type,
                    label_id: p.label_id,
                    label_text: None,
                    is_key: p.is_key,
                    is_mandatory: p.is_mandatory,
                    allow_edit: p.allow_edit,
                })
                .collect(),
            actions: w
                .actions
                .into_iter()
                .map(|a| EntityAction {
                    name: a.name,
                    binding_kind: a
                        .binding_kind
                        .and_then(|b| b.parse().ok())
                        .unwrap_or_default(),
                    return_type: a.return_type.map(|r| ActionReturnType {
                        type_name: r.name,
                        is_collection: r.is_collection,
                    }),
                    parameters: a
                        .parameters
                        .into_iter()
                        .map(|p| {
                            let (type_name, is_collection) = p
                                .type_ref
                                .map_or((String::new(), false), |t| (t.name, t.is_collection));
                            ActionParameter {
                                name: p.name,
                                type_name,
                                is_collection,
                            }
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

impl From<WireEnumeration> for Enumeration {
    fn from(w: WireEnumeration) -> Self {
        Self {
            name: w.name,
            label_id: w.label_id,
            label_text: None,
            members: w
                .members
                .into_iter()
                .map(|m| EnumerationMember {
                    name: m.name,
                    value: m.value,
                    label_id: m.label_id,
                    label_text: None,
                    configuration_enabled: m.configuration_enabled,
                })
                .collect(),
        }
    }
}

/// Quotes a value for use as an OData key literal inside a URL path.
fn key_literal(value: &str) -> String {
    urlencoding::encode(&value.replace('\'', "''")).into_owned()
}

fn map_transport(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_decode() {
        RemoteError::Decode(e.to_string())
    } else {
        RemoteError::Network(e.to_string())
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Metadata source backed by the remote OData metadata API.
pub struct HttpMetadataSource {
    config: HttpSourceConfig,
    client: Client,
}

impl HttpMetadataSource {
    /// Creates a source for `config.base_url`.
    pub fn new(config: HttpSourceConfig) -> SyncResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(SyncError::Config("base_url must not be empty".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self.authorize(request).send().await.map_err(map_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut message = response.text().await.unwrap_or_default();
        message.truncate(MAX_ERROR_BODY);
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> RemoteResult<T> {
        let response = self.send(self.client.get(url)).await?;
        response.json::<T>().await.map_err(map_transport)
    }

    /// GETs `path` and follows `@odata.nextLink` until the collection ends.
    async fn get_collection<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<Vec<T>> {
        let mut url = self.url(path);
        let mut items = Vec::new();
        loop {
            let page: ODataPage<T> = self.get_json(&url).await?;
            items.extend(page.value);
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }
        debug!(path, count = items.len(), "fetched collection");
        Ok(items)
    }

    async fn fetch_label(&self, id: &str, language: &str) -> RemoteResult<Option<String>> {
        let url = self.url(&format!(
            "/Metadata/Labels(Id='{}',Language='{}')",
            key_literal(id),
            key_literal(language)
        ));
        match self.get_json::<WireLabel>(&url).await {
            Ok(label) => Ok(label.value),
            Err(RemoteError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn list_installed_modules(&self) -> RemoteResult<Vec<ModuleVersion>> {
        let request = self
            .client
            .post(self.url(INSTALLED_MODULES_PATH))
            .json(&serde_json::json!({}));
        let response = self.send(request).await?;
        let lines = match response.json::<WireModules>().await.map_err(map_transport)? {
            WireModules::Lines(lines) | WireModules::Wrapped { lines } => lines,
        };

        let mut modules = Vec::with_capacity(lines.len());
        for line in lines.iter().filter(|l| !l.trim().is_empty()) {
            match detector::parse_module_line(line) {
                Ok(m) => modules.push(m),
                Err(e) => warn!(error = %e, "skipping installed module line"),
            }
        }
        Ok(modules)
    }

    async fn fetch_data_entities(&self) -> RemoteResult<Vec<DataEntityInfo>> {
        let wire: Vec<WireDataEntity> = self.get_collection("/Metadata/DataEntities").await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn fetch_public_entity_schema(
        &self,
        name: &str,
    ) -> RemoteResult<Option<PublicEntitySchema>> {
        let url = self.url(&format!("/Metadata/PublicEntities('{}')", key_literal(name)));
        match self.get_json::<WirePublicEntity>(&url).await {
            Ok(wire) => Ok(Some(wire.into())),
            Err(RemoteError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_enumerations(&self) -> RemoteResult<Vec<Enumeration>> {
        let wire: Vec<WireEnumeration> =
            self.get_collection("/Metadata/PublicEnumerations").await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn fetch_labels(
        &self,
        ids: &[String],
        language: &str,
    ) -> RemoteResult<HashMap<String, String>> {
        let results = join_all(ids.iter().map(|id| self.fetch_label(id, language))).await;
        let mut labels = HashMap::with_capacity(ids.len());
        for (id, result) in ids.iter().zip(results) {
            if let Some(text) = result? {
                labels.insert(id.clone(), text);
            }
        }
        Ok(labels)
    }
}
