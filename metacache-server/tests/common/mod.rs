//! Test server and sample catalogue.

#![allow(dead_code)]

use metacache_server::{build_router, AppState};
use metacache_store::MetadataStore;
use metacache_sync::{CacheConfig, MetadataSource, MockMetadataSource, SyncRequest, SyncSession};
use metacache_types::{
    BindingKind, DataEntityInfo, EntityAction, EntityCategory, EntityProperty, Enumeration,
    EnumerationMember, ModuleVersion, PublicEntitySchema, SessionId,
};
use std::sync::Arc;

pub const CONTOSO: &str = "https://contoso.example.com";

fn entity(name: &str, public: &str, label: &str) -> DataEntityInfo {
    DataEntityInfo {
        name: name.to_string(),
        public_entity_name: Some(public.to_string()),
        public_collection_name: Some(format!("{public}s")),
        label_id: Some(label.to_string()),
        label_text: None,
        category: EntityCategory::Master,
        data_service_enabled: true,
        data_management_enabled: true,
        is_read_only: false,
    }
}

fn schema(name: &str, set: &str, action: &str, binding_kind: BindingKind) -> PublicEntitySchema {
    PublicEntitySchema {
        name: name.to_string(),
        entity_set_name: Some(set.to_string()),
        properties: vec![EntityProperty {
            name: "dataAreaId".to_string(),
            type_name: "Edm.String".to_string(),
            data_type: "String".to_string(),
            is_key: true,
            is_mandatory: true,
            ..Default::default()
        }],
        actions: vec![EntityAction {
            name: action.to_string(),
            binding_kind,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn mock() -> MockMetadataSource {
    MockMetadataSource::new()
        .with_modules(vec![ModuleVersion::new("AppSuite", "10.0.1")])
        .with_entities(vec![
            entity("CustCustomerV3Entity", "CustomerV3", "@SYS100"),
            entity("VendVendorV2Entity", "VendorV2", "@SYS200"),
        ])
        .with_schemas(vec![
            schema(
                "CustomerV3",
                "CustomersV3",
                "ValidateCreditLimit",
                BindingKind::BoundToEntityInstance,
            ),
            schema("VendorV2", "VendorsV2", "Approve", BindingKind::Unbound),
        ])
        .with_enumerations(vec![Enumeration {
            name: "NoYes".to_string(),
            label_id: Some("@ENUM1".to_string()),
            label_text: None,
            members: vec![
                EnumerationMember {
                    name: "No".to_string(),
                    value: 0,
                    ..Default::default()
                },
                EnumerationMember {
                    name: "Yes".to_string(),
                    value: 1,
                    ..Default::default()
                },
            ],
        }])
        .with_label("@SYS100", "en-US", "Customers")
        .with_label("@SYS200", "en-US", "Vendors")
        .with_label("@ENUM1", "en-US", "No or yes")
}

pub struct TestServer {
    pub base: String,
    pub state: Arc<AppState>,
    pub source: Arc<MockMetadataSource>,
    pub client: reqwest::Client,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base, path)
    }

    /// Starts a sync over HTTP and waits for it to finish.
    pub async fn sync(&self) -> SyncSession {
        let resp = self
            .client
            .post(self.url("/sync"))
            .json(&SyncRequest::default())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let body: serde_json::Value = resp.json().await.unwrap();
        let id = SessionId::parse(body["session_id"].as_str().unwrap()).unwrap();
        self.state.sessions.wait(id).await.unwrap()
    }
}

/// Spin up the HTTP server on an OS-assigned port over an in-memory store.
pub async fn spawn_test_server() -> TestServer {
    spawn_test_server_with(Arc::new(MetadataStore::open_in_memory().unwrap())).await
}

pub async fn spawn_test_server_with(store: Arc<MetadataStore>) -> TestServer {
    let source = Arc::new(mock());
    let dyn_source: Arc<dyn MetadataSource> = source.clone();
    let state = Arc::new(
        AppState::new(store, dyn_source, CONTOSO, "contoso", CacheConfig::default())
            .await
            .unwrap(),
    );

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        state,
        source,
        client: reqwest::Client::new(),
    }
}
