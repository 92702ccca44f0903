//! Shared fixtures for sync tests.

#![allow(dead_code)]

use metacache_store::MetadataStore;
use metacache_sync::{CacheConfig, MetadataSource, MockMetadataSource, SmartSyncEngine};
use metacache_types::{
    BindingKind, DataEntityInfo, EntityAction, EntityCategory, EntityProperty, Enumeration,
    EnumerationMember, ModuleVersion, PublicEntitySchema,
};
use std::sync::Arc;

pub const CONTOSO: &str = "https://contoso.example.com";
pub const FABRIKAM: &str = "https://fabrikam.example.com";

pub fn modules() -> Vec<ModuleVersion> {
    vec![ModuleVersion::new("AppSuite", "10.0.1")]
}

pub fn upgraded_modules() -> Vec<ModuleVersion> {
    vec![ModuleVersion::new("AppSuite", "10.0.2")]
}

pub fn entity(name: &str, public: Option<&str>, label: &str) -> DataEntityInfo {
    DataEntityInfo {
        name: name.to_string(),
        public_entity_name: public.map(str::to_string),
        public_collection_name: public.map(|p| format!("{p}s")),
        label_id: Some(label.to_string()),
        label_text: None,
        category: EntityCategory::Master,
        data_service_enabled: true,
        data_management_enabled: true,
        is_read_only: false,
    }
}

/// Three entities, two of them exposed as public entities.
pub fn entities() -> Vec<DataEntityInfo> {
    vec![
        entity("CustCustomerV3Entity", Some("CustomerV3"), "@SYS100"),
        entity("VendVendorV2Entity", Some("VendorV2"), "@SYS200"),
        DataEntityInfo {
            category: EntityCategory::Parameters,
            is_read_only: true,
            ..entity("LedgerParametersEntity", None, "@SYS300")
        },
    ]
}

fn key(name: &str) -> EntityProperty {
    EntityProperty {
        name: name.to_string(),
        type_name: "Edm.String".to_string(),
        data_type: "String".to_string(),
        is_key: true,
        is_mandatory: true,
        ..Default::default()
    }
}

pub fn customer_schema() -> PublicEntitySchema {
    PublicEntitySchema {
        name: "CustomerV3".to_string(),
        entity_set_name: Some("CustomersV3".to_string()),
        label_id: Some("@SYS101".to_string()),
        properties: vec![key("dataAreaId"), key("CustomerAccount")],
        actions: vec![EntityAction {
            name: "ValidateCreditLimit".to_string(),
            binding_kind: BindingKind::BoundToEntityInstance,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn vendor_schema() -> PublicEntitySchema {
    PublicEntitySchema {
        name: "VendorV2".to_string(),
        entity_set_name: Some("VendorsV2".to_string()),
        properties: vec![key("dataAreaId"), key("VendorAccount")],
        actions: vec![EntityAction {
            name: "Approve".to_string(),
            binding_kind: BindingKind::Unbound,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn enumerations() -> Vec<Enumeration> {
    vec![Enumeration {
        name: "NoYes".to_string(),
        label_id: Some("@ENUM1".to_string()),
        label_text: None,
        members: ["No", "Yes"]
            .iter()
            .enumerate()
            .map(|(i, m)| EnumerationMember {
                name: m.to_string(),
                value: i as i64,
                ..Default::default()
            })
            .collect(),
    }]
}

/// A remote with the sample catalogue. `@SYS300` is unknown remotely.
pub fn mock() -> MockMetadataSource {
    MockMetadataSource::new()
        .with_modules(modules())
        .with_entities(entities())
        .with_schemas(vec![customer_schema(), vendor_schema()])
        .with_enumerations(enumerations())
        .with_label("@SYS100", "en-US", "Customers")
        .with_label("@SYS101", "en-US", "Customer")
        .with_label("@SYS200", "en-US", "Vendors")
        .with_label("@ENUM1", "en-US", "No or yes")
}

pub fn store() -> Arc<MetadataStore> {
    Arc::new(MetadataStore::open_in_memory().unwrap())
}

pub fn config() -> CacheConfig {
    CacheConfig {
        write_batch_size: 2,
        label_batch_size: 2,
        schema_concurrency: 2,
        ..Default::default()
    }
}

pub async fn engine(
    store: &Arc<MetadataStore>,
    source: &Arc<MockMetadataSource>,
    base_url: &str,
) -> SmartSyncEngine {
    let source: Arc<dyn MetadataSource> = source.clone();
    SmartSyncEngine::new(Arc::clone(store), source, base_url, "test", config())
        .await
        .unwrap()
}
