//! Shared fixtures for store tests.

#![allow(dead_code)]

use metacache_store::MetadataStore;
use metacache_types::{
    ActionParameter, ActionReturnType, BindingKind, DataEntityInfo, EntityAction, EntityCategory,
    EntityProperty, Enumeration, EnumerationMember, Fingerprint, GlobalVersionId, ModuleVersion,
    PublicEntitySchema,
};

pub fn store() -> MetadataStore {
    MetadataStore::open_in_memory().unwrap()
}

/// Acquires a version for `fingerprint` and returns its id.
pub fn version(store: &MetadataStore, fingerprint: &str) -> GlobalVersionId {
    store
        .acquire_version(
            &Fingerprint::new(fingerprint),
            &[ModuleVersion::new("AppSuite", "10.0.1")],
        )
        .unwrap()
        .version
        .id
}

pub fn data_entity(name: &str, public: &str, category: EntityCategory) -> DataEntityInfo {
    DataEntityInfo {
        name: name.to_string(),
        public_entity_name: Some(public.to_string()),
        public_collection_name: Some(format!("{public}s")),
        label_id: Some(format!("@SYS{}", name.len())),
        label_text: Some(format!("{name} label")),
        category,
        data_service_enabled: true,
        data_management_enabled: true,
        is_read_only: false,
    }
}

pub fn sample_entities() -> Vec<DataEntityInfo> {
    vec![
        data_entity("CustCustomerV3Entity", "CustomerV3", EntityCategory::Master),
        data_entity("VendVendorV2Entity", "VendorV2", EntityCategory::Master),
        data_entity("SalesOrderHeaderV2Entity", "SalesOrderHeaderV2", EntityCategory::Transaction),
        DataEntityInfo {
            is_read_only: true,
            data_service_enabled: false,
            ..data_entity("LedgerParametersEntity", "LedgerParameters", EntityCategory::Parameters)
        },
    ]
}

pub fn property(name: &str, is_key: bool) -> EntityProperty {
    EntityProperty {
        name: name.to_string(),
        type_name: "Edm.String".to_string(),
        data_type: "String".to_string(),
        label_id: Some(format!("@SYS{name}")),
        label_text: None,
        is_key,
        is_mandatory: is_key,
        allow_edit: !is_key,
    }
}

pub fn customer_schema() -> PublicEntitySchema {
    PublicEntitySchema {
        name: "CustomerV3".to_string(),
        entity_set_name: Some("CustomersV3".to_string()),
        label_id: Some("@SYS1".to_string()),
        label_text: Some("Customers".to_string()),
        is_read_only: false,
        configuration_enabled: true,
        properties: vec![
            property("dataAreaId", true),
            property("CustomerAccount", true),
            property("CreditLimit", false),
        ],
        actions: vec![
            EntityAction {
                name: "ValidateCreditLimit".to_string(),
                binding_kind: BindingKind::BoundToEntityInstance,
                return_type: Some(ActionReturnType {
                    type_name: "Edm.Boolean".to_string(),
                    is_collection: false,
                }),
                parameters: vec![ActionParameter {
                    name: "amount".to_string(),
                    type_name: "Edm.Decimal".to_string(),
                    is_collection: false,
                }],
            },
            EntityAction {
                name: "BlockAll".to_string(),
                binding_kind: BindingKind::BoundToEntitySet,
                return_type: None,
                parameters: Vec::new(),
            },
        ],
    }
}

pub fn vendor_schema() -> PublicEntitySchema {
    PublicEntitySchema {
        name: "VendorV2".to_string(),
        entity_set_name: Some("VendorsV2".to_string()),
        label_id: Some("@SYS2".to_string()),
        label_text: Some("Vendors".to_string()),
        is_read_only: false,
        configuration_enabled: true,
        properties: vec![property("dataAreaId", true), property("VendorAccount", true)],
        actions: vec![EntityAction {
            name: "Approve".to_string(),
            binding_kind: BindingKind::Unbound,
            return_type: None,
            parameters: Vec::new(),
        }],
    }
}

pub fn enumeration(name: &str, members: &[&str]) -> Enumeration {
    Enumeration {
        name: name.to_string(),
        label_id: Some(format!("@ENUM{name}")),
        label_text: Some(name.to_string()),
        members: members
            .iter()
            .enumerate()
            .map(|(i, m)| EnumerationMember {
                name: m.to_string(),
                value: i as i64,
                label_id: None,
                label_text: None,
                configuration_enabled: true,
            })
            .collect(),
    }
}

/// Populates a version with the sample facts.
pub fn populate(store: &MetadataStore, version: GlobalVersionId) {
    store.upsert_data_entities(version, &sample_entities()).unwrap();
    store
        .upsert_public_entity_schemas(version, &[customer_schema(), vendor_schema()])
        .unwrap();
    store
        .upsert_enumerations(
            version,
            &[
                enumeration("NoYes", &["No", "Yes"]),
                enumeration("CustVendorBlocked", &["No", "Invoice", "All"]),
            ],
        )
        .unwrap();
}
