mod common;

use common::{customer_schema, data_entity, enumeration, populate, sample_entities, store, version};
use metacache_store::{ActionFilter, EntityFilter};
use metacache_types::{BindingKind, EntityCategory};
use pretty_assertions::assert_eq;

// ── Data entities ────────────────────────────────────────────────

#[test]
fn data_entity_round_trip() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);

    let expected = &sample_entities()[0];
    let loaded = store.get_data_entity(v, &expected.name).unwrap().unwrap();
    assert_eq!(&loaded, expected);
}

#[test]
fn upsert_is_idempotent() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);
    populate(&store, v);

    let stats = store.statistics().unwrap();
    assert_eq!(stats.data_entities, 4);
    assert_eq!(stats.public_entities, 2);
    assert_eq!(stats.entity_properties, 5);
    assert_eq!(stats.entity_actions, 3);
    assert_eq!(stats.enumerations, 2);
    assert_eq!(stats.enumeration_members, 5);
}

#[test]
fn facts_are_scoped_to_their_version() {
    let store = store();
    let v1 = version(&store, "h1");
    let v2 = version(&store, "h2");
    populate(&store, v1);

    assert!(store.get_data_entity(v2, "CustCustomerV3Entity").unwrap().is_none());
    assert!(store.get_public_entity_schema(v2, "CustomerV3").unwrap().is_none());
    assert!(store.get_enumeration(v2, "NoYes").unwrap().is_none());
}

#[test]
fn batch_lookup_skips_unknown_names() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);

    let names = vec![
        "VendVendorV2Entity".to_string(),
        "Nope".to_string(),
        "CustCustomerV3Entity".to_string(),
    ];
    let found: Vec<_> = store
        .get_data_entities(v, &names)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(found, vec!["VendVendorV2Entity", "CustCustomerV3Entity"]);
}

#[test]
fn list_data_entities_applies_filters() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);

    let masters = store
        .list_data_entities(
            v,
            &EntityFilter {
                category: Some(EntityCategory::Master),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    let names: Vec<_> = masters.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["CustCustomerV3Entity", "VendVendorV2Entity"]);

    let read_only = store
        .list_data_entities(
            v,
            &EntityFilter {
                is_read_only: Some(true),
                data_service_enabled: Some(false),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(read_only.len(), 1);
    assert_eq!(read_only[0].name, "LedgerParametersEntity");

    let by_name = store
        .list_data_entities(
            v,
            &EntityFilter {
                name_contains: Some("order".into()),
                ..Default::default()
            },
            Some(10),
        )
        .unwrap();
    assert_eq!(by_name.len(), 1);

    let limited = store.list_data_entities(v, &EntityFilter::default(), Some(2)).unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn rewrite_refreshes_entity_row() {
    let store = store();
    let v = version(&store, "h1");
    store
        .upsert_data_entities(v, &[data_entity("A", "PA", EntityCategory::Master)])
        .unwrap();
    let mut changed = data_entity("A", "PA", EntityCategory::Reference);
    changed.label_text = Some("Renamed".into());
    store.upsert_data_entities(v, &[changed.clone()]).unwrap();

    assert_eq!(store.get_data_entity(v, "A").unwrap().unwrap(), changed);
}

#[test]
fn missing_public_entities_shrink_as_schemas_arrive() {
    let store = store();
    let v = version(&store, "h1");
    store.upsert_data_entities(v, &sample_entities()).unwrap();

    assert_eq!(store.public_entity_names(v).unwrap().len(), 4);
    assert_eq!(store.missing_public_entity_names(v).unwrap().len(), 4);

    store.upsert_public_entity_schema(v, &customer_schema()).unwrap();
    let missing = store.missing_public_entity_names(v).unwrap();
    assert_eq!(missing.len(), 3);
    assert!(!missing.contains(&"CustomerV3".to_string()));
}

// ── Public entity schemas ────────────────────────────────────────

#[test]
fn schema_round_trip_preserves_order() {
    let store = store();
    let v = version(&store, "h1");
    store.upsert_public_entity_schema(v, &customer_schema()).unwrap();

    let loaded = store.get_public_entity_schema(v, "CustomerV3").unwrap().unwrap();
    assert_eq!(loaded, customer_schema());
    assert_eq!(loaded.key_names(), vec!["dataAreaId", "CustomerAccount"]);
}

#[test]
fn schema_found_by_entity_set_name() {
    let store = store();
    let v = version(&store, "h1");
    store.upsert_public_entity_schema(v, &customer_schema()).unwrap();

    let loaded = store.get_public_entity_schema(v, "CustomersV3").unwrap().unwrap();
    assert_eq!(loaded.name, "CustomerV3");
}

#[test]
fn schema_rewrite_replaces_children() {
    let store = store();
    let v = version(&store, "h1");
    store.upsert_public_entity_schema(v, &customer_schema()).unwrap();

    let mut slim = customer_schema();
    slim.properties.truncate(1);
    slim.actions.truncate(1);
    store.upsert_public_entity_schema(v, &slim).unwrap();

    assert_eq!(store.get_public_entity_schema(v, "CustomerV3").unwrap().unwrap(), slim);
    assert!(store.find_actions(v, "BlockAll").unwrap().is_empty());
}

// ── Actions ──────────────────────────────────────────────────────

#[test]
fn list_actions_filters_by_entity_and_binding() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);

    let all = store.list_actions(v, &ActionFilter::default(), None).unwrap();
    let names: Vec<_> = all
        .iter()
        .map(|a| (a.entity_name.as_str(), a.action.name.as_str()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("CustomerV3", "BlockAll"),
            ("CustomerV3", "ValidateCreditLimit"),
            ("VendorV2", "Approve"),
        ]
    );

    let bound = store
        .list_actions(
            v,
            &ActionFilter {
                binding_kind: Some(BindingKind::BoundToEntityInstance),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].action, customer_schema().actions[0]);

    let vendor = store
        .list_actions(
            v,
            &ActionFilter {
                entity: Some("VendorV2".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(vendor.len(), 1);
}

#[test]
fn find_actions_matches_exact_name() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);

    let found = store.find_actions(v, "Approve").unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_name, "VendorV2");
    assert!(store.find_actions(v, "Appro").unwrap().is_empty());
}

// ── Enumerations ─────────────────────────────────────────────────

#[test]
fn enumeration_round_trip() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);

    let loaded = store.get_enumeration(v, "CustVendorBlocked").unwrap().unwrap();
    assert_eq!(loaded, enumeration("CustVendorBlocked", &["No", "Invoice", "All"]));

    let names = vec!["NoYes".to_string(), "Missing".to_string()];
    assert_eq!(store.get_enumerations(v, &names).unwrap().len(), 1);
}

#[test]
fn enumeration_names_filter() {
    let store = store();
    let v = version(&store, "h1");
    populate(&store, v);

    assert_eq!(
        store.list_enumeration_names(v, None, None).unwrap(),
        vec!["CustVendorBlocked", "NoYes"]
    );
    assert_eq!(
        store.list_enumeration_names(v, Some("noyes"), None).unwrap(),
        vec!["NoYes"]
    );
}
