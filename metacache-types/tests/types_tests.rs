use metacache_types::{
    BindingKind, EntityCategory, EntityProperty, Fingerprint, GlobalVersionId, PublicEntitySchema,
    SessionId,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::str::FromStr;

// ── SessionId ─────────────────────────────────────────────────────

#[test]
fn session_id_new_is_unique() {
    let a = SessionId::new();
    let b = SessionId::new();
    assert_ne!(a, b);
}

#[test]
fn session_id_display_and_parse() {
    let id = SessionId::new();
    let parsed = SessionId::parse(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
    let from_str = SessionId::from_str(&id.to_string()).unwrap();
    assert_eq!(id, from_str);
}

#[test]
fn session_id_parse_invalid() {
    assert!(SessionId::parse("not-a-uuid").is_err());
}

#[test]
fn session_ids_sort_by_creation() {
    let a = SessionId::new();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = SessionId::new();
    assert!(a < b);
}

#[test]
fn session_id_hash_and_eq() {
    let id = SessionId::new();
    let mut set = HashSet::new();
    set.insert(id);
    set.insert(id);
    assert_eq!(set.len(), 1);
}

#[test]
fn session_id_serde_is_transparent() {
    let id = SessionId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
}

// ── GlobalVersionId ───────────────────────────────────────────────

#[test]
fn temporary_version_sentinel() {
    assert!(GlobalVersionId::TEMPORARY.is_temporary());
    assert_eq!(GlobalVersionId::TEMPORARY.get(), -1);
    assert_eq!(GlobalVersionId::TEMPORARY.to_string(), "temporary");
    assert!(!GlobalVersionId::new(3).is_temporary());
    assert_eq!(GlobalVersionId::new(3).to_string(), "3");
}

// ── Enums ─────────────────────────────────────────────────────────

#[test]
fn entity_category_parse_is_case_insensitive() {
    assert_eq!(EntityCategory::from_str("master").unwrap(), EntityCategory::Master);
    assert_eq!(
        EntityCategory::from_str(" Transaction ").unwrap(),
        EntityCategory::Transaction
    );
    assert!(EntityCategory::from_str("Bogus").is_err());
}

#[test]
fn binding_kind_display_matches_parse() {
    for kind in BindingKind::ALL {
        assert_eq!(BindingKind::from_str(&kind.to_string()).unwrap(), kind);
    }
}

// ── Schema helpers ────────────────────────────────────────────────

#[test]
fn key_names_in_declaration_order() {
    let schema = PublicEntitySchema {
        name: "Customers".into(),
        properties: vec![
            EntityProperty {
                name: "dataAreaId".into(),
                is_key: true,
                ..Default::default()
            },
            EntityProperty {
                name: "Name".into(),
                ..Default::default()
            },
            EntityProperty {
                name: "CustomerAccount".into(),
                is_key: true,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    assert_eq!(schema.key_names(), vec!["dataAreaId", "CustomerAccount"]);
}

#[test]
fn fingerprint_short_prefix() {
    let fp = Fingerprint::new("0123456789abcdef");
    assert_eq!(fp.short(), "0123456789ab");
    assert_eq!(Fingerprint::new("abc").short(), "abc");
}

proptest! {
    #[test]
    fn category_roundtrips_through_display(idx in 0usize..6) {
        let category = EntityCategory::ALL[idx];
        prop_assert_eq!(EntityCategory::from_str(category.as_str()).unwrap(), category);
    }
}

#[test]
fn sync_phases_are_ordered() {
    use metacache_types::SyncPhase;
    let mut sorted = SyncPhase::ALL.to_vec();
    sorted.sort();
    assert_eq!(sorted, SyncPhase::ALL.to_vec());
    assert_eq!(SyncPhase::from_str("search_index").unwrap(), SyncPhase::SearchIndex);
    assert!(SyncPhase::from_str("SearchIndex").is_err());
}
