mod common;

use common::*;
use metacache_store::{LabelCache, MetadataStore};
use metacache_sync::detector;
use metacache_sync::{
    MockMethod, NoopProgress, PhaseEvent, RemoteError, SyncError, SyncRequest, SyncStrategy,
};
use metacache_types::{Fingerprint, SyncPhase};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Makes any delete of temporary label rows abort, from a second connection.
fn pin_temporary_labels(store: &MetadataStore) {
    let side = rusqlite::Connection::open(store.path().unwrap()).unwrap();
    side.execute_batch(
        "CREATE TRIGGER pin_temporary_labels BEFORE DELETE ON labels
         WHEN old.global_version_id = -1
         BEGIN SELECT RAISE(ABORT, 'temporary labels are pinned'); END;",
    )
    .unwrap();
}

// ── First sync ───────────────────────────────────────────────────

#[tokio::test]
async fn first_full_sync_populates_every_phase() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;

    let outcome = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();

    assert!(outcome.version_created);
    assert!(!outcome.short_circuited);
    assert_eq!(outcome.previous_version_id, None);
    assert_eq!(outcome.fingerprint, detector::fingerprint(&modules()).unwrap());
    assert_eq!(outcome.phases_run[&SyncPhase::Entities], 3);
    assert_eq!(outcome.phases_run[&SyncPhase::PublicEntitySchemas], 2);
    assert_eq!(outcome.phases_run[&SyncPhase::Enumerations], 1);
    assert_eq!(outcome.phases_run[&SyncPhase::Labels], 4);
    assert!(outcome.phases_skipped.is_empty());

    let v = outcome.global_version_id;
    assert_eq!(
        outcome.phases_run[&SyncPhase::SearchIndex] as usize,
        store.search_document_count(v).unwrap()
    );
    assert!(store.is_populated(v, &SyncPhase::ALL).unwrap());
    assert_eq!(store.current_version(engine.environment().id).unwrap().unwrap().id, v);
    assert!(store.get_public_entity_schema(v, "CustomerV3").unwrap().is_some());
    assert_eq!(
        store.peek_label(v, "@SYS101", "en-US").unwrap().unwrap().text,
        "Customer"
    );
    assert_eq!(store.get_version(v).unwrap().unwrap().reference_count, 1);
}

#[tokio::test]
async fn progress_events_follow_phase_order() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = Arc::clone(&events);
        move |e: &PhaseEvent| events.lock().unwrap().push(e.clone())
    };

    engine
        .sync(&SyncRequest::default(), &token(), &sink)
        .await
        .unwrap();

    let events = events.lock().unwrap();
    let started: Vec<SyncPhase> = events
        .iter()
        .filter_map(|e| match e {
            PhaseEvent::Started { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(started, SyncPhase::ALL.to_vec());
    let completed = events
        .iter()
        .filter(|e| matches!(e, PhaseEvent::Completed { .. }))
        .count();
    assert_eq!(completed, 5);
    assert!(matches!(events.last(), Some(PhaseEvent::Completed { phase: SyncPhase::SearchIndex, .. })));
}

// ── Short circuit ────────────────────────────────────────────────

#[tokio::test]
async fn second_full_sync_short_circuits_without_fetching() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let first = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();
    let before = store.statistics().unwrap();
    source.reset_calls();

    let second = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();

    assert!(second.short_circuited);
    assert_eq!(second.global_version_id, first.global_version_id);
    assert!(second.phases_run.is_empty());
    assert_eq!(second.phases_skipped, SyncPhase::ALL.to_vec());
    assert_eq!(source.fetch_calls(), 0);
    assert_eq!(source.calls(MockMethod::ListInstalledModules), 1);
    assert_eq!(store.statistics().unwrap(), before);
}

#[tokio::test]
async fn forced_sync_refetches_the_same_version() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let first = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();
    source.reset_calls();

    let forced = engine
        .sync(&SyncRequest::default().forced(), &token(), &NoopProgress)
        .await
        .unwrap();

    assert!(!forced.short_circuited);
    assert!(!forced.version_created);
    assert_eq!(forced.global_version_id, first.global_version_id);
    assert_eq!(forced.previous_version_id, Some(first.global_version_id));
    assert_eq!(source.calls(MockMethod::FetchDataEntities), 1);
    assert_eq!(source.calls(MockMethod::FetchPublicEntitySchema), 2);
    // Labels cached by the first run are still live.
    assert_eq!(forced.phases_run[&SyncPhase::Labels], 0);
    assert_eq!(
        store
            .get_version(first.global_version_id)
            .unwrap()
            .unwrap()
            .reference_count,
        1
    );
}

#[tokio::test]
async fn remote_upgrade_creates_and_binds_a_new_version() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let first = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();

    source.set_modules(upgraded_modules());
    let second = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();

    assert!(second.version_created);
    assert_ne!(second.global_version_id, first.global_version_id);
    assert_eq!(second.previous_version_id, Some(first.global_version_id));
    let old = store.get_version(first.global_version_id).unwrap().unwrap();
    assert_eq!(old.reference_count, 0);
    let history = store.binding_history(engine.environment().id, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].global_version_id, second.global_version_id);
}

// ── Sharing ──────────────────────────────────────────────────────

#[tokio::test]
async fn second_environment_shares_the_populated_version() {
    let store = store();
    let source = Arc::new(mock());
    let contoso = engine(&store, &source, CONTOSO).await;
    let first = contoso
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();
    source.reset_calls();

    let fabrikam = engine(&store, &source, FABRIKAM).await;
    let shared = fabrikam
        .sync(
            &SyncRequest::new(SyncStrategy::SharingMode),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap();

    assert_eq!(shared.global_version_id, first.global_version_id);
    assert!(!shared.version_created);
    assert_eq!(source.calls(MockMethod::FetchDataEntities), 0);
    assert_eq!(source.calls(MockMethod::FetchPublicEntitySchema), 0);
    assert_eq!(store.list_versions().unwrap().len(), 1);
    let version = store.get_version(first.global_version_id).unwrap().unwrap();
    assert_eq!(version.reference_count, 2);
    assert_eq!(
        store.current_version(fabrikam.environment().id).unwrap().unwrap().id,
        first.global_version_id
    );
}

#[tokio::test]
async fn failed_shared_bind_returns_the_reference() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MetadataStore::open_in_dir(dir.path()).unwrap());
    let source = Arc::new(mock());
    let contoso = engine(&store, &source, CONTOSO).await;
    let first = contoso
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();
    let labels = LabelCache::new(Arc::clone(&store), Duration::from_secs(3600));
    labels.set_label(None, "@TMP1", "en-US", "Pending").unwrap();
    pin_temporary_labels(&store);

    let fabrikam = engine(&store, &source, FABRIKAM).await;
    let err = fabrikam
        .sync(
            &SyncRequest::new(SyncStrategy::SharingMode),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Store(_)));
    assert!(store.current_version(fabrikam.environment().id).unwrap().is_none());
    let version = store.get_version(first.global_version_id).unwrap().unwrap();
    assert_eq!(version.reference_count, 1);
}

#[tokio::test]
async fn sharing_again_is_a_no_op() {
    let store = store();
    let source = Arc::new(mock());
    let contoso = engine(&store, &source, CONTOSO).await;
    contoso
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();
    let fabrikam = engine(&store, &source, FABRIKAM).await;
    let request = SyncRequest::new(SyncStrategy::SharingMode);
    let first = fabrikam.sync(&request, &token(), &NoopProgress).await.unwrap();

    let again = fabrikam.sync(&request, &token(), &NoopProgress).await.unwrap();

    assert!(again.short_circuited);
    assert_eq!(again.global_version_id, first.global_version_id);
    let version = store.get_version(first.global_version_id).unwrap().unwrap();
    assert_eq!(version.reference_count, 2);
}

#[tokio::test]
async fn sharing_without_populated_version_fails() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;

    let err = engine
        .sync(
            &SyncRequest::new(SyncStrategy::SharingMode),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::SharingUnavailable(_)));
    assert!(store.list_versions().unwrap().is_empty());
    assert_eq!(source.fetch_calls(), 0);
}

#[tokio::test]
async fn sharing_requires_detection() {
    let store = store();
    let source = Arc::new(mock());
    source.fail(
        MockMethod::ListInstalledModules,
        RemoteError::Network("unreachable".into()),
    );
    let engine = engine(&store, &source, CONTOSO).await;

    let err = engine
        .sync(
            &SyncRequest::new(SyncStrategy::SharingMode),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SharingUnavailable(_)));
}

#[tokio::test]
async fn full_sync_on_second_environment_reuses_completed_phases() {
    let store = store();
    let source = Arc::new(mock());
    let contoso = engine(&store, &source, CONTOSO).await;
    let first = contoso
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();
    source.reset_calls();

    let fabrikam = engine(&store, &source, FABRIKAM).await;
    let outcome = fabrikam
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();

    assert_eq!(outcome.global_version_id, first.global_version_id);
    assert!(!outcome.version_created);
    assert_eq!(outcome.phases_skipped, SyncPhase::ALL.to_vec());
    assert_eq!(source.fetch_calls(), 0);
}

// ── Strategies ───────────────────────────────────────────────────

#[tokio::test]
async fn entities_only_refreshes_entities_and_keeps_schemas() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let first = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();
    let v = first.global_version_id;

    let mut changed = entities();
    changed[0].is_read_only = true;
    source.set_entities(changed);
    source.reset_calls();

    let outcome = engine
        .sync(
            &SyncRequest::new(SyncStrategy::EntitiesOnly),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap();

    assert_eq!(outcome.global_version_id, v);
    assert_eq!(
        outcome.phases_run.keys().copied().collect::<Vec<_>>(),
        vec![SyncPhase::Entities, SyncPhase::SearchIndex]
    );
    assert_eq!(source.calls(MockMethod::FetchDataEntities), 1);
    assert_eq!(source.calls(MockMethod::FetchPublicEntitySchema), 0);
    assert!(
        store
            .get_data_entity(v, "CustCustomerV3Entity")
            .unwrap()
            .unwrap()
            .is_read_only
    );
    assert_eq!(
        store.get_public_entity_schema(v, "CustomerV3").unwrap().unwrap(),
        customer_schema()
    );
}

#[tokio::test]
async fn labels_only_fetches_missing_labels() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let first = engine
        .sync(
            &SyncRequest::new(SyncStrategy::FullWithoutLabels),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap();
    assert!(!first.phases_run.contains_key(&SyncPhase::Labels));
    assert_eq!(source.calls(MockMethod::FetchLabels), 0);

    let labels = engine
        .sync(
            &SyncRequest::new(SyncStrategy::LabelsOnly),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap();

    assert_eq!(labels.phases_run[&SyncPhase::Labels], 4);
    // 5 uncached ids in batches of 2.
    assert_eq!(source.calls(MockMethod::FetchLabels), 3);
    let v = labels.global_version_id;
    assert_eq!(
        store.uncached_label_ids(v, "en-US").unwrap(),
        vec!["@SYS300".to_string()]
    );
}

#[test]
fn strategy_parses_case_insensitively() {
    assert_eq!("SHARINGMODE".parse::<SyncStrategy>().unwrap(), SyncStrategy::SharingMode);
    assert_eq!(" full ".parse::<SyncStrategy>().unwrap(), SyncStrategy::Full);
    assert!(matches!(
        "partial".parse::<SyncStrategy>(),
        Err(SyncError::Config(_))
    ));
    for s in SyncStrategy::ALL {
        assert_eq!(s.to_string().parse::<SyncStrategy>().unwrap(), s);
    }
}

#[test]
fn strategy_phase_sets() {
    assert_eq!(SyncStrategy::Full.phases(), &SyncPhase::ALL);
    assert!(SyncStrategy::SharingMode.phases().is_empty());
    assert!(!SyncStrategy::FullWithoutLabels.phases().contains(&SyncPhase::Labels));
    assert!(SyncStrategy::FullWithoutLabels.skips_completed_phases());
    assert!(!SyncStrategy::EntitiesOnly.skips_completed_phases());
}

// ── Detection fallback ───────────────────────────────────────────

#[tokio::test]
async fn detection_failure_falls_back_to_unknown_fingerprint() {
    let store = store();
    let source = Arc::new(mock());
    source.fail(
        MockMethod::ListInstalledModules,
        RemoteError::Status {
            status: 503,
            message: "maintenance".into(),
        },
    );
    let engine = engine(&store, &source, CONTOSO).await;

    let outcome = engine
        .sync(
            &SyncRequest::new(SyncStrategy::EntitiesOnly),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap();

    assert!(outcome.fingerprint.as_str().starts_with("unknown-"));
    assert!(outcome.version_created);
    // Detection failure forces a full sync.
    assert_eq!(outcome.phases_run.len(), SyncPhase::ALL.len());
}

#[tokio::test]
async fn empty_module_list_is_a_detection_failure() {
    let store = store();
    let source = Arc::new(mock().with_modules(Vec::new()));
    let engine = engine(&store, &source, CONTOSO).await;

    let err = engine.detect_version().await.unwrap_err();
    assert!(matches!(err, SyncError::Detection(_)));
}

#[tokio::test]
async fn target_fingerprint_skips_detection() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;

    let outcome = engine
        .sync(
            &SyncRequest::default().with_fingerprint(Fingerprint::new("pinned")),
            &token(),
            &NoopProgress,
        )
        .await
        .unwrap();

    assert_eq!(outcome.fingerprint.as_str(), "pinned");
    assert_eq!(source.calls(MockMethod::ListInstalledModules), 0);
}

// ── Failure and cancellation ─────────────────────────────────────

#[tokio::test]
async fn phase_failure_leaves_environment_unbound() {
    let store = store();
    let source = Arc::new(mock());
    source.fail_schema("VendorV2");
    let engine = engine(&store, &source, CONTOSO).await;

    let err = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(SyncPhase::PublicEntitySchemas));
    assert!(matches!(
        err,
        SyncError::RemoteFetch {
            source: RemoteError::Status { status: 500, .. },
            ..
        }
    ));
    assert!(store.current_version(engine.environment().id).unwrap().is_none());
    let versions = store.list_versions().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].reference_count, 0);
    assert_eq!(
        store.completed_phases(versions[0].id).unwrap(),
        vec![SyncPhase::Entities]
    );
}

#[tokio::test]
async fn failed_bind_releases_the_version_and_keeps_labels_temporary() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MetadataStore::open_in_dir(dir.path()).unwrap());
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let labels = LabelCache::new(Arc::clone(&store), Duration::from_secs(3600));
    labels.set_label(None, "@TMP1", "en-US", "Pending").unwrap();
    pin_temporary_labels(&store);

    let err = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Store(_)));
    assert!(store.current_version(engine.environment().id).unwrap().is_none());
    let versions = store.list_versions().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].reference_count, 0);
    assert!(labels.get_label(None, "@TMP1", "en-US").unwrap().is_hit());
}

#[tokio::test]
async fn retry_after_failure_resumes_missing_schemas() {
    let store = store();
    let source = Arc::new(mock());
    source.fail_schema("VendorV2");
    let engine = engine(&store, &source, CONTOSO).await;
    engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap_err();

    source.clear_failures();
    source.reset_calls();
    let outcome = engine
        .sync(&SyncRequest::default(), &token(), &NoopProgress)
        .await
        .unwrap();

    assert!(!outcome.version_created);
    assert_eq!(outcome.phases_skipped, vec![SyncPhase::Entities]);
    assert_eq!(source.calls(MockMethod::FetchDataEntities), 0);
    // Only the schema that was not stored yet is fetched again.
    assert_eq!(source.calls(MockMethod::FetchPublicEntitySchema), 1);
    assert_eq!(
        store
            .get_version(outcome.global_version_id)
            .unwrap()
            .unwrap()
            .reference_count,
        1
    );
}

#[tokio::test]
async fn cancellation_between_phases_keeps_written_facts() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let cancel = token();
    let sink = {
        let cancel = cancel.clone();
        move |e: &PhaseEvent| {
            if matches!(e, PhaseEvent::Completed { phase: SyncPhase::Entities, .. }) {
                cancel.cancel();
            }
        }
    };

    let err = engine
        .sync(&SyncRequest::default(), &cancel, &sink)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert!(store.current_version(engine.environment().id).unwrap().is_none());
    let v = store.list_versions().unwrap()[0].id;
    assert!(store.get_data_entity(v, "VendVendorV2Entity").unwrap().is_some());
    assert_eq!(source.calls(MockMethod::FetchPublicEntitySchema), 0);
}

#[tokio::test]
async fn already_cancelled_token_does_nothing() {
    let store = store();
    let source = Arc::new(mock());
    let engine = engine(&store, &source, CONTOSO).await;
    let cancel = token();
    cancel.cancel();

    let err = engine
        .sync(&SyncRequest::default(), &cancel, &NoopProgress)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert!(store.list_versions().unwrap().is_empty());
    assert_eq!(source.calls(MockMethod::ListInstalledModules), 0);
}

#[tokio::test]
async fn engine_rejects_invalid_config() {
    let store = store();
    let source: Arc<dyn metacache_sync::MetadataSource> = Arc::new(mock());
    let config = metacache_sync::CacheConfig {
        label_batch_size: 0,
        ..Default::default()
    };

    let result =
        metacache_sync::SmartSyncEngine::new(store, source, CONTOSO, "contoso", config).await;
    assert!(matches!(result, Err(SyncError::Config(_))));
}
