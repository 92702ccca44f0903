use metacache_sync::{
    ActivityStatus, CacheConfig, HttpSourceConfig, PhaseEvent, SyncActivity, SyncError,
};
use metacache_types::SyncPhase;
use pretty_assertions::assert_eq;
use std::io::Write;
use std::time::Duration;

// ── CacheConfig ──────────────────────────────────────────────────

#[test]
fn defaults() {
    let config = CacheConfig::default();
    assert_eq!(config.label_ttl(), Duration::from_secs(3600));
    assert_eq!(config.language, "en-US");
    assert_eq!(config.write_batch_size, 500);
    assert_eq!(config.label_batch_size, 50);
    assert_eq!(config.history_capacity, 20);
    assert_eq!(config.sweep_interval(), Duration::from_secs(300));
    config.validate().unwrap();
}

#[test]
fn load_fills_missing_fields_with_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"label_ttl_minutes": 5, "language": "da"}}"#).unwrap();

    let config = CacheConfig::load(file.path()).unwrap();

    assert_eq!(config.label_ttl(), Duration::from_secs(300));
    assert_eq!(config.language, "da");
    assert_eq!(config.schema_concurrency, CacheConfig::default().schema_concurrency);
}

#[test]
fn load_reports_bad_files() {
    let missing = CacheConfig::load(std::path::Path::new("/nonexistent/metacache.json"));
    assert!(matches!(missing, Err(SyncError::Config(_))));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();
    assert!(matches!(CacheConfig::load(file.path()), Err(SyncError::Config(_))));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"write_batch_size": 0}}"#).unwrap();
    assert!(matches!(CacheConfig::load(file.path()), Err(SyncError::Config(_))));
}

#[test]
fn validate_rejects_blank_language() {
    let config = CacheConfig {
        language: "  ".into(),
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn token_is_never_serialized() {
    let config = HttpSourceConfig::new("https://contoso.example.com").with_token("secret");
    let json = serde_json::to_string(&config).unwrap();
    assert!(!json.contains("secret"));
    assert_eq!(config.timeout_secs, 60);
}

// ── Activity progress ────────────────────────────────────────────

#[test]
fn activity_lifecycle() {
    let phase = SyncPhase::Entities;
    let mut activity = SyncActivity::new(phase);

    assert!(activity.apply(&PhaseEvent::Started { phase, total: Some(10) }));
    assert_eq!(activity.status, ActivityStatus::Running);
    assert!(activity.started_at.is_some());

    assert!(activity.apply(&PhaseEvent::Progress {
        phase,
        processed: 10,
        total: Some(10)
    }));
    assert_eq!(activity.percent, 99, "capped until completion");

    assert!(activity.apply(&PhaseEvent::Completed { phase, processed: 10 }));
    assert_eq!(activity.status, ActivityStatus::Completed);
    assert_eq!(activity.percent, 100);
    assert!(activity.completed_at.is_some());
}

#[test]
fn activity_progress_never_goes_backwards() {
    let phase = SyncPhase::Labels;
    let mut activity = SyncActivity::new(phase);
    activity.apply(&PhaseEvent::Started { phase, total: None });
    activity.apply(&PhaseEvent::Progress {
        phase,
        processed: 6,
        total: Some(8),
    });
    activity.apply(&PhaseEvent::Progress {
        phase,
        processed: 2,
        total: Some(8),
    });
    assert_eq!(activity.items_processed, 6);
    assert_eq!(activity.percent, 75);
}

#[test]
fn activity_rejects_invalid_transitions() {
    let phase = SyncPhase::Enumerations;
    let mut activity = SyncActivity::new(phase);

    assert!(!activity.apply(&PhaseEvent::Completed { phase, processed: 1 }));
    assert!(!activity.apply(&PhaseEvent::Progress {
        phase,
        processed: 1,
        total: None
    }));
    assert!(!activity.apply(&PhaseEvent::Started {
        phase: SyncPhase::Labels,
        total: None
    }));
    assert!(activity.apply(&PhaseEvent::Skipped {
        phase,
        reason: "already populated".into()
    }));
    assert_eq!(activity.message.as_deref(), Some("already populated"));
    assert!(!activity.apply(&PhaseEvent::Started { phase, total: None }));
    assert!(!activity.apply(&PhaseEvent::Cancelled { phase }));
    assert_eq!(activity.status, ActivityStatus::Skipped);
}

#[test]
fn activity_status_table() {
    use ActivityStatus::*;
    assert!(Pending.can_transition_to(Running));
    assert!(Pending.can_transition_to(Skipped));
    assert!(Pending.can_transition_to(Cancelled));
    assert!(!Pending.can_transition_to(Completed));
    assert!(Running.can_transition_to(Failed));
    assert!(!Running.can_transition_to(Skipped));
    for terminal in [Completed, Skipped, Failed, Cancelled] {
        assert!(terminal.is_terminal());
        assert!(!terminal.can_transition_to(Running));
    }
}

#[test]
fn phase_events_serialize_with_a_tag() {
    let event = PhaseEvent::Progress {
        phase: SyncPhase::PublicEntitySchemas,
        processed: 3,
        total: Some(4),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "progress");
    assert_eq!(json["phase"], "public_entity_schemas");
}
