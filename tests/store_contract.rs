use chrono::{Duration, TimeZone, Utc};
use jira_metrics_store::models::{
    JiraCacheEntry, MetricType, MetricsSnapshot, ProjectData, SaveProfilePayload, SaveQueryPayload,
    ACTIVE_PROFILE_KEY,
};
use jira_metrics_store::{AppError, BatchCoordinator, Clock, Database, EntityStore, JsonStore, ManualClock};
use std::sync::Arc;
use tempfile::TempDir;

struct Backend {
    name: &'static str,
    store: Arc<dyn EntityStore>,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

fn backends() -> Vec<Backend> {
    let start = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();

    let sqlite_dir = tempfile::tempdir().expect("tempdir");
    let sqlite_clock = Arc::new(ManualClock::new(start));
    let sqlite = Database::with_clock(&sqlite_dir.path().join("state.sqlite"), sqlite_clock.clone()).expect("sqlite");

    let json_dir = tempfile::tempdir().expect("tempdir");
    let json_clock = Arc::new(ManualClock::new(start));
    let json = JsonStore::open_with_clock(&json_dir.path().join("state.json"), json_clock.clone()).expect("json");

    vec![
        Backend {
            name: "sqlite",
            store: Arc::new(sqlite),
            clock: sqlite_clock,
            _dir: sqlite_dir,
        },
        Backend {
            name: "json",
            store: Arc::new(json),
            clock: json_clock,
            _dir: json_dir,
        },
    ]
}

fn seed(store: &dyn EntityStore, profile_id: &str, query_id: &str) {
    if store.get_profile(profile_id).expect("get profile").is_none() {
        store
            .save_profile(SaveProfilePayload {
                id: Some(profile_id.to_string()),
                name: profile_id.to_string(),
                jira_config: serde_json::json!({ "baseUrl": "https://issues.apache.org/jira" }),
                field_mappings: Default::default(),
            })
            .expect("save profile");
    }
    store
        .save_query(SaveQueryPayload {
            id: Some(query_id.to_string()),
            profile_id: profile_id.to_string(),
            name: query_id.to_string(),
            jql: format!("project = {}", profile_id.to_uppercase()),
        })
        .expect("save query");
}

fn cache_entry(backend: &Backend, profile_id: &str, query_id: &str, key: &str, ttl: Duration) -> JiraCacheEntry {
    let now = backend.clock.now();
    JiraCacheEntry {
        profile_id: profile_id.to_string(),
        query_id: query_id.to_string(),
        cache_key: key.to_string(),
        payload: serde_json::json!({ "issues": [{ "key": "KAFKA-1" }] }),
        cached_at: now,
        expires_at: now + ttl,
    }
}

fn snapshot(profile_id: &str, query_id: &str, week: &str, metric_type: MetricType, value: i64) -> MetricsSnapshot {
    MetricsSnapshot {
        profile_id: profile_id.to_string(),
        query_id: query_id.to_string(),
        snapshot_date: week.to_string(),
        metric_type,
        metrics: serde_json::json!({ "deployment_frequency": value }),
        forecast: None,
        computed_at: Utc::now(),
    }
}


#[test]
fn deleting_profile_cascades_through_queries_and_dependents() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "p1", "q1");
        seed(store, "p1", "q2");
        store
            .save_jira_cache(&cache_entry(&backend, "p1", "q1", "search", Duration::hours(1)))
            .expect("cache");
        store
            .save_metrics_snapshot(&snapshot("p1", "q1", "2026-W42", MetricType::Dora, 3))
            .expect("snapshot");
        store
            .save_project_data(&ProjectData {
                profile_id: "p1".to_string(),
                query_id: "q2".to_string(),
                statistics: serde_json::json!({ "completed": 12 }),
                scope: serde_json::json!({ "total": 40 }),
                updated_at: Utc::now(),
            })
            .expect("project data");
        store.set_app_state(ACTIVE_PROFILE_KEY, "p1").expect("active");

        store.delete_profile("p1").expect("delete");

        assert!(store.get_profile("p1").expect("profile").is_none(), "{}", backend.name);
        assert!(store.get_query("p1", "q1").expect("query").is_none(), "{}", backend.name);
        assert!(store.list_queries("p1").expect("queries").is_empty(), "{}", backend.name);
        assert!(store.get_jira_cache("p1", "q1", "search").expect("cache").is_none(), "{}", backend.name);
        assert!(store
            .get_metrics_snapshots("p1", "q1", None, None)
            .expect("snapshots")
            .is_empty());
        assert!(store.get_project_data("p1", "q2").expect("data").is_none(), "{}", backend.name);
        assert!(store.get_app_state(ACTIVE_PROFILE_KEY).expect("state").is_none(), "{}", backend.name);

        // Re-creating the same ids must not resurrect old rows.
        seed(store, "p1", "q1");
        assert!(store.get_jira_cache("p1", "q1", "search").expect("cache").is_none(), "{}", backend.name);
    }
}

#[test]
fn deleting_query_leaves_sibling_rows_alone() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "p1", "q1");
        seed(store, "p1", "q2");
        for query in ["q1", "q2"] {
            store
                .save_metrics_snapshot(&snapshot("p1", query, "2026-W42", MetricType::Flow, 1))
                .expect("snapshot");
        }

        store.delete_query("p1", "q1").expect("delete");

        assert!(store.get_query("p1", "q1").expect("q1").is_none(), "{}", backend.name);
        assert!(store.get_metrics_snapshots("p1", "q1", None, None).expect("q1 rows").is_empty());
        assert_eq!(store.get_metrics_snapshots("p1", "q2", None, None).expect("q2 rows").len(), 1);
    }
}

#[test]
fn deleting_absent_entities_is_not_found() {
    for backend in backends() {
        let store = backend.store.as_ref();
        assert!(matches!(store.delete_profile("ghost"), Err(AppError::NotFound(_))), "{}", backend.name);
        seed(store, "p1", "q1");
        assert!(matches!(store.delete_query("p1", "ghost"), Err(AppError::NotFound(_))), "{}", backend.name);
        assert!(store.get_profile("ghost").expect("absent is not an error").is_none());
    }
}

#[test]
fn saves_validate_required_fields() {
    for backend in backends() {
        let store = backend.store.as_ref();
        let err = store
            .save_profile(SaveProfilePayload {
                id: None,
                name: "   ".to_string(),
                jira_config: serde_json::json!({}),
                field_mappings: Default::default(),
            })
            .expect_err("blank name");
        assert!(matches!(err, AppError::Validation(_)), "{}", backend.name);

        seed(store, "p1", "q1");
        let err = store
            .save_query(SaveQueryPayload {
                id: Some("q2".to_string()),
                profile_id: "p1".to_string(),
                name: "no jql".to_string(),
                jql: String::new(),
            })
            .expect_err("blank jql");
        assert!(matches!(err, AppError::Validation(_)), "{}", backend.name);

        let err = store
            .save_jira_cache(&cache_entry(&backend, "p1", "missing", "k", Duration::hours(1)))
            .expect_err("missing parent");
        assert!(matches!(err, AppError::NotFound(_)), "{}", backend.name);
    }
}

#[test]
fn cache_entries_expire_on_read_without_a_sweep() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "kafka", "12w");
        store
            .save_jira_cache(&cache_entry(&backend, "kafka", "12w", "search:abc", Duration::hours(1)))
            .expect("save");

        let hit = store.get_jira_cache("kafka", "12w", "search:abc").expect("get");
        assert_eq!(
            hit.map(|entry| entry.payload),
            Some(serde_json::json!({ "issues": [{ "key": "KAFKA-1" }] })),
            "{}",
            backend.name
        );

        backend.clock.advance(Duration::hours(2));
        assert!(store.get_jira_cache("kafka", "12w", "search:abc").expect("get").is_none(), "{}", backend.name);
    }
}

#[test]
fn resaving_cache_key_upserts_and_extends_expiry() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "kafka", "12w");
        store
            .save_jira_cache(&cache_entry(&backend, "kafka", "12w", "k", Duration::minutes(30)))
            .expect("first");
        let mut refreshed = cache_entry(&backend, "kafka", "12w", "k", Duration::hours(3));
        refreshed.payload = serde_json::json!({ "issues": [] });
        store.save_jira_cache(&refreshed).expect("second");

        backend.clock.advance(Duration::hours(1));
        let entry = store.get_jira_cache("kafka", "12w", "k").expect("get").expect("live");
        assert_eq!(entry.payload, serde_json::json!({ "issues": [] }), "{}", backend.name);
    }
}

#[test]
fn cleanup_sweep_is_idempotent() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "p1", "q1");
        store
            .save_jira_cache(&cache_entry(&backend, "p1", "q1", "short", Duration::minutes(5)))
            .expect("short");
        store
            .save_jira_cache(&cache_entry(&backend, "p1", "q1", "long", Duration::days(2)))
            .expect("long");

        backend.clock.advance(Duration::hours(1));
        assert_eq!(store.cleanup_expired_cache().expect("first sweep"), 1, "{}", backend.name);
        assert_eq!(store.cleanup_expired_cache().expect("second sweep"), 0, "{}", backend.name);
        assert!(store.get_jira_cache("p1", "q1", "long").expect("get").is_some(), "{}", backend.name);
    }
}

#[test]
fn clearing_query_cache_ignores_expiry() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "p1", "q1");
        store
            .save_jira_cache(&cache_entry(&backend, "p1", "q1", "a", Duration::days(1)))
            .expect("a");
        store
            .save_jira_cache(&cache_entry(&backend, "p1", "q1", "b", Duration::days(1)))
            .expect("b");
        assert_eq!(store.clear_query_cache("p1", "q1").expect("clear"), 2, "{}", backend.name);
        assert!(store.get_jira_cache("p1", "q1", "a").expect("get").is_none());
    }
}

#[test]
fn snapshot_key_is_unique_and_latest_payload_wins() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "p1", "q1");
        store
            .save_metrics_snapshot(&snapshot("p1", "q1", "2026-W42", MetricType::Dora, 1))
            .expect("first");
        store
            .save_metrics_snapshot(&snapshot("p1", "q1", "2026-W42", MetricType::Dora, 2))
            .expect("second");

        let rows = store
            .get_metrics_snapshots("p1", "q1", Some(MetricType::Dora), None)
            .expect("rows");
        assert_eq!(rows.len(), 1, "{}", backend.name);
        assert_eq!(rows[0].metrics, serde_json::json!({ "deployment_frequency": 2 }), "{}", backend.name);
    }
}

#[test]
fn snapshot_listing_is_week_ascending_and_limit_keeps_latest() {
    for backend in backends() {
        let store = backend.store.as_ref();
        seed(store, "p1", "q1");
        for week in ["2026-W40", "2026-W38", "2026-W41", "2026-W39"] {
            store
                .save_metrics_snapshot(&snapshot("p1", "q1", week, MetricType::Flow, 1))
                .expect("save");
        }
        store
            .save_metrics_snapshot(&snapshot("p1", "q1", "2026-W41", MetricType::Dora, 1))
            .expect("save dora");

        let flow = store
            .get_metrics_snapshots("p1", "q1", Some(MetricType::Flow), Some(2))
            .expect("flow");
        let weeks = flow.iter().map(|row| row.snapshot_date.as_str()).collect::<Vec<_>>();
        assert_eq!(weeks, vec!["2026-W40", "2026-W41"], "{}", backend.name);

        assert_eq!(store.get_metrics_snapshots("p1", "q1", None, None).expect("all").len(), 5);
        assert_eq!(store.delete_metrics_snapshots("p1", "q1").expect("delete"), 5, "{}", backend.name);
    }
}

#[test]
fn batched_saves_match_immediate_saves() {
    let weeks = (30..42).map(|week| format!("2026-W{:02}", week)).collect::<Vec<_>>();

    for backend in backends() {
        let store = backend.store.clone();
        seed(store.as_ref(), "p1", "immediate");
        seed(store.as_ref(), "p1", "batched");

        for (value, week) in weeks.iter().enumerate() {
            store
                .save_metrics_snapshot(&snapshot("p1", "immediate", week, MetricType::Flow, value as i64))
                .expect("immediate");
        }

        let batch = BatchCoordinator::new(store.clone());
        let scope = batch.enter().expect("enter");
        for (value, week) in weeks.iter().enumerate() {
            store
                .save_metrics_snapshot(&snapshot("p1", "batched", week, MetricType::Flow, value as i64))
                .expect("batched");
        }
        scope.finish().expect("flush");

        let strip = |rows: Vec<MetricsSnapshot>| {
            rows.into_iter()
                .map(|row| (row.snapshot_date, row.metric_type, row.metrics))
                .collect::<Vec<_>>()
        };
        let immediate = strip(store.get_metrics_snapshots("p1", "immediate", None, None).expect("rows"));
        let batched = strip(store.get_metrics_snapshots("p1", "batched", None, None).expect("rows"));
        assert_eq!(immediate, batched, "{}", backend.name);
        assert_eq!(batched.len(), weeks.len());
    }
}

#[test]
fn json_store_batch_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    {
        let store: Arc<dyn EntityStore> = Arc::new(JsonStore::open(&path).expect("open"));
        seed(store.as_ref(), "p1", "q1");
        let batch = BatchCoordinator::new(store.clone());
        let _scope = batch.enter().expect("enter");
        store
            .save_metrics_snapshot(&snapshot("p1", "q1", "2026-W42", MetricType::Dora, 9))
            .expect("save");
    }
    let reopened = JsonStore::open(&path).expect("reopen");
    assert!(reopened
        .get_metrics_snapshot("p1", "q1", "2026-W42", MetricType::Dora)
        .expect("get")
        .is_some());
}
