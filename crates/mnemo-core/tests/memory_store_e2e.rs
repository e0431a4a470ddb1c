//! End-to-end tests for recording, retrieval and access bookkeeping.

use std::sync::Arc;

use chrono::{Duration, Utc};

use mnemo_core::store::fakes::InMemoryRecordStore;
use mnemo_core::{
    MaintenanceOp, Memory, MemoryError, MemoryPatch, MemoryStore, MemoryType, NewMemory,
    QuerySpec, RecordStore, StoreConfig,
};

async fn open_store() -> (Arc<InMemoryRecordStore>, MemoryStore<InMemoryRecordStore>) {
    let backend = Arc::new(InMemoryRecordStore::new());
    let store = MemoryStore::open(backend.clone(), StoreConfig::default())
        .await
        .unwrap();
    (backend, store)
}

fn aged(content: &str, summary: &str, age_days: i64, relevance: f64) -> Memory {
    let created = Utc::now() - Duration::days(age_days);
    let mut m = Memory::from_new(NewMemory::new(content, summary, MemoryType::Pattern), created)
        .unwrap();
    m.relevance_score = relevance;
    m
}

#[tokio::test]
async fn test_decision_memory_lifecycle_scenario() {
    let (backend, store) = open_store().await;

    let m1 = store
        .record(
            NewMemory::new(
                "Adopted JWT bearer tokens for the API gateway",
                "Use JWT for auth",
                MemoryType::Decision,
            )
            .with_confidence(0.85)
            .with_tags(&["auth", "jwt"]),
        )
        .await
        .unwrap();
    assert_eq!(m1.confidence, 0.85);

    let hits = store.query(&QuerySpec::all().with_tag("auth")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, m1.id);

    // Pretend the last access was 30 days ago.
    let mut stale = store.peek(&m1.id).await.unwrap();
    let before = stale.relevance_score;
    stale.last_accessed = Utc::now() - Duration::days(30);
    backend.put(&stale).await.unwrap();

    let report = store
        .maintenance(MaintenanceOp::Decay {
            half_life_days: Some(30.0),
        })
        .await
        .unwrap();
    assert_eq!(report.changed, 1);
    let decayed = store.peek(&m1.id).await.unwrap();
    let ratio = decayed.relevance_score / before;
    assert!((ratio - 0.5).abs() < 1e-3, "ratio = {ratio}");

    // A 100-day-old, low-relevance memory gets archived.
    let old = aged("Legacy session cookies", "Session cookies", 100, 0.2);
    let bundle = serde_json::to_vec(&vec![old.clone()]).unwrap();
    assert_eq!(store.import(&bundle, false).await.unwrap().imported, 1);

    let report = store
        .maintenance(MaintenanceOp::Archive {
            age_days: Some(90),
            relevance_floor: None,
        })
        .await
        .unwrap();
    assert_eq!(report.changed, 1);
    assert!(store.peek(&old.id).await.unwrap().archived);

    let default_hits = store.query(&QuerySpec::all()).await.unwrap();
    assert!(default_hits.iter().all(|m| m.id != old.id));

    let with_archived = store
        .query(&QuerySpec::all().include_archived())
        .await
        .unwrap();
    assert!(with_archived.iter().any(|m| m.id == old.id));
}

#[tokio::test]
async fn test_version_increments_by_one_per_update() {
    let (_, store) = open_store().await;
    let m = store
        .record(NewMemory::new("cache warmup on boot", "Cache warmup", MemoryType::Pattern))
        .await
        .unwrap();

    let mut expected = m.version;
    for summary in ["Warm cache on boot", "Warm caches at startup", "Startup cache warmup"] {
        let updated = store
            .update(&m.id, MemoryPatch::default().with_summary(summary))
            .await
            .unwrap();
        expected += 1;
        assert_eq!(updated.version, expected);
        assert_eq!(updated.id, m.id);
        assert_eq!(updated.created, m.created);
        assert!(updated.last_updated.is_some());
    }

    // A rejected edit leaves the version alone.
    assert!(store.update(&m.id, MemoryPatch::default()).await.is_err());
    assert_eq!(store.peek(&m.id).await.unwrap().version, expected);
}

#[tokio::test]
async fn test_access_count_tracks_every_read() {
    let (_, store) = open_store().await;
    let m = store
        .record(NewMemory::new("prefer tabs", "Tabs over spaces", MemoryType::UserPreference))
        .await
        .unwrap();

    for _ in 0..3 {
        store.get(&m.id).await.unwrap();
    }
    for _ in 0..2 {
        let hits = store
            .query(&QuerySpec::all().with_type(MemoryType::UserPreference))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
    let after = store.peek(&m.id).await.unwrap();
    assert_eq!(after.access_count, 5);
    assert!(after.relevance_score >= m.relevance_score);
    assert_eq!(after.version, m.version);

    // Archived memories are counted too.
    store
        .update(&m.id, MemoryPatch::default().with_archived(true))
        .await
        .unwrap();
    store.get(&m.id).await.unwrap();
    assert_eq!(store.peek(&m.id).await.unwrap().access_count, 6);
}

#[tokio::test]
async fn test_duplicate_rejected_within_window() {
    let (_, store) = open_store().await;
    let new = NewMemory::new(
        "Retry S3 uploads with exponential backoff",
        "Retry uploads",
        MemoryType::ErrorRecovery,
    );
    let first = store.record(new.clone()).await.unwrap();

    match store.record(new.clone()).await {
        Err(MemoryError::Duplicate { existing_id }) => assert_eq!(existing_id, first.id),
        other => panic!("expected duplicate rejection, got {other:?}"),
    }

    let mut other_type = new.clone();
    other_type.memory_type = Some(MemoryType::Pattern);
    assert!(store.record(other_type).await.is_ok());

    assert!(store.record(new.forced()).await.is_ok());
}

#[tokio::test]
async fn test_duplicate_allowed_after_window() {
    let (_, store) = open_store().await;
    let old = aged("Pin the toolchain version", "Pin toolchain", 1, 1.0);
    let bundle = serde_json::to_vec(&vec![old]).unwrap();
    store.import(&bundle, false).await.unwrap();

    let again = store
        .record(NewMemory::new("Pin the toolchain version", "Pin toolchain", MemoryType::Pattern))
        .await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (_, store) = open_store().await;
    let m = store
        .record(NewMemory::new("x marks the spot", "X spot", MemoryType::Feedback))
        .await
        .unwrap();
    assert!(store.delete(&m.id).await.unwrap());
    assert!(!store.delete(&m.id).await.unwrap());
    assert!(matches!(
        store.get(&m.id).await,
        Err(MemoryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_query_text_sort_and_limit() {
    let (_, store) = open_store().await;
    for (content, summary) in [
        ("Parser fails on trailing commas in config.toml", "Trailing comma parse error"),
        ("Use serde defaults for optional config fields", "Serde defaults"),
        ("Dashboard colours follow the brand palette", "Brand palette"),
    ] {
        store
            .record(NewMemory::new(content, summary, MemoryType::Breakthrough))
            .await
            .unwrap();
    }

    let hits = store
        .query(&QuerySpec::all().with_text("config parse"))
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|m| !m.summary.contains("palette")));

    let limited = store.query(&QuerySpec::all().with_limit(2)).await.unwrap();
    assert_eq!(limited.len(), 2);

    let none = store
        .query(&QuerySpec::all().with_project("nowhere"))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_reactivate_returns_memory_to_default_queries() {
    let (_, store) = open_store().await;
    let m = store
        .record(NewMemory::new("old flag", "Old flag", MemoryType::Decision))
        .await
        .unwrap();
    store
        .update(&m.id, MemoryPatch::default().with_archived(true))
        .await
        .unwrap();
    assert!(store.query(&QuerySpec::all()).await.unwrap().is_empty());

    let back = store.reactivate(&m.id).await.unwrap();
    assert!(!back.archived);
    assert_eq!(back.version, 3);
    assert_eq!(store.query(&QuerySpec::all()).await.unwrap().len(), 1);
}
