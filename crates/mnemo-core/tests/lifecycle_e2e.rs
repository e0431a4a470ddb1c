//! Consolidation, chain traversal and maintenance against a live store.

use std::sync::Arc;

use chrono::{Duration, Utc};

use mnemo_core::store::fakes::InMemoryRecordStore;
use mnemo_core::{
    ExportFormat, MaintenanceOp, Memory, MemoryError, MemoryPatch, MemoryStore, MemoryType,
    NewMemory, QuerySpec, StoreConfig,
};

async fn open_store() -> (Arc<InMemoryRecordStore>, MemoryStore<InMemoryRecordStore>) {
    let backend = Arc::new(InMemoryRecordStore::new());
    let store = MemoryStore::open(backend.clone(), StoreConfig::default())
        .await
        .unwrap();
    (backend, store)
}

fn aged(new: NewMemory, age_days: i64, relevance: f64) -> Memory {
    let mut m = Memory::from_new(new, Utc::now() - Duration::days(age_days)).unwrap();
    m.relevance_score = relevance;
    m
}

async fn import_all(store: &MemoryStore<InMemoryRecordStore>, memories: &[Memory]) {
    let bytes = serde_json::to_vec(memories).unwrap();
    let report = store.import(&bytes, false).await.unwrap();
    assert_eq!(report.imported, memories.len());
}

#[tokio::test]
async fn test_consolidate_keeps_newest_and_redirects_edges() {
    let (_, store) = open_store().await;
    let older = aged(
        NewMemory::new(
            "Run rustfmt before every commit",
            "Format before commit",
            MemoryType::Pattern,
        )
        .with_tags(&["fmt"]),
        2,
        0.6,
    );
    import_all(&store, &[older.clone()]).await;

    let newer = store
        .record(
            NewMemory::new(
                "Run rustfmt before every commit",
                "Format before commit",
                MemoryType::Pattern,
            )
            .with_tags(&["style"]),
        )
        .await
        .unwrap();
    let linked = store
        .record(
            NewMemory::new(
                "CI rejects unformatted pushes",
                "Formatting enforced in CI",
                MemoryType::Decision,
            )
            .related_to(&[older.id.as_str()]),
        )
        .await
        .unwrap();

    let candidates = store.consolidation_candidates().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].should_merge);

    let report = store.consolidate().await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.merged, 1);
    assert_eq!(report.removed_ids, vec![older.id.clone()]);
    assert_eq!(report.remaining, 2);
    assert!(report.failed.is_empty());

    assert!(matches!(
        store.peek(&older.id).await,
        Err(MemoryError::NotFound { .. })
    ));
    let survivor = store.peek(&newer.id).await.unwrap();
    assert_eq!(survivor.consolidated_from, vec![older.id.clone()]);
    assert!(survivor.tags.contains("fmt") && survivor.tags.contains("style"));
    assert_eq!(survivor.relevance_score, 1.0);
    assert_eq!(survivor.version, newer.version + 1);

    let linked = store.peek(&linked.id).await.unwrap();
    assert_eq!(linked.related_memories, vec![newer.id.clone()]);

    let again = store.consolidate().await.unwrap();
    assert_eq!(again.merged, 0);
    assert!(again.removed_ids.is_empty());
}

#[tokio::test]
async fn test_same_summary_pairs_are_advisory_only() {
    let (_, store) = open_store().await;
    let first = aged(
        NewMemory::new("Postgres pool size set to 20", "Database tuning", MemoryType::Decision),
        3,
        0.9,
    );
    let second = aged(
        NewMemory::new("Vacuum runs nightly at 02:00", "Database tuning", MemoryType::Decision),
        2,
        0.9,
    );
    import_all(&store, &[first, second]).await;

    let candidates = store.consolidation_candidates().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(!candidates[0].should_merge);

    let report = store.consolidate().await.unwrap();
    assert_eq!(report.merged, 0);
    assert_eq!(report.remaining, 2);
}

#[tokio::test]
async fn test_chain_over_cycle_terminates_with_unique_ids() {
    let (_, store) = open_store().await;
    let a = store
        .record(NewMemory::new("alpha body text", "Alpha", MemoryType::Decision))
        .await
        .unwrap();
    let b = store
        .record(NewMemory::new("beta body text", "Beta", MemoryType::Decision).related_to(&[a.id.as_str()]))
        .await
        .unwrap();
    let c = store
        .record(NewMemory::new("gamma body text", "Gamma", MemoryType::Decision).related_to(&[b.id.as_str()]))
        .await
        .unwrap();
    store
        .update(&a.id, MemoryPatch::default().related_to(&[c.id.as_str()]))
        .await
        .unwrap();

    let chain = store.get_chain(&a.id, 10, false).await.unwrap();
    let ids: Vec<&str> = chain.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], a.id);
    assert!(ids.contains(&b.id.as_str()) && ids.contains(&c.id.as_str()));
    assert!(chain.iter().all(|m| m.content.is_empty()));

    // Content is only blanked in the returned copies.
    let stored = store.peek(&b.id).await.unwrap();
    assert_eq!(stored.content, "beta body text");
    assert_eq!(stored.access_count, 1);

    let with_content = store.get_chain(&a.id, 1, true).await.unwrap();
    assert_eq!(with_content.len(), 3);
    assert!(with_content.iter().all(|m| !m.content.is_empty()));
}

#[tokio::test]
async fn test_chain_depth_is_capped() {
    let (_, store) = open_store().await;
    let mut previous: Option<String> = None;
    let mut first = None;
    for i in 0..8 {
        let mut new = NewMemory::new(
            &format!("link number {i} in the chain"),
            &format!("Step {i}"),
            MemoryType::Pattern,
        );
        if let Some(prev) = &previous {
            new = new.related_to(&[prev.as_str()]);
        }
        let m = store.record(new).await.unwrap();
        first.get_or_insert(m.id.clone());
        previous = Some(m.id);
    }
    let root = first.unwrap();

    let chain = store.get_chain(&root, 2, true).await.unwrap();
    assert_eq!(chain.len(), 3);

    let max = store.config().max_chain_depth;
    let capped = store.get_chain(&root, 100, true).await.unwrap();
    assert_eq!(capped.len(), max + 1);

    assert!(matches!(
        store.get_chain("mem_missing", 2, true).await,
        Err(MemoryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_decay_never_raises_relevance() {
    let (_, store) = open_store().await;
    let memories = vec![
        aged(NewMemory::new("first decaying note", "Decay one", MemoryType::Feedback), 10, 0.9),
        aged(NewMemory::new("second decaying note", "Decay two", MemoryType::Feedback), 60, 0.4),
        aged(NewMemory::new("third decaying note", "Decay three", MemoryType::Feedback), 0, 1.0),
    ];
    import_all(&store, &memories).await;

    for _ in 0..2 {
        let before: Vec<Memory> = peek_all(&store, &memories).await;
        let report = store
            .maintenance(MaintenanceOp::Decay { half_life_days: None })
            .await
            .unwrap();
        assert_eq!(report.processed, 3);
        assert!(report.failed.is_empty());
        let after = peek_all(&store, &memories).await;
        for (b, a) in before.iter().zip(&after) {
            assert!(a.relevance_score <= b.relevance_score);
            assert!(a.relevance_score >= 0.0);
            assert_eq!(a.version, b.version);
        }
    }

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert!(stats.mean_relevance < 1.0);
}

async fn peek_all(store: &MemoryStore<InMemoryRecordStore>, memories: &[Memory]) -> Vec<Memory> {
    let mut out = Vec::with_capacity(memories.len());
    for m in memories {
        out.push(store.peek(&m.id).await.unwrap());
    }
    out
}

#[tokio::test]
async fn test_archive_reports_per_record_failures() {
    let (backend, store) = open_store().await;
    let stuck = aged(NewMemory::new("stale note one", "Stale one", MemoryType::Pattern), 120, 0.1);
    let fine = aged(NewMemory::new("stale note two", "Stale two", MemoryType::Pattern), 120, 0.1);
    let fresh = aged(NewMemory::new("fresh note", "Fresh", MemoryType::Pattern), 1, 0.1);
    import_all(&store, &[stuck.clone(), fine.clone(), fresh.clone()]).await;

    backend.fail_puts_for(&stuck.id);
    let report = store
        .maintenance(MaintenanceOp::Archive {
            age_days: None,
            relevance_floor: None,
        })
        .await
        .unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.changed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, stuck.id);

    assert!(!store.peek(&stuck.id).await.unwrap().archived);
    assert!(store.peek(&fine.id).await.unwrap().archived);
    assert!(!store.peek(&fresh.id).await.unwrap().archived);

    let stats = report.stats.unwrap();
    assert_eq!(stats.archived, 1);
    assert_eq!(stats.active, 2);
}

#[tokio::test]
async fn test_import_does_not_resurrect_consolidated_records() {
    let (_, store) = open_store().await;
    let older = aged(
        NewMemory::new("Cache builds with sccache", "Build cache", MemoryType::Pattern),
        4,
        0.7,
    );
    import_all(&store, &[older.clone()]).await;
    let newer = store
        .record(NewMemory::new("Cache builds with sccache", "Build cache", MemoryType::Pattern))
        .await
        .unwrap();
    let before_merge = store
        .export(&QuerySpec::all(), ExportFormat::Structured)
        .await
        .unwrap();

    let merged = store.consolidate().await.unwrap();
    assert_eq!(merged.removed_ids, vec![older.id.clone()]);

    let report = store.import(&before_merge, false).await.unwrap();
    assert_eq!(report.imported, 0);
    assert_eq!(report.skipped, 2);
    assert!(matches!(
        store.peek(&older.id).await,
        Err(MemoryError::NotFound { .. })
    ));

    let report = store.import(&before_merge, true).await.unwrap();
    assert_eq!(report.imported, 0);
    assert_eq!(report.overwritten, 1);
    assert_eq!(report.skipped, 1);
    let survivor = store.peek(&newer.id).await.unwrap();
    assert_eq!(survivor.consolidated_from, vec![older.id.clone()]);

    let again = store.consolidate().await.unwrap();
    assert!(again.removed_ids.is_empty());
    assert_eq!(again.remaining, 1);
}

#[tokio::test]
async fn test_archive_rejects_out_of_range_parameters() {
    let (_, store) = open_store().await;
    let fresh = aged(NewMemory::new("fresh low note", "Fresh low", MemoryType::Pattern), 0, 0.1);
    import_all(&store, &[fresh.clone()]).await;

    for op in [
        MaintenanceOp::Archive {
            age_days: Some(u64::MAX),
            relevance_floor: None,
        },
        MaintenanceOp::Archive {
            age_days: Some(1_000_000_000),
            relevance_floor: None,
        },
        MaintenanceOp::Archive {
            age_days: Some(1),
            relevance_floor: Some(-0.5),
        },
    ] {
        assert!(matches!(
            store.maintenance(op).await,
            Err(MemoryError::Validation { .. })
        ));
    }
    assert!(!store.peek(&fresh.id).await.unwrap().archived);
}
