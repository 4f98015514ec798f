//! Consolidation cycle tests
//!
//! SWS blends weights toward importance and decays them; REM additionally
//! reinforces co-recalled relationships and, when enabled, re-routes
//! records whose category no longer matches their content.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use eidetic::engine::{CreateRelationshipRequest, Engine, StoreRequest};
use eidetic::memory::{Category, ConsolidationScheduler, CycleKind, MemoryRecord, RecallRequest};
use eidetic::storage::{
    BackendRegistry, CategoryBackend, EventLog, InMemoryStore, InMemoryVectorIndex, MemoryEvent,
    PrimaryStore,
};
use eidetic::testing::{SlowVectorIndex, mock_embedder, test_config, test_engine};

// =============================================================================
// Helpers
// =============================================================================

async fn store(engine: &Engine, name: &str, content: &str) -> uuid::Uuid {
    engine
        .store(StoreRequest::new("note", name, content))
        .await
        .unwrap()
        .id
}

/// Pretend the record was last touched `hours` ago
async fn age(engine: &Engine, id: uuid::Uuid, hours: i64) {
    let then = Utc::now() - chrono::Duration::hours(hours);
    let backdate = move |r: &mut MemoryRecord| {
        r.last_accessed = then;
        r.created_at = then;
    };
    engine
        .registry()
        .primary()
        .update_record(id, &backdate)
        .await
        .unwrap()
        .unwrap();
}

async fn weight_of(engine: &Engine, id: uuid::Uuid) -> f32 {
    engine
        .registry()
        .primary()
        .get(id)
        .await
        .unwrap()
        .unwrap()
        .weight()
}

// =============================================================================
// SWS
// =============================================================================

mod sws_tests {
    use super::*;

    #[tokio::test]
    async fn test_sws_decays_idle_records() {
        let engine = test_engine();
        let idle = store(&engine, "paris", "Paris is the capital of France").await;
        let fresh = store(&engine, "rome", "Rome is the capital of Italy").await;
        age(&engine, idle, 48).await;

        let report = engine.consolidate(CycleKind::Sws).await.unwrap().unwrap();

        assert_eq!(report.kind, CycleKind::Sws);
        assert_eq!(report.records_scanned, 2);
        assert_eq!(report.records_updated, 2);
        assert!(!report.cancelled);
        assert_eq!(report.edges_reinforced, 0);

        // Two half-lives: at most a quarter of the blended weight remains
        let idle_weight = weight_of(&engine, idle).await;
        let fresh_weight = weight_of(&engine, fresh).await;
        assert!(idle_weight <= 0.25 + 1e-5);
        assert!(fresh_weight > idle_weight);

        let record = engine.registry().primary().get(idle).await.unwrap().unwrap();
        assert!(record.consolidated_at.is_some());
    }

    #[tokio::test]
    async fn test_repeated_cycles_keep_weight_in_unit_interval() {
        let engine = test_engine();
        let mut ids = Vec::new();
        for (i, content) in [
            "Paris is the capital of France",
            "I felt so happy and excited",
            "How to install the toolchain step by step",
            "Urgent deadline for the report",
        ]
        .iter()
        .enumerate()
        {
            ids.push(store(&engine, &format!("record-{i}"), content).await);
        }
        age(&engine, ids[0], 500).await;
        age(&engine, ids[1], 3).await;

        for round in 0..6 {
            let kind = if round % 2 == 0 { CycleKind::Sws } else { CycleKind::Rem };
            engine.consolidate(kind).await.unwrap().unwrap();
            engine
                .recall(RecallRequest::new(format!("capital round {round}")))
                .await
                .unwrap();

            for id in &ids {
                let weight = weight_of(&engine, *id).await;
                assert!((0.0..=1.0).contains(&weight), "weight {weight} out of range");
            }
        }
    }

    #[tokio::test]
    async fn test_nothing_is_ever_deleted() {
        let engine = test_engine();
        let id = store(&engine, "paris", "Paris is the capital of France").await;
        age(&engine, id, 24 * 365).await;

        let report = engine.consolidate(CycleKind::Sws).await.unwrap().unwrap();

        assert_eq!(report.dormant_count, 1);
        assert_eq!(engine.get_stats().await.unwrap().records, 1);

        // Dormant records stay recallable
        let response = engine
            .recall(RecallRequest::new("Paris capital"))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_cycle() {
        let engine = test_engine();
        let id = store(&engine, "paris", "Paris is the capital of France").await;

        engine.shutdown();
        let report = engine.consolidate(CycleKind::Sws).await.unwrap().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.records_updated, 0);
        assert_eq!(weight_of(&engine, id).await, 1.0);
    }

    #[tokio::test]
    async fn test_cycle_emits_completion_event() {
        let engine = test_engine();
        store(&engine, "paris", "Paris is the capital of France").await;

        engine.consolidate(CycleKind::Sws).await.unwrap().unwrap();

        let events = engine.events().unwrap().recent(50);
        assert!(events.iter().any(|e| matches!(
            e,
            MemoryEvent::ConsolidationCompleted { cycle, records_updated: 1, .. } if cycle == "sws"
        )));
    }
}

// =============================================================================
// REM
// =============================================================================

mod rem_tests {
    use super::*;

    #[tokio::test]
    async fn test_rem_reinforces_co_recalled_edges() {
        let engine = test_engine();
        store(&engine, "alpha", "Alpha reactor design").await;
        store(&engine, "beta", "Alpha reactor maintenance").await;
        engine
            .create_relationship(CreateRelationshipRequest::new("alpha", "beta", "supports"))
            .await
            .unwrap();

        let recalled = engine
            .recall(RecallRequest::new("alpha reactor").with_graph(false))
            .await
            .unwrap();
        assert_eq!(recalled.results.len(), 2);

        let report = engine.consolidate(CycleKind::Rem).await.unwrap().unwrap();
        assert_eq!(report.edges_reinforced, 1);

        let edges = engine.registry().primary().all_relationships().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].strength - 0.75).abs() < 1e-5);

        // Pairs are consumed by the cycle
        let again = engine.consolidate(CycleKind::Rem).await.unwrap().unwrap();
        assert_eq!(again.edges_reinforced, 0);
    }

    #[tokio::test]
    async fn test_sws_does_not_reinforce() {
        let engine = test_engine();
        store(&engine, "alpha", "Alpha reactor design").await;
        store(&engine, "beta", "Alpha reactor maintenance").await;
        engine
            .create_relationship(CreateRelationshipRequest::new("alpha", "beta", "supports"))
            .await
            .unwrap();
        engine
            .recall(RecallRequest::new("alpha reactor").with_graph(false))
            .await
            .unwrap();

        let report = engine.consolidate(CycleKind::Sws).await.unwrap().unwrap();
        assert_eq!(report.edges_reinforced, 0);

        let edges = engine.registry().primary().all_relationships().await.unwrap();
        assert!((edges[0].strength - 0.7).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_rem_reroutes_when_enabled() {
        let mut config = test_config();
        config.consolidation.reroute_enabled = true;
        let engine = Engine::new(config, BackendRegistry::in_memory(), mock_embedder());

        let id = engine
            .store(
                StoreRequest::new("note", "paris", "Paris is the capital of France")
                    .with_category(Category::Motor),
            )
            .await
            .unwrap()
            .id;

        let report = engine.consolidate(CycleKind::Rem).await.unwrap().unwrap();
        assert_eq!(report.records_rerouted, 1);

        let record = engine.registry().primary().get(id).await.unwrap().unwrap();
        assert_eq!(record.category, Category::Semantic);

        let events = engine.events().unwrap().recent(50);
        assert!(events.iter().any(|e| matches!(
            e,
            MemoryEvent::Rerouted { from: Category::Motor, to: Category::Semantic, .. }
        )));
    }

    #[tokio::test]
    async fn test_rem_leaves_categories_alone_by_default() {
        let engine = test_engine();
        let id = engine
            .store(
                StoreRequest::new("note", "paris", "Paris is the capital of France")
                    .with_category(Category::Motor),
            )
            .await
            .unwrap()
            .id;

        let report = engine.consolidate(CycleKind::Rem).await.unwrap().unwrap();
        assert_eq!(report.records_rerouted, 0);

        let record = engine.registry().primary().get(id).await.unwrap().unwrap();
        assert_eq!(record.category, Category::Motor);
    }
}

// =============================================================================
// Scheduling
// =============================================================================

mod scheduling_tests {
    use super::*;

    #[tokio::test]
    async fn test_overlapping_cycle_of_same_kind_is_skipped() {
        let mut config = test_config();
        config.consolidation.reroute_enabled = true;
        // Re-routing writes to the slow index, which keeps the first cycle busy
        let slow = SlowVectorIndex::new(
            Arc::new(InMemoryVectorIndex::new()),
            Duration::from_millis(200),
        );
        let registry = BackendRegistry::new(Arc::new(InMemoryStore::new()))
            .with_vector_index(Arc::new(slow))
            .with_events(Arc::new(EventLog::new(100)));
        let engine = Engine::new(config, registry, mock_embedder());
        engine
            .store(
                StoreRequest::new("note", "paris", "Paris is the capital of France")
                    .with_category(Category::Motor),
            )
            .await
            .unwrap();

        let (first, second, other_kind) = tokio::join!(
            engine.consolidate(CycleKind::Rem),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                engine.consolidate(CycleKind::Rem).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                engine.consolidate(CycleKind::Sws).await
            },
        );

        let first = first.unwrap().unwrap();
        assert_eq!(first.records_rerouted, 1);
        assert!(second.unwrap().is_none());
        assert!(other_kind.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let mut config = test_config();
        config.consolidation.sws_interval_secs = 3600;
        config.consolidation.rem_interval_secs = 3600;
        let engine = Arc::new(Engine::new(config, BackendRegistry::in_memory(), mock_embedder()));

        let scheduler = ConsolidationScheduler::spawn(Arc::clone(&engine));
        engine.shutdown();

        tokio::time::timeout(Duration::from_secs(5), scheduler.join())
            .await
            .unwrap();
    }
}
