//! Hybrid recall tests
//!
//! Covers ranking, scoping, graph expansion, the result cache, access
//! counting and every degraded path: a failing vector index, a slow one and
//! a missing embedding provider.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;

use eidetic::embedding::{EmbeddingAdapter, EmbeddingSource};
use eidetic::engine::{CreateRelationshipRequest, Engine, StoreRequest};
use eidetic::error::EideticError;
use eidetic::memory::recall::fuse_score;
use eidetic::memory::{Category, MatchType, MemoryRecord, RecallRequest, Relationship};
use eidetic::storage::{
    BackendRegistry, CategoryBackend, GraphBackend, InMemoryStore, InMemoryVectorIndex,
    PrimaryStore,
};
use eidetic::testing::{
    SlowObservationStore, SlowVectorIndex, TEST_DIMENSION, UnavailableVectorIndex,
    mock_embedder, test_config, test_engine, test_engine_with,
};

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

async fn seed(engine: &Engine) {
    store(engine, "paris", "Paris is the capital of France").await;
    store(engine, "rome", "Rome is the capital of Italy").await;
    store(engine, "mood", "I felt so happy and excited").await;
}

fn text_only_engine() -> Engine {
    let registry =
        BackendRegistry::new(Arc::new(InMemoryStore::new())).with_graph(Arc::new(GraphBackend::new()));
    test_engine_with(registry)
}

// =============================================================================
// Ranking
// =============================================================================

mod ranking_tests {
    use super::*;

    #[test]
    fn test_fusion_prefers_similarity_at_default_weights() {
        let close = fuse_score(0.9, 0.2, 0.7, 0.3);
        let important = fuse_score(0.5, 0.9, 0.7, 0.3);

        assert!((close - 0.69).abs() < 1e-5);
        assert!((important - 0.62).abs() < 1e-5);
        assert!(close > important);
    }

    #[test]
    fn test_negative_similarity_counts_as_zero() {
        assert_eq!(fuse_score(-0.4, 0.5, 0.7, 0.3), fuse_score(0.0, 0.5, 0.7, 0.3));
    }

    #[tokio::test]
    async fn test_results_are_ranked_by_score() {
        let engine = test_engine();
        seed(&engine).await;

        let response = engine
            .recall(RecallRequest::new("Paris is the capital of France"))
            .await
            .unwrap();

        assert_eq!(response.results[0].name, "paris");
        assert!(
            response
                .results
                .windows(2)
                .all(|pair| pair[0].score >= pair[1].score)
        );
        assert!(response.results.iter().all(|r| r.match_type == MatchType::Vector));
        assert!(!response.degraded);
    }

    #[tokio::test]
    async fn test_max_results_truncates_but_counts_all() {
        let engine = test_engine();
        seed(&engine).await;

        let response = engine
            .recall(RecallRequest::new("capital").with_max_results(1))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert!(response.total_found >= 1);
    }

    #[tokio::test]
    async fn test_equal_scores_rank_recent_access_first() {
        let engine = text_only_engine();
        let a = store(&engine, "first", "Notes on ownership rules").await;
        let b = store(&engine, "second", "Notes on ownership rules").await;

        // Same age and score; the later access must win even against id order
        let (recent, stale) = if a > b { (a, b) } else { (b, a) };
        let created = chrono::Utc::now() - chrono::Duration::hours(2);
        for (id, accessed) in [
            (recent, created + chrono::Duration::minutes(30)),
            (stale, created),
        ] {
            let backdate = move |r: &mut MemoryRecord| {
                r.created_at = created;
                r.last_accessed = accessed;
            };
            engine
                .registry()
                .primary()
                .update_record(id, &backdate)
                .await
                .unwrap();
        }

        let response = engine
            .recall(RecallRequest::new("ownership").with_graph(false))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].score, response.results[1].score);
        assert_eq!(response.results[0].id, recent);
        assert_eq!(response.results[1].id, stale);
    }
}

// =============================================================================
// Query context
// =============================================================================

mod context_tests {
    use super::*;

    #[tokio::test]
    async fn test_relevance_boost_raises_ranking_importance_only() {
        let engine = text_only_engine();
        let id = store(&engine, "alpha", "Alpha reactor design notes").await;

        let boosted = engine
            .recall(RecallRequest::new("alpha reactor").with_relevance_boost(3.0))
            .await
            .unwrap();
        // The second recall also sees one more access, which the boost outweighs
        let plain = engine
            .recall(RecallRequest::new("alpha reactor"))
            .await
            .unwrap();

        assert!(!plain.cached);
        assert!(boosted.results[0].importance > plain.results[0].importance);

        let record = engine.registry().primary().get(id).await.unwrap().unwrap();
        assert_eq!(record.importance.contextual, 0.0);
        assert_eq!(record.access_count, 2);
    }

    #[tokio::test]
    async fn test_negative_relevance_boost_is_rejected() {
        let engine = test_engine();

        let result = engine
            .recall(RecallRequest::new("anything").with_relevance_boost(-1.0))
            .await;

        assert!(matches!(result, Err(EideticError::Validation(_))));
    }
}

// =============================================================================
// Scoping and validation
// =============================================================================

mod scope_tests {
    use super::*;

    #[tokio::test]
    async fn test_entity_type_scope() {
        let engine = test_engine();
        engine
            .store(StoreRequest::new("city", "paris", "Capital of France"))
            .await
            .unwrap();
        engine
            .store(StoreRequest::new("person", "paris", "A prince of Troy"))
            .await
            .unwrap();

        let response = engine
            .recall(RecallRequest::new("paris").with_entity_type("city"))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].entity_type, "city");
    }

    #[tokio::test]
    async fn test_category_scope() {
        let engine = test_engine();
        seed(&engine).await;

        let response = engine
            .recall(RecallRequest::new("happy capital").with_category(Category::Emotional))
            .await
            .unwrap();

        assert!(!response.results.is_empty());
        assert!(
            response
                .results
                .iter()
                .all(|r| r.category == Category::Emotional)
        );
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let engine = test_engine();

        let empty = engine.recall(RecallRequest::new("   ")).await;
        assert!(matches!(empty, Err(EideticError::Validation(_))));

        let zero = engine
            .recall(RecallRequest::new("paris").with_max_results(0))
            .await;
        assert!(matches!(zero, Err(EideticError::Validation(_))));

        let huge = engine
            .recall(RecallRequest::new("paris").with_max_results(10_000))
            .await;
        assert!(matches!(huge, Err(EideticError::Validation(_))));
    }

    #[tokio::test]
    async fn test_recall_on_empty_store() {
        let engine = test_engine();

        let response = engine.recall(RecallRequest::new("anything")).await.unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.total_found, 0);
    }
}

// =============================================================================
// Graph expansion
// =============================================================================

mod graph_tests {
    use super::*;

    #[tokio::test]
    async fn test_related_record_is_included() {
        let engine = text_only_engine();
        store(&engine, "alpha", "Alpha reactor design notes").await;
        let beta = store(&engine, "beta", "Chocolate cake with cream").await;
        engine
            .create_relationship(CreateRelationshipRequest::new("alpha", "beta", "inspires"))
            .await
            .unwrap();

        let response = engine
            .recall(RecallRequest::new("alpha reactor"))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].name, "alpha");
        assert_eq!(response.results[0].match_type, MatchType::Text);

        let related = response.results.iter().find(|r| r.id == beta).unwrap();
        assert_eq!(related.match_type, MatchType::Related);
        assert_eq!(related.relation_type.as_deref(), Some("inspires"));
        // Reaching a record through an edge is not an access
        assert_eq!(related.access_count, 0);
    }

    #[tokio::test]
    async fn test_graph_expansion_can_be_disabled() {
        let engine = text_only_engine();
        store(&engine, "alpha", "Alpha reactor design notes").await;
        store(&engine, "beta", "Chocolate cake with cream").await;
        engine
            .create_relationship(CreateRelationshipRequest::new("alpha", "beta", "inspires"))
            .await
            .unwrap();

        let response = engine
            .recall(RecallRequest::new("alpha reactor").with_graph(false))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_weak_edges_are_not_followed() {
        let engine = text_only_engine();
        store(&engine, "alpha", "Alpha reactor design notes").await;
        store(&engine, "beta", "Chocolate cake with cream").await;
        engine
            .create_relationship(
                CreateRelationshipRequest::new("alpha", "beta", "mentions").with_strength(0.5),
            )
            .await
            .unwrap();

        let response = engine
            .recall(RecallRequest::new("alpha reactor"))
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
    }

    #[tokio::test]
    async fn test_expansion_reads_graph_backend() {
        let engine = text_only_engine();
        let alpha = store(&engine, "alpha", "Alpha reactor design notes").await;
        let beta = store(&engine, "beta", "Chocolate cake with cream").await;

        // An edge known only to the graph backend
        engine
            .registry()
            .graph()
            .unwrap()
            .link(&Relationship::new(alpha, beta, "cites", 0.9, Map::new()))
            .await;

        let response = engine
            .recall(RecallRequest::new("alpha reactor"))
            .await
            .unwrap();

        let related = response.results.iter().find(|r| r.id == beta).unwrap();
        assert_eq!(related.match_type, MatchType::Related);
        assert_eq!(related.relation_type.as_deref(), Some("cites"));
    }

    #[tokio::test]
    async fn test_expansion_without_graph_backend_uses_primary() {
        let engine = test_engine_with(BackendRegistry::new(Arc::new(InMemoryStore::new())));
        store(&engine, "alpha", "Alpha reactor design notes").await;
        let beta = store(&engine, "beta", "Chocolate cake with cream").await;
        engine
            .create_relationship(CreateRelationshipRequest::new("alpha", "beta", "inspires"))
            .await
            .unwrap();

        let response = engine
            .recall(RecallRequest::new("alpha reactor"))
            .await
            .unwrap();

        let related = response.results.iter().find(|r| r.id == beta).unwrap();
        assert_eq!(related.relation_type.as_deref(), Some("inspires"));
    }
}

// =============================================================================
// Cache
// =============================================================================

mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_recall_is_cached() {
        let engine = test_engine();
        seed(&engine).await;

        let first = engine.recall(RecallRequest::new("paris")).await.unwrap();
        let second = engine.recall(RecallRequest::new("  PARIS ")).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.results.len(), second.results.len());
    }

    #[tokio::test]
    async fn test_cache_hit_is_not_an_access() {
        let engine = test_engine();
        let id = store(&engine, "paris", "Paris is the capital of France").await;

        engine.recall(RecallRequest::new("paris")).await.unwrap();
        engine.recall(RecallRequest::new("paris")).await.unwrap();

        let record = engine.registry().primary().get(id).await.unwrap().unwrap();
        assert_eq!(record.access_count, 1);
    }

    #[tokio::test]
    async fn test_store_invalidates_cached_recall() {
        let engine = test_engine();
        store(&engine, "paris", "Paris is the capital of France").await;

        let before = engine.recall(RecallRequest::new("capital")).await.unwrap();
        assert_eq!(before.results.len(), 1);

        store(&engine, "rome", "Rome is the capital of Italy").await;

        let after = engine.recall(RecallRequest::new("capital")).await.unwrap();
        assert!(!after.cached);
        assert_eq!(after.results.len(), 2);
    }
}

// =============================================================================
// Access counting
// =============================================================================

mod access_tests {
    use super::*;

    #[tokio::test]
    async fn test_recall_boosts_weight_and_counts_access() {
        let mut config = test_config();
        config.weight.initial_weight = 0.5;
        let engine = Engine::new(config, BackendRegistry::in_memory(), mock_embedder());
        let id = store(&engine, "paris", "Paris is the capital of France").await;

        let response = engine.recall(RecallRequest::new("paris")).await.unwrap();

        assert_eq!(response.results[0].access_count, 1);
        assert!((response.results[0].weight - 0.6).abs() < 1e-5);

        let record = engine.registry().primary().get(id).await.unwrap().unwrap();
        assert_eq!(record.access_count, 1);
        assert!(record.last_accessed >= record.created_at);
    }

    #[tokio::test]
    async fn test_concurrent_recalls_count_every_access() {
        let engine = Arc::new(test_engine());
        let id = store(&engine, "paris", "Paris is the capital of France").await;

        let queries = ["paris", "capital", "france", "paris capital", "capital of france"];
        let handles: Vec<_> = queries
            .iter()
            .map(|query| {
                let engine = Arc::clone(&engine);
                let query = query.to_string();
                tokio::spawn(async move { engine.recall(RecallRequest::new(query)).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let record = engine.registry().primary().get(id).await.unwrap().unwrap();
        assert_eq!(record.access_count, queries.len() as u64);
    }
}

// =============================================================================
// Degraded paths
// =============================================================================

mod degraded_tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_index_falls_back_to_text() {
        let registry = BackendRegistry::new(Arc::new(InMemoryStore::new()))
            .with_vector_index(Arc::new(UnavailableVectorIndex));
        let engine = test_engine_with(registry);
        seed(&engine).await;

        let response = engine
            .recall(RecallRequest::new("capital of France"))
            .await
            .unwrap();

        assert!(response.degraded);
        assert_eq!(response.degraded_backends, vec!["vector_index".to_string()]);
        assert!(!response.results.is_empty());
        assert_eq!(response.results[0].name, "paris");
        assert!(response.results.iter().all(|r| r.match_type == MatchType::Text));
    }

    #[tokio::test]
    async fn test_hung_observation_load_is_bounded() {
        let mut config = test_config();
        config.recall.branch_timeout_ms = 50;
        let primary = SlowObservationStore::new(
            Arc::new(InMemoryStore::new()),
            Duration::from_secs(3600),
        );
        let engine = Engine::new(
            config,
            BackendRegistry::new(Arc::new(primary)),
            mock_embedder(),
        );
        engine
            .store(
                StoreRequest::new("note", "paris", "Paris is the capital of France")
                    .with_observation("Home of the Louvre"),
            )
            .await
            .unwrap();

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            engine.recall(RecallRequest::new("capital of France")),
        )
        .await
        .expect("recall must not wait on observations")
        .unwrap();

        assert!(response.degraded);
        assert_eq!(response.degraded_backends, vec!["observations".to_string()]);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].name, "paris");
        assert!(response.results[0].observations.is_empty());
    }

    #[tokio::test]
    async fn test_slow_index_times_out_to_text() {
        let mut config = test_config();
        config.recall.branch_timeout_ms = 50;
        let slow = SlowVectorIndex::new(
            Arc::new(InMemoryVectorIndex::new()),
            Duration::from_millis(300),
        );
        let registry =
            BackendRegistry::new(Arc::new(InMemoryStore::new())).with_vector_index(Arc::new(slow));
        let engine = Engine::new(config, registry, mock_embedder());
        store(&engine, "paris", "Paris is the capital of France").await;

        let response = engine.recall(RecallRequest::new("paris")).await.unwrap();

        assert!(response.degraded);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].match_type, MatchType::Text);
    }

    #[tokio::test]
    async fn test_missing_index_is_not_degraded() {
        let engine = text_only_engine();
        seed(&engine).await;

        let response = engine.recall(RecallRequest::new("capital")).await.unwrap();

        assert!(!response.degraded);
        assert_eq!(response.results.len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_embeddings_still_recall() {
        let engine = Engine::new(
            test_config(),
            BackendRegistry::in_memory(),
            EmbeddingAdapter::fallback_only(TEST_DIMENSION),
        );
        seed(&engine).await;

        let response = engine
            .recall(RecallRequest::new("Paris is the capital of France"))
            .await
            .unwrap();

        assert_eq!(response.embedding_source, EmbeddingSource::Fallback);
        assert_eq!(response.results.len(), 3);
    }
}
