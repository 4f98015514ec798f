//! Engine tests over the LanceDB primary store and vector index
//!
//! Each test opens its own temporary data directory.

use tempfile::TempDir;

use eidetic::config::{Config, PrimaryBackend};
use eidetic::engine::{AddObservationsRequest, CreateRelationshipRequest, Engine, StoreRequest};
use eidetic::memory::{CycleKind, MatchType, RecallRequest};
use eidetic::storage::{BackendRegistry, CategoryBackend, PrimaryStore};
use eidetic::testing::{TEST_DIMENSION, mock_embedder, test_config};

fn lance_config(dir: &TempDir) -> Config {
    let mut config = test_config();
    config.storage.primary = PrimaryBackend::Lance;
    config.storage.data_dir = dir.path().to_path_buf();
    config
}

async fn open_engine(dir: &TempDir) -> Engine {
    let config = lance_config(dir);
    let registry = BackendRegistry::from_config(&config.storage, TEST_DIMENSION)
        .await
        .unwrap();
    Engine::new(config, registry, mock_embedder())
}

#[tokio::test]
async fn test_store_and_recall_on_lance() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    engine
        .store(StoreRequest::new("note", "paris", "Paris is the capital of France"))
        .await
        .unwrap();
    engine
        .store(StoreRequest::new("note", "mood", "I felt so happy and excited"))
        .await
        .unwrap();

    let response = engine
        .recall(RecallRequest::new("Paris is the capital of France"))
        .await
        .unwrap();

    assert!(!response.degraded);
    assert_eq!(response.results[0].name, "paris");
    assert_eq!(response.results[0].match_type, MatchType::Vector);
    assert_eq!(response.results[0].access_count, 1);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let engine = open_engine(&dir).await;
        let stored = engine
            .store(StoreRequest::new("note", "alpha", "Alpha reactor design notes"))
            .await
            .unwrap();
        engine
            .store(StoreRequest::new("note", "beta", "Beta reactor maintenance log"))
            .await
            .unwrap();
        engine
            .add_observations(AddObservationsRequest {
                entity_name: "alpha".to_string(),
                observations: vec!["Reviewed on Monday".to_string()],
                entity_type: None,
                source: None,
            })
            .await
            .unwrap();
        engine
            .create_relationship(CreateRelationshipRequest::new("alpha", "beta", "precedes"))
            .await
            .unwrap();
        stored.id
    };

    let engine = open_engine(&dir).await;
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.observations, 1);
    assert_eq!(stats.relationships, 1);

    let again = engine
        .store(StoreRequest::new("note", "alpha", "Alpha reactor design notes"))
        .await
        .unwrap();
    assert_eq!(again.id, id);
    assert!(!again.created);

    let edges = engine
        .registry()
        .primary()
        .outgoing_relationships(id, 0.0)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].relation_type, "precedes");

    // The graph copy is rebuilt from the persisted edges
    let neighbors = engine.registry().graph().unwrap().neighbors(id, 0.0).await;
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].1, "precedes");
}

#[tokio::test]
async fn test_consolidation_on_lance() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;
    for (name, content) in [
        ("paris", "Paris is the capital of France"),
        ("rome", "Rome is the capital of Italy"),
    ] {
        engine
            .store(StoreRequest::new("note", name, content))
            .await
            .unwrap();
    }

    let report = engine.consolidate(CycleKind::Sws).await.unwrap().unwrap();
    assert_eq!(report.records_updated, 2);
    assert_eq!(report.failures, 0);

    let record = engine
        .registry()
        .primary()
        .find_by_name(Some("note"), "paris")
        .await
        .unwrap()
        .unwrap();
    assert!(record.consolidated_at.is_some());
    assert!((0.0..=1.0).contains(&record.weight()));
}

#[tokio::test]
async fn test_restore_rewrites_content_on_lance() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let engine = open_engine(&dir).await;
        let first = engine
            .store(StoreRequest::new("note", "paris", "Paris is the capital of France"))
            .await
            .unwrap();
        let second = engine
            .store(StoreRequest::new("note", "paris", "Paris hosts the Louvre museum"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(!second.created);
        first.id
    };

    let engine = open_engine(&dir).await;
    let record = engine.registry().primary().get(id).await.unwrap().unwrap();
    assert_eq!(record.content, "Paris hosts the Louvre museum");
    assert_eq!(engine.get_stats().await.unwrap().records, 1);

    let response = engine
        .recall(RecallRequest::new("paris: Paris hosts the Louvre museum"))
        .await
        .unwrap();
    assert_eq!(response.results[0].id, id);
    assert_eq!(response.results[0].content, "Paris hosts the Louvre museum");
}
