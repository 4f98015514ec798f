//! Engine facade
//!
//! Owns the backend registry, the embedding adapter, the evaluator, the
//! router and the caches, and exposes the transport-agnostic operations
//! used by the HTTP API and the CLI.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::RecallCache;
use crate::config::Config;
use crate::embedding::{EmbeddingAdapter, EmbeddingStats};
use crate::error::{EideticError, Result};
use crate::memory::consolidation::{
    CoRecallTracker, ConsolidationReport, Consolidator, CycleKind,
};
use crate::memory::importance::ImportanceEvaluator;
use crate::memory::patterns::{PatternFinder, PatternRequest, PatternResponse};
use crate::memory::recall::{RecallPipeline, RecallRequest, RecallResponse};
use crate::memory::types::{Category, MemoryRecord, Observation, Relationship, WeightBand};
use crate::memory::weight::WeightEngine;
use crate::router::{CategoryClassifier, KeywordRouter};
use crate::storage::registry::VECTOR_INDEX;
use crate::storage::{
    BackendKind, BackendRegistry, BackendStatus, EventLog, MemoryEvent, RecordFilter, VectorEntry,
};

/// Longest accepted entity type or name, in characters
pub const MAX_IDENTIFIER_CHARS: usize = 256;

const NAME_LOCK_STRIPES: usize = 64;

const DEFAULT_SOURCE: &str = "api";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub entity_type: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Appended to the record whether it is new or already exists
    #[serde(default)]
    pub observations: Vec<String>,
    /// Bypasses routing when set
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl StoreRequest {
    pub fn new(
        entity_type: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
            content: content.into(),
            content_type: None,
            metadata: Map::new(),
            observations: Vec::new(),
            category: None,
            created_by: None,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observations.push(observation.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("entity_type", &self.entity_type)?;
        validate_identifier("name", &self.name)?;
        if self.content.trim().is_empty() {
            return Err(EideticError::Validation(
                "content must not be empty".to_string(),
            ));
        }
        validate_observations(&self.observations, true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResponse {
    pub id: Uuid,
    pub category: Category,
    /// The record is persisted in the primary store
    pub stored: bool,
    /// `false` when a record with this entity type and name already existed
    pub created: bool,
    /// Secondary backends whose copy failed; the primary write still stands
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_backends: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddObservationsRequest {
    pub entity_name: String,
    pub observations: Vec<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddObservationsResponse {
    pub entity_id: Uuid,
    pub added: usize,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRelationshipRequest {
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Defaults to `relationships.default_strength`
    #[serde(default)]
    pub strength: Option<f32>,
    #[serde(default)]
    pub from_type: Option<String>,
    #[serde(default)]
    pub to_type: Option<String>,
}

impl CreateRelationshipRequest {
    pub fn new(
        from_entity: impl Into<String>,
        to_entity: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            from_entity: from_entity.into(),
            to_entity: to_entity.into(),
            relation_type: relation_type.into(),
            properties: Map::new(),
            strength: None,
            from_type: None,
            to_type: None,
        }
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = Some(strength);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRelationshipResponse {
    pub relationship_id: Uuid,
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub strength: f32,
    /// `false` when the same edge already existed
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub records: usize,
    pub observations: usize,
    pub relationships: usize,
    pub per_category: BTreeMap<Category, usize>,
    pub weight_bands: BTreeMap<WeightBand, usize>,
    pub backend_availability: Vec<BackendStatus>,
    pub embedding: EmbeddingStats,
    pub classifier: &'static str,
    pub recall_cache_entries: usize,
    pub co_recall_pairs: usize,
}

fn validate_identifier(field: &str, value: &str) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EideticError::Validation(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > MAX_IDENTIFIER_CHARS {
        return Err(EideticError::Validation(format!(
            "{field} must be at most {MAX_IDENTIFIER_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_observations(observations: &[String], allow_empty_list: bool) -> Result<()> {
    if !allow_empty_list && observations.is_empty() {
        return Err(EideticError::Validation(
            "observations must not be empty".to_string(),
        ));
    }
    if observations.iter().any(|o| o.trim().is_empty()) {
        return Err(EideticError::Validation(
            "observations must be non-empty strings".to_string(),
        ));
    }
    Ok(())
}

pub struct Engine {
    config: Config,
    registry: Arc<BackendRegistry>,
    embedder: Arc<EmbeddingAdapter>,
    evaluator: ImportanceEvaluator,
    classifier: Arc<dyn CategoryClassifier>,
    weights: WeightEngine,
    cache: RecallCache,
    co_recall: CoRecallTracker,
    sws_guard: Mutex<()>,
    rem_guard: Mutex<()>,
    /// Serializes stores of the same (entity_type, name)
    name_locks: Vec<Mutex<()>>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(config: Config, registry: BackendRegistry, embedder: EmbeddingAdapter) -> Self {
        let classifier: Arc<dyn CategoryClassifier> = Arc::new(KeywordRouter::new(&config.router));
        let (shutdown, _) = watch::channel(false);
        Self {
            evaluator: ImportanceEvaluator::new(config.importance.clone()),
            weights: WeightEngine::new(config.weight, config.consolidation.blend_alpha),
            cache: RecallCache::new(
                config.recall.cache_capacity,
                Duration::from_secs(config.recall.cache_ttl_secs),
            ),
            co_recall: CoRecallTracker::new(config.recall.co_recall_window),
            sws_guard: Mutex::new(()),
            rem_guard: Mutex::new(()),
            name_locks: (0..NAME_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            registry: Arc::new(registry),
            embedder: Arc::new(embedder),
            classifier,
            shutdown,
            config,
        }
    }

    /// Open the configured backends and embedding provider
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let embedder = EmbeddingAdapter::from_config(&config.embedding)?;
        let registry = BackendRegistry::from_config(&config.storage, embedder.dimension()).await?;
        Ok(Self::new(config, registry, embedder))
    }

    /// Replace the keyword router
    pub fn with_classifier(mut self, classifier: Arc<dyn CategoryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn embedder(&self) -> &Arc<EmbeddingAdapter> {
        &self.embedder
    }

    pub fn events(&self) -> Option<&Arc<EventLog>> {
        self.registry.events()
    }

    /// Receiver that flips to `true` once [`Engine::shutdown`] is called
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop background cycles; an in-flight cycle stops at the next record
    pub fn shutdown(&self) {
        info!("Engine shutting down");
        self.shutdown.send_replace(true);
    }

    fn name_lock(&self, entity_type: &str, name: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        (entity_type, name).hash(&mut hasher);
        &self.name_locks[(hasher.finish() as usize) % self.name_locks.len()]
    }

    fn emit(&self, event: MemoryEvent) {
        if let Some(events) = self.registry.events() {
            if let Err(e) = events.append(event) {
                warn!("Failed to append event: {e}");
            }
        }
    }

    /// Store a record. An existing `(entity_type, name)` keeps its id and
    /// takes the new content; request observations are appended either way.
    pub async fn store(&self, request: StoreRequest) -> Result<StoreResponse> {
        request.validate()?;
        let entity_type = request.entity_type.trim().to_string();
        let name = request.name.trim().to_string();

        let _guard = self.name_lock(&entity_type, &name).lock().await;
        let primary = self.registry.primary();

        if let Some(existing) = primary.find_by_name(Some(&entity_type), &name).await? {
            return self.update_existing(existing, request).await;
        }

        let content = request.content.trim();
        let content_type = request
            .content_type
            .clone()
            .unwrap_or_else(|| "text".to_string());
        let category = request
            .category
            .unwrap_or_else(|| self.classifier.classify(&content_type, content));

        let mut record = MemoryRecord::new(&entity_type, &name, content, Vec::new(), category);
        record.content_type = content_type;
        record.embedding = self.embedder.embed(&record.embedding_text()).await.vector;
        record.emotional_significance = self
            .evaluator
            .emotional_significance(content, &request.metadata);
        record.metadata = request.metadata;
        if let Some(created_by) = request.created_by {
            record.created_by = created_by;
        }
        record.set_weight(self.weights.initial_weight());
        record.importance = self.evaluator.evaluate(&record, None, Utc::now());

        record.id = primary.put(&record).await?;
        info!("Stored {} ({}/{}) in {}", record.id, entity_type, name, category);

        if !request.observations.is_empty() {
            self.append_observations(&record, &request.observations, &record.created_by)
                .await?;
        }

        let degraded_backends = self.copy_to_secondaries(&record).await;
        self.cache.invalidate_for_write(&entity_type, category);

        self.emit(MemoryEvent::Stored {
            id: record.id,
            entity_type,
            name,
            category,
            created: true,
            timestamp: record.created_at,
        });

        Ok(StoreResponse {
            id: record.id,
            category,
            stored: true,
            created: true,
            degraded_backends,
        })
    }

    /// Rewrite an existing record's content, metadata and embedding in
    /// place. Weight, access history and associations carry over. The
    /// category moves only when the request names one, through the audited
    /// re-route.
    async fn update_existing(
        &self,
        existing: MemoryRecord,
        request: StoreRequest,
    ) -> Result<StoreResponse> {
        let primary = self.registry.primary();
        let id = existing.id;
        let previous_category = existing.category;
        debug!("Record {}/{} exists as {id}, updating", existing.entity_type, existing.name);

        let content = request.content.trim().to_string();
        let content_type = request
            .content_type
            .clone()
            .unwrap_or_else(|| existing.content_type.clone());
        let mut metadata = existing.metadata.clone();
        metadata.extend(request.metadata);
        let embedding = self
            .embedder
            .embed(&format!("{}: {}", existing.name, content))
            .await
            .vector;
        let emotional_significance = self.evaluator.emotional_significance(&content, &metadata);

        let rewrite = move |r: &mut MemoryRecord| {
            r.content = content.clone();
            r.content_type = content_type.clone();
            r.metadata = metadata.clone();
            r.embedding = embedding.clone();
            r.emotional_significance = emotional_significance;
            r.updated_at = Utc::now();
        };
        let Some(mut record) = primary.update_record(id, &rewrite).await? else {
            return Err(EideticError::NotFound(format!(
                "entity {}/{}",
                existing.entity_type, existing.name
            )));
        };

        if let Some(category) = request.category.filter(|c| *c != previous_category) {
            if let Some(from) = primary.reroute(id, category).await? {
                info!("Re-routed {id} from {from} to {category} on store");
                record.category = category;
                self.emit(MemoryEvent::Rerouted {
                    id,
                    from,
                    to: category,
                    timestamp: Utc::now(),
                });
            }
        }

        if !request.observations.is_empty() {
            let source = request.created_by.as_deref().unwrap_or(DEFAULT_SOURCE);
            self.append_observations(&record, &request.observations, source)
                .await?;
        }

        let degraded_backends = self.copy_to_secondaries(&record).await;
        self.cache
            .invalidate_for_write(&record.entity_type, previous_category);
        if record.category != previous_category {
            self.cache
                .invalidate_for_write(&record.entity_type, record.category);
        }

        self.emit(MemoryEvent::Stored {
            id,
            entity_type: record.entity_type.clone(),
            name: record.name.clone(),
            category: record.category,
            created: false,
            timestamp: record.updated_at,
        });

        Ok(StoreResponse {
            id,
            category: record.category,
            stored: true,
            created: false,
            degraded_backends,
        })
    }

    /// Best-effort copies to the vector index and the category backend.
    /// Returns the names of backends that failed.
    async fn copy_to_secondaries(&self, record: &MemoryRecord) -> Vec<String> {
        let availability = self.registry.availability();
        let mut failed = Vec::new();

        if let Some(index) = self.registry.vector_index() {
            match index.upsert(VectorEntry::from(record)).await {
                Ok(()) => availability.mark_ok(VECTOR_INDEX, BackendKind::VectorIndex),
                Err(e) => {
                    availability.mark_failed(VECTOR_INDEX, BackendKind::VectorIndex, &e);
                    failed.push(VECTOR_INDEX.to_string());
                }
            }
        }

        if let Some(backend) = self.registry.category_backend(record.category) {
            let name = record.category.as_str();
            match backend.put(record).await {
                Ok(_) => availability.mark_ok(name, backend.kind()),
                Err(e) => {
                    availability.mark_failed(name, backend.kind(), &e);
                    failed.push(name.to_string());
                }
            }
        }

        failed
    }

    async fn append_observations(
        &self,
        record: &MemoryRecord,
        texts: &[String],
        source: &str,
    ) -> Result<usize> {
        let embeddings = join_all(texts.iter().map(|t| self.embedder.embed(t))).await;
        let observations: Vec<Observation> = texts
            .iter()
            .zip(embeddings)
            .map(|(text, embedding)| {
                Observation::new(record.id, text.trim(), embedding.vector, record.category, source)
            })
            .collect();
        self.registry
            .primary()
            .append_observations(&observations)
            .await
    }

    pub async fn recall(&self, request: RecallRequest) -> Result<RecallResponse> {
        request.validate(self.config.recall.max_results_limit)?;

        let response = RecallPipeline::new(
            &self.registry,
            &self.embedder,
            &self.evaluator,
            &self.weights,
            &self.cache,
            &self.co_recall,
            &self.config.recall,
        )
        .run(&request)
        .await?;

        debug!(
            "Recall '{}' returned {} of {} (degraded: {}, cached: {})",
            request.query,
            response.results.len(),
            response.total_found,
            response.degraded,
            response.cached
        );
        self.emit(MemoryEvent::Recalled {
            query: request.query,
            result_count: response.results.len(),
            degraded: response.degraded,
            cached: response.cached,
            timestamp: Utc::now(),
        });
        Ok(response)
    }

    /// Append observations to an existing record. Fails with `NotFound`
    /// and writes nothing when the record does not exist.
    pub async fn add_observations(
        &self,
        request: AddObservationsRequest,
    ) -> Result<AddObservationsResponse> {
        validate_identifier("entity_name", &request.entity_name)?;
        validate_observations(&request.observations, false)?;

        let record = self
            .find_entity(request.entity_type.as_deref(), &request.entity_name)
            .await?;
        let source = request.source.as_deref().unwrap_or(DEFAULT_SOURCE);
        let added = self
            .append_observations(&record, &request.observations, source)
            .await?;
        self.cache
            .invalidate_for_write(&record.entity_type, record.category);

        Ok(AddObservationsResponse {
            entity_id: record.id,
            added,
            category: record.category,
        })
    }

    async fn find_entity(&self, entity_type: Option<&str>, name: &str) -> Result<MemoryRecord> {
        let entity_type = entity_type.map(str::trim).filter(|t| !t.is_empty());
        self.registry
            .primary()
            .find_by_name(entity_type, name.trim())
            .await?
            .ok_or_else(|| match entity_type {
                Some(t) => EideticError::NotFound(format!("entity {t}/{}", name.trim())),
                None => EideticError::NotFound(format!("entity {}", name.trim())),
            })
    }

    /// Create a directed edge; the same `(from, to, type)` returns the
    /// existing edge
    pub async fn create_relationship(
        &self,
        request: CreateRelationshipRequest,
    ) -> Result<CreateRelationshipResponse> {
        validate_identifier("from_entity", &request.from_entity)?;
        validate_identifier("to_entity", &request.to_entity)?;
        let relation_type = request.relation_type.trim();
        if relation_type.is_empty() {
            return Err(EideticError::Validation(
                "relation_type must not be empty".to_string(),
            ));
        }
        let strength = request
            .strength
            .unwrap_or(self.config.relationships.default_strength);
        if !(0.0..=1.0).contains(&strength) {
            return Err(EideticError::Validation(format!(
                "strength must be within [0, 1], got {strength}"
            )));
        }

        let from = self
            .find_entity(request.from_type.as_deref(), &request.from_entity)
            .await?;
        let to = self
            .find_entity(request.to_type.as_deref(), &request.to_entity)
            .await?;

        let (edge, created) = self
            .registry
            .primary()
            .insert_relationship(Relationship::new(
                from.id,
                to.id,
                relation_type,
                strength,
                request.properties,
            ))
            .await?;

        if created {
            info!("Linked {} -[{}]-> {}", from.id, relation_type, to.id);
            if let Some(graph) = self.registry.graph() {
                graph.link(&edge).await;
            }

            let (target, cached_strength) = (to.id, edge.strength);
            let associate = move |r: &mut MemoryRecord| {
                r.associations.insert(target, cached_strength);
                r.updated_at = Utc::now();
            };
            self.registry
                .primary()
                .update_record(from.id, &associate)
                .await?;
            self.cache.invalidate_for_write(&from.entity_type, from.category);

            self.emit(MemoryEvent::RelationshipCreated {
                id: edge.id,
                from_id: edge.from_id,
                to_id: edge.to_id,
                relation_type: edge.relation_type.clone(),
            });
        }

        Ok(CreateRelationshipResponse {
            relationship_id: edge.id,
            from_id: edge.from_id,
            to_id: edge.to_id,
            strength: edge.strength,
            created,
        })
    }

    pub async fn find_patterns(&self, request: PatternRequest) -> Result<PatternResponse> {
        request.validate()?;
        PatternFinder::new(&self.registry, &self.config.patterns)
            .find(&request)
            .await
    }

    pub async fn get_stats(&self) -> Result<EngineStats> {
        let counts = self.registry.primary().counts().await?;
        Ok(EngineStats {
            records: counts.records,
            observations: counts.observations,
            relationships: counts.relationships,
            per_category: counts.per_category,
            weight_bands: counts.weight_bands,
            backend_availability: self.registry.availability().snapshot(),
            embedding: self.embedder.stats(),
            classifier: self.classifier.name(),
            recall_cache_entries: self.cache.len(),
            co_recall_pairs: self.co_recall.len(),
        })
    }

    /// Run one cycle now. Returns `None` when a cycle of the same kind is
    /// already running.
    pub async fn consolidate(&self, kind: CycleKind) -> Result<Option<ConsolidationReport>> {
        let guard = match kind {
            CycleKind::Sws => &self.sws_guard,
            CycleKind::Rem => &self.rem_guard,
        };
        let Ok(_running) = guard.try_lock() else {
            info!("Skipping {kind} consolidation, a run is already in flight");
            return Ok(None);
        };

        let cancel = self.shutdown.subscribe();
        let report = Consolidator::new(
            &self.registry,
            &self.evaluator,
            &self.weights,
            self.classifier.as_ref(),
            &self.co_recall,
            &self.config.consolidation,
        )
        .run(kind, &cancel)
        .await?;

        if report.records_updated > 0 || report.edges_reinforced > 0 {
            self.cache.invalidate_all();
        }
        self.emit(report.to_event());
        Ok(Some(report))
    }

    /// Re-derive the vector index from the primary store. Returns the
    /// number of entries written.
    pub async fn rebuild_vector_index(&self) -> Result<usize> {
        let Some(index) = self.registry.vector_index() else {
            return Err(EideticError::unavailable(
                VECTOR_INDEX,
                "no vector index configured",
            ));
        };
        let availability = self.registry.availability();

        let records = self.registry.primary().query(&RecordFilter::new()).await?;
        let rebuilt = async {
            index.clear().await?;
            for record in &records {
                index.upsert(VectorEntry::from(record)).await?;
            }
            Ok::<usize, EideticError>(records.len())
        }
        .await;

        match rebuilt {
            Ok(count) => {
                availability.mark_ok(VECTOR_INDEX, BackendKind::VectorIndex);
                self.cache.invalidate_all();
                info!("Rebuilt vector index with {count} entries");
                Ok(count)
            }
            Err(e) => {
                availability.mark_failed(VECTOR_INDEX, BackendKind::VectorIndex, &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_request_validation() {
        assert!(StoreRequest::new("person", "Ada", "mathematician").validate().is_ok());
        assert!(StoreRequest::new(" ", "Ada", "x").validate().is_err());
        assert!(StoreRequest::new("person", "", "x").validate().is_err());
        assert!(StoreRequest::new("person", "Ada", "   ").validate().is_err());
        assert!(
            StoreRequest::new("person", "a".repeat(257), "x")
                .validate()
                .is_err()
        );
        assert!(
            StoreRequest::new("person", "a".repeat(256), "x")
                .validate()
                .is_ok()
        );
        assert!(
            StoreRequest::new("person", "Ada", "x")
                .with_observation(" ")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_observation_list_rules() {
        assert!(validate_observations(&[], true).is_ok());
        assert!(validate_observations(&[], false).is_err());
        assert!(validate_observations(&["seen".to_string()], false).is_ok());
    }

    #[test]
    fn test_store_request_json_defaults() {
        let request: StoreRequest = serde_json::from_str(
            r#"{"entity_type": "city", "name": "Paris", "content": "capital of France"}"#,
        )
        .unwrap();
        assert!(request.observations.is_empty());
        assert!(request.category.is_none());
        assert!(request.metadata.is_empty());
    }

    #[test]
    fn test_name_lock_is_stable() {
        let engine = Engine::new(
            Config::default(),
            BackendRegistry::in_memory(),
            EmbeddingAdapter::fallback_only(8),
        );
        let a = engine.name_lock("person", "Ada") as *const _;
        let b = engine.name_lock("person", "Ada") as *const _;
        assert_eq!(a, b);
    }
}
