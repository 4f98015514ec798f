//! Hybrid recall with graceful degradation
//!
//! A recall runs in stages:
//! 1. Embed the query (falling back to a deterministic vector)
//! 2. Nearest-neighbour search on the vector index, or text search on the
//!    primary store when the index is missing, failing or too slow
//! 3. Hydrate matches from the primary store while observations and graph
//!    neighbours load concurrently
//! 4. Refresh importance, fuse it with similarity and rank
//!
//! Only the primary store is required. Every other branch can fail or time
//! out; the response then carries `degraded = true` and names the branch.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, RecallCache};
use crate::config::RecallConfig;
use crate::embedding::{EmbeddingAdapter, EmbeddingSource};
use crate::error::{EideticError, Result};
use crate::memory::consolidation::CoRecallTracker;
use crate::memory::importance::{ImportanceContext, ImportanceEvaluator};
use crate::memory::types::{Category, ImportanceComponents, MemoryRecord, Observation};
use crate::memory::weight::WeightEngine;
use crate::storage::registry::VECTOR_INDEX;
use crate::storage::{BackendKind, BackendRegistry, RecordFilter, VectorHit, term_overlap, search_terms};

fn default_include_graph() -> bool {
    true
}

/// A recall query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallRequest {
    pub query: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    /// Follow outgoing relationships of each match
    #[serde(default = "default_include_graph")]
    pub include_graph: bool,
    /// Defaults to `recall.default_max_results`
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Contextual importance added to every candidate while ranking; never
    /// persisted
    #[serde(default)]
    pub relevance_boost: Option<f32>,
}

impl RecallRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            entity_type: None,
            category: None,
            include_graph: true,
            max_results: None,
            relevance_boost: None,
        }
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_graph(mut self, include_graph: bool) -> Self {
        self.include_graph = include_graph;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_relevance_boost(mut self, relevance_boost: f32) -> Self {
        self.relevance_boost = Some(relevance_boost);
        self
    }

    pub fn validate(&self, max_results_limit: usize) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(EideticError::Validation("query must not be empty".to_string()));
        }
        if let Some(max) = self.max_results {
            if max == 0 || max > max_results_limit {
                return Err(EideticError::Validation(format!(
                    "max_results must be between 1 and {max_results_limit}, got {max}"
                )));
            }
        }
        if let Some(boost) = self.relevance_boost {
            if !boost.is_finite() || boost < 0.0 {
                return Err(EideticError::Validation(format!(
                    "relevance_boost must be a non-negative number, got {boost}"
                )));
            }
        }
        if let Some(entity_type) = &self.entity_type {
            if entity_type.trim().is_empty() {
                return Err(EideticError::Validation(
                    "entity_type must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// How a result entered the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Nearest-neighbour hit
    Vector,
    /// Text fallback hit
    Text,
    /// Reached through a relationship from another hit
    Related,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledObservation {
    pub text: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Observation> for RecalledObservation {
    fn from(observation: Observation) -> Self {
        Self {
            text: observation.text,
            source: observation.source,
            timestamp: observation.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallResult {
    pub id: Uuid,
    pub entity_type: String,
    pub name: String,
    pub content: String,
    pub category: Category,
    pub weight: f32,
    /// Normalized composite importance in [0, 1]
    pub importance: f32,
    pub similarity: f32,
    pub score: f32,
    pub match_type: MatchType,
    /// Relationship type that reached a `related` result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<String>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<RecalledObservation>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallResponse {
    pub results: Vec<RecallResult>,
    /// Matches before truncation to `max_results`
    pub total_found: usize,
    pub embedding_source: EmbeddingSource,
    pub degraded: bool,
    /// Optional branches that failed or timed out
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_backends: Vec<String>,
    #[serde(default)]
    pub cached: bool,
}

/// Rank fusion of similarity and normalized importance. Negative cosine
/// similarity counts as zero.
pub fn fuse_score(
    similarity: f32,
    importance: f32,
    similarity_weight: f32,
    importance_weight: f32,
) -> f32 {
    similarity.clamp(0.0, 1.0) * similarity_weight + importance.clamp(0.0, 1.0) * importance_weight
}

/// Score descending, then most recently accessed, then id
fn rank_order(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.record.last_accessed.cmp(&a.record.last_accessed))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Candidate set from the search stage
enum Matches {
    Vector(Vec<VectorHit>),
    Text(Vec<MemoryRecord>),
}

impl Matches {
    fn ids(&self) -> Vec<Uuid> {
        match self {
            Matches::Vector(hits) => hits.iter().map(|h| h.id).collect(),
            Matches::Text(records) => records.iter().map(|r| r.id).collect(),
        }
    }
}

struct Scored {
    record: MemoryRecord,
    components: ImportanceComponents,
    similarity: f32,
    match_type: MatchType,
    relation_type: Option<String>,
    score: f32,
}

impl Scored {
    fn into_result(self, observations: Vec<Observation>) -> RecallResult {
        let weight = self.record.weight();
        RecallResult {
            id: self.record.id,
            entity_type: self.record.entity_type,
            name: self.record.name,
            content: self.record.content,
            category: self.record.category,
            weight,
            importance: self.components.normalized(),
            similarity: self.similarity,
            score: self.score,
            match_type: self.match_type,
            relation_type: self.relation_type,
            access_count: self.record.access_count,
            last_accessed: self.record.last_accessed,
            observations: observations.into_iter().map(Into::into).collect(),
            metadata: self.record.metadata,
        }
    }
}

/// One recall over borrowed engine components
pub struct RecallPipeline<'a> {
    registry: &'a BackendRegistry,
    embedder: &'a EmbeddingAdapter,
    evaluator: &'a ImportanceEvaluator,
    weights: &'a WeightEngine,
    cache: &'a RecallCache,
    co_recall: &'a CoRecallTracker,
    config: &'a RecallConfig,
}

impl<'a> RecallPipeline<'a> {
    pub fn new(
        registry: &'a BackendRegistry,
        embedder: &'a EmbeddingAdapter,
        evaluator: &'a ImportanceEvaluator,
        weights: &'a WeightEngine,
        cache: &'a RecallCache,
        co_recall: &'a CoRecallTracker,
        config: &'a RecallConfig,
    ) -> Self {
        Self {
            registry,
            embedder,
            evaluator,
            weights,
            cache,
            co_recall,
            config,
        }
    }

    fn branch_timeout(&self) -> Duration {
        Duration::from_millis(self.config.branch_timeout_ms)
    }

    /// Run the recall. The request must already be validated.
    pub async fn run(&self, request: &RecallRequest) -> Result<RecallResponse> {
        let max_results = request
            .max_results
            .unwrap_or(self.config.default_max_results);

        let key = CacheKey::new(request, max_results);
        if let Some(mut cached) = self.cache.get(&key) {
            debug!("Recall cache hit for '{}'", request.query);
            cached.cached = true;
            return Ok(cached);
        }
        let generation = self.cache.generation();

        let embedding = self.embedder.embed(&request.query).await;
        let scope = RecordFilter::scope(request.entity_type.as_deref(), request.category);
        let mut degraded_backends = Vec::new();

        let matches = self
            .search(&request.query, &embedding.vector, &scope, max_results, &mut degraded_backends)
            .await?;
        let hit_ids = matches.ids();

        let (hydrated, observations, related) = tokio::join!(
            self.hydrate(matches),
            self.load_observations(&hit_ids),
            self.expand_graph(&hit_ids, &scope, request.include_graph),
        );

        let hydrated = hydrated?;
        let mut observations = observations.unwrap_or_else(|e| {
            warn!("Observation loading failed, returning results without them: {e}");
            degraded_backends.push("observations".to_string());
            HashMap::new()
        });
        let related = related.unwrap_or_else(|e| {
            warn!("Graph expansion failed, skipping related results: {e}");
            degraded_backends.push("graph".to_string());
            Vec::new()
        });

        let terms = search_terms(&request.query);
        let context = request.relevance_boost.map(ImportanceContext::with_relevance);
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut scored = Vec::new();

        for (record, similarity, match_type) in hydrated {
            // The index can lag behind a re-route
            if !scope.matches(&record) || !seen.insert(record.id) {
                continue;
            }
            let similarity = match match_type {
                MatchType::Text => term_overlap(&record, &terms),
                _ => similarity,
            };
            scored.push(self.score(record, similarity, match_type, None, context.as_ref(), now));
        }
        for (record, relation_type) in related {
            if seen.insert(record.id) {
                scored.push(self.score(
                    record,
                    0.0,
                    MatchType::Related,
                    Some(relation_type),
                    context.as_ref(),
                    now,
                ));
            }
        }

        let total_found = scored.len();
        scored.sort_by(rank_order);
        scored.truncate(max_results);

        self.record_access(&mut scored, context.is_some(), now).await?;

        let returned: Vec<Uuid> = scored.iter().map(|s| s.record.id).collect();
        self.co_recall.record(&returned);

        let results: Vec<RecallResult> = scored
            .into_iter()
            .map(|s| {
                let attached = observations.remove(&s.record.id).unwrap_or_default();
                s.into_result(attached)
            })
            .collect();

        let response = RecallResponse {
            results,
            total_found,
            embedding_source: embedding.source,
            degraded: !degraded_backends.is_empty(),
            degraded_backends,
            cached: false,
        };

        self.cache.insert(key, response.clone(), generation);
        Ok(response)
    }

    async fn search(
        &self,
        query: &str,
        vector: &[f32],
        scope: &RecordFilter,
        limit: usize,
        degraded_backends: &mut Vec<String>,
    ) -> Result<Matches> {
        if let Some(index) = self.registry.vector_index() {
            let availability = self.registry.availability();
            let millis = self.config.branch_timeout_ms;

            let outcome = match tokio::time::timeout(
                self.branch_timeout(),
                index.search(vector, scope, limit),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(EideticError::Timeout {
                    branch: "vector_search".to_string(),
                    millis,
                }),
            };

            match outcome {
                Ok(hits) => {
                    availability.mark_ok(VECTOR_INDEX, BackendKind::VectorIndex);
                    return Ok(Matches::Vector(hits));
                }
                Err(e) => {
                    warn!("Vector search failed, falling back to text search: {e}");
                    availability.mark_failed(VECTOR_INDEX, BackendKind::VectorIndex, &e);
                    degraded_backends.push(VECTOR_INDEX.to_string());
                }
            }
        }

        let records = self
            .registry
            .primary()
            .text_search(query, scope, limit)
            .await?;
        Ok(Matches::Text(records))
    }

    async fn hydrate(&self, matches: Matches) -> Result<Vec<(MemoryRecord, f32, MatchType)>> {
        match matches {
            Matches::Text(records) => Ok(records
                .into_iter()
                .map(|r| (r, 0.0, MatchType::Text))
                .collect()),
            Matches::Vector(hits) => {
                let ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
                let similarity: HashMap<Uuid, f32> =
                    hits.iter().map(|h| (h.id, h.similarity)).collect();
                let records = self.registry.primary().get_many(&ids).await?;
                Ok(records
                    .into_iter()
                    .map(|r| {
                        let sim = similarity.get(&r.id).copied().unwrap_or(0.0);
                        (r, sim, MatchType::Vector)
                    })
                    .collect())
            }
        }
    }

    async fn load_observations(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Observation>>> {
        if self.config.observations_per_result == 0 || ids.is_empty() {
            return Ok(HashMap::new());
        }

        let millis = self.config.branch_timeout_ms;
        match tokio::time::timeout(self.branch_timeout(), self.recent_observations(ids)).await {
            Ok(result) => result,
            Err(_) => Err(EideticError::Timeout {
                branch: "observations".to_string(),
                millis,
            }),
        }
    }

    async fn recent_observations(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Observation>>> {
        let primary = self.registry.primary();
        let limit = self.config.observations_per_result;

        let loaded = join_all(ids.iter().map(|id| async move {
            primary
                .recent_observations(*id, limit)
                .await
                .map(|obs| (*id, obs))
        }))
        .await;

        loaded
            .into_iter()
            .filter(|r| !matches!(r, Ok((_, obs)) if obs.is_empty()))
            .collect()
    }

    async fn expand_graph(
        &self,
        ids: &[Uuid],
        scope: &RecordFilter,
        include_graph: bool,
    ) -> Result<Vec<(MemoryRecord, String)>> {
        if !include_graph || ids.is_empty() {
            return Ok(Vec::new());
        }

        let millis = self.config.branch_timeout_ms;
        match tokio::time::timeout(self.branch_timeout(), self.neighbours(ids, scope)).await {
            Ok(result) => result,
            Err(_) => Err(EideticError::Timeout {
                branch: "graph_expansion".to_string(),
                millis,
            }),
        }
    }

    async fn neighbours(
        &self,
        ids: &[Uuid],
        scope: &RecordFilter,
    ) -> Result<Vec<(MemoryRecord, String)>> {
        let primary = self.registry.primary();
        let threshold = self.config.graph_threshold;
        let hits: HashSet<Uuid> = ids.iter().copied().collect();

        // The graph backend answers neighbour lookups; without one the
        // primary's relationship table does
        let edge_sets: Vec<Result<Vec<(Uuid, String, f32)>>> = match self.registry.graph() {
            Some(graph) => {
                join_all(ids.iter().map(|id| async move {
                    Ok(graph.neighbors(*id, threshold).await)
                }))
                .await
            }
            None => {
                join_all(ids.iter().map(|id| async move {
                    primary
                        .outgoing_relationships(*id, threshold)
                        .await
                        .map(|edges| {
                            edges
                                .into_iter()
                                .map(|e| (e.to_id, e.relation_type, e.strength))
                                .collect()
                        })
                }))
                .await
            }
        };

        // Strongest edge wins when several hits point at one target
        let mut targets: BTreeMap<Uuid, (f32, String)> = BTreeMap::new();
        for edges in edge_sets {
            for (to_id, relation_type, strength) in edges? {
                if hits.contains(&to_id) {
                    continue;
                }
                let slot = targets
                    .entry(to_id)
                    .or_insert((strength, relation_type.clone()));
                if strength > slot.0 {
                    *slot = (strength, relation_type);
                }
            }
        }
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let target_ids: Vec<Uuid> = targets.keys().copied().collect();
        let records = primary.get_many(&target_ids).await?;
        Ok(records
            .into_iter()
            .filter(|r| scope.matches(r))
            .filter_map(|r| targets.remove(&r.id).map(|(_, kind)| (r, kind)))
            .collect())
    }

    fn score(
        &self,
        record: MemoryRecord,
        similarity: f32,
        match_type: MatchType,
        relation_type: Option<String>,
        context: Option<&ImportanceContext>,
        now: DateTime<Utc>,
    ) -> Scored {
        let components = self.evaluator.evaluate(&record, context, now);
        let score = fuse_score(
            similarity,
            components.normalized(),
            self.config.similarity_weight,
            self.config.importance_weight,
        );
        Scored {
            record,
            components,
            similarity,
            match_type,
            relation_type,
            score,
        }
    }

    /// Count an access on every direct hit and persist its refreshed
    /// importance in the same update. A query's relevance boost is left out
    /// of what is persisted.
    async fn record_access(
        &self,
        scored: &mut [Scored],
        contextual: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let primary = self.registry.primary();
        let boost = self.weights.frequency_boost();

        let updates = join_all(
            scored
                .iter()
                .filter(|s| s.match_type != MatchType::Related)
                .map(|s| {
                    let id = s.record.id;
                    let components = if contextual {
                        self.evaluator.evaluate(&s.record, None, now)
                    } else {
                        s.components
                    };
                    async move {
                        let refresh = move |r: &mut MemoryRecord| {
                            r.register_access(boost, now);
                            r.importance = components;
                        };
                        primary.update_record(id, &refresh).await
                    }
                }),
        )
        .await;

        let mut updated: HashMap<Uuid, MemoryRecord> = HashMap::new();
        for result in updates {
            if let Some(record) = result? {
                updated.insert(record.id, record);
            }
        }
        for s in scored.iter_mut() {
            if let Some(record) = updated.remove(&s.record.id) {
                s.record = record;
            }
        }
        Ok(())
    }
}
