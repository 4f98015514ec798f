//! Test utilities for eidetic - deterministic providers and flaky backends
//!
//! - [`MockEmbeddingProvider`]: bag-of-words vectors, so texts sharing words
//!   are similar without any model
//! - [`UnavailableVectorIndex`], [`SlowVectorIndex`] and
//!   [`SlowObservationStore`]: drive recall into its degraded paths
//! - [`test_engine`]: an engine over in-memory backends

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{Config, PrimaryBackend};
use crate::embedding::{EmbeddingAdapter, EmbeddingProvider};
use crate::engine::Engine;
use crate::error::{EideticError, Result};
use crate::storage::registry::VECTOR_INDEX;
use crate::memory::types::{Category, MemoryRecord, Observation, Relationship};
use crate::storage::{
    BackendKind, BackendRegistry, CategoryBackend, PrimaryStore, RecordFilter, RecordMutation,
    StoreCounts, VectorEntry, VectorHit, VectorIndex,
};

/// Dimension used by the helpers in this module
pub const TEST_DIMENSION: usize = 128;

/// Deterministic embeddings from hashed words.
///
/// Each lowercase word adds +1 or -1 to one bucket; the sum is
/// L2-normalized. Texts with the same words map to the same vector.
#[derive(Debug)]
pub struct MockEmbeddingProvider {
    dimension: usize,
    calls: AtomicU64,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dimension as u64) as usize;
            vector[bucket] += if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            vector[0] = 1.0;
        } else {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.vector(text))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// A vector index that always fails
#[derive(Debug, Default)]
pub struct UnavailableVectorIndex;

#[async_trait]
impl VectorIndex for UnavailableVectorIndex {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn upsert(&self, _entry: VectorEntry) -> Result<()> {
        Err(EideticError::unavailable(VECTOR_INDEX, "connection refused"))
    }

    async fn search(
        &self,
        _query: &[f32],
        _scope: &RecordFilter,
        _limit: usize,
    ) -> Result<Vec<VectorHit>> {
        Err(EideticError::unavailable(VECTOR_INDEX, "connection refused"))
    }

    async fn len(&self) -> Result<usize> {
        Err(EideticError::unavailable(VECTOR_INDEX, "connection refused"))
    }

    async fn clear(&self) -> Result<()> {
        Err(EideticError::unavailable(VECTOR_INDEX, "connection refused"))
    }
}

/// Delegates to an inner index after sleeping on every search and upsert
pub struct SlowVectorIndex {
    inner: Arc<dyn VectorIndex>,
    delay: Duration,
}

impl SlowVectorIndex {
    pub fn new(inner: Arc<dyn VectorIndex>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl VectorIndex for SlowVectorIndex {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(entry).await
    }

    async fn search(
        &self,
        query: &[f32],
        scope: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        tokio::time::sleep(self.delay).await;
        self.inner.search(query, scope, limit).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

/// Primary store whose observation reads hang for `delay`; everything else
/// goes straight to the inner store
pub struct SlowObservationStore {
    inner: Arc<dyn PrimaryStore>,
    delay: Duration,
}

impl SlowObservationStore {
    pub fn new(inner: Arc<dyn PrimaryStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl CategoryBackend for SlowObservationStore {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn put(&self, record: &MemoryRecord) -> Result<Uuid> {
        self.inner.put(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        self.inner.get(id).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        self.inner.query(filter).await
    }
}

#[async_trait]
impl PrimaryStore for SlowObservationStore {
    async fn find_by_name(
        &self,
        entity_type: Option<&str>,
        name: &str,
    ) -> Result<Option<MemoryRecord>> {
        self.inner.find_by_name(entity_type, name).await
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        self.inner.get_many(ids).await
    }

    async fn update_record(
        &self,
        id: Uuid,
        mutate: RecordMutation<'_>,
    ) -> Result<Option<MemoryRecord>> {
        self.inner.update_record(id, mutate).await
    }

    async fn reroute(&self, id: Uuid, category: Category) -> Result<Option<Category>> {
        self.inner.reroute(id, category).await
    }

    async fn append_observations(&self, observations: &[Observation]) -> Result<usize> {
        self.inner.append_observations(observations).await
    }

    async fn recent_observations(
        &self,
        entity_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        tokio::time::sleep(self.delay).await;
        self.inner.recent_observations(entity_id, limit).await
    }

    async fn insert_relationship(
        &self,
        relationship: Relationship,
    ) -> Result<(Relationship, bool)> {
        self.inner.insert_relationship(relationship).await
    }

    async fn outgoing_relationships(
        &self,
        from_id: Uuid,
        min_strength: f32,
    ) -> Result<Vec<Relationship>> {
        self.inner.outgoing_relationships(from_id, min_strength).await
    }

    async fn all_relationships(&self) -> Result<Vec<Relationship>> {
        self.inner.all_relationships().await
    }

    async fn reinforce_relationship(
        &self,
        id: Uuid,
        amount: f32,
    ) -> Result<Option<Relationship>> {
        self.inner.reinforce_relationship(id, amount).await
    }

    async fn text_search(
        &self,
        query: &str,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.inner.text_search(query, filter, limit).await
    }

    async fn counts(&self) -> Result<StoreCounts> {
        self.inner.counts().await
    }
}

/// Config for in-memory tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.primary = PrimaryBackend::Memory;
    config.embedding.dimension = TEST_DIMENSION;
    config
}

/// Adapter over [`MockEmbeddingProvider`]
pub fn mock_embedder() -> EmbeddingAdapter {
    EmbeddingAdapter::new(
        Some(Arc::new(MockEmbeddingProvider::new(TEST_DIMENSION))),
        TEST_DIMENSION,
        1024,
        Duration::from_secs(5),
    )
}

/// Engine over every in-memory backend with mock embeddings
pub fn test_engine() -> Engine {
    test_engine_with(BackendRegistry::in_memory())
}

/// Engine over `registry` with mock embeddings
pub fn test_engine_with(registry: BackendRegistry) -> Engine {
    Engine::new(test_config(), registry, mock_embedder())
}
