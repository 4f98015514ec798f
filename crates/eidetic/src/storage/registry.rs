//! Backend handles and availability tracking
//!
//! The registry owns the primary store plus whichever optional backends the
//! configuration enables. Optional backends report success and failure to
//! [`BackendAvailability`], which feeds `get_stats` and degraded-mode flags.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PrimaryBackend, StorageConfig};
use crate::error::{EideticError, Result};
use crate::memory::types::Category;
use crate::storage::{
    BackendKind, CategoryBackend, DocumentBackend, EventLog, GraphBackend, InMemoryStore,
    InMemoryVectorIndex, LanceStore, LanceVectorIndex, PrimaryStore, ScratchBackend, VectorIndex,
};

/// Availability of one backend as last observed
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub kind: BackendKind,
    pub available: bool,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct BackendAvailability {
    statuses: DashMap<String, BackendStatus>,
}

impl BackendAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ok(&self, name: &str, kind: BackendKind) {
        let mut entry = self.entry(name, kind);
        entry.available = true;
        entry.last_checked = Utc::now();
    }

    pub fn mark_failed(&self, name: &str, kind: BackendKind, error: &EideticError) {
        let mut entry = self.entry(name, kind);
        if entry.available {
            warn!("Backend {name} marked unavailable: {error}");
        }
        entry.available = false;
        entry.failures += 1;
        entry.last_error = Some(error.to_string());
        entry.last_checked = Utc::now();
    }

    fn entry(
        &self,
        name: &str,
        kind: BackendKind,
    ) -> dashmap::mapref::one::RefMut<'_, String, BackendStatus> {
        self.statuses
            .entry(name.to_string())
            .or_insert_with(|| BackendStatus {
                name: name.to_string(),
                kind,
                available: true,
                failures: 0,
                last_error: None,
                last_checked: Utc::now(),
            })
    }

    /// Unknown backends count as available
    pub fn is_available(&self, name: &str) -> bool {
        self.statuses.get(name).is_none_or(|s| s.available)
    }

    /// All statuses ordered by name
    pub fn snapshot(&self) -> Vec<BackendStatus> {
        let mut statuses: Vec<BackendStatus> =
            self.statuses.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

/// Name under which the primary store reports availability
pub const PRIMARY: &str = "primary";
/// Name under which the vector index reports availability
pub const VECTOR_INDEX: &str = "vector_index";

pub struct BackendRegistry {
    primary: Arc<dyn PrimaryStore>,
    vector: Option<Arc<dyn VectorIndex>>,
    categories: HashMap<Category, Arc<dyn CategoryBackend>>,
    graph: Option<Arc<GraphBackend>>,
    events: Option<Arc<EventLog>>,
    availability: Arc<BackendAvailability>,
}

impl BackendRegistry {
    /// A registry with only the primary store
    pub fn new(primary: Arc<dyn PrimaryStore>) -> Self {
        let availability = Arc::new(BackendAvailability::new());
        availability.mark_ok(PRIMARY, BackendKind::Structured);
        Self {
            primary,
            vector: None,
            categories: HashMap::new(),
            graph: None,
            events: None,
            availability,
        }
    }

    /// Everything in memory: primary, vector index and all category backends
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
            .with_vector_index(Arc::new(InMemoryVectorIndex::new()))
            .with_category_backend(
                Category::Episodic,
                Arc::new(ScratchBackend::new(1024, Duration::from_secs(3600))),
            )
            .with_graph(Arc::new(GraphBackend::new()))
            .with_category_backend(Category::Emotional, Arc::new(DocumentBackend::new()))
            .with_events(Arc::new(EventLog::new(10_000)))
    }

    /// Open the backends enabled in `config`
    pub async fn from_config(config: &StorageConfig, dimension: usize) -> Result<Self> {
        let lance_dir = config.data_dir.join("lance");

        let mut registry = match config.primary {
            PrimaryBackend::Lance => {
                std::fs::create_dir_all(&lance_dir).map_err(|e| {
                    EideticError::Storage(format!(
                        "Failed to create data directory {}: {}",
                        lance_dir.display(),
                        e
                    ))
                })?;
                Self::new(Arc::new(LanceStore::open(&lance_dir, dimension).await?))
            }
            PrimaryBackend::Memory => Self::new(Arc::new(InMemoryStore::new())),
        };

        if config.vector_index {
            let index: Arc<dyn VectorIndex> = match config.primary {
                PrimaryBackend::Lance => Arc::new(LanceVectorIndex::open(&lance_dir, dimension).await?),
                PrimaryBackend::Memory => Arc::new(InMemoryVectorIndex::new()),
            };
            registry = registry.with_vector_index(index);
        }
        if config.scratch {
            registry = registry.with_category_backend(
                Category::Episodic,
                Arc::new(ScratchBackend::new(
                    config.scratch_capacity,
                    Duration::from_secs(config.scratch_ttl_secs),
                )),
            );
        }
        if config.graph {
            let graph = Arc::new(GraphBackend::new());
            let edges = registry.primary.all_relationships().await?;
            for edge in &edges {
                graph.link(edge).await;
            }
            debug!("Seeded graph with {} edges", edges.len());
            registry = registry.with_graph(graph);
        }
        if config.documents {
            registry =
                registry.with_category_backend(Category::Emotional, Arc::new(DocumentBackend::new()));
        }
        if config.event_log {
            registry = registry.with_events(Arc::new(EventLog::new(config.event_log_capacity)));
        }

        info!(
            "Backends ready: primary={:?}, vector_index={}, categories={}",
            config.primary,
            registry.vector.is_some(),
            registry.categories.len()
        );
        Ok(registry)
    }

    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.availability.mark_ok(VECTOR_INDEX, BackendKind::VectorIndex);
        self.vector = Some(index);
        self
    }

    pub fn with_category_backend(
        mut self,
        category: Category,
        backend: Arc<dyn CategoryBackend>,
    ) -> Self {
        self.availability.mark_ok(category.as_str(), backend.kind());
        self.categories.insert(category, backend);
        self
    }

    /// Graph backend, also used as the procedural category backend
    pub fn with_graph(mut self, graph: Arc<GraphBackend>) -> Self {
        self.graph = Some(Arc::clone(&graph));
        self.with_category_backend(Category::Procedural, graph)
    }

    /// Event log, also used as the motor category backend
    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(Arc::clone(&events));
        self.with_category_backend(Category::Motor, events)
    }

    pub fn primary(&self) -> &Arc<dyn PrimaryStore> {
        &self.primary
    }

    pub fn vector_index(&self) -> Option<&Arc<dyn VectorIndex>> {
        self.vector.as_ref()
    }

    /// Secondary backend holding copies of `category` records. Semantic
    /// records live only in the primary store, attention is served by the
    /// vector index.
    pub fn category_backend(&self, category: Category) -> Option<&Arc<dyn CategoryBackend>> {
        self.categories.get(&category)
    }

    pub fn graph(&self) -> Option<&Arc<GraphBackend>> {
        self.graph.as_ref()
    }

    pub fn events(&self) -> Option<&Arc<EventLog>> {
        self.events.as_ref()
    }

    pub fn availability(&self) -> &Arc<BackendAvailability> {
        &self.availability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_tracking() {
        let availability = BackendAvailability::new();
        assert!(availability.is_available("vector_index"));

        availability.mark_failed(
            "vector_index",
            BackendKind::VectorIndex,
            &EideticError::unavailable("vector_index", "connection refused"),
        );
        assert!(!availability.is_available("vector_index"));

        availability.mark_ok("vector_index", BackendKind::VectorIndex);
        let snapshot = availability.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].available);
        assert_eq!(snapshot[0].failures, 1);
        assert!(snapshot[0].last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[test]
    fn test_in_memory_registry_has_every_category_copy() {
        let registry = BackendRegistry::in_memory();
        assert!(registry.vector_index().is_some());
        assert!(registry.graph().is_some());
        assert!(registry.events().is_some());
        for category in [Category::Episodic, Category::Procedural, Category::Emotional, Category::Motor] {
            assert!(registry.category_backend(category).is_some(), "{category}");
        }
        assert!(registry.category_backend(Category::Semantic).is_none());
        assert!(registry.category_backend(Category::Attention).is_none());
    }

    #[tokio::test]
    async fn test_from_config_memory_primary() {
        let config = StorageConfig {
            primary: PrimaryBackend::Memory,
            graph: false,
            ..StorageConfig::default()
        };
        let registry = BackendRegistry::from_config(&config, 8).await.unwrap();
        assert!(registry.graph().is_none());
        assert!(registry.category_backend(Category::Procedural).is_none());
        assert_eq!(registry.vector_index().unwrap().name(), "memory");
    }

    #[tokio::test]
    async fn test_from_config_lance_primary() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let registry = BackendRegistry::from_config(&config, 8).await.unwrap();
        assert_eq!(registry.vector_index().unwrap().name(), "lance");
        assert!(temp_dir.path().join("lance").exists());
        assert_eq!(registry.primary().counts().await.unwrap().records, 0);
    }
}
