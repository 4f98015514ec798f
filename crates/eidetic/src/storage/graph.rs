//! Typed-edge graph for procedural copies
//!
//! Nodes are records; edges mirror the primary store's relationships and
//! serve recall's neighbour lookups. Never the source of truth: the
//! registry re-seeds edges from the primary when it opens.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, Relationship};
use crate::storage::filter::RecordFilter;
use crate::storage::{BackendKind, CategoryBackend};

#[derive(Debug, Default)]
struct GraphState {
    nodes: HashMap<Uuid, MemoryRecord>,
    /// from -> (to, relation_type) -> strength
    edges: HashMap<Uuid, BTreeMap<(Uuid, String), f32>>,
}

#[derive(Debug, Default)]
pub struct GraphBackend {
    state: RwLock<GraphState>,
}

impl GraphBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update the edge for `relationship`
    pub async fn link(&self, relationship: &Relationship) {
        let mut state = self.state.write().await;
        state.edges.entry(relationship.from_id).or_default().insert(
            (relationship.to_id, relationship.relation_type.clone()),
            relationship.strength,
        );
    }

    /// Outgoing neighbours of `id` as `(to, relation_type, strength)` with
    /// strength strictly above `min_strength`, strongest first
    pub async fn neighbors(&self, id: Uuid, min_strength: f32) -> Vec<(Uuid, String, f32)> {
        let state = self.state.read().await;
        let mut out: Vec<(Uuid, String, f32)> = state
            .edges
            .get(&id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|(_, strength)| **strength > min_strength)
                    .map(|((to, kind), strength)| (*to, kind.clone(), *strength))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edges.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl CategoryBackend for GraphBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    async fn put(&self, record: &MemoryRecord) -> Result<Uuid> {
        self.state
            .write()
            .await
            .nodes
            .insert(record.id, record.clone());
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(self.state.read().await.nodes.get(&id).cloned())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<MemoryRecord> = state
            .nodes
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Category;
    use serde_json::Map;

    #[tokio::test]
    async fn test_nodes_and_edges() {
        let graph = GraphBackend::new();
        let a = MemoryRecord::new("skill", "deploy", "how to deploy", vec![], Category::Procedural);
        let b = MemoryRecord::new("skill", "build", "how to build", vec![], Category::Procedural);
        graph.put(&a).await.unwrap();
        graph.put(&b).await.unwrap();

        graph
            .link(&Relationship::new(a.id, b.id, "requires", 0.6, Map::new()))
            .await;
        graph
            .link(&Relationship::new(a.id, b.id, "requires", 0.9, Map::new()))
            .await;

        let neighbors = graph.neighbors(a.id, 0.0).await;
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, b.id);
        assert!((neighbors[0].2 - 0.9).abs() < 1e-6);
        assert_eq!(graph.edge_count().await, 1);
        assert!(graph.neighbors(a.id, 0.9).await.is_empty());
        assert!(graph.neighbors(b.id, 0.0).await.is_empty());

        assert_eq!(graph.query(&RecordFilter::new()).await.unwrap().len(), 2);
        assert!(graph.get(a.id).await.unwrap().is_some());
    }
}
