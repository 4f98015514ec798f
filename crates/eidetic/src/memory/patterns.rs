//! Pattern finder: groups records by similarity or connectivity
//!
//! With a vector index, clusters grow greedily from each unclustered seed:
//! a neighbour joins only if it is similar enough to every current member.
//! Without one (or when it fails) records are grouped by connected
//! components of the relationship graph.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PatternConfig;
use crate::embedding::cosine_similarity;
use crate::error::{EideticError, Result};
use crate::memory::types::{Category, MemoryRecord, Relationship};
use crate::storage::registry::VECTOR_INDEX;
use crate::storage::{BackendKind, BackendRegistry, RecordFilter, VectorIndex};

fn default_min_cluster_size() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRequest {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
}

impl Default for PatternRequest {
    fn default() -> Self {
        Self {
            entity_type: None,
            category: None,
            min_cluster_size: default_min_cluster_size(),
        }
    }
}

impl PatternRequest {
    pub fn validate(&self) -> Result<()> {
        if self.min_cluster_size < 2 {
            return Err(EideticError::Validation(format!(
                "min_cluster_size must be at least 2, got {}",
                self.min_cluster_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMethod {
    Similarity,
    Connectivity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: Uuid,
    pub entity_type: String,
    pub name: String,
    pub category: Category,
    pub weight: f32,
}

impl From<&MemoryRecord> for ClusterMember {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            id: record.id,
            entity_type: record.entity_type.clone(),
            name: record.name.clone(),
            category: record.category,
            weight: record.weight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub members: Vec<ClusterMember>,
    pub size: usize,
    /// Mean pairwise similarity, or edge density for connectivity clusters
    pub cohesion: f32,
    /// Relationships with both endpoints inside the cluster
    pub edge_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternResponse {
    pub clusters: Vec<Cluster>,
    pub method: ClusterMethod,
    /// Records considered
    pub scanned: usize,
    pub degraded: bool,
}

pub struct PatternFinder<'a> {
    registry: &'a BackendRegistry,
    config: &'a PatternConfig,
}

impl<'a> PatternFinder<'a> {
    pub fn new(registry: &'a BackendRegistry, config: &'a PatternConfig) -> Self {
        Self { registry, config }
    }

    pub async fn find(&self, request: &PatternRequest) -> Result<PatternResponse> {
        let scope = RecordFilter::scope(request.entity_type.as_deref(), request.category);
        let records = self
            .registry
            .primary()
            .query(&scope.clone().with_limit(self.config.max_scan))
            .await?;
        let scanned = records.len();

        let mut degraded = false;
        if let Some(index) = self.registry.vector_index() {
            match self
                .similarity_clusters(index.as_ref(), &records, &scope, request.min_cluster_size)
                .await
            {
                Ok(clusters) => {
                    self.registry
                        .availability()
                        .mark_ok(VECTOR_INDEX, BackendKind::VectorIndex);
                    let relationships = self.registry.primary().all_relationships().await?;
                    let clusters = self.finish(clusters, &relationships, false);
                    return Ok(PatternResponse {
                        clusters,
                        method: ClusterMethod::Similarity,
                        scanned,
                        degraded,
                    });
                }
                Err(e) => {
                    warn!("Similarity clustering failed, using connectivity: {e}");
                    self.registry.availability().mark_failed(
                        VECTOR_INDEX,
                        BackendKind::VectorIndex,
                        &e,
                    );
                    degraded = true;
                }
            }
        }

        let relationships = self.registry.primary().all_relationships().await?;
        let clusters = connectivity_clusters(&records, &relationships, request.min_cluster_size);
        Ok(PatternResponse {
            clusters: self.finish(clusters, &relationships, true),
            method: ClusterMethod::Connectivity,
            scanned,
            degraded,
        })
    }

    async fn similarity_clusters(
        &self,
        index: &dyn VectorIndex,
        records: &[MemoryRecord],
        scope: &RecordFilter,
        min_size: usize,
    ) -> Result<Vec<Vec<MemoryRecord>>> {
        let threshold = self.config.similarity_threshold;
        let by_id: HashMap<Uuid, &MemoryRecord> = records.iter().map(|r| (r.id, r)).collect();
        let mut clustered: HashSet<Uuid> = HashSet::new();
        let mut clusters = Vec::new();

        for seed in records {
            if clustered.contains(&seed.id) {
                continue;
            }

            let hits = index
                .search(&seed.embedding, scope, self.config.max_scan)
                .await?;

            let mut members: Vec<&MemoryRecord> = vec![seed];
            for hit in hits {
                if hit.id == seed.id || hit.similarity < threshold || clustered.contains(&hit.id) {
                    continue;
                }
                let Some(candidate) = by_id.get(&hit.id) else {
                    continue;
                };
                let fits = members
                    .iter()
                    .all(|m| cosine_similarity(&m.embedding, &candidate.embedding) >= threshold);
                if fits {
                    members.push(candidate);
                }
            }

            if members.len() >= min_size {
                debug!("Cluster of {} seeded by {}", members.len(), seed.id);
                clustered.extend(members.iter().map(|m| m.id));
                clusters.push(members.into_iter().cloned().collect());
            }
        }

        Ok(clusters)
    }

    /// Score, order and cap clusters
    fn finish(
        &self,
        clusters: Vec<Vec<MemoryRecord>>,
        relationships: &[Relationship],
        by_edges: bool,
    ) -> Vec<Cluster> {
        let mut scored: Vec<Cluster> = clusters
            .into_iter()
            .map(|members| {
                let ids: HashSet<Uuid> = members.iter().map(|m| m.id).collect();
                let edge_count = relationships
                    .iter()
                    .filter(|e| ids.contains(&e.from_id) && ids.contains(&e.to_id))
                    .count();
                let cohesion = if by_edges {
                    edge_density(members.len(), edge_count)
                } else {
                    mean_pairwise_similarity(&members)
                };
                Cluster {
                    members: members.iter().map(ClusterMember::from).collect(),
                    size: members.len(),
                    cohesion,
                    edge_count,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            let edges = if by_edges {
                b.edge_count.cmp(&a.edge_count)
            } else {
                std::cmp::Ordering::Equal
            };
            edges
                .then_with(|| b.size.cmp(&a.size))
                .then_with(|| b.cohesion.total_cmp(&a.cohesion))
                .then_with(|| a.members[0].id.cmp(&b.members[0].id))
        });
        scored.truncate(self.config.max_clusters);
        scored
    }
}

fn mean_pairwise_similarity(members: &[MemoryRecord]) -> f32 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            total += cosine_similarity(&a.embedding, &b.embedding);
            pairs += 1;
        }
    }
    if pairs == 0 { 0.0 } else { total / pairs as f32 }
}

fn edge_density(size: usize, edges: usize) -> f32 {
    if size < 2 {
        return 0.0;
    }
    let possible = size * (size - 1);
    (edges as f32 / possible as f32).min(1.0)
}

/// Connected components of the relationship graph restricted to `records`,
/// ignoring edge direction
pub fn connectivity_clusters(
    records: &[MemoryRecord],
    relationships: &[Relationship],
    min_size: usize,
) -> Vec<Vec<MemoryRecord>> {
    let position: HashMap<Uuid, usize> =
        records.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
    let mut parent: Vec<usize> = (0..records.len()).collect();

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for edge in relationships {
        let (Some(&a), Some(&b)) = (position.get(&edge.from_id), position.get(&edge.to_id)) else {
            continue;
        };
        let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
        if ra != rb {
            parent[ra.max(rb)] = ra.min(rb);
        }
    }

    let mut components: HashMap<usize, Vec<MemoryRecord>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        let root = find(&mut parent, i);
        components.entry(root).or_default().push(record.clone());
    }

    let mut clusters: Vec<(usize, Vec<MemoryRecord>)> = components
        .into_iter()
        .filter(|(_, members)| members.len() >= min_size)
        .collect();
    clusters.sort_by_key(|(root, _)| *root);
    clusters.into_iter().map(|(_, members)| members).collect()
}
