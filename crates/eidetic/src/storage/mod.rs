//! Storage abstraction
//!
//! Every category backend implements [`CategoryBackend`]. Exactly one
//! backend is the authoritative [`PrimaryStore`]; the vector index, the
//! category copies and the caches are derivable from it and may lag or fail
//! independently.

pub mod document;
pub mod events;
pub mod filter;
pub mod graph;
pub mod lance;
pub mod memory;
pub mod registry;
pub mod scratch;
pub mod vector;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::types::{Category, MemoryRecord, Observation, Relationship, WeightBand};

pub use document::DocumentBackend;
pub use events::{EventLog, MemoryEvent};
pub use filter::RecordFilter;
pub use graph::GraphBackend;
pub use lance::LanceStore;
pub use memory::InMemoryStore;
pub use registry::{BackendAvailability, BackendRegistry, BackendStatus};
pub use scratch::ScratchBackend;
pub use vector::{InMemoryVectorIndex, LanceVectorIndex, VectorEntry, VectorHit, VectorIndex};

/// Capability class of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Fast mutable key-value scratch space
    Scratch,
    /// Durable structured records
    Structured,
    /// Typed-edge graph
    Graph,
    /// Flexible-schema documents
    Document,
    /// Nearest-neighbour vector index
    VectorIndex,
    /// Append-only event stream
    EventLog,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Scratch => "scratch",
            BackendKind::Structured => "structured",
            BackendKind::Graph => "graph",
            BackendKind::Document => "document",
            BackendKind::VectorIndex => "vector_index",
            BackendKind::EventLog => "event_log",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform contract over heterogeneous category backends
#[async_trait]
pub trait CategoryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Store or replace `record`, returning its id
    async fn put(&self, record: &MemoryRecord) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>>;

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>>;
}

/// In-place change applied to one record under the store's write guard
pub type RecordMutation<'a> = &'a (dyn Fn(&mut MemoryRecord) + Send + Sync);

/// Record, observation and relationship totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreCounts {
    pub records: usize,
    pub observations: usize,
    pub relationships: usize,
    pub per_category: BTreeMap<Category, usize>,
    pub weight_bands: BTreeMap<WeightBand, usize>,
}

impl StoreCounts {
    /// Tally category and band counts for `records`
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a MemoryRecord>) -> Self {
        let mut counts = StoreCounts::default();
        for record in records {
            counts.add(record);
        }
        counts
    }

    pub fn add(&mut self, record: &MemoryRecord) {
        self.add_entry(record.category, record.weight());
    }

    pub fn add_entry(&mut self, category: Category, weight: f32) {
        self.records += 1;
        *self.per_category.entry(category).or_default() += 1;
        *self.weight_bands.entry(WeightBand::for_weight(weight)).or_default() += 1;
    }
}

/// The authoritative record store
#[async_trait]
pub trait PrimaryStore: CategoryBackend {
    /// Look up a record by name, optionally scoped to an entity type
    async fn find_by_name(&self, entity_type: Option<&str>, name: &str)
    -> Result<Option<MemoryRecord>>;

    /// Fetch several records; missing ids are skipped
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>>;

    /// Atomically apply `mutate` to one record and return the result, or
    /// `None` if the record does not exist
    async fn update_record(
        &self,
        id: Uuid,
        mutate: RecordMutation<'_>,
    ) -> Result<Option<MemoryRecord>>;

    /// Count one access: counter, timestamp and weight boost in one step
    async fn record_access(
        &self,
        id: Uuid,
        boost: f32,
        at: DateTime<Utc>,
    ) -> Result<Option<MemoryRecord>> {
        self.update_record(id, &move |r: &mut MemoryRecord| r.register_access(boost, at))
            .await
    }

    /// Move a record to another category. Returns the previous category, or
    /// `None` if the record does not exist.
    async fn reroute(&self, id: Uuid, category: Category) -> Result<Option<Category>> {
        let previous = std::sync::Mutex::new(None);
        self.update_record(id, &|r: &mut MemoryRecord| {
            if let Ok(mut slot) = previous.lock() {
                *slot = Some(r.category);
            }
            r.category = category;
            r.updated_at = Utc::now();
        })
        .await?;
        Ok(previous.into_inner().ok().flatten())
    }

    async fn append_observations(&self, observations: &[Observation]) -> Result<usize>;

    /// Most recent observations for a record, newest first
    async fn recent_observations(&self, entity_id: Uuid, limit: usize)
    -> Result<Vec<Observation>>;

    /// Insert `relationship` unless an edge with the same `(from, to, type)`
    /// exists. Returns the stored edge and whether it was newly created.
    async fn insert_relationship(&self, relationship: Relationship)
    -> Result<(Relationship, bool)>;

    /// Edges leaving `from_id` with strength strictly above `min_strength`
    async fn outgoing_relationships(
        &self,
        from_id: Uuid,
        min_strength: f32,
    ) -> Result<Vec<Relationship>>;

    async fn all_relationships(&self) -> Result<Vec<Relationship>>;

    /// Add `amount` to an edge's strength (capped at 1.0), returning the
    /// updated edge
    async fn reinforce_relationship(&self, id: Uuid, amount: f32)
    -> Result<Option<Relationship>>;

    /// Records whose name or content contains any query term of three or
    /// more characters, ordered by stored importance
    async fn text_search(
        &self,
        query: &str,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>>;

    async fn counts(&self) -> Result<StoreCounts>;
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "what", "who", "how", "are", "was", "were",
    "from", "have", "has", "had", "not", "but", "you", "your", "about", "into", "its",
];

/// Lowercased query terms used by text search: three or more characters,
/// common stopwords removed
pub fn search_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Fraction of `terms` present in the record's name or content
pub fn term_overlap(record: &MemoryRecord, terms: &[String]) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = format!("{} {}", record.name, record.content).to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

/// Order by stored importance (descending), then id, and truncate
pub(crate) fn rank_by_importance(records: &mut Vec<MemoryRecord>, limit: usize) {
    records.sort_by(|a, b| {
        b.importance
            .composite
            .total_cmp(&a.importance.composite)
            .then_with(|| a.id.cmp(&b.id))
    });
    records.truncate(limit);
}
