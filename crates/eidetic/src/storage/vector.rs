//! Nearest-neighbour index over record embeddings
//!
//! The index is derived data: every entry can be rebuilt from the primary
//! store, and a missing or failing index only degrades recall.

use std::path::Path;
use std::sync::Arc;

use arrow_array::{FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use dashmap::DashMap;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use tracing::info;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::{EideticError, Result};
use crate::memory::types::{Category, MemoryRecord};
use crate::storage::filter::RecordFilter;
use crate::storage::lance::{
    collect, column, embedding_array, embedding_field, open_or_create, parse_uuid, read_embedding,
};

const INDEX_TABLE: &str = "attention_index";

/// One indexed embedding with the fields recall can scope on
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: Uuid,
    pub embedding: Vec<f32>,
    pub entity_type: String,
    pub category: Category,
}

impl From<&MemoryRecord> for VectorEntry {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            id: record.id,
            embedding: record.embedding.clone(),
            entity_type: record.entity_type.clone(),
            category: record.category,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub id: Uuid,
    /// Cosine similarity in [-1, 1]
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert(&self, entry: VectorEntry) -> Result<()>;

    /// The `limit` nearest entries to `query` within the entity type and
    /// category of `scope`, most similar first
    async fn search(&self, query: &[f32], scope: &RecordFilter, limit: usize)
    -> Result<Vec<VectorHit>>;

    async fn len(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

fn in_scope(entry: &VectorEntry, scope: &RecordFilter) -> bool {
    scope
        .entity_type
        .as_ref()
        .is_none_or(|t| *t == entry.entity_type)
        && scope.category.is_none_or(|c| c == entry.category)
}

fn sort_hits(hits: &mut Vec<VectorHit>, limit: usize) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
}

/// Brute-force cosine index held in memory
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    entries: DashMap<Uuid, VectorEntry>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        scope: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let mut hits: Vec<VectorHit> = self
            .entries
            .iter()
            .filter(|e| in_scope(e.value(), scope))
            .map(|e| VectorHit {
                id: e.id,
                similarity: cosine_similarity(query, &e.embedding),
            })
            .collect();
        sort_hits(&mut hits, limit);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.len())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Vector index in its own LanceDB table, searched by cosine distance
pub struct LanceVectorIndex {
    table: Table,
    dimension: usize,
}

impl LanceVectorIndex {
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| EideticError::Storage("Invalid path encoding".to_string()))?;
        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let table = open_or_create(&connection, INDEX_TABLE, Self::schema(dimension)).await?;
        info!("Vector index opened at {}", path.display());
        Ok(Self { table, dimension })
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("entity_type", DataType::Utf8, false),
            Field::new("category", DataType::Utf8, false),
            embedding_field(dimension),
        ]))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    fn name(&self) -> &'static str {
        "lance"
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        if entry.embedding.len() != self.dimension {
            return Err(EideticError::Storage(format!(
                "Index embedding has {} dimensions, expected {}",
                entry.embedding.len(),
                self.dimension
            )));
        }

        let batch = RecordBatch::try_new(
            Self::schema(self.dimension),
            vec![
                Arc::new(StringArray::from(vec![entry.id.to_string()])),
                Arc::new(StringArray::from(vec![entry.entity_type.clone()])),
                Arc::new(StringArray::from(vec![entry.category.as_str()])),
                Arc::new(embedding_array(std::iter::once(&entry.embedding), self.dimension)),
            ],
        )
        .map_err(|e| EideticError::Storage(format!("Failed to create index RecordBatch: {e}")))?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge = self.table.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to upsert index entry: {e}")))?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        scope: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let mut search = self
            .table
            .query()
            .nearest_to(query)
            .map_err(|e| EideticError::Storage(format!("Failed to create vector query: {e}")))?
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        let scope = RecordFilter::scope(scope.entity_type.as_deref(), scope.category);
        if let Some(clause) = scope.to_sql_clause() {
            search = search.only_if(clause);
        }

        let batches = collect(search.execute().await, "execute vector search").await?;

        let mut hits = Vec::new();
        for batch in &batches {
            let ids = column::<StringArray>(batch, "id")?;
            let embeddings = column::<FixedSizeListArray>(batch, "embedding")?;
            for row in 0..batch.num_rows() {
                hits.push(VectorHit {
                    id: parse_uuid(ids.value(row))?,
                    similarity: cosine_similarity(query, &read_embedding(embeddings, row)?),
                });
            }
        }
        sort_hits(&mut hits, limit);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to count index rows: {e}")))
    }

    async fn clear(&self) -> Result<()> {
        self.table
            .delete("id IS NOT NULL")
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to clear index: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(embedding: Vec<f32>, entity_type: &str, category: Category) -> VectorEntry {
        VectorEntry {
            id: Uuid::new_v4(),
            embedding,
            entity_type: entity_type.to_string(),
            category,
        }
    }

    async fn exercise(index: &dyn VectorIndex) {
        let near = entry(vec![1.0, 0.0, 0.0, 0.0], "note", Category::Semantic);
        let far = entry(vec![0.0, 1.0, 0.0, 0.0], "note", Category::Semantic);
        let other = entry(vec![0.9, 0.1, 0.0, 0.0], "person", Category::Episodic);
        for e in [&near, &far, &other] {
            index.upsert(e.clone()).await.unwrap();
        }
        assert_eq!(index.len().await.unwrap(), 3);

        let hits = index
            .search(&[1.0, 0.0, 0.0, 0.0], &RecordFilter::new(), 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, near.id);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);

        let scoped = index
            .search(
                &[1.0, 0.0, 0.0, 0.0],
                &RecordFilter::new().with_entity_type("note"),
                10,
            )
            .await
            .unwrap();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|h| h.id != other.id));

        let mut moved = near.clone();
        moved.category = Category::Motor;
        index.upsert(moved).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 3);
        let motor = index
            .search(
                &[1.0, 0.0, 0.0, 0.0],
                &RecordFilter::new().with_category(Category::Motor),
                10,
            )
            .await
            .unwrap();
        assert_eq!(motor.len(), 1);

        index.clear().await.unwrap();
        assert_eq!(index.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_index() {
        exercise(&InMemoryVectorIndex::new()).await;
    }

    #[tokio::test]
    async fn test_lance_index() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = LanceVectorIndex::open(temp_dir.path(), 4).await.unwrap();
        exercise(&index).await;
    }

    #[tokio::test]
    async fn test_lance_index_rejects_wrong_dimension() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = LanceVectorIndex::open(temp_dir.path(), 4).await.unwrap();
        let result = index
            .upsert(entry(vec![1.0; 3], "note", Category::Semantic))
            .await;
        assert!(result.is_err());
    }
}
