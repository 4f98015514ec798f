//! LanceDB-backed primary store
//!
//! Three tables: `entities`, `observations` and `relationships`. Structured
//! fields that have no natural Arrow column (importance components,
//! associations, metadata, relationship properties) are stored as JSON text.
//! Writes from this process are serialized through one async lock so that a
//! read-modify-write of a record lands as a single table update.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EideticError, Result};
use crate::memory::types::{
    Category, ImportanceComponents, MemoryRecord, Observation, Relationship, clamp_unit,
};
use crate::storage::filter::{RecordFilter, escape_sql};
use crate::storage::{
    BackendKind, CategoryBackend, PrimaryStore, RecordMutation, StoreCounts, rank_by_importance,
    search_terms,
};

const ENTITIES_TABLE: &str = "entities";
const OBSERVATIONS_TABLE: &str = "observations";
const RELATIONSHIPS_TABLE: &str = "relationships";

pub struct LanceStore {
    connection: Connection,
    dimension: usize,
    entities: Table,
    observations: Table,
    relationships: Table,
    write_lock: Mutex<()>,
}

impl LanceStore {
    /// Connect to the database at `path`, creating any missing table
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| EideticError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let entities =
            open_or_create(&connection, ENTITIES_TABLE, entities_schema(dimension)).await?;
        let observations =
            open_or_create(&connection, OBSERVATIONS_TABLE, observations_schema(dimension))
                .await?;
        let relationships =
            open_or_create(&connection, RELATIONSHIPS_TABLE, relationships_schema()).await?;

        info!("LanceStore opened at {} (dimension {dimension})", path.display());

        Ok(Self {
            connection,
            dimension,
            entities,
            observations,
            relationships,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        table_exists(&self.connection, name).await
    }

    async fn select_entities(&self, predicate: Option<String>) -> Result<Vec<MemoryRecord>> {
        let mut query = self.entities.query();
        if let Some(predicate) = predicate {
            query = query.only_if(predicate);
        }
        let batches = collect(query.execute().await, "query entities").await?;

        let mut records = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                records.push(batch_to_record(batch, row)?);
            }
        }
        Ok(records)
    }

    async fn select_relationships(&self, predicate: Option<String>) -> Result<Vec<Relationship>> {
        let mut query = self.relationships.query();
        if let Some(predicate) = predicate {
            query = query.only_if(predicate);
        }
        let batches = collect(query.execute().await, "query relationships").await?;

        let mut edges = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                edges.push(batch_to_relationship(batch, row)?);
            }
        }
        Ok(edges)
    }

    fn check_dimension(&self, embedding: &[f32], what: &str) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(EideticError::Storage(format!(
                "{what} embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(())
    }
}

async fn table_exists(connection: &Connection, name: &str) -> Result<bool> {
    let names = connection
        .table_names()
        .execute()
        .await
        .map_err(|e| EideticError::Storage(format!("Failed to list tables: {e}")))?;

    Ok(names.iter().any(|n| n == name))
}

pub(crate) async fn open_or_create(
    connection: &Connection,
    name: &str,
    schema: Arc<Schema>,
) -> Result<Table> {
    if table_exists(connection, name).await? {
        return connection
            .open_table(name)
            .execute()
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to open {name} table: {e}")));
    }

    let batches = RecordBatchIterator::new(vec![Ok(RecordBatch::new_empty(schema.clone()))], schema);
    connection
        .create_table(name, Box::new(batches))
        .execute()
        .await
        .map_err(|e| EideticError::Storage(format!("Failed to create {name} table: {e}")))
}

pub(crate) async fn collect<S>(
    stream: std::result::Result<S, lancedb::Error>,
    what: &str,
) -> Result<Vec<RecordBatch>>
where
    S: futures::TryStream<Ok = RecordBatch, Error = lancedb::Error> + Unpin,
{
    let stream = stream.map_err(|e| EideticError::Storage(format!("Failed to {what}: {e}")))?;
    stream
        .try_collect()
        .await
        .map_err(|e| EideticError::Storage(format!("Failed to collect results ({what}): {e}")))
}

fn utc_timestamp() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

pub(crate) fn embedding_field(dimension: usize) -> Field {
    Field::new(
        "embedding",
        DataType::FixedSizeList(
            Arc::new(Field::new("item", DataType::Float32, true)),
            dimension as i32,
        ),
        false,
    )
}

fn entities_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("entity_type", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("content_type", DataType::Utf8, false),
        embedding_field(dimension),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("weight", DataType::Float32, false),
        Field::new("importance", DataType::Float32, false),
        Field::new("importance_components", DataType::Utf8, false),
        Field::new("emotional_significance", DataType::Float32, false),
        Field::new("associations", DataType::Utf8, false),
        Field::new("access_count", DataType::Int64, false),
        Field::new("created_at", utc_timestamp(), false),
        Field::new("updated_at", utc_timestamp(), false),
        Field::new("last_accessed", utc_timestamp(), false),
        Field::new("consolidated_at", utc_timestamp(), true),
        Field::new("created_by", DataType::Utf8, false),
    ]))
}

fn observations_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("entity_id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        embedding_field(dimension),
        Field::new("category", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("timestamp", utc_timestamp(), false),
    ]))
}

fn relationships_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("from_id", DataType::Utf8, false),
        Field::new("to_id", DataType::Utf8, false),
        Field::new("relation_type", DataType::Utf8, false),
        Field::new("properties", DataType::Utf8, false),
        Field::new("strength", DataType::Float32, false),
        Field::new("created_at", utc_timestamp(), false),
    ]))
}

pub(crate) fn embedding_array<'a>(
    vectors: impl Iterator<Item = &'a Vec<f32>>,
    dimension: usize,
) -> FixedSizeListArray {
    let values: Vec<Option<Vec<Option<f32>>>> = vectors
        .map(|v| Some(v.iter().map(|&x| Some(x)).collect()))
        .collect();
    FixedSizeListArray::from_iter_primitive::<arrow_array::types::Float32Type, _, _>(
        values,
        dimension as i32,
    )
}

fn timestamps(values: Vec<i64>) -> TimestampMicrosecondArray {
    TimestampMicrosecondArray::from(values).with_timezone("UTC")
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EideticError::Serialization(e.to_string()))
}

fn records_to_batch(records: &[MemoryRecord], dimension: usize) -> Result<RecordBatch> {
    let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
    let metadata = records
        .iter()
        .map(|r| to_json(&r.metadata))
        .collect::<Result<Vec<_>>>()?;
    let components = records
        .iter()
        .map(|r| to_json(&r.importance))
        .collect::<Result<Vec<_>>>()?;
    let associations = records
        .iter()
        .map(|r| to_json(&r.associations))
        .collect::<Result<Vec<_>>>()?;

    RecordBatch::try_new(
        entities_schema(dimension),
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.entity_type.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.name.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.content.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.content_type.as_str()))),
            Arc::new(embedding_array(records.iter().map(|r| &r.embedding), dimension)),
            Arc::new(StringArray::from(metadata)),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.category.as_str()))),
            Arc::new(Float32Array::from_iter_values(records.iter().map(|r| r.weight()))),
            Arc::new(Float32Array::from_iter_values(records.iter().map(|r| r.importance.composite))),
            Arc::new(StringArray::from(components)),
            Arc::new(Float32Array::from_iter_values(records.iter().map(|r| r.emotional_significance))),
            Arc::new(StringArray::from(associations)),
            Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.access_count as i64))),
            Arc::new(timestamps(records.iter().map(|r| r.created_at.timestamp_micros()).collect())),
            Arc::new(timestamps(records.iter().map(|r| r.updated_at.timestamp_micros()).collect())),
            Arc::new(timestamps(records.iter().map(|r| r.last_accessed.timestamp_micros()).collect())),
            Arc::new(
                TimestampMicrosecondArray::from(
                    records
                        .iter()
                        .map(|r| r.consolidated_at.map(|t| t.timestamp_micros()))
                        .collect::<Vec<_>>(),
                )
                .with_timezone("UTC"),
            ),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.created_by.as_str()))),
        ],
    )
    .map_err(|e| EideticError::Storage(format!("Failed to create RecordBatch: {e}")))
}

fn observations_to_batch(observations: &[Observation], dimension: usize) -> Result<RecordBatch> {
    RecordBatch::try_new(
        observations_schema(dimension),
        vec![
            Arc::new(StringArray::from_iter_values(observations.iter().map(|o| o.id.to_string()))),
            Arc::new(StringArray::from_iter_values(
                observations.iter().map(|o| o.entity_id.to_string()),
            )),
            Arc::new(StringArray::from_iter_values(observations.iter().map(|o| o.text.as_str()))),
            Arc::new(embedding_array(observations.iter().map(|o| &o.embedding), dimension)),
            Arc::new(StringArray::from_iter_values(observations.iter().map(|o| o.category.as_str()))),
            Arc::new(StringArray::from_iter_values(observations.iter().map(|o| o.source.as_str()))),
            Arc::new(timestamps(observations.iter().map(|o| o.timestamp.timestamp_micros()).collect())),
        ],
    )
    .map_err(|e| EideticError::Storage(format!("Failed to create observation RecordBatch: {e}")))
}

fn relationship_to_batch(edge: &Relationship) -> Result<RecordBatch> {
    RecordBatch::try_new(
        relationships_schema(),
        vec![
            Arc::new(StringArray::from(vec![edge.id.to_string()])),
            Arc::new(StringArray::from(vec![edge.from_id.to_string()])),
            Arc::new(StringArray::from(vec![edge.to_id.to_string()])),
            Arc::new(StringArray::from(vec![edge.relation_type.clone()])),
            Arc::new(StringArray::from(vec![to_json(&edge.properties)?])),
            Arc::new(Float32Array::from(vec![edge.strength])),
            Arc::new(timestamps(vec![edge.created_at.timestamp_micros()])),
        ],
    )
    .map_err(|e| EideticError::Storage(format!("Failed to create relationship RecordBatch: {e}")))
}

pub(crate) fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| EideticError::Storage(format!("Failed to get {name} column")))
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| EideticError::Storage(format!("Failed to parse UUID: {e}")))
}

fn parse_timestamp(micros: i64, name: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| EideticError::Storage(format!("Failed to parse {name} timestamp")))
}

pub(crate) fn read_embedding(array: &FixedSizeListArray, row: usize) -> Result<Vec<f32>> {
    let list = array.value(row);
    let values = list
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| EideticError::Storage("Failed to get embedding values".to_string()))?;
    Ok(values.values().to_vec())
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str, name: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| EideticError::Serialization(format!("Invalid {name} JSON: {e}")))
}

fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<MemoryRecord> {
    let strings = |name: &str| column::<StringArray>(batch, name).map(|c| c.value(row).to_string());
    let floats = |name: &str| column::<Float32Array>(batch, name).map(|c| c.value(row));
    let micros = |name: &str| column::<TimestampMicrosecondArray>(batch, name).map(|c| c.value(row));

    let category: Category = strings("category")?
        .parse()
        .map_err(|e| EideticError::Storage(format!("Stored category is invalid: {e}")))?;

    let consolidated = column::<TimestampMicrosecondArray>(batch, "consolidated_at")?;
    let consolidated_at = if consolidated.is_null(row) {
        None
    } else {
        Some(parse_timestamp(consolidated.value(row), "consolidated_at")?)
    };

    let mut record = MemoryRecord::new(
        strings("entity_type")?,
        strings("name")?,
        strings("content")?,
        read_embedding(column::<FixedSizeListArray>(batch, "embedding")?, row)?,
        category,
    );
    record.id = parse_uuid(&strings("id")?)?;
    record.content_type = strings("content_type")?;
    record.metadata = from_json::<Map<String, Value>>(&strings("metadata")?, "metadata")?;
    record.set_weight(floats("weight")?);
    record.importance =
        from_json::<ImportanceComponents>(&strings("importance_components")?, "importance")?;
    record.importance.composite = floats("importance")?;
    record.emotional_significance = floats("emotional_significance")?;
    record.associations =
        from_json::<BTreeMap<Uuid, f32>>(&strings("associations")?, "associations")?;
    record.access_count = column::<Int64Array>(batch, "access_count")?.value(row).max(0) as u64;
    record.created_at = parse_timestamp(micros("created_at")?, "created_at")?;
    record.updated_at = parse_timestamp(micros("updated_at")?, "updated_at")?;
    record.last_accessed = parse_timestamp(micros("last_accessed")?, "last_accessed")?;
    record.consolidated_at = consolidated_at;
    record.created_by = strings("created_by")?;
    Ok(record)
}

fn batch_to_observation(batch: &RecordBatch, row: usize) -> Result<Observation> {
    let strings = |name: &str| column::<StringArray>(batch, name).map(|c| c.value(row).to_string());

    let category: Category = strings("category")?
        .parse()
        .map_err(|e| EideticError::Storage(format!("Stored category is invalid: {e}")))?;
    let mut observation = Observation::new(
        parse_uuid(&strings("entity_id")?)?,
        strings("text")?,
        read_embedding(column::<FixedSizeListArray>(batch, "embedding")?, row)?,
        category,
        strings("source")?,
    );
    observation.id = parse_uuid(&strings("id")?)?;
    observation.timestamp = parse_timestamp(
        column::<TimestampMicrosecondArray>(batch, "timestamp")?.value(row),
        "timestamp",
    )?;
    Ok(observation)
}

fn batch_to_relationship(batch: &RecordBatch, row: usize) -> Result<Relationship> {
    let strings = |name: &str| column::<StringArray>(batch, name).map(|c| c.value(row).to_string());

    let mut edge = Relationship::new(
        parse_uuid(&strings("from_id")?)?,
        parse_uuid(&strings("to_id")?)?,
        strings("relation_type")?,
        column::<Float32Array>(batch, "strength")?.value(row),
        from_json(&strings("properties")?, "properties")?,
    );
    edge.id = parse_uuid(&strings("id")?)?;
    edge.created_at = parse_timestamp(
        column::<TimestampMicrosecondArray>(batch, "created_at")?.value(row),
        "created_at",
    )?;
    Ok(edge)
}

fn sql_string(value: &str) -> String {
    format!("'{}'", escape_sql(value))
}

fn sql_timestamp(value: Option<DateTime<Utc>>) -> String {
    match value {
        Some(t) => format!("{}", t.timestamp_micros()),
        None => "NULL".to_string(),
    }
}

#[async_trait]
impl CategoryBackend for LanceStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Structured
    }

    /// Upsert keyed on id. A record whose `(entity_type, name)` already
    /// exists is written under the existing id.
    async fn put(&self, record: &MemoryRecord) -> Result<Uuid> {
        self.check_dimension(&record.embedding, "Record")?;
        let _guard = self.write_lock.lock().await;

        let mut stored = record.clone();
        if let Some(existing) = self
            .find_by_name(Some(&record.entity_type), &record.name)
            .await?
        {
            stored.id = existing.id;
        }

        let batch = records_to_batch(std::slice::from_ref(&stored), self.dimension)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge = self.entities.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to upsert record: {e}")))?;

        debug!("Stored record {} ({})", stored.id, stored.name);
        Ok(stored.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(self
            .select_entities(Some(format!("id = '{id}'")))
            .await?
            .into_iter()
            .next())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let mut records = self.select_entities(filter.to_sql_clause()).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

#[async_trait]
impl PrimaryStore for LanceStore {
    async fn find_by_name(
        &self,
        entity_type: Option<&str>,
        name: &str,
    ) -> Result<Option<MemoryRecord>> {
        let mut predicate = format!("name = {}", sql_string(name));
        if let Some(entity_type) = entity_type {
            predicate.push_str(&format!(" AND entity_type = {}", sql_string(entity_type)));
        }

        let mut matches = self.select_entities(Some(predicate)).await?;
        matches.sort_by(|a, b| {
            a.entity_type
                .cmp(&b.entity_type)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(matches.into_iter().next())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = ids
            .iter()
            .map(|id| format!("'{id}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let found = self.select_entities(Some(format!("id IN ({list})"))).await?;

        // Keep the caller's order
        let mut by_id: BTreeMap<Uuid, MemoryRecord> =
            found.into_iter().map(|r| (r.id, r)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn update_record(
        &self,
        id: Uuid,
        mutate: RecordMutation<'_>,
    ) -> Result<Option<MemoryRecord>> {
        let _guard = self.write_lock.lock().await;

        let Some(before) = self.get(id).await? else {
            return Ok(None);
        };
        let mut record = before.clone();
        mutate(&mut record);

        // Content edits rewrite the whole row, embedding included
        if record.content != before.content
            || record.content_type != before.content_type
            || record.embedding != before.embedding
        {
            self.check_dimension(&record.embedding, "Record")?;
            let batch = records_to_batch(std::slice::from_ref(&record), self.dimension)?;
            let schema = batch.schema();
            let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

            let mut merge = self.entities.merge_insert(&["id"]);
            merge.when_matched_update_all(None).when_not_matched_insert_all();
            merge
                .execute(Box::new(reader))
                .await
                .map_err(|e| EideticError::Storage(format!("Failed to rewrite record: {e}")))?;
            return Ok(Some(record));
        }

        self.entities
            .update()
            .only_if(format!("id = '{id}'"))
            .column("category", sql_string(record.category.as_str()))
            .column("metadata", sql_string(&to_json(&record.metadata)?))
            .column("weight", format!("{}", record.weight()))
            .column("importance", format!("{}", record.importance.composite))
            .column(
                "importance_components",
                sql_string(&to_json(&record.importance)?),
            )
            .column(
                "emotional_significance",
                format!("{}", record.emotional_significance),
            )
            .column("associations", sql_string(&to_json(&record.associations)?))
            .column("access_count", format!("{}", record.access_count))
            .column("updated_at", sql_timestamp(Some(record.updated_at)))
            .column("last_accessed", sql_timestamp(Some(record.last_accessed)))
            .column("consolidated_at", sql_timestamp(record.consolidated_at))
            .execute()
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to update record: {e}")))?;

        Ok(Some(record))
    }

    async fn append_observations(&self, observations: &[Observation]) -> Result<usize> {
        if observations.is_empty() {
            return Ok(0);
        }
        for observation in observations {
            self.check_dimension(&observation.embedding, "Observation")?;
        }

        let batch = observations_to_batch(observations, self.dimension)?;
        let schema = batch.schema();
        self.observations
            .add(Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema)))
            .execute()
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to insert observations: {e}")))?;

        Ok(observations.len())
    }

    async fn recent_observations(&self, entity_id: Uuid, limit: usize) -> Result<Vec<Observation>> {
        let stream = self
            .observations
            .query()
            .only_if(format!("entity_id = '{entity_id}'"))
            .execute()
            .await;
        let batches = collect(stream, "query observations").await?;

        let mut observations = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                observations.push(batch_to_observation(batch, row)?);
            }
        }
        observations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        observations.truncate(limit);
        Ok(observations)
    }

    async fn insert_relationship(&self, relationship: Relationship) -> Result<(Relationship, bool)> {
        let _guard = self.write_lock.lock().await;

        let existing = self
            .select_relationships(Some(format!(
                "from_id = '{}' AND to_id = '{}' AND relation_type = {}",
                relationship.from_id,
                relationship.to_id,
                sql_string(&relationship.relation_type)
            )))
            .await?;
        if let Some(edge) = existing.into_iter().next() {
            return Ok((edge, false));
        }

        let batch = relationship_to_batch(&relationship)?;
        let schema = batch.schema();
        self.relationships
            .add(Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema)))
            .execute()
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to insert relationship: {e}")))?;

        Ok((relationship, true))
    }

    async fn outgoing_relationships(
        &self,
        from_id: Uuid,
        min_strength: f32,
    ) -> Result<Vec<Relationship>> {
        let mut edges = self
            .select_relationships(Some(format!(
                "from_id = '{from_id}' AND strength > {min_strength}"
            )))
            .await?;
        edges.sort_by(|a, b| b.strength.total_cmp(&a.strength).then_with(|| a.id.cmp(&b.id)));
        Ok(edges)
    }

    async fn all_relationships(&self) -> Result<Vec<Relationship>> {
        let mut edges = self.select_relationships(None).await?;
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(edges)
    }

    async fn reinforce_relationship(&self, id: Uuid, amount: f32) -> Result<Option<Relationship>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut edge) = self
            .select_relationships(Some(format!("id = '{id}'")))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        edge.strength = clamp_unit(edge.strength + amount);

        self.relationships
            .update()
            .only_if(format!("id = '{id}'"))
            .column("strength", format!("{}", edge.strength))
            .execute()
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to reinforce relationship: {e}")))?;

        Ok(Some(edge))
    }

    async fn text_search(
        &self,
        query: &str,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let terms = search_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let any_term = terms
            .iter()
            .map(|t| {
                let pattern = escape_sql(&t.replace(['%', '_'], ""));
                format!("lower(content) LIKE '%{pattern}%' OR lower(name) LIKE '%{pattern}%'")
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        let predicate = match filter.to_sql_clause() {
            Some(clause) => format!("({any_term}) AND {clause}"),
            None => format!("({any_term})"),
        };

        let mut records = self.select_entities(Some(predicate)).await?;
        rank_by_importance(&mut records, limit);
        Ok(records)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let stream = self
            .entities
            .query()
            .select(Select::columns(&["category", "weight"]))
            .execute()
            .await;
        let batches = collect(stream, "count records").await?;

        let mut counts = StoreCounts::default();
        for batch in &batches {
            let categories = column::<StringArray>(batch, "category")?;
            let weights = column::<Float32Array>(batch, "weight")?;
            for row in 0..batch.num_rows() {
                let category: Category = categories
                    .value(row)
                    .parse()
                    .map_err(|e| EideticError::Storage(format!("Stored category is invalid: {e}")))?;
                counts.add_entry(category, weights.value(row));
            }
        }

        counts.observations = self
            .observations
            .count_rows(None)
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to count observations: {e}")))?;
        counts.relationships = self
            .relationships
            .count_rows(None)
            .await
            .map_err(|e| EideticError::Storage(format!("Failed to count relationships: {e}")))?;

        Ok(counts)
    }
}
