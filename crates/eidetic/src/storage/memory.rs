//! Process-local primary store
//!
//! Keeps records, observations and relationships in `DashMap`s. Per-record
//! updates run under the map's entry lock, so concurrent mutations of one
//! record are serialized without a global lock. Nothing survives a restart.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, Observation, Relationship, clamp_unit};
use crate::storage::filter::RecordFilter;
use crate::storage::{
    BackendKind, CategoryBackend, PrimaryStore, RecordMutation, StoreCounts, rank_by_importance,
    search_terms,
};

type NameKey = (String, String);
type EdgeKey = (Uuid, Uuid, String);

#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<Uuid, MemoryRecord>,
    names: DashMap<NameKey, Uuid>,
    observations: DashMap<Uuid, Vec<Observation>>,
    relationships: DashMap<Uuid, Relationship>,
    edges: DashMap<EdgeKey, Uuid>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CategoryBackend for InMemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Structured
    }

    /// Upsert by id. A record whose `(entity_type, name)` already belongs to
    /// another id is stored under that canonical id instead.
    async fn put(&self, record: &MemoryRecord) -> Result<Uuid> {
        let key = (record.entity_type.clone(), record.name.clone());
        let canonical = *self.names.entry(key.clone()).or_insert(record.id);

        let mut stored = record.clone();
        stored.id = canonical;

        if let Some(previous) = self.records.insert(canonical, stored) {
            let previous_key = (previous.entity_type, previous.name);
            if previous_key != key {
                self.names.remove_if(&previous_key, |_, id| *id == canonical);
            }
        }

        Ok(canonical)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let mut records: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

#[async_trait]
impl PrimaryStore for InMemoryStore {
    async fn find_by_name(
        &self,
        entity_type: Option<&str>,
        name: &str,
    ) -> Result<Option<MemoryRecord>> {
        let id = match entity_type {
            Some(entity_type) => self
                .names
                .get(&(entity_type.to_string(), name.to_string()))
                .map(|id| *id.value()),
            None => self
                .names
                .iter()
                .filter(|entry| entry.key().1 == name)
                .min_by(|a, b| a.key().0.cmp(&b.key().0))
                .map(|entry| *entry.value()),
        };

        Ok(id.and_then(|id| self.records.get(&id).map(|r| r.value().clone())))
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn update_record(
        &self,
        id: Uuid,
        mutate: RecordMutation<'_>,
    ) -> Result<Option<MemoryRecord>> {
        Ok(self.records.get_mut(&id).map(|mut entry| {
            mutate(entry.value_mut());
            entry.value().clone()
        }))
    }

    async fn append_observations(&self, observations: &[Observation]) -> Result<usize> {
        for observation in observations {
            self.observations
                .entry(observation.entity_id)
                .or_default()
                .push(observation.clone());
        }
        Ok(observations.len())
    }

    async fn recent_observations(&self, entity_id: Uuid, limit: usize) -> Result<Vec<Observation>> {
        let mut observations = self
            .observations
            .get(&entity_id)
            .map(|o| o.value().clone())
            .unwrap_or_default();
        observations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        observations.truncate(limit);
        Ok(observations)
    }

    async fn insert_relationship(&self, relationship: Relationship) -> Result<(Relationship, bool)> {
        let key = (
            relationship.from_id,
            relationship.to_id,
            relationship.relation_type.clone(),
        );

        match self.edges.entry(key) {
            Entry::Occupied(existing) => {
                let existing_id = *existing.get();
                let stored = self
                    .relationships
                    .get(&existing_id)
                    .map(|r| r.value().clone())
                    .unwrap_or(relationship);
                Ok((stored, false))
            }
            Entry::Vacant(slot) => {
                self.relationships
                    .insert(relationship.id, relationship.clone());
                slot.insert(relationship.id);
                Ok((relationship, true))
            }
        }
    }

    async fn outgoing_relationships(
        &self,
        from_id: Uuid,
        min_strength: f32,
    ) -> Result<Vec<Relationship>> {
        let mut edges: Vec<Relationship> = self
            .relationships
            .iter()
            .filter(|r| r.from_id == from_id && r.strength > min_strength)
            .map(|r| r.value().clone())
            .collect();
        edges.sort_by(|a, b| b.strength.total_cmp(&a.strength).then_with(|| a.id.cmp(&b.id)));
        Ok(edges)
    }

    async fn all_relationships(&self) -> Result<Vec<Relationship>> {
        let mut edges: Vec<Relationship> =
            self.relationships.iter().map(|r| r.value().clone()).collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(edges)
    }

    async fn reinforce_relationship(&self, id: Uuid, amount: f32) -> Result<Option<Relationship>> {
        Ok(self.relationships.get_mut(&id).map(|mut edge| {
            edge.strength = clamp_unit(edge.strength + amount);
            edge.value().clone()
        }))
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

        let mut records: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .filter(|r| {
                let haystack = format!("{} {}", r.name, r.content).to_lowercase();
                terms.iter().any(|t| haystack.contains(t.as_str()))
            })
            .map(|r| r.value().clone())
            .collect();

        rank_by_importance(&mut records, limit);
        Ok(records)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let mut counts = StoreCounts::default();
        for record in self.records.iter() {
            counts.add(record.value());
        }
        counts.observations = self.observations.iter().map(|o| o.value().len()).sum();
        counts.relationships = self.relationships.len();
        Ok(counts)
    }
}
