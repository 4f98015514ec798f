//! Flexible-schema document copies for emotional records
//!
//! Records are kept as JSON documents, so fields added later round-trip
//! without a schema change.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EideticError, Result};
use crate::memory::types::MemoryRecord;
use crate::storage::filter::RecordFilter;
use crate::storage::{BackendKind, CategoryBackend};

#[derive(Debug, Default)]
pub struct DocumentBackend {
    documents: DashMap<Uuid, Value>,
}

impl DocumentBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw document for `id`
    pub fn document(&self, id: Uuid) -> Option<Value> {
        self.documents.get(&id).map(|d| d.value().clone())
    }

    fn decode(document: &Value) -> Result<MemoryRecord> {
        serde_json::from_value(document.clone())
            .map_err(|e| EideticError::Serialization(format!("Invalid document: {e}")))
    }
}

#[async_trait]
impl CategoryBackend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn put(&self, record: &MemoryRecord) -> Result<Uuid> {
        let document = serde_json::to_value(record)?;
        self.documents.insert(record.id, document);
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        self.documents
            .get(&id)
            .map(|d| Self::decode(d.value()))
            .transpose()
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::new();
        for entry in self.documents.iter() {
            let record = Self::decode(entry.value())?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}
