//! Append-only event stream
//!
//! Holds motor (action) records and the audit trail of engine activity.
//! The log is bounded in memory and fanned out to live subscribers (the
//! `/events` SSE stream) through a broadcast channel.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{EideticError, Result};
use crate::memory::types::{Category, MemoryRecord};
use crate::storage::filter::RecordFilter;
use crate::storage::{BackendKind, CategoryBackend};

const BROADCAST_CAPACITY: usize = 256;

/// Events emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEvent {
    /// A record was stored (or an existing one matched)
    Stored {
        id: Uuid,
        entity_type: String,
        name: String,
        category: Category,
        created: bool,
        timestamp: DateTime<Utc>,
    },
    /// A recall completed
    Recalled {
        query: String,
        result_count: usize,
        degraded: bool,
        cached: bool,
        timestamp: DateTime<Utc>,
    },
    /// Audit entry for a category change made by deep consolidation
    Rerouted {
        id: Uuid,
        from: Category,
        to: Category,
        timestamp: DateTime<Utc>,
    },
    RelationshipCreated {
        id: Uuid,
        from_id: Uuid,
        to_id: Uuid,
        relation_type: String,
    },
    ConsolidationCompleted {
        cycle: String,
        records_scanned: usize,
        records_updated: usize,
        edges_reinforced: usize,
        cancelled: bool,
        duration_ms: u64,
    },
    /// A motor record appended to the stream
    Action { record: Box<MemoryRecord> },
}

impl MemoryEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            MemoryEvent::Stored { .. } => "stored",
            MemoryEvent::Recalled { .. } => "recalled",
            MemoryEvent::Rerouted { .. } => "rerouted",
            MemoryEvent::RelationshipCreated { .. } => "relationship_created",
            MemoryEvent::ConsolidationCompleted { .. } => "consolidation_completed",
            MemoryEvent::Action { .. } => "action",
        }
    }
}

/// Bounded event log with live fan-out
pub struct EventLog {
    entries: Mutex<VecDeque<MemoryEvent>>,
    capacity: usize,
    sender: broadcast::Sender<MemoryEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            sender,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<MemoryEvent>>> {
        self.entries
            .lock()
            .map_err(|_| EideticError::unavailable("event_log", "lock poisoned"))
    }

    /// Append an event, dropping the oldest when full. Subscribers that lag
    /// behind miss events; the log itself is unaffected.
    pub fn append(&self, event: MemoryEvent) -> Result<()> {
        {
            let mut entries = self.lock()?;
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(event.clone());
        }
        // No receivers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Up to `limit` most recent events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<MemoryEvent> {
        self.lock()
            .map(|entries| {
                let skip = entries.len().saturating_sub(limit);
                entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest snapshot of every action record
    fn actions(&self) -> Result<BTreeMap<Uuid, MemoryRecord>> {
        let entries = self.lock()?;
        let mut latest = BTreeMap::new();
        for event in entries.iter() {
            if let MemoryEvent::Action { record } = event {
                latest.insert(record.id, record.as_ref().clone());
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl CategoryBackend for EventLog {
    fn kind(&self) -> BackendKind {
        BackendKind::EventLog
    }

    async fn put(&self, record: &MemoryRecord) -> Result<Uuid> {
        self.append(MemoryEvent::Action {
            record: Box::new(record.clone()),
        })?;
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(self.actions()?.remove(&id))
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let mut records: Vec<MemoryRecord> = self
            .actions()?
            .into_values()
            .filter(|r| filter.matches(r))
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

    fn action(name: &str) -> MemoryRecord {
        MemoryRecord::new("command", name, "run the tests", vec![], Category::Motor)
    }

    #[test]
    fn test_event_serialization() {
        let event = MemoryEvent::Rerouted {
            id: Uuid::new_v4(),
            from: Category::Semantic,
            to: Category::Motor,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"rerouted\""));
        assert!(json.contains("\"to\":\"motor\""));
        assert_eq!(event.type_name(), "rerouted");
    }

    #[test]
    fn test_bounded_capacity() {
        let log = EventLog::new(2);
        for i in 0..3 {
            log.append(MemoryEvent::RelationshipCreated {
                id: Uuid::new_v4(),
                from_id: Uuid::new_v4(),
                to_id: Uuid::new_v4(),
                relation_type: format!("r{i}"),
            })
            .unwrap();
        }
        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        match &recent[0] {
            MemoryEvent::RelationshipCreated { relation_type, .. } => assert_eq!(relation_type, "r1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let log = EventLog::new(8);
        let mut rx = log.subscribe();
        log.put(&action("test")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "action");
    }

    #[tokio::test]
    async fn test_actions_as_category_backend() {
        let log = EventLog::new(8);
        let mut r = action("deploy");
        log.put(&r).await.unwrap();
        r.set_weight(0.3);
        log.put(&r).await.unwrap();

        let latest = log.get(r.id).await.unwrap().unwrap();
        assert!((latest.weight() - 0.3).abs() < 1e-6);
        assert_eq!(log.query(&RecordFilter::new()).await.unwrap().len(), 1);
        assert_eq!(log.len(), 2);
    }
}
