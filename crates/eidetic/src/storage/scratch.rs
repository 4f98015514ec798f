//! Fast mutable scratch space for episodic copies
//!
//! A bounded LRU with a time-to-live. Entries that expire or fall off the
//! end are simply gone from scratch; the primary store still has them.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use uuid::Uuid;

use crate::error::{EideticError, Result};
use crate::memory::types::MemoryRecord;
use crate::storage::filter::RecordFilter;
use crate::storage::{BackendKind, CategoryBackend};

pub struct ScratchBackend {
    entries: Mutex<LruCache<Uuid, (MemoryRecord, Instant)>>,
    ttl: Duration,
}

impl ScratchBackend {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<Uuid, (MemoryRecord, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| EideticError::unavailable("scratch", "lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CategoryBackend for ScratchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Scratch
    }

    async fn put(&self, record: &MemoryRecord) -> Result<Uuid> {
        self.lock()?.put(record.id, (record.clone(), Instant::now()));
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let mut entries = self.lock()?;
        let expired = match entries.get(&id) {
            Some((_, stored_at)) => stored_at.elapsed() > self.ttl,
            None => return Ok(None),
        };
        if expired {
            entries.pop(&id);
            return Ok(None);
        }
        Ok(entries.peek(&id).map(|(record, _)| record.clone()))
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let entries = self.lock()?;
        let mut records: Vec<MemoryRecord> = entries
            .iter()
            .filter(|(_, (_, stored_at))| stored_at.elapsed() <= self.ttl)
            .filter(|(_, (record, _))| filter.matches(record))
            .map(|(_, (record, _))| record.clone())
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

    fn record(name: &str) -> MemoryRecord {
        MemoryRecord::new("event", name, "we met for coffee", vec![], Category::Episodic)
    }

    #[tokio::test]
    async fn test_put_get() {
        let scratch = ScratchBackend::new(4, Duration::from_secs(60));
        let r = record("coffee");
        scratch.put(&r).await.unwrap();
        assert_eq!(scratch.get(r.id).await.unwrap().unwrap().name, "coffee");
        assert_eq!(scratch.kind(), BackendKind::Scratch);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let scratch = ScratchBackend::new(2, Duration::from_secs(60));
        let a = record("a");
        let b = record("b");
        let c = record("c");
        for r in [&a, &b, &c] {
            scratch.put(r).await.unwrap();
        }
        assert_eq!(scratch.len(), 2);
        assert!(scratch.get(a.id).await.unwrap().is_none());
        assert!(scratch.get(c.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let scratch = ScratchBackend::new(4, Duration::from_millis(10));
        let r = record("short");
        scratch.put(&r).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(scratch.get(r.id).await.unwrap().is_none());
        assert!(scratch.query(&RecordFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_filters() {
        let scratch = ScratchBackend::new(8, Duration::from_secs(60));
        scratch.put(&record("a")).await.unwrap();
        let mut other = record("b");
        other.entity_type = "person".to_string();
        scratch.put(&other).await.unwrap();

        let people = scratch
            .query(&RecordFilter::new().with_entity_type("person"))
            .await
            .unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].name, "b");
    }
}
