//! Recall response cache
//!
//! Responses are keyed on the normalized query and its scope. Writes
//! invalidate every entry whose scope could include the written record, and
//! bump a generation counter so a recall that started before the write
//! cannot store its (now stale) response afterwards.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, warn};

use crate::memory::recall::{RecallRequest, RecallResponse};
use crate::memory::types::Category;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    entity_type: Option<String>,
    category: Option<Category>,
    query: String,
    include_graph: bool,
    max_results: usize,
    relevance_boost: Option<u32>,
}

impl CacheKey {
    pub fn new(request: &RecallRequest, max_results: usize) -> Self {
        Self {
            entity_type: request.entity_type.clone(),
            category: request.category,
            query: normalize_query(&request.query),
            include_graph: request.include_graph,
            max_results,
            relevance_boost: request.relevance_boost.map(f32::to_bits),
        }
    }

    /// Whether a record of this type and category could appear under this key
    fn covers(&self, entity_type: &str, category: Category) -> bool {
        self.entity_type.as_deref().is_none_or(|t| t == entity_type)
            && self.category.is_none_or(|c| c == category)
    }
}

/// Lowercase and collapse whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct RecallCache {
    entries: Mutex<LruCache<CacheKey, (RecallResponse, Instant)>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl RecallCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    /// Current write generation; pass it back to [`RecallCache::insert`]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &CacheKey) -> Option<RecallResponse> {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Recall cache lock poisoned, bypassing cache");
            return None;
        };

        let expired = match entries.get(key) {
            Some((_, stored_at)) => stored_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.peek(key).map(|(response, _)| response.clone())
    }

    /// Store `response` unless a write happened since `generation` was read
    pub fn insert(&self, key: CacheKey, response: RecallResponse, generation: u64) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        // Checked under the lock; invalidation bumps the counter under it too
        if self.generation.load(Ordering::Acquire) != generation {
            debug!("Skipping cache insert, a write happened during recall");
            return;
        }
        entries.put(key, (response, Instant::now()));
    }

    /// Drop every entry a write of `(entity_type, category)` could affect
    pub fn invalidate_for_write(&self, entity_type: &str, category: Category) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        self.generation.fetch_add(1, Ordering::AcqRel);

        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.covers(entity_type, category))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
