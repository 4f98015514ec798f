//! Embedding adapter
//!
//! Wraps an optional [`EmbeddingProvider`] behind a cache and a
//! deterministic fallback so callers always get a vector of the configured
//! dimension. The [`EmbeddingSource`] on each result says where it came from.

#[cfg(feature = "local-embeddings")]
pub mod local;
pub mod remote;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{EideticError, Result};

#[cfg(feature = "local-embeddings")]
pub use local::FastEmbedProvider;
pub use remote::RemoteEmbeddingProvider;

/// After a provider failure, skip it for this long before trying again
const PROVIDER_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Source of text embeddings
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Provider name for logs and stats
    fn name(&self) -> &'static str;
}

/// Where an embedding came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Provider,
    Cache,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub source: EmbeddingSource,
}

/// Adapter counters, reported through engine stats
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingStats {
    pub provider: Option<&'static str>,
    pub provider_available: bool,
    pub dimension: usize,
    pub cache_entries: usize,
    pub provider_calls: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
}

type CacheKey = [u8; 32];

pub struct EmbeddingAdapter {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    dimension: usize,
    timeout: Duration,
    cache: Mutex<LruCache<CacheKey, Vec<f32>>>,
    provider_available: AtomicBool,
    /// Unix millis of the last provider failure, 0 when none
    last_failure_ms: AtomicU64,
    provider_calls: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
}

impl EmbeddingAdapter {
    pub fn new(
        provider: Option<Arc<dyn EmbeddingProvider>>,
        dimension: usize,
        cache_capacity: usize,
        timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let has_provider = provider.is_some();
        Self {
            provider,
            dimension,
            timeout,
            cache: Mutex::new(LruCache::new(capacity)),
            provider_available: AtomicBool::new(has_provider),
            last_failure_ms: AtomicU64::new(0),
            provider_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Adapter that only ever produces fallback vectors
    pub fn fallback_only(dimension: usize) -> Self {
        Self::new(None, dimension, 1, Duration::from_millis(0))
    }

    /// Build the adapter and its provider from configuration
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let provider: Option<Arc<dyn EmbeddingProvider>> = match config.provider {
            EmbeddingProviderKind::None => None,
            EmbeddingProviderKind::Remote => Some(Arc::new(RemoteEmbeddingProvider::new(
                &config.remote,
                config.dimension,
            )?)),
            EmbeddingProviderKind::Local => Some(local_provider()?),
        };

        if let Some(p) = &provider {
            tracing::info!("Embedding provider: {} ({} dims)", p.name(), config.dimension);
        } else {
            tracing::info!(
                "No embedding provider configured, using fallback vectors ({} dims)",
                config.dimension
            );
        }

        Ok(Self::new(
            provider,
            config.dimension,
            config.cache_capacity,
            Duration::from_millis(config.timeout_ms),
        ))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn provider_available(&self) -> bool {
        self.provider.is_some() && self.provider_available.load(Ordering::Relaxed)
    }

    /// Embed `text`. Never fails: provider errors, timeouts and dimension
    /// mismatches fall back to a deterministic vector.
    pub async fn embed(&self, text: &str) -> Embedding {
        let mut key: CacheKey = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(text.as_bytes()));

        if let Some(vector) = self.cache_get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Embedding {
                vector,
                source: EmbeddingSource::Cache,
            };
        }

        if let Some(provider) = self.provider.as_ref().filter(|_| self.should_try_provider()) {
            self.provider_calls.fetch_add(1, Ordering::Relaxed);
            match self.call_provider(provider.as_ref(), text).await {
                Ok(vector) => {
                    self.provider_available.store(true, Ordering::Relaxed);
                    self.cache_put(key, vector.clone());
                    return Embedding {
                        vector,
                        source: EmbeddingSource::Provider,
                    };
                }
                Err(e) => {
                    tracing::warn!("Embedding provider {} failed, using fallback: {e}", provider.name());
                    self.provider_available.store(false, Ordering::Relaxed);
                    self.last_failure_ms.store(now_millis(), Ordering::Relaxed);
                }
            }
        }

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        Embedding {
            vector: fallback_embedding(text, self.dimension),
            source: EmbeddingSource::Fallback,
        }
    }

    async fn call_provider(&self, provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
        let vector = tokio::time::timeout(self.timeout, provider.embed(text))
            .await
            .map_err(|_| EideticError::Timeout {
                branch: "embedding".to_string(),
                millis: self.timeout.as_millis() as u64,
            })??;

        if vector.len() != self.dimension {
            return Err(EideticError::Embedding(format!(
                "Provider returned {} dimensions, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(vector)
    }

    fn should_try_provider(&self) -> bool {
        if self.provider_available.load(Ordering::Relaxed) {
            return true;
        }
        let last_failure = self.last_failure_ms.load(Ordering::Relaxed);
        now_millis().saturating_sub(last_failure) >= PROVIDER_RETRY_AFTER.as_millis() as u64
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn cache_put(&self, key: CacheKey, vector: Vec<f32>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, vector);
        }
    }

    pub fn stats(&self) -> EmbeddingStats {
        EmbeddingStats {
            provider: self.provider.as_ref().map(|p| p.name()),
            provider_available: self.provider_available(),
            dimension: self.dimension,
            cache_entries: self.cache.lock().map(|c| c.len()).unwrap_or(0),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(feature = "local-embeddings")]
fn local_provider() -> Result<Arc<dyn EmbeddingProvider>> {
    Ok(Arc::new(FastEmbedProvider::new()?))
}

#[cfg(not(feature = "local-embeddings"))]
fn local_provider() -> Result<Arc<dyn EmbeddingProvider>> {
    Err(EideticError::Config(
        "embedding.provider = \"local\" requires the local-embeddings feature".to_string(),
    ))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Deterministic pseudo-embedding derived from the SHA-256 of `text`.
///
/// The digest is extended by hashing `digest || counter` until `dimension`
/// values are available, each mapped to [-1, 1]. The vector is then
/// mean-centred and L2-normalized, so it is reproducible across processes.
pub fn fallback_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let seed = Sha256::digest(text.as_bytes());
    let mut values = Vec::with_capacity(dimension);
    let mut counter: u32 = 0;

    while values.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_le_bytes());
        let block = hasher.finalize();

        for chunk in block.chunks_exact(4) {
            if values.len() == dimension {
                break;
            }
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            values.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
        counter = counter.wrapping_add(1);
    }

    if values.is_empty() {
        return values;
    }

    let mean = values.iter().sum::<f32>() / values.len() as f32;
    for v in values.iter_mut() {
        *v -= mean;
    }

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
    values
}

/// Cosine similarity of two vectors; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
