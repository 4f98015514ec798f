//! Local ONNX embeddings via fastembed

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};

use crate::embedding::EmbeddingProvider;
use crate::error::{EideticError, Result};

/// Output dimension of the bundled model
pub const LOCAL_EMBEDDING_DIMENSION: usize = 384;

/// Runs `MultilingualE5Small` in-process. Inference is blocking, so each call
/// moves to the blocking thread pool.
pub struct FastEmbedProvider {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedProvider {
    pub fn new() -> Result<Self> {
        tracing::info!("Loading local embedding model (this may take a moment on first run)...");
        let model = TextEmbedding::try_new(InitOptions::new(FastEmbedModel::MultilingualE5Small))
            .map_err(|e| EideticError::Embedding(e.to_string()))?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let input = vec![text.to_string()];

        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| EideticError::Embedding("Embedding model lock poisoned".to_string()))?;
            guard
                .embed(input, None)
                .map_err(|e| EideticError::Embedding(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| EideticError::Embedding("No embedding returned".to_string()))
        })
        .await
        .map_err(|e| EideticError::Embedding(format!("Embedding task failed: {e}")))?
    }

    fn name(&self) -> &'static str {
        "fastembed"
    }
}
