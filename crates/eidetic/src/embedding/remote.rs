//! Remote embedding provider using OpenAI-compatible APIs
//!
//! Posts `{model, input, dimensions}` to `{api_url}/embeddings` and reads the
//! first vector from `data[].embedding`. The API key is read from the
//! environment variable named in the config; when it is unset no
//! Authorization header is sent, which suits local servers.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RemoteEmbeddingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{EideticError, Result};

#[derive(Debug)]
pub struct RemoteEmbeddingProvider {
    client: Client,
    config: RemoteEmbeddingConfig,
    api_key: Option<String>,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: &RemoteEmbeddingConfig, dimension: usize) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            debug!(
                "API key env var '{}' not set, sending unauthenticated requests",
                config.api_key_env
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EideticError::Embedding(e.to_string()))?;

        info!(
            "RemoteEmbeddingProvider initialized with model: {}, api_url: {}",
            config.model, config.api_url
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
            dimension,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.api_url.trim_end_matches('/'))
    }

    fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: text,
            dimensions: self.dimension,
        };
        let url = self.endpoint();

        let attempts = self.config.max_retries + 1;
        let mut delay = Duration::from_millis(250);
        let mut last_error = String::from("no attempt made");

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            let mut builder = self.client.post(&url).json(&request);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Embedding request failed on attempt {}/{}: {e}",
                        attempt + 1,
                        attempts
                    );
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if Self::is_retryable(status) {
                warn!(
                    "Embedding API returned {status} on attempt {}/{}",
                    attempt + 1,
                    attempts
                );
                last_error = format!("API returned {status}");
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(EideticError::Embedding(format!(
                    "API returned {status}: {error_text}"
                )));
            }

            let parsed: EmbeddingResponse = response
                .json()
                .await
                .map_err(|e| EideticError::Embedding(format!("Invalid response: {e}")))?;

            return parsed
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| EideticError::Embedding("Empty embedding response".to_string()));
        }

        Err(EideticError::Embedding(format!(
            "Failed after {attempts} attempts: {last_error}"
        )))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(api_url: String, api_key_env: &str) -> RemoteEmbeddingConfig {
        RemoteEmbeddingConfig {
            api_url,
            api_key_env: api_key_env.to_string(),
            model: "text-embedding-3-small".to_string(),
            timeout_secs: 5,
            max_retries: 1,
        }
    }

    #[tokio::test]
    async fn test_embed_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(serde_json::json!({
                "model": "text-embedding-3-small",
                "input": "hello",
                "dimensions": 3
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3], "index": 0 }]
            })))
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), "EIDETIC_TEST_UNSET_KEY_1");
        let provider = RemoteEmbeddingProvider::new(&config, 3).unwrap();

        let vector = provider.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_embed_sends_bearer_key() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "embedding": [1.0, 0.0] }]
            })))
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("EIDETIC_TEST_EMBED_KEY", "secret-key") };
        let config = create_test_config(mock_server.uri(), "EIDETIC_TEST_EMBED_KEY");
        let provider = RemoteEmbeddingProvider::new(&config, 2).unwrap();

        let vector = provider.embed("keyed").await.unwrap();
        assert_eq!(vector, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_client_error_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), "EIDETIC_TEST_UNSET_KEY_2");
        let provider = RemoteEmbeddingProvider::new(&config, 3).unwrap();

        let err = provider.embed("hello").await.unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_embed_server_error_retries_then_fails() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), "EIDETIC_TEST_UNSET_KEY_3");
        let provider = RemoteEmbeddingProvider::new(&config, 3).unwrap();

        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, EideticError::Embedding(_)));
        assert!(err.to_string().contains("2 attempts"));
    }

    #[tokio::test]
    async fn test_embed_empty_data_is_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [] })),
            )
            .mount(&mock_server)
            .await;

        let config = create_test_config(mock_server.uri(), "EIDETIC_TEST_UNSET_KEY_4");
        let provider = RemoteEmbeddingProvider::new(&config, 3).unwrap();

        assert!(provider.embed("hello").await.is_err());
    }
}
