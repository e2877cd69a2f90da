use crate::cache::EmbeddingCache;
use crate::embeddings::Embedder;
use crate::error::{FactgraphError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const MAX_RETRIES: usize = 3;

/// Request structure for the OpenAI-compatible embeddings API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

/// Response structure from the embeddings API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// A failed request, tagged with whether another attempt may succeed.
struct RequestError {
    error: FactgraphError,
    transient: bool,
}

/// OpenAI-compatible embeddings client
///
/// Retries rate limits and server errors with exponential backoff. Repeated
/// texts are served from an optional LRU cache.
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    dimensions: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl OpenAIEmbedder {
    /// Create a new embedder
    ///
    /// # Arguments
    ///
    /// * `api_key` - API key sent as a bearer token
    /// * `model` - Model name (e.g., "text-embedding-3-small")
    /// * `base_url` - API root, e.g. "https://api.openai.com/v1"
    /// * `dimensions` - Requested vector length
    pub fn new(api_key: String, model: String, base_url: String, dimensions: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FactgraphError::Embedding(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            dimensions,
            cache: None,
        })
    }

    /// Attach an LRU cache for repeated texts.
    pub fn with_cache(mut self, cache: Option<Arc<EmbeddingCache>>) -> Self {
        self.cache = cache;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    async fn request_once(&self, text: &str) -> std::result::Result<Vec<f32>, RequestError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: vec![text],
            dimensions: Some(self.dimensions),
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| RequestError {
                error: FactgraphError::Embedding(format!("Network error: {}", e)),
                transient: e.is_timeout() || e.is_connect(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(RequestError {
                error: FactgraphError::Embedding(format!("Embeddings API error {}: {}", status, body)),
                transient: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            });
        }

        let mut result: EmbeddingResponse = response.json().await.map_err(|e| RequestError {
            error: FactgraphError::Embedding(format!("Failed to parse response: {}", e)),
            transient: false,
        })?;

        if result.data.is_empty() {
            return Err(RequestError {
                error: FactgraphError::Embedding("Empty response from embeddings API".to_string()),
                transient: false,
            });
        }
        let embedding = result.data.swap_remove(0).embedding;
        if embedding.len() != self.dimensions {
            return Err(RequestError {
                error: FactgraphError::Embedding(format!(
                    "Unexpected embedding dimension: expected {}, got {}",
                    self.dimensions,
                    embedding.len()
                )),
                transient: false,
            });
        }
        Ok(embedding)
    }

    /// Embed one text, retrying transient failures.
    async fn embed_with_retry(&self, text: &str, max_retries: usize) -> Result<Vec<f32>> {
        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_millis(500);

        loop {
            match self.request_once(text).await {
                Ok(embedding) => {
                    log::debug!("Embedding API call took {:?} (attempt {})", start.elapsed(), attempt + 1);
                    return Ok(embedding);
                }
                Err(RequestError { error, transient: true }) if attempt < max_retries => {
                    log::warn!("Retry {}/{} after error: {}", attempt + 1, max_retries, error);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(RequestError { error, .. }) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("Embedding cache hit");
                return Ok(cached);
            }
        }

        let embedding = self.embed_with_retry(text, MAX_RETRIES).await?;

        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
