//! Embedding generation via a remote model deployment.
//!
//! Defines the [`Embedder`] trait and the production
//! [`AzureEmbeddingClient`], which calls an Azure OpenAI embeddings
//! deployment with batching, retry, and backoff.
//!
//! # Batching
//!
//! Input texts are split into batches of at most [`MAX_EMBED_BATCH`]
//! items per upstream call. Output order always matches input order.
//! Reported token usage is amortized evenly across the items of a batch.
//! A batch that still fails after retries aborts the whole embed call
//! with the failing batch index in the error; the indexing pipeline
//! records that as a per-document error and moves on.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::OpenAiConfig;

/// Required embedding vector length. The vector index schema and every
/// stored chunk depend on this value.
pub const EMBEDDING_DIMENSIONS: usize = 1536;

/// Maximum texts per upstream embedding call.
pub const MAX_EMBED_BATCH: usize = 16;

/// Retry attempts per batch beyond the first try.
const MAX_RETRIES: u32 = 5;

/// Errors from embedding generation.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// A batch failed after retries; `batch` is its zero-based index.
    #[error("embedding batch {batch} failed: {message}")]
    Batch { batch: usize, message: String },
    /// The model returned a vector of the wrong length. Indicates a
    /// misconfigured deployment; never recoverable by retrying.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// One embedded text with its amortized token count.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// Vector of [`EMBEDDING_DIMENSIONS`] floats.
    pub vector: Vec<f32>,
    /// Token usage attributed to this text (evenly amortized per batch).
    pub token_count: u32,
}

/// Embedding seam between the pipeline/chat core and the remote model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed texts, preserving order and length. Zero inputs yield zero
    /// outputs without an upstream call.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError>;
}

/// Production embedder for an Azure OpenAI embeddings deployment.
pub struct AzureEmbeddingClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl AzureEmbeddingClient {
    pub fn new(config: &OpenAiConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            config.endpoint.trim_end_matches('/'),
            config.embedding_deployment,
            config.api_version
        );
        Ok(Self {
            http,
            url,
            api_key: config.api_key.clone(),
        })
    }

    /// Send one batch with retry/backoff. Returns an error message for
    /// the caller to wrap with the batch index.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, String> {
        let body = json!({ "input": texts });
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let response = self
                .http
                .post(&self.url)
                .header("api-key", &self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let payload: Value =
                            response.json().await.map_err(|e| e.to_string())?;
                        return parse_embedding_response(&payload, texts.len());
                    }
                    let detail = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("HTTP {}: {}", status, detail));
                        continue;
                    }
                    return Err(format!("HTTP {}: {}", status, detail));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "embedding failed after retries".to_string()))
    }
}

#[async_trait]
impl Embedder for AzureEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut embeddings = Vec::with_capacity(texts.len());
        for (batch_index, batch) in texts.chunks(MAX_EMBED_BATCH).enumerate() {
            let batch_result =
                self.embed_batch(batch)
                    .await
                    .map_err(|message| EmbeddingError::Batch {
                        batch: batch_index,
                        message,
                    })?;
            for item in &batch_result {
                if item.vector.len() != EMBEDDING_DIMENSIONS {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: EMBEDDING_DIMENSIONS,
                        actual: item.vector.len(),
                    });
                }
            }
            debug!(
                batch = batch_index,
                size = batch.len(),
                "embedded batch"
            );
            embeddings.extend(batch_result);
        }
        Ok(embeddings)
    }
}

/// Parse an embeddings API response: restore input order by `index`,
/// require one vector per input, and amortize token usage evenly.
fn parse_embedding_response(payload: &Value, expected: usize) -> Result<Vec<Embedding>, String> {
    let data = payload["data"]
        .as_array()
        .ok_or_else(|| "response missing data array".to_string())?;
    if data.len() != expected {
        return Err(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        ));
    }

    let total_tokens = payload["usage"]["total_tokens"]
        .as_u64()
        .or_else(|| payload["usage"]["prompt_tokens"].as_u64())
        .unwrap_or(0);
    let per_item = amortize_tokens(total_tokens, expected);

    let mut items: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for entry in data {
        let index = entry["index"]
            .as_u64()
            .ok_or_else(|| "embedding entry missing index".to_string())? as usize;
        let vector = entry["embedding"]
            .as_array()
            .ok_or_else(|| "embedding entry missing vector".to_string())?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        items.push((index, vector));
    }
    items.sort_by_key(|(index, _)| *index);

    Ok(items
        .into_iter()
        .map(|(_, vector)| Embedding {
            vector,
            token_count: per_item,
        })
        .collect())
}

/// Evenly split a batch's token usage across its items.
fn amortize_tokens(total: u64, items: usize) -> u32 {
    if items == 0 {
        return 0;
    }
    ((total as f64) / (items as f64)).round() as u32
}
