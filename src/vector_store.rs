//! Vector index client (Azure AI Search).
//!
//! Defines the [`VectorIndex`] trait and the production
//! [`AzureSearchIndex`] REST client. The index holds [`DocumentChunk`]
//! documents with a 1536-dimension HNSW vector field and is the only
//! persisted state in the system.
//!
//! # Schema bootstrap
//!
//! [`VectorIndex::ensure_index`] is an idempotent describe-or-create run
//! at component start. There is no migration path: a schema change means
//! the operator deletes and recreates the index.
//!
//! # Replace semantics
//!
//! Callers replace a document by `delete_by_document_id` followed by
//! `upsert_chunks`. Upserts run in batches of at most
//! [`MAX_UPSERT_BATCH`] documents with per-item status reporting; a
//! transport-level failure aborts the call and the next pipeline pass
//! restores consistency.

use async_trait::async_trait;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::embedding::EMBEDDING_DIMENSIONS;
use crate::models::{ChunkHit, DocumentChunk, FileType, IndexStats};

/// Maximum documents per upsert batch.
pub const MAX_UPSERT_BATCH: usize = 1000;

/// Error messages sampled into the log per failed batch.
const ERROR_SAMPLES_PER_BATCH: usize = 5;

/// REST API version used for all index and document operations.
const API_VERSION: &str = "2023-11-01";

/// Metadata fields returned by searches (the embedding is never selected).
const SELECT_FIELDS: &str =
    "id,documentId,driveId,webUrl,siteUrl,siteName,documentTitle,fileType,chunkIndex,chunkText";

/// Options for similarity search.
#[derive(Debug, Clone)]
pub struct VectorSearchOptions {
    /// Number of results to return.
    pub top_k: usize,
    /// Restrict hits to one site.
    pub site_url: Option<String>,
    /// Restrict hits to these file types.
    pub file_types: Option<Vec<FileType>>,
    /// Hits scoring below this are dropped.
    pub min_score: f64,
}

impl Default for VectorSearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            site_url: None,
            file_types: None,
            min_score: 0.6,
        }
    }
}

/// Outcome of an upsert call.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Operations the core needs from the vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the index schema if it does not exist yet.
    async fn ensure_index(&self) -> Result<()>;

    /// Merge-or-upload chunks in batches, reporting per-item outcomes.
    async fn upsert_chunks(&self, chunks: &[DocumentChunk]) -> Result<UpsertSummary>;

    /// Delete every chunk belonging to a document. Returns the number of
    /// chunks removed; a document with no stored chunks is a no-op.
    async fn delete_by_document_id(&self, document_id: &str) -> Result<u64>;

    /// Pure vector query, filtered and ranked, with `min_score` applied.
    async fn search_similar(
        &self,
        embedding: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<ChunkHit>>;

    /// Vector query with the text query passed verbatim alongside it.
    /// Ranking remains dominated by vector similarity.
    async fn search_hybrid(
        &self,
        query: &str,
        embedding: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<ChunkHit>>;

    /// Aggregate document count and storage size.
    async fn stats(&self) -> Result<IndexStats>;
}

/// Production [`VectorIndex`] backed by the Azure AI Search REST API.
pub struct AzureSearchIndex {
    http: reqwest::Client,
    endpoint: String,
    index_name: String,
    api_key: String,
}

impl AzureSearchIndex {
    pub fn new(config: &SearchConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            index_name: config.index_name.clone(),
            api_key: config.admin_key.clone(),
        })
    }

    fn index_url(&self, suffix: &str) -> String {
        format!(
            "{}/indexes/{}{}?api-version={}",
            self.endpoint, self.index_name, suffix, API_VERSION
        )
    }

    async fn post_docs(&self, suffix: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(self.index_url(suffix))
            .header("api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .context("vector index request failed")?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .context("vector index returned a non-JSON body")?;
        if !status.is_success() && status.as_u16() != 207 {
            bail!(
                "vector index returned HTTP {}: {}",
                status,
                payload["error"]["message"].as_str().unwrap_or("unknown")
            );
        }
        Ok(payload)
    }

    /// Run one search body and map hits above `min_score`.
    async fn run_search(&self, body: Value, min_score: f64) -> Result<Vec<ChunkHit>> {
        let payload = self.post_docs("/docs/search", &body).await?;
        Ok(hits_from_response(&payload, min_score))
    }
}

#[async_trait]
impl VectorIndex for AzureSearchIndex {
    async fn ensure_index(&self) -> Result<()> {
        let response = self
            .http
            .get(self.index_url(""))
            .header("api-key", &self.api_key)
            .send()
            .await
            .context("vector index describe failed")?;

        if response.status().is_success() {
            debug!(index = %self.index_name, "index already exists");
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            bail!(
                "vector index describe returned HTTP {}",
                response.status()
            );
        }

        let response = self
            .http
            .put(self.index_url(""))
            .header("api-key", &self.api_key)
            .json(&index_schema(&self.index_name))
            .send()
            .await
            .context("vector index create failed")?;
        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("vector index create rejected: {}", detail);
        }
        debug!(index = %self.index_name, "created index");
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: &[DocumentChunk]) -> Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();

        for chunk in chunks {
            if chunk.embedding.len() != EMBEDDING_DIMENSIONS {
                bail!(
                    "chunk {} carries an embedding of length {} (expected {})",
                    chunk.id,
                    chunk.embedding.len(),
                    EMBEDDING_DIMENSIONS
                );
            }
        }

        for batch in chunks.chunks(MAX_UPSERT_BATCH) {
            let mut actions = Vec::with_capacity(batch.len());
            for chunk in batch {
                let mut value =
                    serde_json::to_value(chunk).context("chunk failed to serialize")?;
                value["@search.action"] = json!("mergeOrUpload");
                actions.push(value);
            }

            let payload = self
                .post_docs("/docs/index", &json!({ "value": actions }))
                .await?;

            let mut samples = Vec::new();
            for item in payload["value"].as_array().unwrap_or(&Vec::new()) {
                if item["status"].as_bool().unwrap_or(false) {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                    if samples.len() < ERROR_SAMPLES_PER_BATCH {
                        samples.push(
                            item["errorMessage"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string(),
                        );
                    }
                }
            }
            if !samples.is_empty() {
                warn!(
                    failed = summary.failed,
                    samples = ?samples,
                    "upsert batch reported item failures"
                );
            }
        }

        Ok(summary)
    }

    async fn delete_by_document_id(&self, document_id: &str) -> Result<u64> {
        let filter = format!("documentId eq '{}'", escape_odata(document_id));
        let payload = self
            .post_docs(
                "/docs/search",
                &json!({
                    "filter": filter,
                    "select": "id",
                    "top": MAX_UPSERT_BATCH,
                }),
            )
            .await?;

        let ids: Vec<String> = payload["value"]
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .filter_map(|doc| doc["id"].as_str().map(str::to_string))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let actions: Vec<Value> = ids
            .iter()
            .map(|id| json!({ "@search.action": "delete", "id": id }))
            .collect();
        self.post_docs("/docs/index", &json!({ "value": actions }))
            .await?;
        debug!(document_id, count = ids.len(), "deleted stale chunks");
        Ok(ids.len() as u64)
    }

    async fn search_similar(
        &self,
        embedding: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<ChunkHit>> {
        let mut body = json!({
            "count": false,
            "select": SELECT_FIELDS,
            "top": options.top_k,
            "vectorQueries": [{
                "kind": "vector",
                "vector": embedding,
                "fields": "embedding",
                "k": options.top_k,
            }],
        });
        if let Some(filter) = build_filter(options) {
            body["filter"] = json!(filter);
        }
        self.run_search(body, options.min_score).await
    }

    async fn search_hybrid(
        &self,
        query: &str,
        embedding: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<ChunkHit>> {
        let mut body = json!({
            "count": false,
            "search": query,
            "select": SELECT_FIELDS,
            "top": options.top_k,
            "vectorQueries": [{
                "kind": "vector",
                "vector": embedding,
                "fields": "embedding",
                "k": options.top_k,
            }],
        });
        if let Some(filter) = build_filter(options) {
            body["filter"] = json!(filter);
        }
        self.run_search(body, options.min_score).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        let response = self
            .http
            .get(self.index_url("/stats"))
            .header("api-key", &self.api_key)
            .send()
            .await
            .context("vector index stats failed")?;
        if !response.status().is_success() {
            bail!("vector index stats returned HTTP {}", response.status());
        }
        let payload: Value = response.json().await?;
        Ok(IndexStats {
            document_count: payload["documentCount"].as_u64().unwrap_or(0),
            storage_size: payload["storageSize"].as_u64().unwrap_or(0),
        })
    }
}

/// Build the `and`-joined OData filter for the search options.
/// Returns `None` when no predicate applies, so no filter clause is sent.
fn build_filter(options: &VectorSearchOptions) -> Option<String> {
    let mut clauses = Vec::new();

    if let Some(site) = options.site_url.as_deref() {
        clauses.push(format!("siteUrl eq '{}'", escape_odata(site)));
    }
    if let Some(types) = options.file_types.as_deref() {
        if !types.is_empty() {
            let group = types
                .iter()
                .map(|t| format!("fileType eq '{}'", t.as_str()))
                .collect::<Vec<_>>()
                .join(" or ");
            clauses.push(format!("({})", group));
        }
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" and "))
    }
}

/// Escape a string literal for an OData filter (single quotes double).
fn escape_odata(value: &str) -> String {
    value.replace('\'', "''")
}

/// Map a search response into [`ChunkHit`]s, dropping hits below `min_score`.
fn hits_from_response(payload: &Value, min_score: f64) -> Vec<ChunkHit> {
    payload["value"]
        .as_array()
        .map(|docs| {
            docs.iter()
                .filter_map(|doc| {
                    let score = doc["@search.score"].as_f64().unwrap_or(0.0);
                    if score < min_score {
                        return None;
                    }
                    Some(ChunkHit {
                        score,
                        id: doc["id"].as_str()?.to_string(),
                        document_id: doc["documentId"].as_str()?.to_string(),
                        drive_id: doc["driveId"].as_str().map(str::to_string),
                        web_url: doc["webUrl"].as_str().unwrap_or_default().to_string(),
                        site_url: doc["siteUrl"].as_str().unwrap_or_default().to_string(),
                        site_name: doc["siteName"].as_str().unwrap_or_default().to_string(),
                        document_title: doc["documentTitle"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        file_type: doc["fileType"].as_str().unwrap_or_default().to_string(),
                        chunk_index: doc["chunkIndex"].as_i64().unwrap_or(0),
                        chunk_text: doc["chunkText"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The index schema: the [`DocumentChunk`] field set plus an HNSW vector
/// configuration (m=4, efConstruction=400, efSearch=500, cosine).
fn index_schema(index_name: &str) -> Value {
    json!({
        "name": index_name,
        "fields": [
            { "name": "id", "type": "Edm.String", "key": true, "filterable": true },
            { "name": "documentId", "type": "Edm.String", "filterable": true },
            { "name": "driveId", "type": "Edm.String", "filterable": true },
            { "name": "webUrl", "type": "Edm.String" },
            { "name": "siteUrl", "type": "Edm.String", "filterable": true, "facetable": true },
            { "name": "siteName", "type": "Edm.String", "filterable": true, "facetable": true },
            { "name": "documentTitle", "type": "Edm.String", "searchable": true },
            { "name": "fileType", "type": "Edm.String", "filterable": true, "facetable": true },
            { "name": "chunkIndex", "type": "Edm.Int64", "filterable": true },
            { "name": "chunkText", "type": "Edm.String", "searchable": true },
            {
                "name": "embedding",
                "type": "Collection(Edm.Single)",
                "searchable": true,
                "dimensions": EMBEDDING_DIMENSIONS,
                "vectorSearchProfile": "embedding-profile"
            },
            { "name": "documentModifiedAt", "type": "Edm.DateTimeOffset", "filterable": true },
            { "name": "indexedAt", "type": "Edm.DateTimeOffset", "filterable": true }
        ],
        "vectorSearch": {
            "algorithms": [{
                "name": "hnsw-default",
                "kind": "hnsw",
                "hnswParameters": {
                    "m": 4,
                    "efConstruction": 400,
                    "efSearch": 500,
                    "metric": "cosine"
                }
            }],
            "profiles": [{
                "name": "embedding-profile",
                "algorithm": "hnsw-default"
            }]
        }
    })
}
