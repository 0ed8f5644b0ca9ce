//! In-process fakes for the external services, shared by the
//! integration tests. All trait seams are faked: document provider,
//! extractor, embedder, vector index, and chat model.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use knowledge_agent::agent::ChatCore;
use knowledge_agent::embedding::{Embedder, Embedding, EmbeddingError, EMBEDDING_DIMENSIONS};
use knowledge_agent::extract::{ContentExtractor, ExtractError};
use knowledge_agent::graph::{DocumentProvider, KqlQuery, PagePart, ProviderError};
use knowledge_agent::indexer::IndexingPipeline;
use knowledge_agent::llm::{AssistantTurn, ChatModel, LlmError, ToolCall, ToolDefinition, WireMessage};
use knowledge_agent::models::{
    AuthenticatedUser, ChunkHit, DocumentChunk, FileType, IndexStats, KnowledgeDocument,
    SearchMode, SiteInfo, UserProfile,
};
use knowledge_agent::vector_store::{UpsertSummary, VectorIndex, VectorSearchOptions};

pub const SITE_URL: &str = "https://acme.sharepoint.com/sites/eng";

/// A drive-item PDF candidate on the test site.
pub fn pdf_document(id: &str, title: &str) -> KnowledgeDocument {
    KnowledgeDocument {
        id: id.to_string(),
        title: title.to_string(),
        web_url: format!("{}/docs/{}", SITE_URL, title),
        file_type: FileType::Pdf,
        last_modified: Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).unwrap(),
        site_url: SITE_URL.to_string(),
        site_name: "Engineering".to_string(),
        drive_id: Some("drive-1".to_string()),
        drive_item_id: Some(id.to_string()),
        summary: Some(format!("summary of {}", title)),
    }
}

pub fn test_user() -> AuthenticatedUser {
    AuthenticatedUser {
        id: "user-1".to_string(),
        name: "Dana Reyes".to_string(),
        email: "dana@acme.com".to_string(),
        token: "delegated-token".to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Document provider fake
// ═══════════════════════════════════════════════════════════════════════

/// How the provider answers an access probe for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    Allow,
    Forbidden,
    NotFound,
    ServerError,
    Timeout,
    Malformed,
}

pub struct FakeProvider {
    pub documents: Mutex<Vec<KnowledgeDocument>>,
    pub probe_behaviors: Mutex<HashMap<String, ProbeBehavior>>,
    pub default_probe: ProbeBehavior,
    pub probe_counts: Mutex<HashMap<String, usize>>,
    pub search_calls: Mutex<usize>,
    /// Artificial latency on search, to hold a pipeline pass open.
    pub search_delay: Duration,
}

impl FakeProvider {
    pub fn new(documents: Vec<KnowledgeDocument>) -> Self {
        Self {
            documents: Mutex::new(documents),
            probe_behaviors: Mutex::new(HashMap::new()),
            default_probe: ProbeBehavior::Allow,
            probe_counts: Mutex::new(HashMap::new()),
            search_calls: Mutex::new(0),
            search_delay: Duration::ZERO,
        }
    }

    pub fn with_probe(self, document_id: &str, behavior: ProbeBehavior) -> Self {
        self.probe_behaviors
            .lock()
            .unwrap()
            .insert(document_id.to_string(), behavior);
        self
    }

    pub fn with_default_probe(mut self, behavior: ProbeBehavior) -> Self {
        self.default_probe = behavior;
        self
    }

    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = delay;
        self
    }

    pub fn search_call_count(&self) -> usize {
        *self.search_calls.lock().unwrap()
    }

    pub fn probe_count(&self, document_id: &str) -> usize {
        self.probe_counts
            .lock()
            .unwrap()
            .get(document_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentProvider for FakeProvider {
    async fn search_documents(
        &self,
        _query: &KqlQuery,
        size: usize,
    ) -> Result<Vec<KnowledgeDocument>, ProviderError> {
        if !self.search_delay.is_zero() {
            tokio::time::sleep(self.search_delay).await;
        }
        *self.search_calls.lock().unwrap() += 1;
        let mut documents = self.documents.lock().unwrap().clone();
        documents.truncate(size);
        Ok(documents)
    }

    async fn download_bytes(&self, _doc: &KnowledgeDocument) -> Result<Vec<u8>, ProviderError> {
        Ok(b"%PDF-1.4 fake".to_vec())
    }

    async fn resolve_site(
        &self,
        hostname: &str,
        site_name: &str,
    ) -> Result<SiteInfo, ProviderError> {
        Ok(SiteInfo {
            id: "site-1".to_string(),
            name: site_name.to_string(),
            web_url: format!("https://{}/sites/{}", hostname, site_name),
        })
    }

    async fn get_page_parts(
        &self,
        _site_id: &str,
        _page_name: &str,
    ) -> Result<Vec<PagePart>, ProviderError> {
        Ok(Vec::new())
    }

    async fn probe_access(
        &self,
        document_id: &str,
        _drive_id: Option<&str>,
        _web_url: &str,
        _user_token: &str,
    ) -> Result<(), ProviderError> {
        *self
            .probe_counts
            .lock()
            .unwrap()
            .entry(document_id.to_string())
            .or_insert(0) += 1;

        let behavior = self
            .probe_behaviors
            .lock()
            .unwrap()
            .get(document_id)
            .copied()
            .unwrap_or(self.default_probe);
        match behavior {
            ProbeBehavior::Allow => Ok(()),
            ProbeBehavior::Forbidden => {
                Err(ProviderError::Unauthorized("403 Forbidden".to_string()))
            }
            ProbeBehavior::NotFound => Err(ProviderError::NotFound("404 Not Found".to_string())),
            ProbeBehavior::ServerError => Err(ProviderError::Server {
                status: 503,
                message: "service unavailable".to_string(),
            }),
            ProbeBehavior::Timeout => {
                Err(ProviderError::Network("operation timed out".to_string()))
            }
            ProbeBehavior::Malformed => {
                Err(ProviderError::Parse("unexpected response body".to_string()))
            }
        }
    }

    async fn get_user_profile(&self, _user_token: &str) -> Result<UserProfile, ProviderError> {
        Ok(UserProfile {
            display_name: Some("Dana Reyes".to_string()),
            mail: Some("dana@acme.com".to_string()),
            job_title: Some("Staff Engineer".to_string()),
            department: Some("Platform".to_string()),
            company_name: Some("Acme".to_string()),
            office_location: Some("Rotterdam".to_string()),
            manager: Some("Robin Vos".to_string()),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extractor fake
// ═══════════════════════════════════════════════════════════════════════

pub struct FakeExtractor {
    /// Per-document canned output: extracted text or an error message.
    pub outputs: Mutex<HashMap<String, Result<String, String>>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_text(self, document_id: &str, text: &str) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(document_id.to_string(), Ok(text.to_string()));
        self
    }

    pub fn with_failure(self, document_id: &str, message: &str) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(document_id.to_string(), Err(message.to_string()));
        self
    }

    pub fn set_text(&self, document_id: &str, text: &str) {
        self.outputs
            .lock()
            .unwrap()
            .insert(document_id.to_string(), Ok(text.to_string()));
    }
}

#[async_trait]
impl ContentExtractor for FakeExtractor {
    async fn extract(&self, doc: &KnowledgeDocument) -> Result<String, ExtractError> {
        match self.outputs.lock().unwrap().get(&doc.id) {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(message)) => Err(ExtractError::Pdf(message.clone())),
            None => Ok(String::new()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Embedder fake
// ═══════════════════════════════════════════════════════════════════════

pub struct FakeEmbedder {
    /// Input sizes of every embed call, in order.
    pub calls: Mutex<Vec<usize>>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

/// Deterministic stand-in vector derived from the text length.
pub fn deterministic_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIMENSIONS];
    vector[0] = 1.0;
    vector[1] = (text.len() % 97) as f32 / 97.0;
    vector
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        self.calls.lock().unwrap().push(texts.len());
        Ok(texts
            .iter()
            .map(|text| Embedding {
                vector: deterministic_vector(text),
                token_count: (text.len() / 4) as u32,
            })
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Vector index fake
// ═══════════════════════════════════════════════════════════════════════

pub struct FakeIndex {
    pub chunks: Mutex<HashMap<String, DocumentChunk>>,
    /// Score served for a document's chunks (default 0.9).
    pub scores: Mutex<HashMap<String, f64>>,
}

impl FakeIndex {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_score(self, document_id: &str, score: f64) -> Self {
        self.scores
            .lock()
            .unwrap()
            .insert(document_id.to_string(), score);
        self
    }

    pub fn chunks_for(&self, document_id: &str) -> Vec<DocumentChunk> {
        let mut chunks: Vec<DocumentChunk> = self
            .chunks
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    fn score_for(&self, document_id: &str) -> f64 {
        self.scores
            .lock()
            .unwrap()
            .get(document_id)
            .copied()
            .unwrap_or(0.9)
    }
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn ensure_index(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: &[DocumentChunk]) -> Result<UpsertSummary> {
        let mut store = self.chunks.lock().unwrap();
        for chunk in chunks {
            assert_eq!(
                chunk.embedding.len(),
                EMBEDDING_DIMENSIONS,
                "stored chunk must carry a full embedding"
            );
            store.insert(chunk.id.clone(), chunk.clone());
        }
        Ok(UpsertSummary {
            succeeded: chunks.len(),
            failed: 0,
        })
    }

    async fn delete_by_document_id(&self, document_id: &str) -> Result<u64> {
        let mut store = self.chunks.lock().unwrap();
        let before = store.len();
        store.retain(|_, chunk| chunk.document_id != document_id);
        Ok((before - store.len()) as u64)
    }

    async fn search_similar(
        &self,
        _embedding: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<ChunkHit>> {
        let store = self.chunks.lock().unwrap();
        let mut hits: Vec<ChunkHit> = store
            .values()
            .filter(|chunk| match options.site_url.as_deref() {
                Some(site) => chunk.site_url == site,
                None => true,
            })
            .map(|chunk| ChunkHit {
                score: self.score_for(&chunk.document_id),
                id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                drive_id: chunk.drive_id.clone(),
                web_url: chunk.web_url.clone(),
                site_url: chunk.site_url.clone(),
                site_name: chunk.site_name.clone(),
                document_title: chunk.document_title.clone(),
                file_type: chunk.file_type.clone(),
                chunk_index: chunk.chunk_index,
                chunk_text: chunk.chunk_text.clone(),
            })
            .filter(|hit| hit.score >= options.min_score)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(options.top_k);
        Ok(hits)
    }

    async fn search_hybrid(
        &self,
        _query: &str,
        embedding: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<ChunkHit>> {
        self.search_similar(embedding, options).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            document_count: self.chunks.lock().unwrap().len() as u64,
            storage_size: 0,
        })
    }
}

/// Insert one already-embedded chunk directly into the fake index.
pub async fn seed_chunk(index: &FakeIndex, doc: &KnowledgeDocument, chunk_index: i64, text: &str) {
    let chunk = DocumentChunk {
        id: DocumentChunk::chunk_key(&doc.id, chunk_index as usize),
        document_id: doc.id.clone(),
        drive_id: doc.drive_id.clone(),
        web_url: doc.web_url.clone(),
        site_url: doc.site_url.clone(),
        site_name: doc.site_name.clone(),
        document_title: doc.title.clone(),
        file_type: doc.file_type.as_str().to_string(),
        chunk_index,
        chunk_text: text.to_string(),
        embedding: deterministic_vector(text),
        document_modified_at: doc.last_modified,
        indexed_at: Utc::now(),
    };
    index.upsert_chunks(&[chunk]).await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
// Chat model fake
// ═══════════════════════════════════════════════════════════════════════

pub struct ScriptedModel {
    turns: Mutex<VecDeque<AssistantTurn>>,
    /// Full message transcript received on each completion call.
    pub received: Mutex<Vec<Vec<WireMessage>>>,
    /// Tool names offered on each completion call.
    pub tools_seen: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<AssistantTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            received: Mutex::new(Vec::new()),
            tools_seen: Mutex::new(Vec::new()),
        }
    }

    /// An assistant turn that calls tools.
    pub fn calls(calls: Vec<(&str, &str, &str)>) -> AssistantTurn {
        AssistantTurn {
            content: None,
            tool_calls: calls
                .into_iter()
                .map(|(id, name, arguments)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                })
                .collect(),
        }
    }

    /// A final assistant turn with text only.
    pub fn answer(text: &str) -> AssistantTurn {
        AssistantTurn {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
        }
    }

    /// The tool-result contents appended after completion call `call`.
    pub fn tool_results_before_call(&self, call: usize) -> Vec<String> {
        self.received.lock().unwrap()[call]
            .iter()
            .filter(|m| m.role == "tool")
            .filter_map(|m| m.content.clone())
            .collect()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[WireMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantTurn, LlmError> {
        self.received.lock().unwrap().push(messages.to_vec());
        self.tools_seen
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        Ok(self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedModel::answer("no more scripted turns")))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Assembly helpers
// ═══════════════════════════════════════════════════════════════════════

pub fn pipeline(
    provider: Arc<FakeProvider>,
    extractor: Arc<FakeExtractor>,
    embedder: Arc<FakeEmbedder>,
    index: Arc<FakeIndex>,
) -> IndexingPipeline {
    IndexingPipeline::new(provider, extractor, embedder, index)
}

pub fn chat_core(
    model: Arc<ScriptedModel>,
    provider: Arc<FakeProvider>,
    embedder: Arc<FakeEmbedder>,
    index: Arc<FakeIndex>,
    extractor: Arc<FakeExtractor>,
    default_mode: SearchMode,
) -> ChatCore {
    ChatCore {
        model,
        provider,
        embedder,
        index,
        extractor,
        default_mode,
        use_hybrid: false,
        tool_timeout: Duration::from_secs(30),
    }
}
