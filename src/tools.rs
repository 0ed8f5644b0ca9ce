//! Agent tools and the per-request tool registry.
//!
//! The chat core wires tools at request time: a [`ToolRegistry`] is built
//! for each request from the requested search mode, so there is no
//! process-wide mutable tool list. Every tool is a string-in / string-out
//! transaction from the model's point of view; errors become tool error
//! strings, never request failures.
//!
//! # Permission filter
//!
//! `knowledge_search` is the only way retrieved chunks reach the model,
//! and it re-verifies every candidate against the requesting user's
//! delegated credential before formatting its result. The probe fails
//! closed: 403, 404, server errors, timeouts, and malformed responses
//! all drop the chunk. Access decisions are memoized per document id in
//! a cache owned by the tool instance, so they live exactly as long as
//! the request.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use anyhow::{bail, Context, Result};

use crate::embedding::Embedder;
use crate::extract::ContentExtractor;
use crate::graph::{DocumentProvider, KqlQuery};
use crate::llm::ToolDefinition;
use crate::models::{
    AuthenticatedUser, ChunkHit, FileType, KnowledgeDocument, SearchMode,
};
use crate::vector_store::{VectorIndex, VectorSearchOptions};

/// Characters of file content handed to the model before truncation.
const READ_FILE_MAX_CHARS: usize = 8000;

/// Sources returned by `knowledge_search` after filtering and dedupe.
const KNOWLEDGE_TOP_K: usize = 10;

/// Hits listed by `sharepoint_search`.
const KQL_RESULT_LIMIT: usize = 25;

/// A tool the model can call during the agent loop.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Tool name as exposed to the model.
    fn name(&self) -> &str;

    /// One-line description for the tool definition.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Execute with parsed arguments, returning the tool result string.
    async fn execute(&self, arguments: Value) -> Result<String>;
}

/// Per-request collection of tools.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Wire-level definitions for the completion request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for one chat request's tools.
///
/// Owned by the tools through an `Arc`; dropped with the registry when
/// the request completes.
pub struct ToolContext {
    pub provider: Arc<dyn DocumentProvider>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub extractor: Arc<dyn ContentExtractor>,
    /// The requesting user; their token drives probes and profile reads.
    pub user: AuthenticatedUser,
    /// Site the conversation is scoped to.
    pub site_url: String,
    /// Route `knowledge_search` through the hybrid query path.
    pub use_hybrid: bool,
}

/// Build the tool registry for a request.
///
/// Both modes carry `get_current_site`, `get_current_user`, and
/// `read_file_content`; RAG adds `knowledge_search`, KQL adds
/// `sharepoint_search`.
pub fn build_registry(mode: SearchMode, ctx: Arc<ToolContext>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(GetCurrentSiteTool { ctx: ctx.clone() }));
    registry.register(Arc::new(GetCurrentUserTool { ctx: ctx.clone() }));
    registry.register(Arc::new(ReadFileContentTool { ctx: ctx.clone() }));
    match mode {
        SearchMode::Rag => registry.register(Arc::new(KnowledgeSearchTool::new(ctx))),
        SearchMode::Kql => registry.register(Arc::new(SharePointSearchTool { ctx })),
    }
    registry
}

// ═══════════════════════════════════════════════════════════════════════
// Common tools
// ═══════════════════════════════════════════════════════════════════════

/// Resolves the context site and returns its descriptor.
struct GetCurrentSiteTool {
    ctx: Arc<ToolContext>,
}

#[async_trait]
impl AgentTool for GetCurrentSiteTool {
    fn name(&self) -> &str {
        "get_current_site"
    }

    fn description(&self) -> &str {
        "Get the id, name, and URL of the site this conversation is scoped to"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: Value) -> Result<String> {
        let (hostname, site_name) = split_site_url(&self.ctx.site_url)?;
        let site = self
            .ctx
            .provider
            .resolve_site(&hostname, &site_name)
            .await
            .context("failed to resolve the current site")?;
        Ok(serde_json::to_string_pretty(&site)?)
    }
}

/// Returns the delegated user's profile, fetched with their credential.
struct GetCurrentUserTool {
    ctx: Arc<ToolContext>,
}

#[async_trait]
impl AgentTool for GetCurrentUserTool {
    fn name(&self) -> &str {
        "get_current_user"
    }

    fn description(&self) -> &str {
        "Get the current user's profile: name, title, department, company, location, manager"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: Value) -> Result<String> {
        let profile = self
            .ctx
            .provider
            .get_user_profile(&self.ctx.user.token)
            .await
            .context("failed to fetch the user profile")?;
        Ok(serde_json::to_string_pretty(&profile)?)
    }
}

/// Downloads and extracts a single document.
struct ReadFileContentTool {
    ctx: Arc<ToolContext>,
}

#[async_trait]
impl AgentTool for ReadFileContentTool {
    fn name(&self) -> &str {
        "read_file_content"
    }

    fn description(&self) -> &str {
        "Read the full text of one document, given its driveId, itemId, and file name"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "driveId": { "type": "string", "description": "Drive containing the file" },
                "itemId": { "type": "string", "description": "Item id of the file" },
                "name": { "type": "string", "description": "File name, used to detect the format" }
            },
            "required": ["driveId", "itemId", "name"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<String> {
        let drive_id = required_str(&arguments, "driveId")?;
        let item_id = required_str(&arguments, "itemId")?;
        let name = required_str(&arguments, "name")?;

        let doc = KnowledgeDocument {
            id: item_id.clone(),
            title: name.clone(),
            web_url: String::new(),
            file_type: FileType::from_name(&name),
            last_modified: chrono::Utc::now(),
            site_url: self.ctx.site_url.clone(),
            site_name: String::new(),
            drive_id: Some(drive_id),
            drive_item_id: Some(item_id),
            summary: None,
        };

        let text = self
            .ctx
            .extractor
            .extract(&doc)
            .await
            .with_context(|| format!("failed to read {}", name))?;
        if text.trim().is_empty() {
            bail!("{} has no extractable text content", name);
        }
        Ok(truncate_content(&text, READ_FILE_MAX_CHARS))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// knowledge_search (RAG mode)
// ═══════════════════════════════════════════════════════════════════════

/// Vector retrieval with the mandatory per-chunk permission filter.
struct KnowledgeSearchTool {
    ctx: Arc<ToolContext>,
    /// Access decisions by document id, scoped to this request.
    permission_cache: Mutex<HashMap<String, bool>>,
}

impl KnowledgeSearchTool {
    fn new(ctx: Arc<ToolContext>) -> Self {
        Self {
            ctx,
            permission_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Decide accessibility for one document, memoizing the result.
    /// Any probe error counts as "not accessible".
    async fn is_accessible(&self, hit: &ChunkHit) -> bool {
        let mut cache = self.permission_cache.lock().await;
        if let Some(&decision) = cache.get(&hit.document_id) {
            return decision;
        }
        let decision = self
            .ctx
            .provider
            .probe_access(
                &hit.document_id,
                hit.drive_id.as_deref(),
                &hit.web_url,
                &self.ctx.user.token,
            )
            .await
            .is_ok();
        if !decision {
            debug!(document_id = %hit.document_id, "permission filter dropped document");
        }
        cache.insert(hit.document_id.clone(), decision);
        decision
    }
}

#[async_trait]
impl AgentTool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> &str {
        "Search the indexed knowledge base for content relevant to the user's question"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The user's question, passed verbatim" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<String> {
        let query = required_str(&arguments, "query")?;

        let embeddings = self
            .ctx
            .embedder
            .embed(&[query.clone()])
            .await
            .context("failed to embed the query")?;
        let query_vector = embeddings
            .into_iter()
            .next()
            .map(|e| e.vector)
            .context("embedder returned no vector for the query")?;

        // Over-fetch so permission filtering and per-document dedupe
        // still leave enough results.
        let options = VectorSearchOptions {
            top_k: KNOWLEDGE_TOP_K * 2,
            site_url: Some(self.ctx.site_url.clone()),
            ..Default::default()
        };
        let hits = if self.ctx.use_hybrid {
            self.ctx
                .index
                .search_hybrid(&query, &query_vector, &options)
                .await?
        } else {
            self.ctx.index.search_similar(&query_vector, &options).await?
        };

        let mut accessible = Vec::new();
        for hit in hits {
            if self.is_accessible(&hit).await {
                accessible.push(hit);
            }
        }

        let top = dedupe_best_per_document(accessible, KNOWLEDGE_TOP_K);
        if top.is_empty() {
            return Ok("No accessible documents matched the query.".to_string());
        }
        Ok(format_sources(&top))
    }
}

/// Keep the highest-scoring chunk per document, sort descending by
/// score, and take the first `limit` entries.
fn dedupe_best_per_document(hits: Vec<ChunkHit>, limit: usize) -> Vec<ChunkHit> {
    let mut best: HashMap<String, ChunkHit> = HashMap::new();
    for hit in hits {
        match best.get(&hit.document_id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(hit.document_id.clone(), hit);
            }
        }
    }
    let mut deduped: Vec<ChunkHit> = best.into_values().collect();
    deduped.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    deduped.truncate(limit);
    deduped
}

/// Render the retrieved sources as the structured block handed to the
/// model.
fn format_sources(hits: &[ChunkHit]) -> String {
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!("Source {}:\n", i + 1));
        out.push_str(&format!("  Title: {}\n", hit.document_title));
        out.push_str(&format!("  URL: {}\n", hit.web_url));
        out.push_str(&format!("  Site: {}\n", hit.site_name));
        out.push_str(&format!(
            "  DriveId: {}\n",
            hit.drive_id.as_deref().unwrap_or("-")
        ));
        out.push_str(&format!("  ItemId: {}\n", hit.document_id));
        out.push_str(&format!("  Relevance: {}%\n", (hit.score * 100.0).round()));
        out.push_str(&format!("  Content: {}\n", hit.chunk_text));
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
// sharepoint_search (KQL mode)
// ═══════════════════════════════════════════════════════════════════════

/// Keyword retrieval against the provider search endpoint.
struct SharePointSearchTool {
    ctx: Arc<ToolContext>,
}

#[async_trait]
impl AgentTool for SharePointSearchTool {
    fn name(&self) -> &str {
        "sharepoint_search"
    }

    fn description(&self) -> &str {
        "Search the current site for documents and pages by topic keywords"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "One to three topic keywords" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<String> {
        let query = required_str(&arguments, "query")?;

        let kql = KqlQuery::new()
            .clause(query)
            .clause(format!("site:\"{}\"", self.ctx.site_url))
            .clause("(IsDocument:1 OR FileType:aspx)");
        let documents = self
            .ctx
            .provider
            .search_documents(&kql, KQL_RESULT_LIMIT)
            .await
            .context("site search failed")?;

        if documents.is_empty() {
            return Ok("No documents matched the search.".to_string());
        }

        let listing: Vec<Value> = documents
            .iter()
            .map(|doc| {
                json!({
                    "name": doc.title,
                    "summary": doc.summary.as_deref().unwrap_or(""),
                    "webUrl": doc.web_url,
                    "driveId": doc.drive_id,
                    "itemId": doc.id,
                    "lastModified": doc.last_modified.to_rfc3339(),
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&listing)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════

/// Read a required string argument from the model-supplied object.
fn required_str(arguments: &Value, key: &str) -> Result<String> {
    match arguments[key].as_str() {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => bail!("missing required argument: {}", key),
    }
}

/// Truncate tool output to `max` characters, marking the cut.
fn truncate_content(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    format!("{}\n\n[Content truncated]", head)
}

/// Split a site URL into `(hostname, site name)`.
fn split_site_url(site_url: &str) -> Result<(String, String)> {
    let stripped = site_url
        .strip_prefix("https://")
        .or_else(|| site_url.strip_prefix("http://"))
        .with_context(|| format!("unsupported site URL: {}", site_url))?;
    let hostname = stripped.split('/').next().unwrap_or(stripped).to_string();
    let site_name = stripped
        .split("/sites/")
        .nth(1)
        .map(|rest| rest.split('/').next().unwrap_or(rest))
        .unwrap_or("")
        .to_string();
    Ok((hostname, site_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(document_id: &str, score: f64, chunk_index: i64) -> ChunkHit {
        ChunkHit {
            score,
            id: format!("{}_chunk_{}", document_id, chunk_index),
            document_id: document_id.to_string(),
            drive_id: Some("drive-1".to_string()),
            web_url: format!("https://acme.sharepoint.com/sites/eng/{}.pdf", document_id),
            site_url: "https://acme.sharepoint.com/sites/eng".to_string(),
            site_name: "Engineering".to_string(),
            document_title: format!("{}.pdf", document_id),
            file_type: "pdf".to_string(),
            chunk_index,
            chunk_text: format!("chunk {} of {}", chunk_index, document_id),
        }
    }

    #[test]
    fn dedupe_keeps_best_chunk_per_document() {
        let hits = vec![
            hit("doc-a", 0.7, 0),
            hit("doc-a", 0.9, 3),
            hit("doc-b", 0.8, 1),
        ];
        let top = dedupe_best_per_document(hits, 10);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].document_id, "doc-a");
        assert_eq!(top[0].chunk_index, 3);
        assert_eq!(top[1].document_id, "doc-b");
    }

    #[test]
    fn dedupe_truncates_to_limit_after_sorting() {
        let hits = vec![
            hit("doc-a", 0.6, 0),
            hit("doc-b", 0.9, 0),
            hit("doc-c", 0.8, 0),
        ];
        let top = dedupe_best_per_document(hits, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].document_id, "doc-b");
        assert_eq!(top[1].document_id, "doc-c");
    }

    #[test]
    fn source_block_lists_all_reference_fields() {
        let block = format_sources(&[hit("doc-a", 0.87, 0)]);
        assert!(block.contains("Source 1:"));
        assert!(block.contains("Title: doc-a.pdf"));
        assert!(block.contains("URL: https://acme.sharepoint.com/sites/eng/doc-a.pdf"));
        assert!(block.contains("Site: Engineering"));
        assert!(block.contains("DriveId: drive-1"));
        assert!(block.contains("ItemId: doc-a"));
        assert!(block.contains("Relevance: 87%"));
        assert!(block.contains("Content: chunk 0 of doc-a"));
    }

    #[test]
    fn truncation_appends_marker_only_when_needed() {
        assert_eq!(truncate_content("short", 10), "short");
        let long = "x".repeat(9000);
        let truncated = truncate_content(&long, 8000);
        assert!(truncated.ends_with("[Content truncated]"));
        assert!(truncated.starts_with(&"x".repeat(100)));
    }

    #[test]
    fn site_url_split_extracts_host_and_name() {
        let (host, name) =
            split_site_url("https://acme.sharepoint.com/sites/engineering").unwrap();
        assert_eq!(host, "acme.sharepoint.com");
        assert_eq!(name, "engineering");

        assert!(split_site_url("not-a-url").is_err());
    }

    #[test]
    fn required_str_rejects_missing_and_blank() {
        let args = json!({ "query": "vacation policy", "blank": "  " });
        assert_eq!(required_str(&args, "query").unwrap(), "vacation policy");
        assert!(required_str(&args, "blank").is_err());
        assert!(required_str(&args, "absent").is_err());
    }
}
