//! Core data models used throughout the knowledge agent.
//!
//! These types represent the documents, chunks, and chat messages that flow
//! through the indexing and retrieval pipeline. The data lifecycle is:
//!
//! ```text
//! Provider search → KnowledgeDocument → extract() → text → chunk() → TextChunk
//!                                                                ↓
//!                                                    embed() → DocumentChunk
//!                                                                ↓
//!                                              search_similar() → ChunkHit
//! ```
//!
//! # Type Relationships
//!
//! - A **[`KnowledgeDocument`]** is a candidate discovered by the provider
//!   search; it lives for one pipeline pass and is then discarded.
//! - A **[`TextChunk`]** is a bounded span of extracted text produced by
//!   the chunker, before embedding.
//! - A **[`DocumentChunk`]** is the persisted unit in the vector index:
//!   chunk text + embedding + denormalized document metadata.
//! - A **[`ChunkHit`]** is a scored chunk returned by the vector index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Document formats the extractor understands.
///
/// Anything the provider returns outside this set maps to
/// [`FileType::Unknown`], which the pipeline treats as "skip".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Doc,
    Docx,
    Aspx,
    Unknown,
}

impl FileType {
    /// Infer the file type from a filename extension.
    ///
    /// Used when a search hit carries no explicit file type field.
    pub fn from_name(name: &str) -> Self {
        match name.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "pdf" => FileType::Pdf,
            Some(ext) if ext == "doc" => FileType::Doc,
            Some(ext) if ext == "docx" => FileType::Docx,
            Some(ext) if ext == "aspx" => FileType::Aspx,
            _ => FileType::Unknown,
        }
    }

    /// Parse a provider-supplied file type string (case-insensitive).
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pdf" => FileType::Pdf,
            "doc" => FileType::Doc,
            "docx" => FileType::Docx,
            "aspx" => FileType::Aspx,
            _ => FileType::Unknown,
        }
    }

    /// Lowercase token used in search filters and stored metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Doc => "doc",
            FileType::Docx => "docx",
            FileType::Aspx => "aspx",
            FileType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate document discovered by the provider search.
///
/// Created per search hit, immutable, and discarded after the pipeline
/// pass that processed it. The `id` is the provider's stable identifier
/// and keys the delete-then-insert replacement in the vector index.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDocument {
    /// Stable identifier from the provider (drive item or list item id).
    pub id: String,
    /// Human-readable title (typically the filename).
    pub title: String,
    /// Web-browsable URL of the document.
    pub web_url: String,
    /// Document format, inferred from metadata or filename.
    pub file_type: FileType,
    /// Last modification timestamp reported by the provider (UTC).
    pub last_modified: DateTime<Utc>,
    /// URL of the site the document lives in.
    pub site_url: String,
    /// Display name of the site.
    pub site_name: String,
    /// Drive containing the item, when the hit is a drive item.
    pub drive_id: Option<String>,
    /// Item id within the drive, when the hit is a drive item.
    pub drive_item_id: Option<String>,
    /// Search-hit summary snippet, when the provider supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// A bounded span of extracted text produced by the chunker.
///
/// Offsets are character positions into the normalized source text.
/// `text` is the trimmed content of the `[start_offset, end_offset)` span;
/// consecutive chunks overlap by the configured overlap width.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// Zero-based position in the document's chunk sequence.
    pub index: usize,
    /// Trimmed chunk text.
    pub text: String,
    /// Start of the span in the source text (characters, inclusive).
    pub start_offset: usize,
    /// End of the span in the source text (characters, exclusive).
    pub end_offset: usize,
}

/// The persisted unit in the vector index.
///
/// All chunks for a given `document_id` share identical document metadata;
/// replacing a document deletes every prior chunk with that `document_id`
/// before inserting new ones, so no orphan chunks survive a re-index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    /// Primary key: `<sanitized-documentId>_chunk_<index>` (URL-safe).
    pub id: String,
    /// Provider document id this chunk belongs to.
    pub document_id: String,
    /// Drive containing the source item, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    /// Web-browsable URL of the source document.
    pub web_url: String,
    /// URL of the site the document lives in.
    pub site_url: String,
    /// Display name of the site.
    pub site_name: String,
    /// Title of the source document.
    pub document_title: String,
    /// Source document format token (`"pdf"`, `"docx"`, ...).
    pub file_type: String,
    /// Zero-based chunk position within the document.
    pub chunk_index: i64,
    /// Chunk text content.
    pub chunk_text: String,
    /// Embedding vector; length must equal the configured dimension (1536).
    pub embedding: Vec<f32>,
    /// Last-modified timestamp of the source document.
    pub document_modified_at: DateTime<Utc>,
    /// Timestamp of the pipeline pass that wrote this chunk.
    pub indexed_at: DateTime<Utc>,
}

impl DocumentChunk {
    /// Build the URL-safe chunk key for a document id and chunk index.
    ///
    /// Characters outside `[A-Za-z0-9_\-=]` are replaced with `_` so the
    /// key is valid for the vector index and for URL path segments.
    pub fn chunk_key(document_id: &str, index: usize) -> String {
        let sanitized: String = document_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '=' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_chunk_{}", sanitized, index)
    }
}

/// A scored chunk returned by the vector index.
///
/// Carries the stored metadata fields but never the embedding vector;
/// `score` is in `[0.0, 1.0]` where larger is better.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHit {
    /// Relevance score in `[0.0, 1.0]`.
    pub score: f64,
    /// Chunk key.
    pub id: String,
    /// Provider document id.
    pub document_id: String,
    /// Drive containing the source item, when known.
    pub drive_id: Option<String>,
    /// Web-browsable URL of the source document.
    pub web_url: String,
    /// Site URL.
    pub site_url: String,
    /// Site display name.
    pub site_name: String,
    /// Source document title.
    pub document_title: String,
    /// Source document format token.
    pub file_type: String,
    /// Chunk position within the document.
    pub chunk_index: i64,
    /// Chunk text content.
    pub chunk_text: String,
}

/// Aggregate counts reported by the vector index.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    /// Number of stored chunks.
    pub document_count: u64,
    /// Storage consumed by the index, in bytes.
    pub storage_size: u64,
}

/// Result of one indexing pipeline pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerReport {
    /// Candidates returned by the provider search.
    pub documents_found: usize,
    /// Documents that made it through extract → chunk → embed → upsert.
    pub documents_processed: usize,
    /// Chunks written (or counted, when embeddings are skipped).
    pub chunks_created: usize,
    /// Per-document error descriptions; a failure here never aborts the pass.
    pub errors: Vec<String>,
    /// Wall-clock duration of the pass in milliseconds.
    pub duration_ms: u64,
}

/// Conversation roles carried in the chat API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in the chat conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Retrieval strategy for a chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Vector retrieval over the knowledge index.
    Rag,
    /// Keyword retrieval against the provider search endpoint.
    Kql,
}

impl SearchMode {
    /// Parse a mode token, accepting any casing. Unknown tokens yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "rag" => Some(SearchMode::Rag),
            "kql" => Some(SearchMode::Kql),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Rag => "rag",
            SearchMode::Kql => "kql",
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request chat context sent by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContext {
    /// Site the conversation is scoped to.
    pub site_url: String,
    /// Requested retrieval mode; falls back to the configured default.
    #[serde(default)]
    pub search_mode: Option<SearchMode>,
}

/// The authenticated caller attached to each request by the auth layer.
///
/// The bearer token is the user's delegated credential and is forwarded to
/// the provider for permission probes and profile lookups; it is never
/// logged or echoed in responses.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Stable user object id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Primary email address.
    pub email: String,
    /// Raw delegated access token.
    pub token: String,
}

/// Profile fields returned by the provider for the delegated user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub mail: Option<String>,
    pub job_title: Option<String>,
    pub department: Option<String>,
    pub company_name: Option<String>,
    pub office_location: Option<String>,
    pub manager: Option<String>,
}

/// Descriptor of a resolved provider site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteInfo {
    pub id: String,
    pub name: String,
    pub web_url: String,
}
