//! # Knowledge Agent
//!
//! **Backend core for a permission-aware knowledge assistant.**
//!
//! The knowledge agent indexes documents from a hosted document platform
//! into a vector search index and answers user questions by combining
//! retrieval with a tool-calling LLM — while re-verifying every retrieved
//! chunk against the requesting user's delegated credentials.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌───────────────┐
//! │   Provider   │──▶│ Indexing pipeline │──▶│ Vector index  │
//! │ (SharePoint) │   │ extract·chunk·embed│  │ (HNSW, 1536d) │
//! └──────┬───────┘   └───────────────────┘   └───────┬───────┘
//!        │ permission probes                         │ retrieval
//!        ▼                                           ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        Chat agent (per-request tools + LLM loop)        │
//! └─────────────────────────────────────────────────────────┘
//!                            ▲
//!                       HTTP │ /api/chat, /api/admin/…
//! ```
//!
//! ## Data Flow
//!
//! 1. The **scheduler** ([`indexer`]) triggers a pipeline pass on an
//!    interval; overlapping triggers are dropped.
//! 2. The **provider adapter** ([`graph`]) discovers candidate documents
//!    through keyword search and downloads their content.
//! 3. The **extractor** ([`extract`]) decodes PDF, Word, and markup
//!    pages into normalized plain text.
//! 4. The **chunker** ([`chunk`]) splits text into overlapping,
//!    boundary-aware chunks.
//! 5. The **embedder** ([`embedding`]) turns chunk batches into
//!    1536-dimension vectors.
//! 6. The **vector store** ([`vector_store`]) replaces the document's
//!    chunks with delete-then-insert semantics.
//! 7. The **chat core** ([`agent`], [`tools`], [`llm`]) answers
//!    questions through mode-specific tools, filtering every retrieved
//!    chunk through the user's own permissions before the model sees it.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-backed configuration and validation |
//! | [`models`] | Core data types: documents, chunks, chat messages |
//! | [`graph`] | Document platform adapter (search, download, probe) |
//! | [`extract`] | PDF / Word / markup-page text extraction |
//! | [`chunk`] | Boundary-aware overlapping chunker |
//! | [`embedding`] | Batched embedding client |
//! | [`vector_store`] | Vector index client (schema, upsert, search) |
//! | [`indexer`] | Pipeline orchestration and singleton scheduler |
//! | [`llm`] | Chat completion client with tool calling |
//! | [`tools`] | Agent tools and the per-request registry |
//! | [`agent`] | Tool-calling loop and system prompt composition |
//! | [`server`] | HTTP API (Axum) with bearer identity |

pub mod agent;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod graph;
pub mod indexer;
pub mod llm;
pub mod models;
pub mod server;
pub mod tools;
pub mod vector_store;
