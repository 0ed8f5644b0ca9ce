//! Indexing pipeline orchestration and scheduling.
//!
//! Coordinates the full pass: provider search → per-document extract →
//! chunk → embed → delete-then-upsert into the vector index. Failures
//! are isolated per document: one bad document lands in the report's
//! error list and the pass moves on.
//!
//! # Pipeline pass
//!
//! 1. **Discover** — provider keyword search for marked documents
//!    modified in the last `days_back` days, optionally scoped to a site.
//! 2. **Extract** — per document; normalized text shorter than
//!    [`MIN_CONTENT_CHARS`](crate::extract::MIN_CONTENT_CHARS) skips the
//!    document ("insufficient content").
//! 3. **Chunk** — boundary-aware overlapping chunks; empty output skips.
//! 4. **Embed** — one call per document (the embedder batches
//!    internally); skipped entirely in test mode.
//! 5. **Replace** — delete every stored chunk for the document id, then
//!    upsert the fresh set. Strict order, so no orphan chunks survive.
//!
//! # Scheduling
//!
//! The scheduler runs one pass immediately at startup, then on a
//! repeating timer. A tick (or manual trigger) arriving while a pass is
//! in flight is dropped, not queued — an `AtomicBool` is the sole
//! concurrency control, and the design assumes one indexer process per
//! deployment; multi-instance deployments must elect a single indexer
//! externally. Shutdown cancels the timer through a
//! [`CancellationToken`] and lets any in-flight pass finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use anyhow::{Context, Result};

use crate::chunk::{chunk_text, estimate_tokens, ChunkOptions};
use crate::embedding::Embedder;
use crate::extract::{ContentExtractor, MIN_CONTENT_CHARS};
use crate::graph::{DocumentProvider, KqlQuery, MAX_SEARCH_HITS};
use crate::models::{DocumentChunk, IndexerReport, KnowledgeDocument};
use crate::vector_store::VectorIndex;

/// Default lookback window for candidate discovery.
pub const DEFAULT_DAYS_BACK: u32 = 30;

/// Options for one pipeline pass.
#[derive(Debug, Clone)]
pub struct PassOptions {
    /// Restrict discovery to one site.
    pub site_url: Option<String>,
    /// How many days of modifications to consider.
    pub days_back: u32,
    /// Count chunks but skip embedding and storage (test mode).
    pub skip_embeddings: bool,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            site_url: None,
            days_back: DEFAULT_DAYS_BACK,
            skip_embeddings: false,
        }
    }
}

/// Outcome of a trigger attempt.
#[derive(Debug)]
pub enum RunOutcome {
    /// The pass ran; here is its report.
    Completed(IndexerReport),
    /// Another pass was in flight; this trigger was dropped.
    AlreadyRunning,
}

/// The indexing pipeline: discovery through storage.
pub struct IndexingPipeline {
    provider: Arc<dyn DocumentProvider>,
    extractor: Arc<dyn ContentExtractor>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunk_options: ChunkOptions,
}

impl IndexingPipeline {
    pub fn new(
        provider: Arc<dyn DocumentProvider>,
        extractor: Arc<dyn ContentExtractor>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            provider,
            extractor,
            embedder,
            index,
            chunk_options: ChunkOptions::default(),
        }
    }

    /// Run the discovery search without processing anything. Backs the
    /// candidate-preview endpoint.
    pub async fn discover(&self, options: &PassOptions) -> Result<Vec<KnowledgeDocument>> {
        let query = KqlQuery::knowledge_documents(options.days_back, options.site_url.as_deref());
        self.provider
            .search_documents(&query, MAX_SEARCH_HITS)
            .await
            .context("candidate discovery failed")
    }

    /// Run one full pass. Never fails as a whole: discovery and
    /// per-document failures are collected into the report.
    pub async fn run_pass(&self, options: &PassOptions) -> IndexerReport {
        let started = Instant::now();
        let mut report = IndexerReport::default();

        let documents = match self.discover(options).await {
            Ok(documents) => documents,
            Err(e) => {
                report.errors.push(format!("{:#}", e));
                report.duration_ms = started.elapsed().as_millis() as u64;
                return report;
            }
        };
        report.documents_found = documents.len();

        for doc in &documents {
            match self.process_document(doc, options.skip_embeddings).await {
                Ok(Some(chunk_count)) => {
                    report.documents_processed += 1;
                    report.chunks_created += chunk_count;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(document = %doc.title, error = %format!("{:#}", e), "document failed");
                    report.errors.push(format!("{}: {:#}", doc.title, e));
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            documents_found = report.documents_found,
            documents_processed = report.documents_processed,
            chunks_created = report.chunks_created,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "indexing pass finished"
        );
        report
    }

    /// Process one document end to end. `Ok(None)` means the document
    /// was skipped (insufficient or unextractable content).
    async fn process_document(
        &self,
        doc: &KnowledgeDocument,
        skip_embeddings: bool,
    ) -> Result<Option<usize>> {
        let text = self
            .extractor
            .extract(doc)
            .await
            .context("extraction failed")?;
        if text.chars().count() < MIN_CONTENT_CHARS {
            debug!(document = %doc.title, "skipped: insufficient content");
            return Ok(None);
        }

        let chunks = chunk_text(&text, &self.chunk_options);
        if chunks.is_empty() {
            debug!(document = %doc.title, "skipped: no chunks produced");
            return Ok(None);
        }
        debug!(
            document = %doc.title,
            chunks = chunks.len(),
            tokens = estimate_tokens(&text),
            "chunked document"
        );

        if skip_embeddings {
            return Ok(Some(chunks.len()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self
            .embedder
            .embed(&texts)
            .await
            .context("embedding failed")?;

        let indexed_at = Utc::now();
        let document_chunks: Vec<DocumentChunk> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| DocumentChunk {
                id: DocumentChunk::chunk_key(&doc.id, chunk.index),
                document_id: doc.id.clone(),
                drive_id: doc.drive_id.clone(),
                web_url: doc.web_url.clone(),
                site_url: doc.site_url.clone(),
                site_name: doc.site_name.clone(),
                document_title: doc.title.clone(),
                file_type: doc.file_type.as_str().to_string(),
                chunk_index: chunk.index as i64,
                chunk_text: chunk.text.clone(),
                embedding: embedding.vector,
                document_modified_at: doc.last_modified,
                indexed_at,
            })
            .collect();

        // Strict replace order: clear the document's old chunks before
        // inserting the new set.
        self.index
            .delete_by_document_id(&doc.id)
            .await
            .context("stale chunk delete failed")?;
        self.index
            .upsert_chunks(&document_chunks)
            .await
            .context("chunk upsert failed")?;

        Ok(Some(document_chunks.len()))
    }
}

/// Periodic, singleton-scoped driver for the pipeline.
pub struct IndexerScheduler {
    pipeline: Arc<IndexingPipeline>,
    interval: Duration,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl IndexerScheduler {
    pub fn new(pipeline: Arc<IndexingPipeline>, interval_ms: u64) -> Self {
        Self {
            pipeline,
            interval: Duration::from_millis(interval_ms),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Attempt a pass now. Returns [`RunOutcome::AlreadyRunning`]
    /// immediately when another pass holds the flag.
    pub async fn try_run(&self, options: PassOptions) -> RunOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return RunOutcome::AlreadyRunning;
        }
        let report = self.pipeline.run_pass(&options).await;
        self.running.store(false, Ordering::SeqCst);
        RunOutcome::Completed(report)
    }

    /// Expose the pipeline for read-only operations (preview).
    pub fn pipeline(&self) -> &IndexingPipeline {
        &self.pipeline
    }

    /// Start the schedule: one pass immediately, then every interval.
    /// Ticks that land while a pass is in flight are skipped.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = self.interval.as_millis() as u64, "indexer scheduler started");

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("indexer scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.try_run(PassOptions::default()).await {
                            RunOutcome::Completed(_) => {}
                            RunOutcome::AlreadyRunning => {
                                warn!("scheduled pass skipped: a pass is already running");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Cancel the timer. An in-flight pass completes on its own.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
