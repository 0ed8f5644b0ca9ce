//! # Knowledge Agent server (`knowledge-agent`)
//!
//! Binary entry point. `serve` (the default) runs the HTTP API together
//! with the indexing scheduler; the remaining subcommands are operator
//! shortcuts for the same operations the admin endpoints expose.
//!
//! ## Usage
//!
//! ```bash
//! knowledge-agent serve
//! knowledge-agent index --site-url https://acme.sharepoint.com/sites/eng --days 7
//! knowledge-agent index --skip-embeddings      # dry run, counts chunks only
//! knowledge-agent preview --limit 20
//! knowledge-agent stats
//! ```
//!
//! Configuration comes entirely from the environment; see
//! [`knowledge_agent::config`] for the recognized keys. Logging is
//! controlled through `RUST_LOG` (default `knowledge_agent=info`).

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use knowledge_agent::agent::ChatCore;
use knowledge_agent::config::{AppConfig, DEFAULT_COMPLETION_TIMEOUT, DEFAULT_TOOL_TIMEOUT};
use knowledge_agent::embedding::{AzureEmbeddingClient, Embedder};
use knowledge_agent::extract::{ContentExtractor, FormatExtractor};
use knowledge_agent::graph::{DocumentProvider, GraphClient};
use knowledge_agent::indexer::{IndexerScheduler, IndexingPipeline, PassOptions};
use knowledge_agent::llm::{AzureChatClient, ChatModel};
use knowledge_agent::server::{run_server, AppState};
use knowledge_agent::vector_store::{AzureSearchIndex, VectorIndex};

/// Knowledge agent backend: indexes platform documents into a vector
/// index and answers questions with permission-filtered retrieval.
#[derive(Parser)]
#[command(
    name = "knowledge-agent",
    about = "Knowledge agent backend — document indexing and permission-aware RAG chat",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server and the indexing scheduler (default).
    Serve,

    /// Run one indexing pass and exit.
    Index {
        /// Restrict discovery to one site URL.
        #[arg(long)]
        site_url: Option<String>,
        /// Days of modifications to consider.
        #[arg(long)]
        days: Option<u32>,
        /// Count chunks without embedding or storing anything.
        #[arg(long)]
        skip_embeddings: bool,
    },

    /// List discovery candidates without writing anything.
    Preview {
        /// Restrict discovery to one site URL.
        #[arg(long)]
        site_url: Option<String>,
        /// Days of modifications to consider.
        #[arg(long)]
        days: Option<u32>,
        /// Maximum candidates to list.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show vector index statistics.
    Stats,
}

/// All long-lived components, wired once at startup.
struct Components {
    provider: Arc<dyn DocumentProvider>,
    extractor: Arc<dyn ContentExtractor>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    model: Arc<dyn ChatModel>,
    pipeline: Arc<IndexingPipeline>,
}

fn build_components(config: &AppConfig) -> anyhow::Result<Components> {
    let provider: Arc<dyn DocumentProvider> = Arc::new(GraphClient::new(
        config.identity.clone(),
        config.sharepoint_geo.clone(),
        DEFAULT_TOOL_TIMEOUT,
    )?);
    let extractor: Arc<dyn ContentExtractor> = Arc::new(FormatExtractor::new(provider.clone()));
    let embedder: Arc<dyn Embedder> =
        Arc::new(AzureEmbeddingClient::new(&config.openai, DEFAULT_TOOL_TIMEOUT)?);
    let index: Arc<dyn VectorIndex> =
        Arc::new(AzureSearchIndex::new(&config.search, DEFAULT_TOOL_TIMEOUT)?);
    let model: Arc<dyn ChatModel> = Arc::new(AzureChatClient::new(
        &config.openai,
        DEFAULT_COMPLETION_TIMEOUT,
    )?);
    let pipeline = Arc::new(IndexingPipeline::new(
        provider.clone(),
        extractor.clone(),
        embedder.clone(),
        index.clone(),
    ));
    Ok(Components {
        provider,
        extractor,
        embedder,
        index,
        model,
        pipeline,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("knowledge_agent=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from_env()?;
    let components = build_components(&config)?;

    // Idempotent schema bootstrap before anything touches the index.
    components.index.ensure_index().await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, components).await,
        Commands::Index {
            site_url,
            days,
            skip_embeddings,
        } => {
            let options = PassOptions {
                site_url,
                days_back: days.unwrap_or(PassOptions::default().days_back),
                skip_embeddings,
            };
            let report = components.pipeline.run_pass(&options).await;
            println!("indexing pass");
            println!("  documents found: {}", report.documents_found);
            println!("  documents processed: {}", report.documents_processed);
            println!("  chunks created: {}", report.chunks_created);
            println!("  duration: {} ms", report.duration_ms);
            for error in &report.errors {
                println!("  error: {}", error);
            }
            Ok(())
        }
        Commands::Preview {
            site_url,
            days,
            limit,
        } => {
            let options = PassOptions {
                site_url,
                days_back: days.unwrap_or(PassOptions::default().days_back),
                skip_embeddings: true,
            };
            let mut documents = components.pipeline.discover(&options).await?;
            documents.truncate(limit);
            println!("candidates: {}", documents.len());
            for doc in &documents {
                println!(
                    "  [{}] {} ({})",
                    doc.file_type, doc.title, doc.last_modified
                );
                println!("      {}", doc.web_url);
            }
            Ok(())
        }
        Commands::Stats => {
            let stats = components.index.stats().await?;
            println!("index stats");
            println!("  chunks: {}", stats.document_count);
            println!("  storage: {} bytes", stats.storage_size);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig, components: Components) -> anyhow::Result<()> {
    let scheduler = Arc::new(IndexerScheduler::new(
        components.pipeline.clone(),
        config.indexer.interval_ms,
    ));

    let scheduler_task = if config.indexer.enabled {
        Some(scheduler.clone().spawn())
    } else {
        info!("indexer disabled by configuration");
        None
    };

    let chat = Arc::new(ChatCore {
        model: components.model.clone(),
        provider: components.provider.clone(),
        embedder: components.embedder.clone(),
        index: components.index.clone(),
        extractor: components.extractor.clone(),
        default_mode: config.default_search_mode,
        use_hybrid: false,
        tool_timeout: DEFAULT_TOOL_TIMEOUT,
    });
    let state = AppState {
        chat,
        scheduler: scheduler.clone(),
        index: components.index.clone(),
        provider: components.provider.clone(),
    };

    let shutdown = {
        let scheduler = scheduler.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            scheduler.shutdown();
        }
    };
    run_server(state, config.port, shutdown).await?;

    if let Some(task) = scheduler_task {
        let _ = task.await;
    }
    Ok(())
}
