//! Environment-backed configuration.
//!
//! All settings come from plain key/value pairs in the process
//! environment. [`AppConfig::load_from_env`] reads and validates them at
//! startup; a missing required key is fatal and names the key in the
//! error. Secrets are held in memory only and never logged.
//!
//! | Key | Default |
//! |-----|---------|
//! | `AD_TENANT_ID` / `AD_CLIENT_ID` / `AD_CLIENT_SECRET` | required |
//! | `AZURE_OPENAI_ENDPOINT` / `AZURE_OPENAI_API_KEY` | required |
//! | `AZURE_OPENAI_API_VERSION` | `2024-02-01` |
//! | `AZURE_OPENAI_DEPLOYMENT` / `AZURE_OPENAI_EMBEDDING_DEPLOYMENT` | required |
//! | `AZURE_SEARCH_ENDPOINT` / `AZURE_SEARCH_ADMIN_KEY` / `AZURE_SEARCH_INDEX_NAME` | required |
//! | `KNOWLEDGE_INDEXER_ENABLED` | `true` |
//! | `KNOWLEDGE_INDEXER_INTERVAL_MS` | `3600000` |
//! | `SHAREPOINT_GEO` | `US` |
//! | `DEFAULT_SEARCH_MODE` | `kql` |
//! | `PORT` | `3000` |

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::models::SearchMode;

/// Suggested timeout for tool-level outbound calls.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
/// Suggested timeout for chat completion calls.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub openai: OpenAiConfig,
    pub search: SearchConfig,
    pub indexer: IndexerConfig,
    /// Search region passed to the provider search endpoint.
    pub sharepoint_geo: String,
    /// Retrieval mode used when a chat request does not pick one.
    pub default_search_mode: SearchMode,
    /// HTTP listen port.
    pub port: u16,
}

/// Application identity for the client-credentials grant.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Azure OpenAI endpoint and deployments.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    /// Chat-completion deployment name.
    pub deployment: String,
    /// Embedding deployment name.
    pub embedding_deployment: String,
}

/// Azure AI Search endpoint and index.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub endpoint: String,
    pub admin_key: String,
    pub index_name: String,
}

/// Indexer scheduling settings.
#[derive(Debug, Clone, Copy)]
pub struct IndexerConfig {
    /// When false, the scheduler never starts.
    pub enabled: bool,
    /// Milliseconds between scheduled passes.
    pub interval_ms: u64,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn load_from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup. Exists so tests
    /// can inject settings without touching process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => bail!("missing required configuration: {}", key),
            }
        };
        let optional = |key: &str, default: &str| -> String {
            lookup(key).unwrap_or_else(|| default.to_string())
        };

        let identity = IdentityConfig {
            tenant_id: required("AD_TENANT_ID")?,
            client_id: required("AD_CLIENT_ID")?,
            client_secret: required("AD_CLIENT_SECRET")?,
        };
        let openai = OpenAiConfig {
            endpoint: required("AZURE_OPENAI_ENDPOINT")?,
            api_key: required("AZURE_OPENAI_API_KEY")?,
            api_version: optional("AZURE_OPENAI_API_VERSION", "2024-02-01"),
            deployment: required("AZURE_OPENAI_DEPLOYMENT")?,
            embedding_deployment: required("AZURE_OPENAI_EMBEDDING_DEPLOYMENT")?,
        };
        let search = SearchConfig {
            endpoint: required("AZURE_SEARCH_ENDPOINT")?,
            admin_key: required("AZURE_SEARCH_ADMIN_KEY")?,
            index_name: required("AZURE_SEARCH_INDEX_NAME")?,
        };

        let enabled = parse_bool(&optional("KNOWLEDGE_INDEXER_ENABLED", "true"))
            .context("KNOWLEDGE_INDEXER_ENABLED must be a boolean")?;
        let interval_ms: u64 = optional("KNOWLEDGE_INDEXER_INTERVAL_MS", "3600000")
            .parse()
            .context("KNOWLEDGE_INDEXER_INTERVAL_MS must be an integer")?;
        if interval_ms == 0 {
            bail!("KNOWLEDGE_INDEXER_INTERVAL_MS must be > 0");
        }

        let mode_token = optional("DEFAULT_SEARCH_MODE", "kql");
        let default_search_mode = SearchMode::parse(&mode_token)
            .with_context(|| format!("unknown DEFAULT_SEARCH_MODE: {}", mode_token))?;

        let port: u16 = optional("PORT", "3000")
            .parse()
            .context("PORT must be a valid port number")?;

        Ok(Self {
            identity,
            openai,
            search,
            indexer: IndexerConfig {
                enabled,
                interval_ms,
            },
            sharepoint_geo: optional("SHAREPOINT_GEO", "US"),
            default_search_mode,
            port,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
