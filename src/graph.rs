//! Document platform adapter (Microsoft Graph).
//!
//! Wraps the hosted document platform behind the [`DocumentProvider`]
//! trait: keyword search over site content, content download, site and
//! page resolution for markup pages, and the per-user access probe the
//! chat permission filter depends on.
//!
//! # Authentication
//!
//! Two credentials flow through this module:
//!
//! - An **application token** (client-credentials grant against the
//!   configured tenant) used by the indexing pipeline. Cached in-process
//!   until shortly before expiry.
//! - A **delegated user token** passed per call for permission probes and
//!   profile lookups, so every access decision is made with the
//!   requesting user's own permissions.
//!
//! # Access probe
//!
//! [`DocumentProvider::probe_access`] issues a minimal metadata fetch
//! with the delegated token. The caller treats *any* error as "not
//! accessible": 403 and 404 are the expected denial shapes, and anything
//! else fails closed.
//!
//! # Malformed hits
//!
//! Search hits are parsed tolerantly: unknown fields are ignored, a
//! missing file type is inferred from the filename extension, and hits
//! without a stable id or URL are dropped with a warning instead of
//! failing the search.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::IdentityConfig;
use crate::models::{FileType, KnowledgeDocument, SiteInfo, UserProfile};

/// Maximum hits the provider search endpoint returns per call.
pub const MAX_SEARCH_HITS: usize = 500;

/// Managed-property clause marking documents opted into the knowledge index.
const KNOWLEDGE_MARKER_CLAUSE: &str = "KnowledgeArticle:1";

/// File formats the indexing pipeline accepts.
const INDEXABLE_TYPES: [FileType; 4] =
    [FileType::Pdf, FileType::Doc, FileType::Docx, FileType::Aspx];

/// Errors returned by the document platform adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credential acquisition failed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The platform denied access to the resource (401/403).
    #[error("access denied: {0}")]
    Unauthorized(String),
    /// The resource does not exist or was moved (404).
    #[error("not found: {0}")]
    NotFound(String),
    /// The platform throttled the request (429).
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The platform returned a server-side failure (5xx).
    #[error("provider server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    /// Transport-level failure (DNS, connect, timeout).
    #[error("network error: {0}")]
    Network(String),
    /// The response body did not have the expected shape.
    #[error("malformed provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => ProviderError::Unauthorized(message),
            404 => ProviderError::NotFound(message),
            429 => ProviderError::RateLimited(message),
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::Server { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProviderError::Network(err.to_string())
        } else if err.is_decode() {
            ProviderError::Parse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// One web part of a markup page, as returned by the pages endpoint.
///
/// Parts carry either rendered HTML or a plain-text property; the
/// extractor prefers the HTML payload and falls back to the text field.
#[derive(Debug, Clone, Default)]
pub struct PagePart {
    /// Rendered HTML payload of the part, when present.
    pub inner_html: Option<String>,
    /// Plain-text property (`data.properties.text`), when present.
    pub text: Option<String>,
}

/// Operations the core needs from the document platform.
///
/// Implemented by [`GraphClient`] for production and by in-process fakes
/// in tests; constructors thread the chosen implementation explicitly
/// through the pipeline and chat components.
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    /// Run a keyword search and return candidate documents (≤ `size`,
    /// capped at [`MAX_SEARCH_HITS`]).
    async fn search_documents(
        &self,
        query: &KqlQuery,
        size: usize,
    ) -> Result<Vec<KnowledgeDocument>, ProviderError>;

    /// Download the raw bytes of a document.
    ///
    /// Resolves by drive + item id when both are present, otherwise by
    /// hostname + URL path.
    async fn download_bytes(&self, doc: &KnowledgeDocument) -> Result<Vec<u8>, ProviderError>;

    /// Resolve a site by hostname and site name.
    async fn resolve_site(
        &self,
        hostname: &str,
        site_name: &str,
    ) -> Result<SiteInfo, ProviderError>;

    /// Fetch the structured web parts of a markup page.
    ///
    /// An empty result is not an error; the extractor falls back to the
    /// raw page file in that case.
    async fn get_page_parts(
        &self,
        site_id: &str,
        page_name: &str,
    ) -> Result<Vec<PagePart>, ProviderError>;

    /// Probe whether the delegated user can read a document.
    ///
    /// Issues a minimal metadata fetch with the user's own token.
    /// Callers must treat any `Err` as "not accessible" — the permission
    /// filter fails closed on 403, 404, server errors, timeouts, and
    /// malformed responses alike.
    async fn probe_access(
        &self,
        document_id: &str,
        drive_id: Option<&str>,
        web_url: &str,
        user_token: &str,
    ) -> Result<(), ProviderError>;

    /// Fetch the delegated user's profile fields.
    async fn get_user_profile(&self, user_token: &str) -> Result<UserProfile, ProviderError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Keyword query builder
// ═══════════════════════════════════════════════════════════════════════

/// Composable keyword expression with conjunction semantics.
///
/// Clauses are `FIELD:VALUE` tokens joined by spaces (implicit AND);
/// ranges use `FIELD>=YYYY-MM-DD`. [`KqlQuery::knowledge_documents`]
/// assembles the standard indexing query: marker clause, file-type
/// whitelist, optional site scope, and a day-granular modified range.
#[derive(Debug, Clone, Default)]
pub struct KqlQuery {
    clauses: Vec<String>,
}

impl KqlQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard candidate-discovery query for the indexing pipeline.
    pub fn knowledge_documents(days_back: u32, site_url: Option<&str>) -> Self {
        let mut query = Self::new()
            .clause(KNOWLEDGE_MARKER_CLAUSE)
            .file_types(&INDEXABLE_TYPES);
        if let Some(site) = site_url {
            query = query.path(site);
        }
        query.modified_within_days(days_back)
    }

    /// Append a raw clause.
    pub fn clause(mut self, clause: impl Into<String>) -> Self {
        self.clauses.push(clause.into());
        self
    }

    /// Restrict hits to a whitelist of file types (OR group).
    pub fn file_types(self, types: &[FileType]) -> Self {
        let group = types
            .iter()
            .map(|t| format!("FileType:{}", t.as_str()))
            .collect::<Vec<_>>()
            .join(" OR ");
        self.clause(format!("({})", group))
    }

    /// Scope the query to a site URL.
    pub fn path(self, site_url: &str) -> Self {
        self.clause(format!("path:\"{}\"", site_url))
    }

    /// Restrict to documents modified in `[now − days, now]`, at day
    /// granularity in UTC.
    pub fn modified_within_days(self, days: u32) -> Self {
        let end = Utc::now().date_naive();
        let start = end - ChronoDuration::days(i64::from(days));
        self.clause(format!("LastModifiedTime>={}", start.format("%Y-%m-%d")))
            .clause(format!("LastModifiedTime<={}", end.format("%Y-%m-%d")))
    }

    /// Render the final query string.
    pub fn build(&self) -> String {
        self.clauses.join(" ")
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Graph client
// ═══════════════════════════════════════════════════════════════════════

/// Cached application token with its expiry.
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Production [`DocumentProvider`] backed by the Microsoft Graph REST API.
///
/// Stateless apart from the application token cache, so a single client
/// is shared by the indexer and all concurrent chat requests.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    login_url: String,
    identity: IdentityConfig,
    region: String,
    app_token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    /// Create a client against the public Graph endpoint.
    pub fn new(identity: IdentityConfig, region: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            login_url: "https://login.microsoftonline.com".to_string(),
            identity,
            region,
            app_token: Mutex::new(None),
        })
    }

    /// Override the Graph and login base URLs. Used by tests and
    /// sovereign-cloud deployments.
    pub fn with_endpoints(mut self, base_url: String, login_url: String) -> Self {
        self.base_url = base_url;
        self.login_url = login_url;
        self
    }

    /// Acquire (or reuse) the application token via the client-credentials
    /// grant. Tokens are refreshed five minutes before expiry.
    async fn app_token(&self) -> Result<String, ProviderError> {
        let mut cache = self.app_token.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at > Utc::now() + ChronoDuration::minutes(5) {
                return Ok(cached.token.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_url, self.identity.tenant_id
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.identity.client_id.as_str()),
                ("client_secret", self.identity.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        if status != 200 {
            let detail = body["error_description"]
                .as_str()
                .unwrap_or("token endpoint rejected the request");
            return Err(ProviderError::Auth(detail.to_string()));
        }

        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse("token response missing access_token".into()))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);
        *cache = Some(CachedToken {
            token: token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
        });
        Ok(token)
    }

    /// GET a Graph URL with a bearer token and parse the JSON body.
    async fn get_json(&self, url: &str, token: &str) -> Result<Value, ProviderError> {
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, truncate_message(&message)));
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }

    /// Parse one search hit into a [`KnowledgeDocument`].
    ///
    /// Returns `None` when the hit lacks a stable id or URL; everything
    /// else is filled from the fields available, falling back to the
    /// filename extension for the file type and to the URL prefix for
    /// the site.
    fn parse_hit(hit: &Value) -> Option<KnowledgeDocument> {
        let resource = &hit["resource"];
        let id = resource["id"].as_str()?.to_string();
        let web_url = resource["webUrl"].as_str()?.to_string();

        let name = resource["name"]
            .as_str()
            .or_else(|| resource["fields"]["title"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                web_url
                    .rsplit('/')
                    .next()
                    .unwrap_or("untitled")
                    .to_string()
            });

        let file_type = resource["fields"]["fileType"]
            .as_str()
            .map(FileType::parse)
            .filter(|t| *t != FileType::Unknown)
            .unwrap_or_else(|| FileType::from_name(&name));

        let last_modified = resource["lastModifiedDateTime"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::UNIX_EPOCH);

        let (fallback_site_url, fallback_site_name) = site_from_web_url(&web_url);
        let site_url = resource["fields"]["siteUrl"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(fallback_site_url);
        let site_name = resource["fields"]["siteName"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(fallback_site_name);

        let drive_id = resource["parentReference"]["driveId"]
            .as_str()
            .map(str::to_string);
        let drive_item_id = drive_id.as_ref().map(|_| id.clone());

        Some(KnowledgeDocument {
            id,
            title: name,
            web_url,
            file_type,
            last_modified,
            site_url,
            site_name,
            drive_id,
            drive_item_id,
            summary: hit["summary"].as_str().map(str::to_string),
        })
    }
}

#[async_trait]
impl DocumentProvider for GraphClient {
    async fn search_documents(
        &self,
        query: &KqlQuery,
        size: usize,
    ) -> Result<Vec<KnowledgeDocument>, ProviderError> {
        let token = self.app_token().await?;
        let body = json!({
            "requests": [{
                "entityTypes": ["driveItem", "listItem"],
                "query": { "queryString": query.build() },
                "from": 0,
                "size": size.min(MAX_SEARCH_HITS),
                "region": self.region,
                "fields": [
                    "id", "name", "title", "webUrl", "lastModifiedDateTime",
                    "parentReference", "fileType", "siteUrl", "siteName"
                ]
            }]
        });

        let response = self
            .http
            .post(format!("{}/search/query", self.base_url))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, truncate_message(&message)));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let mut documents = Vec::new();
        let containers = payload["value"]
            .as_array()
            .and_then(|v| v.first())
            .and_then(|r| r["hitsContainers"].as_array())
            .cloned()
            .unwrap_or_default();
        for container in &containers {
            for hit in container["hits"].as_array().unwrap_or(&Vec::new()) {
                match Self::parse_hit(hit) {
                    Some(doc) => documents.push(doc),
                    None => warn!("dropping malformed search hit"),
                }
            }
        }
        debug!(count = documents.len(), "provider search returned hits");
        Ok(documents)
    }

    async fn download_bytes(&self, doc: &KnowledgeDocument) -> Result<Vec<u8>, ProviderError> {
        let token = self.app_token().await?;
        let url = match (&doc.drive_id, &doc.drive_item_id) {
            (Some(drive), Some(item)) => format!(
                "{}/drives/{}/items/{}/content",
                self.base_url, drive, item
            ),
            _ => {
                let (host, path) = split_web_url(&doc.web_url)?;
                format!("{}/sites/{}:{}:/content", self.base_url, host, path)
            }
        };

        let response = self.http.get(&url).bearer_auth(&token).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, truncate_message(&message)));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn resolve_site(
        &self,
        hostname: &str,
        site_name: &str,
    ) -> Result<SiteInfo, ProviderError> {
        let token = self.app_token().await?;
        let url = format!(
            "{}/sites/{}:/sites/{}",
            self.base_url,
            hostname,
            urlencoding::encode(site_name)
        );
        let body = self.get_json(&url, &token).await?;
        Ok(SiteInfo {
            id: body["id"]
                .as_str()
                .ok_or_else(|| ProviderError::Parse("site response missing id".into()))?
                .to_string(),
            name: body["displayName"]
                .as_str()
                .unwrap_or(site_name)
                .to_string(),
            web_url: body["webUrl"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn get_page_parts(
        &self,
        site_id: &str,
        page_name: &str,
    ) -> Result<Vec<PagePart>, ProviderError> {
        let token = self.app_token().await?;
        let filter = format!("name eq '{}'", page_name.replace('\'', "''"));
        let url = format!(
            "{}/sites/{}/pages?$filter={}&$expand=webParts",
            self.base_url,
            site_id,
            urlencoding::encode(&filter)
        );
        let body = self.get_json(&url, &token).await?;

        let mut parts = Vec::new();
        let pages = body["value"].as_array().cloned().unwrap_or_default();
        if let Some(page) = pages.first() {
            for part in page["webParts"].as_array().unwrap_or(&Vec::new()) {
                parts.push(PagePart {
                    inner_html: part["innerHtml"].as_str().map(str::to_string),
                    text: part["data"]["properties"]["text"]
                        .as_str()
                        .map(str::to_string),
                });
            }
        }
        Ok(parts)
    }

    async fn probe_access(
        &self,
        document_id: &str,
        drive_id: Option<&str>,
        web_url: &str,
        user_token: &str,
    ) -> Result<(), ProviderError> {
        // Minimal metadata fetch with the delegated token. Drive items
        // are addressed directly; everything else goes through the
        // sharing-URL lookup so list items and pages probe the same way.
        let url = match drive_id {
            Some(drive) => format!(
                "{}/drives/{}/items/{}?$select=id",
                self.base_url, drive, document_id
            ),
            None => {
                let encoded =
                    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(web_url.as_bytes());
                format!(
                    "{}/shares/u!{}/driveItem?$select=id",
                    self.base_url, encoded
                )
            }
        };
        self.get_json(&url, user_token).await.map(|_| ())
    }

    async fn get_user_profile(&self, user_token: &str) -> Result<UserProfile, ProviderError> {
        let url = format!(
            "{}/me?$select=displayName,mail,jobTitle,department,companyName,officeLocation",
            self.base_url
        );
        let body = self.get_json(&url, user_token).await?;

        // Manager is best-effort: most tenants deny it for some users.
        let manager = self
            .get_json(&format!("{}/me/manager", self.base_url), user_token)
            .await
            .ok()
            .and_then(|m| m["displayName"].as_str().map(str::to_string));

        Ok(UserProfile {
            display_name: body["displayName"].as_str().map(str::to_string),
            mail: body["mail"].as_str().map(str::to_string),
            job_title: body["jobTitle"].as_str().map(str::to_string),
            department: body["department"].as_str().map(str::to_string),
            company_name: body["companyName"].as_str().map(str::to_string),
            office_location: body["officeLocation"].as_str().map(str::to_string),
            manager,
        })
    }
}

/// Split a document web URL into `(hostname, path)` for the
/// hostname-addressed content endpoint.
fn split_web_url(web_url: &str) -> Result<(String, String), ProviderError> {
    let stripped = web_url
        .strip_prefix("https://")
        .or_else(|| web_url.strip_prefix("http://"))
        .ok_or_else(|| ProviderError::Parse(format!("unsupported document URL: {}", web_url)))?;
    match stripped.split_once('/') {
        Some((host, path)) => Ok((host.to_string(), format!("/{}", path))),
        None => Err(ProviderError::Parse(format!(
            "document URL has no path: {}",
            web_url
        ))),
    }
}

/// Derive `(site_url, site_name)` from a document web URL.
///
/// Falls back to the URL origin when the path carries no `/sites/<name>`
/// segment.
fn site_from_web_url(web_url: &str) -> (String, String) {
    if let Some(idx) = web_url.find("/sites/") {
        let after = &web_url[idx + "/sites/".len()..];
        let name_end = after.find('/').unwrap_or(after.len());
        let site_name = &after[..name_end];
        let site_url = &web_url[..idx + "/sites/".len() + name_end];
        return (site_url.to_string(), site_name.to_string());
    }
    let origin_end = web_url
        .find("://")
        .map(|i| {
            web_url[i + 3..]
                .find('/')
                .map(|j| i + 3 + j)
                .unwrap_or(web_url.len())
        })
        .unwrap_or(web_url.len());
    (web_url[..origin_end].to_string(), String::new())
}

/// Bound error bodies quoted into error messages.
fn truncate_message(message: &str) -> String {
    const MAX: usize = 300;
    if message.chars().count() > MAX {
        let head: String = message.chars().take(MAX).collect();
        format!("{}…", head)
    } else {
        message.to_string()
    }
}
