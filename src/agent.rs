//! Chat agent core.
//!
//! Drives a tool-calling conversation with the chat model until it
//! produces a final assistant message. The core adds no reasoning of its
//! own beyond the system prompt template and the permission filter that
//! lives inside `knowledge_search` — the model decides which tools to
//! call and when to stop.
//!
//! # Loop shape
//!
//! ```text
//! system prompt + history
//!        │
//!        ▼
//!   model.complete ──── tool_calls? ──no──▶ final assistant message
//!        ▲                   │yes
//!        │                   ▼
//!        └──── tool results ◀─ execute all calls concurrently
//! ```
//!
//! A single assistant turn may request several tool calls; they run
//! concurrently and their results are appended in call order, so the
//! transcript the model sees next turn is deterministic. Tool failures
//! and timeouts become tool error strings — the model may retry with a
//! different call — and only a model failure surfaces to the caller.

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use anyhow::Result;

use crate::embedding::Embedder;
use crate::extract::ContentExtractor;
use crate::graph::DocumentProvider;
use crate::llm::{ChatModel, ToolCall, WireMessage};
use crate::models::{
    AuthenticatedUser, ChatContext, ChatMessage, ChatRole, SearchMode,
};
use crate::tools::{build_registry, ToolContext, ToolRegistry};
use crate::vector_store::VectorIndex;

/// Upper bound on model ↔ tool round trips per request.
const MAX_TOOL_ITERATIONS: usize = 8;

/// Everything a chat request needs, shared across requests.
///
/// Each request builds its own tool registry and permission cache from
/// this; no mutable state is shared between concurrent requests.
pub struct ChatCore {
    pub model: Arc<dyn ChatModel>,
    pub provider: Arc<dyn DocumentProvider>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub extractor: Arc<dyn ContentExtractor>,
    /// Mode used when the request does not pick one.
    pub default_mode: SearchMode,
    /// Route retrieval through the hybrid query path.
    pub use_hybrid: bool,
    /// Timeout applied to each tool execution.
    pub tool_timeout: Duration,
}

/// Result of one chat turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// The new assistant message.
    pub response: String,
    /// Original conversation plus the new assistant message.
    pub messages: Vec<ChatMessage>,
    /// The mode the request effectively ran in.
    pub search_mode: SearchMode,
}

impl ChatCore {
    /// Run one chat turn for an authenticated user.
    pub async fn handle(
        &self,
        user: AuthenticatedUser,
        mut messages: Vec<ChatMessage>,
        context: ChatContext,
    ) -> Result<ChatOutcome> {
        let mode = context.search_mode.unwrap_or(self.default_mode);

        let tool_ctx = Arc::new(ToolContext {
            provider: self.provider.clone(),
            embedder: self.embedder.clone(),
            index: self.index.clone(),
            extractor: self.extractor.clone(),
            user: user.clone(),
            site_url: context.site_url.clone(),
            use_hybrid: self.use_hybrid,
        });
        let registry = build_registry(mode, tool_ctx);
        debug!(mode = %mode, tools = ?registry.names(), "built request tool set");

        let prompt = build_system_prompt(&user, mode, Utc::now());
        let agent = ChatAgent {
            model: self.model.clone(),
            registry,
            tool_timeout: self.tool_timeout,
        };
        let response = agent.run(&prompt, &messages).await?;

        messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: response.clone(),
        });
        Ok(ChatOutcome {
            response,
            messages,
            search_mode: mode,
        })
    }
}

/// One request's agent: a model handle plus the request's tool set.
struct ChatAgent {
    model: Arc<dyn ChatModel>,
    registry: ToolRegistry,
    tool_timeout: Duration,
}

impl ChatAgent {
    /// Drive the model until it stops calling tools, returning its final
    /// text.
    async fn run(&self, system_prompt: &str, history: &[ChatMessage]) -> Result<String> {
        let mut wire = vec![WireMessage::system(system_prompt)];
        for message in history {
            wire.push(match message.role {
                ChatRole::System => WireMessage::system(message.content.clone()),
                ChatRole::User => WireMessage::user(message.content.clone()),
                ChatRole::Assistant => WireMessage::assistant(message.content.clone()),
            });
        }
        let definitions = self.registry.definitions();

        for iteration in 0..MAX_TOOL_ITERATIONS {
            let turn = self.model.complete(&wire, &definitions).await?;

            if turn.tool_calls.is_empty() {
                return Ok(turn.content.unwrap_or_default());
            }

            debug!(
                iteration,
                calls = turn.tool_calls.len(),
                "executing tool calls"
            );
            wire.push(WireMessage::assistant_tool_calls(
                turn.content.clone(),
                &turn.tool_calls,
            ));

            // Execute every call from this turn concurrently, then append
            // results in call order so the transcript stays deterministic.
            let results = join_all(
                turn.tool_calls
                    .iter()
                    .map(|call| self.execute_tool_call(call)),
            )
            .await;
            for (call, result) in turn.tool_calls.iter().zip(results) {
                wire.push(WireMessage::tool_result(call.id.clone(), result));
            }
        }

        // The model never settled; ask once more without tools so the
        // caller still gets an answer.
        warn!("tool iteration limit reached, forcing a final answer");
        let turn = self.model.complete(&wire, &[]).await?;
        Ok(turn
            .content
            .unwrap_or_else(|| "I was unable to complete the request.".to_string()))
    }

    /// Execute one tool call, converting every failure into a tool error
    /// string for the model.
    async fn execute_tool_call(&self, call: &ToolCall) -> String {
        let Some(tool) = self.registry.find(&call.name) else {
            return format!("Error: unknown tool '{}'", call.name);
        };
        let arguments = match serde_json::from_str(&call.arguments) {
            Ok(value) => value,
            Err(e) => return format!("Error: invalid tool arguments: {}", e),
        };

        match tokio::time::timeout(self.tool_timeout, tool.execute(arguments)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(tool = call.name, error = %e, "tool call failed");
                format!("Error: {:#}", e)
            }
            Err(_) => {
                warn!(tool = call.name, "tool call timed out");
                format!(
                    "Error: {} timed out after {} seconds",
                    call.name,
                    self.tool_timeout.as_secs()
                )
            }
        }
    }
}

/// Compose the system prompt: base identity block, mode-specific tools
/// block, common closing instructions.
pub fn build_system_prompt(
    user: &AuthenticatedUser,
    mode: SearchMode,
    now: DateTime<Utc>,
) -> String {
    let base = format!(
        "You are a knowledge assistant for the company intranet.\n\
         You are speaking with {} ({}).\n\
         The current UTC time is {}.",
        user.name,
        user.email,
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    let tools_block = match mode {
        SearchMode::Rag => {
            "Available tools:\n\
             - knowledge_search: searches the indexed knowledge base. Pass the user's \
             question verbatim as the query. Do not rephrase, augment, or split it.\n\
             - get_current_site: returns the site this conversation is scoped to.\n\
             - get_current_user: returns the current user's profile.\n\
             - read_file_content: reads one document in full, given its driveId, itemId, and name.\n\
             Always call knowledge_search before answering a content question."
        }
        SearchMode::Kql => {
            "Available tools:\n\
             - sharepoint_search: searches the current site. Pass only 1-3 topic keywords \
             as the query. Do not include user-specific context, names, or full sentences.\n\
             - get_current_site: returns the site this conversation is scoped to.\n\
             - get_current_user: returns the current user's profile.\n\
             - read_file_content: reads one document in full, given its driveId, itemId, and name.\n\
             Use sharepoint_search to locate documents, then read_file_content for details."
        }
    };

    let closing = "When answering:\n\
         - Prefer hedged phrasing such as \"it appears that...\" over absolute statements.\n\
         - Include short verbatim quotes from the sources to support claims.\n\
         - End the answer by citing the webUrl of every source you used.";

    format!("{}\n\n{}\n\n{}", base, tools_block, closing)
}
