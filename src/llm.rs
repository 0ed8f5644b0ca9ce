//! Chat completion client with tool calling.
//!
//! Defines the [`ChatModel`] trait the agent loop drives, the wire types
//! for a tool-calling conversation, and the production
//! [`AzureChatClient`] for an Azure OpenAI chat deployment.
//!
//! The agent only needs one operation: send the conversation so far plus
//! the available tool definitions, get back either assistant text or a
//! set of tool calls (or both). Everything else — deciding when to stop,
//! executing tools, appending results — lives in [`crate::agent`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::OpenAiConfig;

/// Errors from the chat completion service.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("chat completion failed (HTTP {status}): {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed completion response: {0}")]
    Parse(String),
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Call id echoed back in the tool-result message.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments, passed through verbatim.
    pub arguments: String,
}

/// A tool exposed to the model, in function-calling form.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// One message on the completion wire.
///
/// Built through the constructors below so role/field combinations stay
/// consistent: tool results always carry a `tool_call_id`, assistant
/// tool-call turns carry `tool_calls`, everything else is plain content.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    fn text(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: Option<String>, calls: &[ToolCall]) -> Self {
        let wire_calls: Vec<Value> = calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments }
                })
            })
            .collect();
        Self {
            role: "assistant",
            content,
            tool_calls: Some(json!(wire_calls)),
            tool_call_id: None,
        }
    }

    /// Result of executing one tool call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// What the model produced for one turn.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    /// Assistant text, present on final answers (and sometimes alongside
    /// tool calls).
    pub content: Option<String>,
    /// Tool calls to execute before the next model turn. Empty means the
    /// turn is final.
    pub tool_calls: Vec<ToolCall>,
}

/// Seam between the agent loop and the completion service.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[WireMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantTurn, LlmError>;
}

/// Production [`ChatModel`] for an Azure OpenAI chat deployment.
pub struct AzureChatClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl AzureChatClient {
    pub fn new(config: &OpenAiConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            config.endpoint.trim_end_matches('/'),
            config.deployment,
            config.api_version
        );
        Ok(Self {
            http,
            url,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for AzureChatClient {
    async fn complete(
        &self,
        messages: &[WireMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantTurn, LlmError> {
        let mut body = json!({ "messages": messages });
        if !tools.is_empty() {
            body["tools"] = json!(tools.iter().map(|t| t.to_wire()).collect::<Vec<_>>());
            body["tool_choice"] = json!("auto");
        }

        let response = self
            .http
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Http { status, message });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        parse_assistant_turn(&payload).map_err(LlmError::Parse)
    }
}

/// Extract the assistant turn from a completion response.
fn parse_assistant_turn(payload: &Value) -> Result<AssistantTurn, String> {
    let message = payload["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .map(|choice| &choice["message"])
        .ok_or_else(|| "response has no choices".to_string())?;

    let content = message["content"].as_str().map(str::to_string);

    let mut tool_calls = Vec::new();
    for call in message["tool_calls"].as_array().unwrap_or(&Vec::new()) {
        let id = call["id"]
            .as_str()
            .ok_or_else(|| "tool call missing id".to_string())?
            .to_string();
        let name = call["function"]["name"]
            .as_str()
            .ok_or_else(|| "tool call missing function name".to_string())?
            .to_string();
        let arguments = call["function"]["arguments"]
            .as_str()
            .unwrap_or("{}")
            .to_string();
        tool_calls.push(ToolCall {
            id,
            name,
            arguments,
        });
    }

    Ok(AssistantTurn {
        content,
        tool_calls,
    })
}
