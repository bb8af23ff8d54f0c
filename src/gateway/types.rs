//! Shared chat message, tool, and tool-call data model.
//!
//! Mirrors [`crate::cloudllm::client_wrapper::Message`]/`Role` in shape (role enum, `Arc<str>`
//! content) but widens `content` to the multi-part `ChatContent` form the connector's wire format
//! needs, and widens `Role::Tool` into a plain field rather than an enum variant carrying the id,
//! since tool-role messages here also carry a `tool_call_id` separately from assistant-role
//! messages carrying `tool_calls`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// One part of a multi-part chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContent {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Either a single in-progress string, or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ChatContent>),
}

impl Content {
    /// First textual part, or the whole string content.
    pub fn text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .find_map(|p| match p {
                    ChatContent::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation the model requested, already resolved against the visible tool set.
///
/// Stored inline in an assistant message's `tool_calls`; an unresolved/unparseable entry is kept
/// as the plain error string instead (see [`ToolCallOrError`]). Not `Deserialize`: a `Tool` carries
/// a live callable, so these are only ever constructed internally by the response parsers, never
/// read back from wire JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: Tool,
    pub params: Value,
}

/// Either a resolved `ToolCall`, or the error string the parser produced instead of one — the
/// in-band and native parsers both emit this mixed list, and the runner turns every error string
/// into a synthetic `tool`-role message rather than ever raising.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolCallOrError {
    Call(ToolCall),
    Error(String),
}

/// A chat message as passed between the runner, the connectors, and the HTTP layer. Serializable
/// for outgoing responses/logging; incoming request bodies are parsed into a separate wire type
/// at the HTTP boundary and converted, since assistant `tool_calls` there carry no live `Tool`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallOrError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallOrError>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: Content::Text(content.into()),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::System,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// First textual part, or the whole content if it is plain text.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// A single named, typed parameter of a [`Tool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
}

/// The result returned by invoking a tool callable — always reduced to a plain string before it
/// reaches the model, but callables are free to fail in a way the runner can still report.
pub type ToolCallableResult = Pin<Box<dyn Future<Output = String> + Send>>;

/// A callable exposed to the model. `name` is a dotted path (`namespace.sub.leaf`); a `.__main__`
/// suffix marks a namespace anchor (see tool visibility policy in the multi-agent runner).
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: HashMap<String, ToolParameter>,
    pub callable: Arc<dyn Fn(Value) -> ToolCallableResult + Send + Sync>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl serde::Serialize for Tool {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Tool", 3)?;
        s.serialize_field("name", &self.name)?;
        s.serialize_field("description", &self.description)?;
        s.serialize_field("parameters", &self.parameters)?;
        s.end()
    }
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: HashMap<String, ToolParameter>,
        callable: impl Fn(Value) -> ToolCallableResult + Send + Sync + 'static,
    ) -> Self {
        Tool {
            name: name.into(),
            description: description.into(),
            parameters,
            callable: Arc::new(callable),
        }
    }

    /// Whether this is a namespace anchor (`*.__main__`) — see §4.6's tool visibility policy.
    pub fn is_namespace_anchor(&self) -> bool {
        self.name.ends_with(".__main__")
    }

    pub async fn call(&self, params: Value) -> String {
        (self.callable)(params).await
    }
}

/// A token-usage report, reported by connectors that surface one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}
