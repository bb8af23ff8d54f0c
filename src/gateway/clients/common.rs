//! Shared HTTP plumbing and message/tool wire-format helpers used by the OpenAI-compatible
//! connector.
//!
//! Grounded on `cloudllm::clients::common` (the shared pooled [`reqwest::Client`] and
//! `send_with_native_tools` shape) and the original `core/llm/utils.py` (`tools_to_openai`,
//! `tools_to_custom_prompt`, `messages_to_openai`, `remove_thoughts_from_str`).

use crate::gateway::types::{ChatMessage, Content, Role, Tool, ToolCallOrError};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling, used by every connector instance
    /// so TLS sessions and DNS lookups stay warm across requests.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");

    static ref THINK_RE: Regex = Regex::new(r"(?s)<think>.*?</think>").expect("valid regex");
}

pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Strip `<think>...</think>` spans (non-greedy, dot-matches-newline) from a string.
pub fn strip_thoughts(text: &str) -> String {
    THINK_RE.replace_all(text, "").trim().to_string()
}

/// Apply [`strip_thoughts`] to every textual part of a message, leaving everything else as-is.
/// Idempotent: running it twice yields the same result as running it once, since the regex has
/// nothing left to match on its own output.
pub fn remove_thoughts(message: &ChatMessage) -> ChatMessage {
    let mut copy = message.clone();
    copy.content = match &message.content {
        Content::Text(s) => Content::Text(strip_thoughts(s)),
        Content::Parts(parts) => Content::Parts(
            parts
                .iter()
                .map(|p| match p {
                    crate::gateway::types::ChatContent::Text { text } => {
                        crate::gateway::types::ChatContent::Text {
                            text: strip_thoughts(text),
                        }
                    }
                    other => other.clone(),
                })
                .collect(),
        ),
    };
    copy
}

/// Convert `Tool`s to the OpenAI native `tools` array shape.
pub fn tools_to_openai(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let properties: serde_json::Map<String, Value> = tool
                .parameters
                .iter()
                .map(|(name, p)| {
                    (
                        name.clone(),
                        serde_json::json!({"type": p.param_type, "description": p.description}),
                    )
                })
                .collect();
            let required: Vec<&String> = tool.parameters.keys().collect();
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }
                }
            })
        })
        .collect()
}

/// Render `tools` into the textual prompt fragment used for unofficial (in-band) tool calling,
/// by filling a `{tools}` placeholder in `prompt_template`.
pub fn tools_to_custom_prompt(tools: &[Tool], prompt_template: &str) -> String {
    let mut descriptions = Vec::new();
    for tool in tools {
        let description = tool.description.trim_end_matches('.');
        let mut parameters = String::new();
        for (name, param) in &tool.parameters {
            parameters.push_str(&format!("  - {}: {}\n", name, param.description));
        }
        descriptions.push(
            format!("* {}: {}.\n{}\n", tool.name.to_lowercase(), description, parameters)
                .trim()
                .to_string(),
        );
    }
    prompt_template.replace("{tools}", &descriptions.join("\n"))
}

/// Translate a message's `tool_calls` into the upstream's structured format, dropping error
/// strings (they carry no resolved tool/params and were already surfaced as a `tool` message).
pub fn tool_calls_to_wire(tool_calls: &[ToolCallOrError]) -> Vec<Value> {
    tool_calls
        .iter()
        .filter_map(|tc| match tc {
            ToolCallOrError::Call(call) => Some(serde_json::json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.tool.name,
                    "arguments": serde_json::to_string(&call.params).unwrap_or_else(|_| "{}".to_string()),
                }
            })),
            ToolCallOrError::Error(_) => None,
        })
        .collect()
}

/// Serialise one [`ChatMessage`] to the upstream wire shape.
pub fn message_to_wire(message: &ChatMessage) -> Value {
    match message.role {
        Role::System => serde_json::json!({"role": "system", "content": message.text()}),
        Role::User => serde_json::json!({"role": "user", "content": message.text()}),
        Role::Assistant => {
            if message.tool_calls.is_empty() {
                serde_json::json!({"role": "assistant", "content": message.text()})
            } else {
                serde_json::json!({
                    "role": "assistant",
                    "content": Value::Null,
                    "tool_calls": tool_calls_to_wire(&message.tool_calls),
                })
            }
        }
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.text(),
        }),
    }
}

/// Flatten multi-part content to plain text, for connections configured `text_only`.
pub fn flatten_to_text(message: &ChatMessage) -> ChatMessage {
    let mut copy = message.clone();
    copy.content = Content::Text(message.text());
    copy
}
