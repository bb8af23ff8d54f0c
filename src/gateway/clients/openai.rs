//! The OpenAI-compatible connector: one instance per configured connection, wrapping either a
//! real OpenAI/Azure endpoint or an ollama server behind the same `chat()` contract.
//!
//! Grounded on `cloudllm::clients::openai_client`/`common::send_with_native_tools` for the wire
//! shape and the shared pooled client, and on `core/llm/proxy_chat_handler.py` +
//! `core/llm/response_openai.py`/`response_custom.py` for the nine-step `chat()` contract.

use crate::gateway::clients::common::{
    get_shared_http_client, message_to_wire, remove_thoughts, strip_thoughts, tools_to_custom_prompt,
    tools_to_openai,
};
use crate::gateway::config::ModelConnectionSpec;
use crate::gateway::error::GatewayError;
use crate::gateway::response::{
    native, custom, LlmResponse, UpstreamDelta, UpstreamDeltaToolCall, UpstreamMessage,
    UpstreamMessageToolCall,
};
use crate::gateway::types::{ChatMessage, Tool};
use futures_util::StreamExt;
use serde_json::Value;

const DEFAULT_CUSTOM_TOOL_CALL_PROMPT: &str = include_str!("../templates/custom_tool_call_prompt.md");

/// One configured upstream connection, fully resolved: its endpoint, credentials, and per-call
/// behavior flags.
pub struct OpenAiConnector {
    endpoint: String,
    api_key: String,
    provider: String,
    /// The concrete model id this connector sends upstream (post-AUTODETECT resolution).
    model: String,
    name_prefix: String,
    unofficial_toolcalling: bool,
    no_think: bool,
    system_prompt_last: bool,
    never_stream: bool,
    text_only: bool,
    max_tokens: Option<u32>,
    custom_tool_call_prompt: String,
    api_version: Option<String>,
}

/// A resolved `logical name -> concrete upstream model id` pair returned by construction, so the
/// model provider can fold them into its registry in config order.
pub struct DiscoveredModel {
    pub logical_name: String,
    pub upstream_model: String,
}

impl OpenAiConnector {
    /// Build a connector for `spec`, autodetecting ollama's live model list when requested.
    /// Returns one connector plus every logical name it answers to (normally one, but ollama
    /// AUTODETECT with a server exposing N models over-registers to N).
    pub async fn construct(
        spec: &ModelConnectionSpec,
    ) -> Result<(Self, Vec<DiscoveredModel>), GatewayError> {
        let provider_lower = spec.provider.to_lowercase();
        let is_autodetect = spec.model == "AUTODETECT";

        if is_autodetect && provider_lower != "ollama" {
            return Err(GatewayError::ConfigError(format!(
                "model == \"AUTODETECT\" is only valid for provider \"ollama\" (got \"{}\")",
                spec.provider
            )));
        }

        let name_prefix = spec.config.name_prefix.clone().unwrap_or_default();

        let (model, discovered) = if is_autodetect {
            let tags_url = format!("{}/api/tags", spec.api_endpoint.trim_end_matches('/'));
            let resp = get_shared_http_client()
                .get(&tags_url)
                .send()
                .await
                .map_err(|e| GatewayError::ConfigError(format!("ollama autodetect failed: {}", e)))?;
            let body: Value = resp
                .json()
                .await
                .map_err(|e| GatewayError::ConfigError(format!("ollama autodetect response: {}", e)))?;
            let models: Vec<String> = body
                .get("models")
                .and_then(|m| m.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|m| m.get("name").and_then(|n| n.as_str()).map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if models.is_empty() {
                return Err(GatewayError::ConfigError(format!(
                    "ollama server at {} reported no models",
                    spec.api_endpoint
                )));
            }
            let discovered = models
                .iter()
                .map(|m| DiscoveredModel {
                    logical_name: format!("{}{}", name_prefix, m),
                    upstream_model: m.clone(),
                })
                .collect();
            // The connector itself is bound to whichever model the caller asks `chat()` for, so
            // there is no single "the" model here; callers always pass the resolved upstream id.
            (String::new(), discovered)
        } else {
            let logical = spec.config.name.clone().unwrap_or_else(|| spec.model.clone());
            (
                spec.model.clone(),
                vec![DiscoveredModel {
                    logical_name: logical,
                    upstream_model: spec.model.clone(),
                }],
            )
        };

        let api_version = if provider_lower == "azureopenai" {
            Some(
                spec.config
                    .api_version
                    .clone()
                    .unwrap_or_else(|| "2024-02-01".to_string()),
            )
        } else {
            None
        };

        Ok((
            OpenAiConnector {
                endpoint: spec.api_endpoint.clone(),
                api_key: spec.api_key.clone(),
                provider: spec.provider.clone(),
                model,
                name_prefix,
                unofficial_toolcalling: spec.config.unofficial_toolcalling,
                no_think: spec.config.no_think,
                system_prompt_last: spec.config.system_prompt_last,
                never_stream: spec.config.never_stream,
                text_only: spec.config.text_only,
                max_tokens: spec.config.max_tokens,
                custom_tool_call_prompt: spec
                    .config
                    .custom_tool_call_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CUSTOM_TOOL_CALL_PROMPT.to_string()),
                api_version,
            },
            discovered,
        ))
    }

    /// The endpoint this connector talks to — used by diagnostics and by tests that need to tell
    /// two connectors apart without making a live call.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn chat_url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        match &self.api_version {
            Some(v) => format!("{}/chat/completions?api-version={}", base, v),
            None => format!("{}/chat/completions", base),
        }
    }

    /// Run the nine-step `chat()` contract and return the resulting [`LlmResponse`].
    #[allow(clippy::too_many_arguments)]
    pub async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Vec<Tool>,
        system_prompt: String,
        remove_thoughts_flag: bool,
        stream: bool,
    ) -> Result<LlmResponse, GatewayError> {
        // 1. Strip <think>...</think> from history when requested.
        let mut history: Vec<ChatMessage> = if remove_thoughts_flag {
            messages.iter().map(remove_thoughts).collect()
        } else {
            messages
        };

        // 6b. text_only flattens multi-part content before wire serialization.
        if self.text_only {
            history = history
                .iter()
                .map(crate::gateway::clients::common::flatten_to_text)
                .collect();
        }

        // 3. Unofficial tool calling renders a prompt fragment appended to the system prompt.
        let mut system_prompt = system_prompt;
        if !tools.is_empty() && self.unofficial_toolcalling {
            let fragment = tools_to_custom_prompt(&tools, &self.custom_tool_call_prompt);
            system_prompt = format!("{}\n\n{}", system_prompt, fragment);
        }

        // 4. no_think suffix.
        if self.no_think {
            system_prompt.push_str(" /no_think");
        }

        // 5. Place the system prompt first or last per connection config.
        let system_message = ChatMessage::system(system_prompt);
        let mut wire_messages: Vec<Value> = Vec::with_capacity(history.len() + 1);
        if !self.system_prompt_last {
            wire_messages.push(message_to_wire(&system_message));
        }
        wire_messages.extend(history.iter().map(message_to_wire));
        if self.system_prompt_last {
            wire_messages.push(message_to_wire(&system_message));
        }

        // 6a. never_stream forces buffered mode regardless of the caller's request.
        let effective_stream = stream && !self.never_stream;

        // 7. Native tools forwarded only when not using the in-band convention.
        let forward_native_tools = !tools.is_empty() && !self.unofficial_toolcalling;

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": effective_stream,
        });
        if forward_native_tools {
            body["tools"] = Value::Array(tools_to_openai(&tools));
        }
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = Value::from(max_tokens);
        }

        // 8. Call upstream.
        let response = get_shared_http_client()
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamError(format!("request to {} failed: {}", self.endpoint, e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::UnknownModel(model.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamError(format!(
                "upstream returned {}: {}",
                status, text
            )));
        }

        // 9. Dispatch to one of the four response shapes.
        if effective_stream {
            self.stream_response(response, tools).await
        } else {
            self.buffered_response(response, tools).await
        }
    }

    async fn stream_response(
        &self,
        response: reqwest::Response,
        tools: Vec<Tool>,
    ) -> Result<LlmResponse, GatewayError> {
        let unofficial = self.unofficial_toolcalling;
        let byte_stream = response.bytes_stream();
        let delta_stream = sse_deltas(byte_stream);

        if unofficial {
            Ok(custom::parse_stream(delta_stream, tools))
        } else {
            Ok(native::parse_stream(delta_stream, tools))
        }
    }

    async fn buffered_response(
        &self,
        response: reqwest::Response,
        tools: Vec<Tool>,
    ) -> Result<LlmResponse, GatewayError> {
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamError(format!("invalid upstream JSON: {}", e)))?;

        let choice = body
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| GatewayError::UpstreamError("upstream response had no choices".to_string()))?;

        let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str());
        if finish_reason == Some("error") {
            let content = choice
                .pointer("/message/content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return Err(GatewayError::UpstreamError(content.to_string()));
        }

        let message = choice.get("message").cloned().unwrap_or(Value::Null);
        let content = message.get("content").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|tc| UpstreamMessageToolCall {
                        id: tc.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        name: tc
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: tc
                            .pointer("/function/arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let upstream_message = UpstreamMessage {
            content,
            tool_calls,
            finish_reason: finish_reason.map(str::to_string),
        };

        if self.unofficial_toolcalling {
            Ok(custom::parse_buffered(upstream_message.content, tools))
        } else {
            Ok(native::parse_buffered(upstream_message, tools))
        }
    }
}

/// Turn an SSE byte stream (`data: {json}\n\n` frames, terminated by `data: [DONE]`) into a
/// stream of [`UpstreamDelta`]s.
fn sse_deltas(
    byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures_util::Stream<Item = UpstreamDelta> + Send + 'static {
    let state = (Box::pin(byte_stream), String::new());
    futures_util::stream::unfold(state, |(mut bytes, mut carry)| async move {
        loop {
            if let Some(pos) = carry.find("\n\n") {
                let frame = carry[..pos].to_string();
                carry.drain(..pos + 2);
                if let Some(delta) = parse_sse_frame(&frame) {
                    return Some((delta, (bytes, carry)));
                }
                continue;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => {
                    carry.push_str(&String::from_utf8_lossy(&chunk));
                    continue;
                }
                Some(Err(_)) | None => return None,
            }
        }
    })
}

fn parse_sse_frame(frame: &str) -> Option<UpstreamDelta> {
    let data = frame.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return None;
    }
    let parsed: Value = serde_json::from_str(data).ok()?;
    let choice = parsed.get("choices")?.as_array()?.first()?;
    let delta = choice.get("delta")?;
    let content = delta.get("content").and_then(|v| v.as_str()).map(str::to_string);
    let tool_calls = delta
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let index = tc.get("index")?.as_u64()? as usize;
                    Some(UpstreamDeltaToolCall {
                        index,
                        id: tc.get("id").and_then(|v| v.as_str()).map(str::to_string),
                        name: tc
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        arguments: tc
                            .pointer("/function/arguments")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).map(str::to_string);

    Some(UpstreamDelta {
        content,
        tool_calls,
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_parses_content_delta() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}";
        let delta = parse_sse_frame(frame).expect("frame should parse");
        assert_eq!(delta.content.as_deref(), Some("hi"));
    }

    #[test]
    fn sse_done_marker_yields_none() {
        assert!(parse_sse_frame("data: [DONE]").is_none());
    }
}
