//! Native structured tool-call parsing.
//!
//! Grounded on `core/llm/response_openai.py::OpenAIToolCallingResponse(Stream)`: deltas are
//! coalesced by index into `{id, name, arguments}` as they arrive; at end-of-stream the
//! accumulated `arguments` string is parsed as JSON and matched against the visible tool list.

use super::{find_tool, Shared, TokenStream};
use crate::gateway::response::LlmResponse;
use crate::gateway::types::{Tool, ToolCall, ToolCallOrError};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use super::{UpstreamDelta, UpstreamMessage};

#[derive(Default, Clone)]
struct Partial {
    id: String,
    name: String,
    arguments: String,
}

fn resolve(partials: BTreeMap<usize, Partial>, tools: &[Tool]) -> Vec<ToolCallOrError> {
    partials
        .into_values()
        .map(|p| {
            let args: Value = if p.arguments.is_empty() {
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&p.arguments) {
                    Ok(v) => v,
                    Err(_) => Value::Object(Default::default()),
                }
            };
            match find_tool(&p.name, tools) {
                Some(tool) => ToolCallOrError::Call(ToolCall {
                    id: p.id,
                    tool: tool.clone(),
                    params: args,
                }),
                None => ToolCallOrError::Error(format!("Tool '{}' not found.", p.name)),
            }
        })
        .collect()
}

/// Parse a live stream of structured deltas into an [`LlmResponse`].
pub fn parse_stream(
    upstream: impl Stream<Item = UpstreamDelta> + Send + 'static,
    tools: Vec<Tool>,
) -> LlmResponse {
    let shared = Shared::new();
    let shared_for_stream = shared.clone();

    let state = (
        Box::pin(upstream),
        BTreeMap::<usize, Partial>::new(),
        tools,
        shared_for_stream,
    );

    let out = futures_util::stream::unfold(state, |(mut upstream, mut partials, tools, shared)| async move {
        loop {
            match upstream.next().await {
                Some(delta) => {
                    for tc in delta.tool_calls {
                        let entry = partials.entry(tc.index).or_default();
                        if let Some(id) = tc.id {
                            entry.id = id;
                        }
                        if let Some(name) = tc.name {
                            entry.name = name;
                        }
                        if let Some(args) = tc.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                    if let Some(content) = delta.content {
                        if !content.is_empty() {
                            shared.raw_text.lock().await.push_str(&content);
                            return Some((content, (upstream, partials, tools, shared)));
                        }
                    }
                    // Empty delta carrying only tool-call fragments: keep pulling without
                    // yielding a token.
                    continue;
                }
                None => {
                    let resolved = resolve(partials, &tools);
                    *shared.tool_calls.lock().await = resolved;
                    shared.drained.store(true, Ordering::Release);
                    return None;
                }
            }
        }
    });

    LlmResponse::new(Box::pin(out) as TokenStream, shared)
}

/// Parse a fully-buffered (non-streamed) upstream message into an [`LlmResponse`] whose `stream()`
/// yields the whole text as a single token — matching the original's `if isinstance(response, str):
/// response = [response]` wrapping in `proxy_chat_handler.py`.
pub fn parse_buffered(message: UpstreamMessage, tools: Vec<Tool>) -> LlmResponse {
    let shared = Shared::new();
    let mut partials = BTreeMap::new();
    for (idx, tc) in message.tool_calls.into_iter().enumerate() {
        partials.insert(
            idx,
            Partial {
                id: tc.id,
                name: tc.name,
                arguments: tc.arguments,
            },
        );
    }
    let resolved = resolve(partials, &tools);

    let text = message.content;
    let shared_clone = shared.clone();
    let text_for_buffer = text.clone();
    let out = futures_util::stream::once(async move {
        *shared_clone.raw_text.lock().await = text_for_buffer;
        *shared_clone.tool_calls.lock().await = resolved;
        shared_clone.drained.store(true, Ordering::Release);
        text
    });

    LlmResponse::new(Box::pin(out) as TokenStream, shared)
}
