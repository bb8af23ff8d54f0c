//! In-band `[CALL] {json}` tool-call parsing, for upstreams without native structured tool
//! calls.
//!
//! Grounded on `core/llm/response_custom.py`. The streaming variant is a small character-level
//! state machine (`plain` / `tag_buffering` / `bracket_buffering` / `thinking` /
//! `tool_call_collecting`) that classifies whole whitespace/bracket-delimited "words" as it goes,
//! exactly mirroring the Python generator's buffering logic token by token.

use super::{find_tool, Shared, TokenStream};
use crate::gateway::response::LlmResponse;
use crate::gateway::types::{Tool, ToolCall, ToolCallOrError};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use super::{UpstreamDelta, UpstreamMessage};

fn parse_tool_calls(buffer: &str, tools: &[Tool]) -> Vec<ToolCallOrError> {
    let mut out = Vec::new();
    for piece in buffer.split("[CALL]") {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let diagnostic = |e: &dyn std::fmt::Display| -> String {
            format!(
                "Failed to load tool call with the following error: `{}`.\n\n\
                 Detected Toolcall:\n```\n{}\n```\n\n\
                 Possible reasons are:\n\
                 \u{20}\u{20}- `Extra data`: You wrote something else after the tool call. The tool call has to be your last output.\n\
                 \u{20}\u{20}- `Keyerror`: Your json object did not adhere to the format requiring `parameters` and `name` on top level.\n\
                 Make sure your message ends on a tool call with no text after it and that it adheres to the correct format.",
                e, piece
            )
        };

        let parsed: Result<Value, _> = serde_json::from_str(piece);
        let spec = match parsed {
            Ok(v) => v,
            Err(e) => {
                out.push(ToolCallOrError::Error(diagnostic(&e)));
                continue;
            }
        };
        let name = spec.get("name").and_then(|n| n.as_str());
        let params = spec.get("parameters").cloned();
        match (name, params) {
            (Some(name), Some(params)) => match find_tool(name, tools) {
                Some(tool) => out.push(ToolCallOrError::Call(ToolCall {
                    id: Uuid::new_v4().to_string(),
                    tool: tool.clone(),
                    params,
                })),
                None => out.push(ToolCallOrError::Error(format!("Tool '{}' not found.", name))),
            },
            (None, _) => out.push(ToolCallOrError::Error(diagnostic(&"'name'"))),
            (Some(_), None) => out.push(ToolCallOrError::Error(diagnostic(&"'parameters'"))),
        }
    }
    out
}

/// The scanner's state between tokens.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Plain,
    Thinking,
    ToolCallCollecting,
}

struct Scanner {
    state: ScanState,
    buffer: String,
    tool_calls_buffer: String,
    has_tools: bool,
}

impl Scanner {
    fn new(has_tools: bool) -> Self {
        Scanner {
            state: ScanState::Plain,
            buffer: String::new(),
            tool_calls_buffer: String::new(),
            has_tools,
        }
    }

    /// Feed one incoming text chunk; returns the text that should be yielded to the client
    /// verbatim (possibly empty).
    fn feed(&mut self, chunk: &str) -> String {
        let mut out = String::new();

        for ch in chunk.chars() {
            if self.state == ScanState::ToolCallCollecting {
                self.tool_calls_buffer.push(ch);
                continue;
            }
            if ch == '<' {
                if !self.buffer.is_empty() {
                    out.push_str(&self.buffer);
                }
                self.buffer = ch.to_string();
            } else if ch == '[' && self.state != ScanState::Thinking {
                if !self.buffer.is_empty() {
                    out.push_str(&self.buffer);
                }
                self.buffer = ch.to_string();
            } else if !self.buffer.is_empty() {
                if matches!(ch, '>' | ']' | ' ' | '\n' | '\t') {
                    let mut word = std::mem::take(&mut self.buffer);
                    word.push(ch);
                    if word == "<think>" {
                        self.state = ScanState::Thinking;
                    }
                    if word == "</think>" {
                        self.state = ScanState::Plain;
                    }
                    if self.state != ScanState::Thinking && word == "[CALL]" && self.has_tools {
                        self.state = ScanState::ToolCallCollecting;
                        word.clear();
                    }
                    if !word.is_empty() {
                        out.push_str(&word);
                    }
                } else {
                    self.buffer.push(ch);
                }
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Whatever is left unflushed once the upstream closes (mirrors the Python generator's
    /// trailing `if buffer: yield buffer`).
    fn finish(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

/// Parse a live token stream using the in-band `[CALL]` scanner.
pub fn parse_stream(
    upstream: impl Stream<Item = UpstreamDelta> + Send + 'static,
    tools: Vec<Tool>,
) -> LlmResponse {
    let shared = Shared::new();
    let has_tools = !tools.is_empty();
    let state = (Box::pin(upstream), Scanner::new(has_tools), tools, shared.clone());

    let out = futures_util::stream::unfold(state, |(mut upstream, mut scanner, tools, shared)| async move {
        loop {
            match upstream.next().await {
                Some(delta) => {
                    let content = delta.content.unwrap_or_default();
                    if content.is_empty() {
                        continue;
                    }
                    shared.raw_text.lock().await.push_str(&content);
                    let yielded = scanner.feed(&content);
                    if yielded.is_empty() {
                        continue;
                    }
                    return Some((yielded, (upstream, scanner, tools, shared)));
                }
                None => {
                    let tail = scanner.finish();
                    let resolved = parse_tool_calls(scanner.tool_calls_buffer.trim(), &tools);
                    *shared.tool_calls.lock().await = resolved;
                    shared.drained.store(true, Ordering::Release);
                    if !tail.is_empty() {
                        return Some((tail, (upstream, scanner, tools, shared)));
                    }
                    return None;
                }
            }
        }
    });

    LlmResponse::new(Box::pin(out) as TokenStream, shared)
}

/// Parse a fully-buffered (non-streamed) response, grounded on
/// `CustomToolCallingResponse.__init__`: split the text on the first `[CALL]` rather than
/// scanning char by char, since there is no incremental client to stream to.
pub fn parse_buffered(raw_text: String, tools: Vec<Tool>) -> LlmResponse {
    let shared = Shared::new();
    let non_think = strip_thoughts(&raw_text);

    let (visible_text, tool_calls_buffer) = if !tools.is_empty() && non_think.contains("[CALL]") {
        let mut parts = non_think.splitn(2, "[CALL]");
        let _before = parts.next().unwrap_or("");
        let calls = format!("[CALL]{}", parts.next().unwrap_or(""));
        let visible = raw_text.replace(&calls, "");
        (visible, calls)
    } else {
        (raw_text.clone(), String::new())
    };

    let resolved = parse_tool_calls(tool_calls_buffer.trim(), &tools);
    let shared_clone = shared.clone();
    let out = futures_util::stream::once(async move {
        *shared_clone.raw_text.lock().await = visible_text.clone();
        *shared_clone.tool_calls.lock().await = resolved;
        shared_clone.drained.store(true, Ordering::Release);
        visible_text
    });

    LlmResponse::new(Box::pin(out) as TokenStream, shared)
}

/// `<think>...</think>` removal, non-greedy, dot-matches-newline — used here only to locate the
/// `[CALL]` span outside of thought regions (the connector's own `remove_thoughts` step is
/// separate and operates on history, not on this response).
fn strip_thoughts(text: &str) -> String {
    crate::gateway::clients::common::strip_thoughts(text)
}
