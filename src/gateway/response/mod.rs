//! Tool-call response parsing: the streamed/buffered response abstraction plus its two
//! implementations (native structured tool calls, in-band `[CALL] {...}` text convention).
//!
//! Grounded on the original `core/llm/types.py::LLMResponse` (a `stream` property that can only
//! be consumed once, after which `text`/`tool_calls` become valid) and
//! `core/llm/response_openai.py` / `core/llm/response_custom.py` for the two parsers themselves.

pub mod custom;
pub mod native;

use crate::gateway::error::GatewayError;
use crate::gateway::types::{Tool, ToolCallOrError};
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

pub type TokenStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A single raw delta from an upstream streaming chat-completion response.
#[derive(Debug, Clone, Default)]
pub struct UpstreamDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<UpstreamDeltaToolCall>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamDeltaToolCall {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// A full, non-streamed upstream chat-completion message.
#[derive(Debug, Clone, Default)]
pub struct UpstreamMessage {
    pub content: String,
    pub tool_calls: Vec<UpstreamMessageToolCall>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamMessageToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Post-stream state shared between the `TokenStream` being drained and the `LlmResponse` handle
/// the caller holds. `drained` is the post-condition flag design note §9 asks for: `tool_calls()`
/// and `text()` panic with a [`GatewayError`] if read before the stream finishes.
struct Shared {
    drained: AtomicBool,
    tool_calls: AsyncMutex<Vec<ToolCallOrError>>,
    raw_text: AsyncMutex<String>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            drained: AtomicBool::new(false),
            tool_calls: AsyncMutex::new(Vec::new()),
            raw_text: AsyncMutex::new(String::new()),
        })
    }
}

/// Either a native-parsed or in-band-parsed response, streamed or pre-buffered. Exposes the one
/// capability set spec.md's design notes call for: `stream()`, `tool_calls()`, `text()`.
pub struct LlmResponse {
    stream: Option<TokenStream>,
    shared: Arc<Shared>,
}

impl LlmResponse {
    fn new(stream: TokenStream, shared: Arc<Shared>) -> Self {
        LlmResponse {
            stream: Some(stream),
            shared,
        }
    }

    /// Consume the response, yielding tokens in order. Can only be called once; the second call
    /// returns an empty stream since the caller already owns the first one.
    pub fn stream(&mut self) -> TokenStream {
        self.stream
            .take()
            .unwrap_or_else(|| Box::pin(futures_util::stream::empty()))
    }

    /// The tool calls (and parse-failure error strings) the response carried. Only valid once the
    /// stream returned by [`Self::stream`] has been fully drained.
    pub async fn tool_calls(&self) -> Result<Vec<ToolCallOrError>, GatewayError> {
        if !self.shared.drained.load(Ordering::Acquire) {
            return Err(GatewayError::Other(
                "LlmResponse::tool_calls() called before the stream was drained".into(),
            ));
        }
        Ok(self.shared.tool_calls.lock().await.clone())
    }

    /// The full text of the response. Only valid once the stream has been fully drained.
    pub async fn text(&self) -> Result<String, GatewayError> {
        if !self.shared.drained.load(Ordering::Acquire) {
            return Err(GatewayError::Other(
                "LlmResponse::text() called before the stream was drained".into(),
            ));
        }
        Ok(self.shared.raw_text.lock().await.clone())
    }
}

/// Find `tools` by case-insensitive name match.
pub(crate) fn find_tool<'a>(name: &str, tools: &'a [Tool]) -> Option<&'a Tool> {
    let lower = name.to_lowercase();
    tools.iter().find(|t| t.name.to_lowercase() == lower)
}
