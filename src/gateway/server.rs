//! The OpenAI-compatible HTTP surface: `/chat/completions`, `/models`, `/workspaces`.
//!
//! Grounded on `api/server.py::create_openai_api`: a per-request bounded queue feeds a background
//! handler task, the response body drains that queue either as SSE chunks or one buffered JSON
//! object; CORS and the `RequestValidationError` -> 422 mapping are carried over as the axum/tower
//! equivalents the original's FastAPI middleware implements.

use crate::gateway::config::GatewayConfig;
use crate::gateway::handler::ChatHandlerRegistry;
use crate::gateway::output_writer::OutputWriter;
use crate::gateway::types::{ChatMessage, Content, Role};
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::cors::{Any, CorsLayer};

pub struct AppState {
    pub registry: Arc<ChatHandlerRegistry>,
    pub workspaces: std::collections::HashMap<String, String>,
}

/// Build the axum router: three routes plus a permissive CORS layer, matching §6's "any origin,
/// {GET,POST,PUT,DELETE,OPTIONS}, credentials allowed" policy.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/models", get(list_models))
        .route("/workspaces", get(list_workspaces))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct IncomingContentPart {
    #[serde(rename = "type")]
    part_type: String,
    text: Option<String>,
    image_url: Option<IncomingImageUrl>,
}

#[derive(Debug, Deserialize)]
struct IncomingImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IncomingContent {
    Text(String),
    Parts(Vec<IncomingContentPart>),
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    content: IncomingContent,
    #[serde(default)]
    tool_call_id: Option<String>,
}

impl From<IncomingMessage> for ChatMessage {
    fn from(msg: IncomingMessage) -> Self {
        let role = match msg.role.as_str() {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        };
        let content = match msg.content {
            IncomingContent::Text(s) => Content::Text(s),
            IncomingContent::Parts(parts) => Content::Parts(
                parts
                    .into_iter()
                    .map(|p| match p.part_type.as_str() {
                        "image_url" => crate::gateway::types::ChatContent::ImageUrl {
                            image_url: crate::gateway::types::ImageUrl {
                                url: p.image_url.map(|i| i.url).unwrap_or_default(),
                            },
                        },
                        _ => crate::gateway::types::ChatContent::Text {
                            text: p.text.unwrap_or_default(),
                        },
                    })
                    .collect(),
            ),
        };
        ChatMessage {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: msg.tool_call_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    #[allow(dead_code)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    workspace: Option<String>,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatCompletionRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return handle_json_rejection(rejection).await.into_response(),
    };
    let history: Vec<ChatMessage> = request.messages.into_iter().map(ChatMessage::from).collect();
    let workspace = request
        .workspace
        .filter(|w| state.workspaces.contains_key(w))
        .or_else(|| state.workspaces.keys().next().cloned());

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(1);
    let output = OutputWriter::with_queue(tx);

    let handler = state.registry.get_handler(&request.model);
    let completion_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let model = request.model.clone();

    match handler {
        Ok(handler) => {
            tokio::spawn(async move {
                if let Err(e) = handler.handle(history, workspace, output).await {
                    log::error!("handler for model '{}' failed: {}", model, e);
                }
            });
        }
        Err(e) => {
            tokio::spawn(async move {
                let mut output = OutputWriter::with_queue(tx);
                output
                    .default(&format!("Unexpected error occured:\n\n```\n{}\n```\n", e))
                    .await;
                output.clear().await;
            });
        }
    }

    if request.stream {
        sse_response(rx, completion_id, request.model).into_response()
    } else {
        buffered_response(rx, completion_id, request.model).await.into_response()
    }
}

fn chunk_json(id: &str, model: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": now_unix(),
        "model": model,
        "choices": [{"delta": {"content": content, "role": "assistant"}}],
    })
}

/// One token at a time off the channel, each emitted as its own SSE frame as soon as it arrives;
/// the empty-string sentinel `clear()` sends at end-of-turn ends the stream and appends `[DONE]`.
fn sse_response(
    rx: tokio::sync::mpsc::Receiver<String>,
    id: String,
    model: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let tokens = futures_util::stream::unfold(rx, move |mut rx| async move {
        match rx.recv().await {
            Some(token) if !token.is_empty() => Some((token, rx)),
            _ => None,
        }
    });
    let frames = tokens
        .map(move |token| Event::default().data(chunk_json(&id, &model, &token).to_string()))
        .chain(futures_util::stream::once(async { Event::default().data("[DONE]") }))
        .map(Ok);
    Sse::new(frames)
}

use futures_util::StreamExt;

async fn buffered_response(mut rx: tokio::sync::mpsc::Receiver<String>, id: String, model: String) -> Json<serde_json::Value> {
    let mut text = String::new();
    while let Some(token) = rx.recv().await {
        if token.is_empty() {
            break;
        }
        text.push_str(&token);
    }
    Json(serde_json::json!({
        "id": id,
        "object": "chat.completion",
        "created": now_unix(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop",
        }],
    }))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .registry
        .list_handlers()
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": now_unix(),
                "owned_by": "micro-graph",
            })
        })
        .collect();
    Json(serde_json::json!({"object": "list", "data": models}))
}

async fn list_workspaces(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.workspaces.keys().cloned().collect())
}

#[derive(Debug, Serialize)]
struct ValidationErrorBody {
    error: String,
}

/// Flattens an axum JSON-rejection into the 422 shape §6 calls for.
pub async fn handle_json_rejection(rejection: axum::extract::rejection::JsonRejection) -> impl IntoResponse {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ValidationErrorBody {
            error: rejection.body_text(),
        }),
    )
}

pub fn workspaces_from_config(config: &GatewayConfig) -> std::collections::HashMap<String, String> {
    config.workspaces.clone()
}
