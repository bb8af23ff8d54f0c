//! Named chat handlers plus the registry that resolves a request's `model` field to one.
//!
//! Grounded on `api/chat_handler.py::ChatHandlerRegistry`: a static `name -> handler` map plus an
//! ordered list of providers, consulted in *reverse* registration order so a provider registered
//! later can shadow one registered earlier; first hit wins, miss raises with the full known list.

use crate::gateway::agents::Runner;
use crate::gateway::error::GatewayError;
use crate::gateway::model_provider::ModelProvider;
use crate::gateway::output_writer::OutputWriter;
use crate::gateway::types::ChatMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send>>;

/// A named conversation handler: given history, an optional workspace, and an output writer to
/// fill, runs to completion. The only observable effect is what it wrote.
pub trait ChatHandler: Send + Sync {
    fn handle(
        &self,
        history: Vec<ChatMessage>,
        workspace: Option<String>,
        output: OutputWriter,
    ) -> HandlerFuture;
}

/// A provider of dynamically-named handlers (e.g. one `proxy.<model>` handler per proxied
/// connection) that the static map alone can't enumerate ahead of time.
#[async_trait]
pub trait ChatHandlerProvider: Send + Sync {
    fn get_handler(&self, name: &str) -> Option<Arc<dyn ChatHandler>>;
    fn list_handlers(&self) -> Vec<String>;
}

/// Process-wide handler registry. Built once at startup; providers may be added afterward but the
/// static map is not mutated once construction finishes (mirrors `ModelProvider`'s own
/// init-then-read lifecycle).
#[derive(Default)]
pub struct ChatHandlerRegistry {
    handlers: HashMap<String, Arc<dyn ChatHandler>>,
    providers: Vec<Arc<dyn ChatHandlerProvider>>,
}

impl ChatHandlerRegistry {
    pub fn new() -> Self {
        ChatHandlerRegistry::default()
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn ChatHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn register_handler_provider(&mut self, provider: Arc<dyn ChatHandlerProvider>) {
        self.providers.push(provider);
    }

    /// Reverse-registration-order provider lookup, falling back to the static map; `UnknownHandler`
    /// on a total miss, carrying every name any provider or the static map currently knows about.
    pub fn get_handler(&self, name: &str) -> Result<Arc<dyn ChatHandler>, GatewayError> {
        for provider in self.providers.iter().rev() {
            if let Some(handler) = provider.get_handler(name) {
                return Ok(handler);
            }
        }
        if let Some(handler) = self.handlers.get(name) {
            return Ok(handler.clone());
        }
        Err(GatewayError::UnknownHandler {
            name: name.to_string(),
            known: self.list_handlers(),
        })
    }

    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        for provider in &self.providers {
            names.extend(provider.list_handlers());
        }
        names.sort();
        names.dedup();
        names
    }
}

/// One handler per agent: `handle()` runs the multi-agent turn loop pinned to that agent.
pub struct AgentChatHandler {
    runner: Arc<Runner>,
    agent_name: String,
}

impl AgentChatHandler {
    pub fn new(runner: Arc<Runner>, agent_name: String) -> Self {
        AgentChatHandler { runner, agent_name }
    }
}

impl ChatHandler for AgentChatHandler {
    fn handle(&self, history: Vec<ChatMessage>, _workspace: Option<String>, mut output: OutputWriter) -> HandlerFuture {
        let runner = self.runner.clone();
        let agent_name = self.agent_name.clone();
        Box::pin(async move {
            let task = history
                .iter()
                .rev()
                .find(|m| matches!(m.role, crate::gateway::types::Role::User))
                .map(|m| m.text())
                .unwrap_or_default();
            runner
                .run(history, &mut output, Some(agent_name.as_str()), &task, &HashMap::new())
                .await
        })
    }
}

/// A `proxy.<name>` handler per connection listed in `config.proxy`: streams the upstream's raw
/// tokens straight to the writer, with no agent framing, tool calls, or turn loop — grounded on
/// `core/llm/proxy_chat_handler.py::ProxyChatHandlerProvider`.
pub struct ProxyChatHandlerProvider {
    model_provider: Arc<ModelProvider>,
    proxied: Vec<String>,
}

impl ProxyChatHandlerProvider {
    /// `config.proxy` is filtered against the model provider's own known model list — a name
    /// listed in `proxy` that no connection actually exposes is silently dropped, matching
    /// `ProxyChatHandlerProvider.setup_from_config`.
    pub fn new(model_provider: Arc<ModelProvider>, proxy: &[String]) -> Self {
        let known = model_provider.get_models();
        let proxied = proxy.iter().filter(|name| known.contains(name)).cloned().collect();
        ProxyChatHandlerProvider { model_provider, proxied }
    }
}

struct ProxyHandler {
    model_provider: Arc<ModelProvider>,
    model_name: String,
}

impl ChatHandler for ProxyHandler {
    fn handle(&self, history: Vec<ChatMessage>, _workspace: Option<String>, mut output: OutputWriter) -> HandlerFuture {
        let model_provider = self.model_provider.clone();
        let model_name = self.model_name.clone();
        Box::pin(async move {
            use futures_util::StreamExt;
            let (connector, upstream_model) = model_provider.get_llm(&model_name)?;
            let result = connector
                .chat(&upstream_model, history, Vec::new(), String::new(), false, true)
                .await;
            match result {
                Ok(mut response) => {
                    let mut stream = response.stream();
                    while let Some(token) = stream.next().await {
                        output.write(&token, crate::gateway::output_writer::Section::Default, false, false).await;
                    }
                }
                Err(e) => {
                    output
                        .default(&format!("Unexpected error occured:\n\n```\n{}\n```\n", e))
                        .await;
                }
            }
            output.clear().await;
            Ok(())
        })
    }
}

#[async_trait]
impl ChatHandlerProvider for ProxyChatHandlerProvider {
    fn get_handler(&self, name: &str) -> Option<Arc<dyn ChatHandler>> {
        let model_name = name.strip_prefix("proxy.")?;
        if !self.proxied.iter().any(|n| n == model_name) {
            return None;
        }
        Some(Arc::new(ProxyHandler {
            model_provider: self.model_provider.clone(),
            model_name: model_name.to_string(),
        }) as Arc<dyn ChatHandler>)
    }

    fn list_handlers(&self) -> Vec<String> {
        self.proxied.iter().map(|name| format!("proxy.{}", name)).collect()
    }
}
