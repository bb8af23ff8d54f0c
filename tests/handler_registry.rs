//! `ChatHandlerRegistry` lookup semantics: static map, reverse-order provider shadowing, and the
//! `UnknownHandler` miss carrying the full known-names list.

use async_trait::async_trait;
use quack_gateway::gateway::error::GatewayError;
use quack_gateway::gateway::handler::{ChatHandler, ChatHandlerProvider, ChatHandlerRegistry, HandlerFuture};
use quack_gateway::gateway::output_writer::OutputWriter;
use quack_gateway::gateway::types::ChatMessage;
use std::sync::Arc;

struct StubHandler(&'static str);

impl ChatHandler for StubHandler {
    fn handle(&self, _history: Vec<ChatMessage>, _workspace: Option<String>, mut output: OutputWriter) -> HandlerFuture {
        let tag = self.0;
        Box::pin(async move {
            output.default(tag).await;
            Ok(())
        })
    }
}

struct StubProvider {
    prefix: &'static str,
    names: Vec<String>,
    tag: &'static str,
}

#[async_trait]
impl ChatHandlerProvider for StubProvider {
    fn get_handler(&self, name: &str) -> Option<Arc<dyn ChatHandler>> {
        let suffix = name.strip_prefix(self.prefix)?;
        if self.names.iter().any(|n| n == suffix) {
            Some(Arc::new(StubHandler(self.tag)) as Arc<dyn ChatHandler>)
        } else {
            None
        }
    }

    fn list_handlers(&self) -> Vec<String> {
        self.names.iter().map(|n| format!("{}{}", self.prefix, n)).collect()
    }
}

#[test]
fn unknown_model_reports_every_known_name() {
    let mut registry = ChatHandlerRegistry::new();
    registry.register_handler("alpha", Arc::new(StubHandler("alpha")));
    registry.register_handler("beta", Arc::new(StubHandler("beta")));

    let err = registry.get_handler("gamma").unwrap_err();
    match err {
        GatewayError::UnknownHandler { name, known } => {
            assert_eq!(name, "gamma");
            assert_eq!(known, vec!["alpha".to_string(), "beta".to_string()]);
        }
        other => panic!("expected UnknownHandler, got {:?}", other),
    }
}

#[tokio::test]
async fn providers_are_consulted_in_reverse_registration_order() {
    let mut registry = ChatHandlerRegistry::new();
    // Both providers use an empty prefix, so they genuinely collide on the literal name "shared" —
    // the only thing that can decide which one answers is registration order. Each handler tags
    // its output with its own provider's identity so the winner is directly observable.
    registry.register_handler_provider(Arc::new(StubProvider {
        prefix: "",
        names: vec!["shared".to_string()],
        tag: "first",
    }));
    registry.register_handler_provider(Arc::new(StubProvider {
        prefix: "",
        names: vec!["shared".to_string()],
        tag: "second",
    }));

    let handler = registry.get_handler("shared").expect("one of the two colliding providers must answer");
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let output = OutputWriter::with_queue(tx);
    handler.handle(vec![], None, output).await.unwrap();

    let mut received = String::new();
    while let Some(chunk) = rx.recv().await {
        received.push_str(&chunk);
    }
    assert_eq!(received, "second", "the later-registered provider must win on a true name collision");
}

#[test]
fn list_handlers_merges_static_and_provider_names_sorted_and_deduped() {
    let mut registry = ChatHandlerRegistry::new();
    registry.register_handler("zeta", Arc::new(StubHandler("zeta")));
    registry.register_handler("alpha", Arc::new(StubHandler("alpha")));
    registry.register_handler_provider(Arc::new(StubProvider {
        prefix: "proxy.",
        names: vec!["alpha".to_string(), "mid".to_string()],
        tag: "proxy",
    }));

    assert_eq!(
        registry.list_handlers(),
        vec![
            "alpha".to_string(),
            "proxy.alpha".to_string(),
            "proxy.mid".to_string(),
            "zeta".to_string(),
        ]
    );
}
