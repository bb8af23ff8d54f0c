//! Process-wide registry of warmed-up model connectors.
//!
//! Grounded on `core/model_provider.py::ModelProvider`: connectors are constructed concurrently,
//! but the logical `model name -> connector` map is folded in the *configured* order once every
//! construction finishes, so a later connection deterministically shadows an earlier one that
//! claims the same logical name regardless of which one finished warming up first. The original
//! used a thread pool because connector construction was synchronous Python; construction here is
//! already `async`, so a bounded `tokio::spawn` + `Semaphore` fan-out is the idiomatic equivalent.

use crate::gateway::clients::OpenAiConnector;
use crate::gateway::config::GatewayConfig;
use crate::gateway::error::GatewayError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bound on concurrent in-flight connector warm-ups (ollama autodetect GETs, mostly).
const MAX_CONCURRENT_WARMUPS: usize = 8;

/// A warmed-up, process-wide set of connectors plus the logical model names they answer to.
pub struct ModelProvider {
    connectors: HashMap<String, Arc<OpenAiConnector>>,
    models: HashMap<String, String>,
}

impl ModelProvider {
    /// Warm up every connection in `config.llms` concurrently, then apply the resulting
    /// `logical name -> connection name` shadowing in `config.llms`'s own iteration order.
    pub async fn warm_up(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_WARMUPS));
        let mut tasks = Vec::with_capacity(config.llms.len());

        for (connection_name, spec) in &config.llms {
            let connection_name = connection_name.clone();
            let spec = spec.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = OpenAiConnector::construct(&spec).await;
                (connection_name, result)
            }));
        }

        let mut by_connection: HashMap<String, Arc<OpenAiConnector>> = HashMap::new();
        let mut discovered_by_connection: HashMap<String, Vec<String>> = HashMap::new();

        for task in tasks {
            let (connection_name, result) = task
                .await
                .map_err(|e| GatewayError::ConfigError(format!("connector warm-up task panicked: {}", e)))?;
            let (connector, discovered) = result?;
            let logical_names: Vec<String> = discovered.into_iter().map(|d| d.logical_name).collect();
            by_connection.insert(connection_name.clone(), Arc::new(connector));
            discovered_by_connection.insert(connection_name, logical_names);
        }

        // Apply shadowing in the original config's iteration order, not completion order.
        let mut models = HashMap::new();
        for connection_name in config.llms.keys() {
            if let Some(names) = discovered_by_connection.get(connection_name) {
                for logical_name in names {
                    models.insert(logical_name.clone(), connection_name.clone());
                }
            }
        }

        Ok(ModelProvider {
            connectors: by_connection,
            models,
        })
    }

    /// Every logical model name currently resolvable, in no particular order.
    pub fn get_models(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// The connector bound to `model`, plus the concrete upstream model id `chat()` should send.
    pub fn get_llm(&self, model: &str) -> Result<(Arc<OpenAiConnector>, String), GatewayError> {
        let connection_name = self
            .models
            .get(model)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))?;
        let connector = self
            .connectors
            .get(connection_name)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))?;
        Ok((connector.clone(), model.to_string()))
    }

    /// Embeddings are in-scope only as a thin passthrough on the same connector kind; the
    /// gateway's HTTP surface does not expose `/embeddings` (only `/chat/completions`, `/models`,
    /// `/workspaces` are named), so this exists for programmatic/library callers only.
    pub fn get_embedder(&self, model: &str) -> Result<Arc<OpenAiConnector>, GatewayError> {
        self.get_llm(model).map(|(connector, _)| connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::config::{GatewayConfig, ModelConnectionConfig, ModelConnectionSpec};
    use indexmap::IndexMap;

    fn spec(endpoint: &str, logical_name: &str) -> ModelConnectionSpec {
        let mut config = ModelConnectionConfig::default();
        config.name = Some(logical_name.to_string());
        ModelConnectionSpec {
            api_endpoint: endpoint.to_string(),
            api_key: String::new(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            config,
        }
    }

    /// Two connections both register the logical name "shared"; whichever is *later* in the
    /// config's own key order must win, regardless of which connector happened to finish warming
    /// up first (both are non-ollama, so `construct` does no network I/O and completion order is
    /// effectively racy).
    #[tokio::test]
    async fn later_config_entry_shadows_earlier_one_for_the_same_logical_name() {
        let mut llms = IndexMap::new();
        llms.insert("first".to_string(), spec("https://first.example", "shared"));
        llms.insert("second".to_string(), spec("https://second.example", "shared"));
        let config = GatewayConfig {
            llms,
            ..GatewayConfig::default()
        };

        let provider = ModelProvider::warm_up(&config).await.expect("non-ollama construct needs no network");
        let (connector, _) = provider.get_llm("shared").expect("shared should resolve");
        assert_eq!(connector.endpoint(), "https://second.example");
    }
}
