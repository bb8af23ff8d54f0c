//! Client side of the Model Context Protocol: turns a configured remote/local MCP server into a
//! set of [`Tool`]s the runner can hand to a connector.
//!
//! Grounded on `cloudllm::tool_protocols::McpClientProtocol` for the reqwest-based session shape,
//! and on the original `core/mcp_client.py::list_tools` for the three-transport surface, the
//! "fresh session per call" invocation model, and the stdio spawn-sleep-retry fallback.

use crate::gateway::config::McpServerSpec;
use crate::gateway::error::GatewayError;
use crate::gateway::types::{Tool, ToolParameter};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// One configured MCP server, ready to list/call tools against.
#[derive(Clone)]
pub struct McpClient {
    spec: McpServerSpec,
}

impl McpClient {
    pub fn new(spec: McpServerSpec) -> Self {
        McpClient { spec }
    }

    /// Discover the server's tools, each named `{prefix}{server_name}`, with `parameters` taken
    /// from the tool's `inputSchema.properties`. On failure, if `command` is configured, spawn it
    /// detached, sleep 5s, and retry once — the server process may simply not have bound its
    /// listener yet.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        match self.try_list_tools().await {
            Ok(tools) => Ok(tools),
            Err(e) => {
                if let Some(command) = &self.spec.command {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!(
                            "MCP server listing failed ({}), spawning '{}' and retrying once",
                            e,
                            command
                        );
                    }
                    self.spawn_detached(command)?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    self.try_list_tools().await
                } else {
                    Err(e)
                }
            }
        }
    }

    fn spawn_detached(&self, command: &str) -> Result<(), GatewayError> {
        Command::new(command)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(GatewayError::from)?;
        Ok(())
    }

    async fn try_list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        let prefix = self.spec.prefix.clone().unwrap_or_default();
        let entries = match self.spec.transport.as_str() {
            "http" | "sse" => self.list_tools_http().await?,
            "stdio" => self.list_tools_stdio().await?,
            other => {
                return Err(GatewayError::ConfigError(format!(
                    "unknown MCP transport '{}'",
                    other
                )))
            }
        };

        Ok(entries
            .into_iter()
            .map(|entry| self.entry_to_tool(entry, &prefix))
            .collect())
    }

    fn entry_to_tool(&self, entry: McpToolEntry, prefix: &str) -> Tool {
        let tool_name = format!("{}{}", prefix, entry.name);
        let server_name = entry.name.clone();
        let client = self.clone();
        let parameters: HashMap<String, ToolParameter> = entry
            .properties
            .into_iter()
            .map(|(name, schema)| {
                let param_type = schema
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("string")
                    .to_string();
                let description = schema
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (name, ToolParameter { param_type, description })
            })
            .collect();

        Tool::new(tool_name.clone(), entry.description, parameters, move |params| {
            let client = client.clone();
            let server_name = server_name.clone();
            let tool_name = tool_name.clone();
            Box::pin(async move {
                match client.call_tool(&server_name, params).await {
                    Ok(text) => text,
                    Err(e) => format!("Error calling tool {}: {}", tool_name, e),
                }
            })
        })
    }

    /// Open a fresh session, invoke `server_name` with `params`, concatenate any text-typed
    /// content parts of the result into one string.
    async fn call_tool(&self, server_name: &str, params: Value) -> Result<String, GatewayError> {
        match self.spec.transport.as_str() {
            "http" | "sse" => self.call_tool_http(server_name, params).await,
            "stdio" => self.call_tool_stdio(server_name, params).await,
            other => Err(GatewayError::ConfigError(format!("unknown MCP transport '{}'", other))),
        }
    }

    fn url(&self) -> Result<String, GatewayError> {
        self.spec
            .url
            .clone()
            .ok_or_else(|| GatewayError::ConfigError("MCP server missing 'url'".to_string()))
    }

    async fn rpc_call_http(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let url = self.url()?;
        let client = crate::gateway::clients::common::get_shared_http_client();
        let mut request = client.post(&url).json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": next_id(),
            "method": method,
            "params": params,
        }));
        for (key, value) in &self.spec.headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamError(format!("MCP request to {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::UpstreamError(format!(
                "MCP server returned status {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamError(format!("invalid MCP response: {}", e)))?;
        if let Some(error) = body.get("error") {
            return Err(GatewayError::UpstreamError(format!("MCP error: {}", error)));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn list_tools_http(&self) -> Result<Vec<McpToolEntry>, GatewayError> {
        let result = self.rpc_call_http("tools/list", serde_json::json!({})).await?;
        Ok(parse_tool_entries(&result))
    }

    async fn call_tool_http(&self, server_name: &str, params: Value) -> Result<String, GatewayError> {
        let result = self
            .rpc_call_http(
                "tools/call",
                serde_json::json!({"name": server_name, "arguments": params}),
            )
            .await?;
        Ok(extract_text_content(&result))
    }

    async fn list_tools_stdio(&self) -> Result<Vec<McpToolEntry>, GatewayError> {
        let result = self.rpc_call_stdio("tools/list", serde_json::json!({})).await?;
        Ok(parse_tool_entries(&result))
    }

    async fn call_tool_stdio(&self, server_name: &str, params: Value) -> Result<String, GatewayError> {
        let result = self
            .rpc_call_stdio(
                "tools/call",
                serde_json::json!({"name": server_name, "arguments": params}),
            )
            .await?;
        Ok(extract_text_content(&result))
    }

    /// A fresh stdio session per call: spawn the command, write one JSON-RPC request line, read
    /// one response line, let the child exit.
    async fn rpc_call_stdio(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let command = self
            .spec
            .command
            .clone()
            .ok_or_else(|| GatewayError::ConfigError("MCP stdio server missing 'command'".to_string()))?;

        let mut child = Command::new(&command)
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(GatewayError::from)?;

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": next_id(),
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::UpstreamError("MCP stdio child had no stdin".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(GatewayError::from)?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::UpstreamError("MCP stdio child had no stdout".to_string()))?;
        let mut reader = BufReader::new(stdout);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .await
            .map_err(GatewayError::from)?;

        let _ = child.wait().await;

        let body: Value = serde_json::from_str(response_line.trim())?;
        if let Some(error) = body.get("error") {
            return Err(GatewayError::UpstreamError(format!("MCP error: {}", error)));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

struct McpToolEntry {
    name: String,
    description: String,
    properties: serde_json::Map<String, Value>,
}

fn parse_tool_entries(result: &Value) -> Vec<McpToolEntry> {
    result
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .map(|t| McpToolEntry {
                    name: t.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    description: t
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    properties: t
                        .pointer("/inputSchema/properties")
                        .and_then(|v| v.as_object())
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Concatenate every text-typed entry of a `{content: [{type, text}]}` MCP call result.
fn extract_text_content(result: &Value) -> String {
    result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(|v| v.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Load every configured MCP server's tools in parallel; servers that fail are logged and
/// skipped rather than aborting startup.
pub async fn load_all_tools(mcps: &HashMap<String, McpServerSpec>) -> Vec<Tool> {
    let futures = mcps.values().cloned().map(|spec| async move {
        let client = McpClient::new(spec);
        client.list_tools().await
    });

    futures_util::future::join_all(futures)
        .await
        .into_iter()
        .filter_map(|result| match result {
            Ok(tools) => Some(tools),
            Err(e) => {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("failed to load MCP tools: {}", e);
                }
                None
            }
        })
        .flatten()
        .collect()
}
