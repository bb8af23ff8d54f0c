//! Configuration: the merged JSON document the rest of the gateway reads from.
//!
//! Grounded on `common/config.py::read_config`/`write_config`: three layers merged in order
//! (repo-local defaults, `~/.config/quack-norris/`, cwd-relative), each layer a shallow
//! `serde_json::Value` object merge where later layers win key-by-key, plus `--name=value`
//! CLI overwrite parsing.

use crate::gateway::error::GatewayError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Per-connection tuning knobs, all optional — see data model §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConnectionConfig {
    pub name_prefix: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub unofficial_toolcalling: bool,
    #[serde(default)]
    pub no_think: bool,
    #[serde(default)]
    pub system_prompt_last: bool,
    #[serde(default)]
    pub never_stream: bool,
    #[serde(default)]
    pub text_only: bool,
    pub max_tokens: Option<u32>,
    pub custom_tool_call_prompt: Option<String>,
    pub api_version: Option<String>,
}

/// One configured upstream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConnectionSpec {
    pub api_endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub config: ModelConnectionConfig,
}

/// One configured MCP server — resolves the spec's "mcps" map, left opaque in the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerSpec {
    pub transport: String,
    pub url: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub prefix: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_max_steps() -> usize {
    15
}
fn default_agents_dir() -> String {
    "agents".to_string()
}
fn default_skills_dir() -> String {
    "skills".to_string()
}

/// The fully merged configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Ordered map: connections are warmed up concurrently, but later-wins shadowing of the
    /// logical model name is applied in this iteration order, not completion order — an
    /// `IndexMap` (rather than `HashMap`) is what lets that order survive a round trip through
    /// JSON, mirroring a Python `dict`'s own insertion-order guarantee.
    #[serde(default)]
    pub llms: IndexMap<String, ModelConnectionSpec>,
    #[serde(default)]
    pub mcps: HashMap<String, McpServerSpec>,
    #[serde(default)]
    pub proxy: Vec<String>,
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub workspaces: HashMap<String, String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_agents_dir")]
    pub agents_dir: String,
    #[serde(default = "default_skills_dir")]
    pub skills_dir: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            llms: IndexMap::new(),
            mcps: HashMap::new(),
            proxy: Vec::new(),
            default_model: String::new(),
            workspaces: HashMap::new(),
            debug: false,
            host: default_host(),
            port: default_port(),
            agents_dir: default_agents_dir(),
            skills_dir: default_skills_dir(),
            max_steps: default_max_steps(),
        }
    }
}

fn load_json_object(path: &Path) -> Result<Value, GatewayError> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    Ok(value)
}

/// Shallow `update(**dict)`-style merge: every top-level key in `overlay` replaces the one in
/// `base`, whole-value, matching `config.update(**_load_json(path))` in the original.
fn merge_shallow(base: &mut Value, overlay: Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (base, overlay) {
        for (k, v) in overlay_map {
            base_map.insert(k, v);
        }
    }
}

/// Three-path merge: `<repo>/configs/<config_name>`, then `~/.config/quack-norris/<config_name>`,
/// then `./<config_name>` relative to the current working directory. Each layer is optional;
/// layers present later win.
pub fn read_config(config_name: &str, code_home: &Path) -> Result<GatewayConfig, GatewayError> {
    let mut merged = Value::Object(Default::default());

    let repo_path = code_home.join("configs").join(config_name);
    if repo_path.is_file() {
        merge_shallow(&mut merged, load_json_object(&repo_path)?);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_path = config_dir.join("quack-norris").join(config_name);
        if user_path.is_file() {
            merge_shallow(&mut merged, load_json_object(&user_path)?);
        }
    }

    let cwd_path = PathBuf::from(config_name);
    if cwd_path.is_file() {
        merge_shallow(&mut merged, load_json_object(&cwd_path)?);
    }

    let config: GatewayConfig = serde_json::from_value(merged)
        .map_err(|e| GatewayError::ConfigError(format!("invalid configuration: {}", e)))?;

    if config.debug {
        log::debug!("merged configuration: {:#?}", config);
    }

    Ok(config)
}

/// Persist `config` to the cwd-relative path, creating parent directories as needed.
pub fn write_config(config: &GatewayConfig, config_name: &str) -> Result<(), GatewayError> {
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(config_name, text)?;
    Ok(())
}

/// Apply `--name=value` / `--flag` CLI overrides onto an already-merged config document, typed
/// against whatever value already occupies that key (bool flag if no `=value` is given).
pub fn apply_overrides(config: &mut GatewayConfig, overrides: &[String]) -> Result<(), GatewayError> {
    let mut value = serde_json::to_value(&*config)?;
    for raw in overrides {
        let stripped = raw.trim_start_matches("--");
        match stripped.split_once('=') {
            Some((key, val)) => {
                set_override(&mut value, key, val)?;
            }
            None => {
                set_override(&mut value, stripped, "true")?;
            }
        }
    }
    *config = serde_json::from_value(value)
        .map_err(|e| GatewayError::ConfigError(format!("invalid override: {}", e)))?;
    Ok(())
}

fn set_override(root: &mut Value, key: &str, raw_value: &str) -> Result<(), GatewayError> {
    let object = root
        .as_object_mut()
        .ok_or_else(|| GatewayError::ConfigError("configuration root is not an object".to_string()))?;
    let existing = object.get(key);
    let typed = match existing {
        Some(Value::Bool(_)) => Value::Bool(raw_value == "true" || raw_value == "1"),
        Some(Value::Number(_)) => raw_value
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw_value.parse::<f64>().map(Value::from))
            .map_err(|_| GatewayError::ConfigError(format!("'{}' is not numeric", raw_value)))?,
        _ => Value::String(raw_value.to_string()),
    };
    object.insert(key.to_string(), typed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_shallow_overwrites_whole_keys() {
        let mut base = serde_json::json!({"a": 1, "b": 2});
        merge_shallow(&mut base, serde_json::json!({"b": 3, "c": 4}));
        assert_eq!(base, serde_json::json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn apply_overrides_types_bool_and_number() {
        let mut config = GatewayConfig::default();
        apply_overrides(&mut config, &["--debug".to_string(), "--port=9001".to_string()]).unwrap();
        assert!(config.debug);
        assert_eq!(config.port, 9001);
    }
}
