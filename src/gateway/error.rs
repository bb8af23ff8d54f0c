//! Crate-wide error taxonomy.
//!
//! Hand-rolled rather than built on `thiserror`, matching how
//! [`crate::cloudllm::tool_protocol::ToolError`] is defined in this crate: an explicit enum with a
//! manual `Display` implementation. Most fallible internals return
//! `Result<T, Box<dyn std::error::Error + Send + Sync>>`; call sites that must report a specific
//! kind to an HTTP caller narrow into a `GatewayError` at the boundary.

use std::error::Error;
use std::fmt;

/// Error kinds the gateway can surface to a caller or log at startup.
#[derive(Debug)]
pub enum GatewayError {
    /// A logical model name was requested that no connector exposes.
    UnknownModel(String),
    /// `/chat/completions` named a model/agent that no handler resolves.
    UnknownHandler {
        name: String,
        known: Vec<String>,
    },
    /// The upstream returned `finish_reason == "error"`, or the HTTP call itself failed.
    UpstreamError(String),
    /// An in-band `[CALL] {...}` block could not be decoded. Never fatal — fed back to the model.
    ToolParseError(String),
    /// A parsed tool call named a tool the registry doesn't know. Never fatal.
    ToolNotFound(String),
    /// A tool callable raised/returned an error. Never fatal.
    ToolRuntimeError(String),
    /// Mandatory configuration is missing or contradictory. Fatal at startup.
    ConfigError(String),
    /// An agent or skill file was malformed. Logged and skipped, not fatal.
    FileLoadError(String),
    /// Any other error crossing a boundary that expects a `GatewayError`.
    Other(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::UnknownModel(name) => write!(f, "Unknown model '{}'", name),
            GatewayError::UnknownHandler { name, known } => write!(
                f,
                "Model/Agent '{}' not found. Available models/agents: {}",
                name,
                known.join(", ")
            ),
            GatewayError::UpstreamError(msg) => write!(f, "{}", msg),
            GatewayError::ToolParseError(msg) => write!(f, "{}", msg),
            GatewayError::ToolNotFound(name) => write!(f, "Tool '{}' not found.", name),
            GatewayError::ToolRuntimeError(msg) => write!(f, "Tool execution error: {}", msg),
            GatewayError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            GatewayError::FileLoadError(msg) => write!(f, "{}", msg),
            GatewayError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for GatewayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GatewayError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<Box<dyn Error + Send + Sync>> for GatewayError {
    fn from(err: Box<dyn Error + Send + Sync>) -> Self {
        GatewayError::Other(err)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Other(Box::new(err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Other(Box::new(err))
    }
}

impl From<&str> for GatewayError {
    fn from(msg: &str) -> Self {
        GatewayError::Other(msg.into())
    }
}

impl From<String> for GatewayError {
    fn from(msg: String) -> Self {
        GatewayError::Other(msg.into())
    }
}
