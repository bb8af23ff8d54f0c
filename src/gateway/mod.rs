//! An OpenAI-compatible chat gateway that aggregates multiple upstream LLM providers behind one
//! endpoint and layers a multi-agent runtime with dynamically discoverable tools on top.

pub mod agents;
pub mod cli;
pub mod clients;
pub mod config;
pub mod error;
pub mod handler;
pub mod mcp_client;
pub mod model_provider;
pub mod output_writer;
pub mod response;
pub mod server;
pub mod types;
