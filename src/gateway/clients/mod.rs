//! Upstream model connectors.

pub mod common;
pub mod openai;

pub use openai::{DiscoveredModel, OpenAiConnector};
