// src/lib.rs

// The gateway: OpenAI-compatible HTTP surface, model connectors, and the multi-agent runtime.
pub mod gateway;
