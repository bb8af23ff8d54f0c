//! Multi-agent runtime: file-backed agent/skill definitions plus the turn-loop runner that drives
//! a conversation across handovers, skill switches, and tool calls.

pub mod registry;
pub mod runner;

pub use registry::{AgentDefinition, AgentRegistry, Skill};
pub use runner::Runner;
