//! The multi-agent turn loop: resolves the active agent, synthesizes handover/skill switch
//! tools, applies the tool visibility policy, and drives `chat()` calls until the model produces
//! a final answer or `max_steps` is exhausted.
//!
//! Grounded on the original runner's turn loop (agent determination from history, handover/skill
//! marker strings, namespace-anchor tool filtering) and on the teacher's
//! `Arc<RwLock<ToolRegistry>>` ownership pattern in `agent.rs` for how process-wide state is
//! shared with per-request mutation kept local to the runner instance.

use crate::gateway::agents::registry::AgentRegistry;
use crate::gateway::error::GatewayError;
use crate::gateway::mcp_client;
use crate::gateway::model_provider::ModelProvider;
use crate::gateway::output_writer::OutputWriter;
use crate::gateway::types::{ChatMessage, Tool, ToolCall, ToolCallOrError, ToolParameter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const HISTORY_WINDOW: usize = 10;

fn agent_switch_marker(name: &str) -> String {
    format!("Successfully switched to agent: `{}`", name)
}

fn skill_switch_marker(name: &str) -> String {
    format!("Successfully switched to skill: `{}`", name)
}

/// Scan `history` backwards for the most recent line matching `marker_prefix` + a backtick-quoted
/// name, returning that name.
fn most_recent_marker(history: &[ChatMessage], prefix: &str) -> Option<String> {
    for message in history.iter().rev() {
        let text = message.text();
        for line in text.lines().rev() {
            if let Some(rest) = line.strip_prefix(prefix) {
                let rest = rest.trim();
                if let Some(name) = rest.strip_prefix('`').and_then(|r| r.strip_suffix('`')) {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

/// Mutable per-turn state a synthesized handover/skill tool callable can reach into.
struct TurnState {
    active_agent: String,
    active_skills: Vec<String>,
    extra_system_prompt: String,
    /// The args the model passed to the last `agent.<name>` handover call, entirely replacing the
    /// caller-supplied `task`/`context` once a handover happens (mirrors `multi_agent_runner.py`'s
    /// `_callback`: `kwargs = args`, not a merge). Empty until the first handover.
    kwargs: HashMap<String, String>,
}

/// Flattens a tool call's JSON params object into the `{placeholder}` string map a prompt
/// template is filled from. Non-string values are rendered as compact JSON.
fn params_to_string_map(params: &serde_json::Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(obj) = params.as_object() {
        for (key, value) in obj {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            map.insert(key.clone(), rendered);
        }
    }
    map
}

/// Drives one `/chat/completions` request end to end. Bootstrap state (MCP tools, agent/skill
/// registry, warmed-up model provider) is shared process-wide; everything mutated during a turn
/// (active agent, active skills) lives in a fresh `TurnState` per call to [`Runner::run`].
pub struct Runner {
    model_provider: Arc<ModelProvider>,
    agents: Arc<AgentRegistry>,
    mcp_tools: Vec<Tool>,
    default_model: String,
    default_agent: String,
    max_steps: usize,
}

impl Runner {
    pub fn new(
        model_provider: Arc<ModelProvider>,
        agents: Arc<AgentRegistry>,
        mcp_tools: Vec<Tool>,
        default_model: String,
        default_agent: String,
        max_steps: usize,
    ) -> Self {
        Runner {
            model_provider,
            agents,
            mcp_tools,
            default_model,
            default_agent,
            max_steps,
        }
    }

    /// Convenience bootstrap: load every configured MCP server's tools in parallel (log-and-skip
    /// per-server failures) and build a [`Runner`].
    pub async fn bootstrap(
        model_provider: Arc<ModelProvider>,
        agents: Arc<AgentRegistry>,
        mcps: &HashMap<String, crate::gateway::config::McpServerSpec>,
        default_model: String,
        default_agent: String,
        max_steps: usize,
    ) -> Self {
        let mcp_tools = mcp_client::load_all_tools(mcps).await;
        Runner::new(model_provider, agents, mcp_tools, default_model, default_agent, max_steps)
    }

    /// Determine the active agent for this turn: an explicit name wins outright; otherwise the
    /// most recent handover marker in `history`; otherwise the configured default.
    async fn determine_active_agent(&self, history: &[ChatMessage], explicit: Option<&str>) -> String {
        if let Some(name) = explicit {
            if self.agents.get_agent(name).await.is_some() {
                return name.to_string();
            }
        }
        if let Some(name) = most_recent_marker(history, "Successfully switched to agent: ") {
            if self.agents.get_agent(&name).await.is_some() {
                return name;
            }
        }
        self.default_agent.clone()
    }

    /// Skills the active agent currently has switched into, recovered from history markers,
    /// restricted to ones the agent actually declares.
    fn determine_active_skills(&self, history: &[ChatMessage], declared: &[String]) -> Vec<String> {
        let mut active = Vec::new();
        for message in history {
            if let Some(name) = most_recent_marker(std::slice::from_ref(message), "Successfully switched to skill: ")
            {
                if declared.contains(&name) && !active.contains(&name) {
                    active.push(name);
                }
            }
        }
        active
    }

    fn synthesize_handover_tools(&self, agent_names: &[String], state: Arc<Mutex<TurnState>>) -> Vec<Tool> {
        agent_names
            .iter()
            .map(|name| {
                let target = name.clone();
                let state = state.clone();
                Tool::new(
                    format!("agent.{}", target),
                    format!("Switch the conversation over to the '{}' agent.", target),
                    HashMap::new(),
                    move |params| {
                        let target = target.clone();
                        let state = state.clone();
                        Box::pin(async move {
                            let kwargs = params_to_string_map(&params);
                            let mut guard = state.lock().unwrap();
                            guard.active_agent = target.clone();
                            guard.kwargs = kwargs;
                            agent_switch_marker(&target)
                        })
                    },
                )
            })
            .collect()
    }

    fn synthesize_skill_tools(
        &self,
        skills: &[crate::gateway::agents::registry::Skill],
        state: Arc<Mutex<TurnState>>,
    ) -> Vec<Tool> {
        skills
            .iter()
            .map(|skill| {
                let name = skill.name.clone();
                let prompt = skill.prompt.clone();
                let mut parameters = HashMap::new();
                parameters.insert(
                    "reason".to_string(),
                    ToolParameter {
                        param_type: "string".to_string(),
                        description: "Why this skill is needed now.".to_string(),
                    },
                );
                let state = state.clone();
                Tool::new(
                    format!("switch_skill.{}", name),
                    skill.description.clone(),
                    parameters,
                    move |_params| {
                        let name = name.clone();
                        let prompt = prompt.clone();
                        let state = state.clone();
                        Box::pin(async move {
                            let mut guard = state.lock().unwrap();
                            if !guard.active_skills.contains(&name) {
                                guard.active_skills.push(name.clone());
                            }
                            guard.extra_system_prompt.push_str("\n\n");
                            guard.extra_system_prompt.push_str(&prompt);
                            skill_switch_marker(&name)
                        })
                    },
                )
            })
            .collect()
    }

    /// Tool visibility policy (§4.6): self-exclusion, glob filtering, namespace-anchor gating.
    fn visible_tools(all_tools: &[Tool], filters: &[String], current_agent: &str) -> Vec<Tool> {
        let self_switch = format!("agent.{}", current_agent);
        let current_agent_tool = format!("agent.{}", current_agent);

        let anchors: Vec<&str> = all_tools
            .iter()
            .filter(|t| t.is_namespace_anchor())
            .map(|t| t.name.trim_end_matches("__main__"))
            .collect();

        all_tools
            .iter()
            .filter(|tool| tool.name != self_switch)
            .filter(|tool| {
                filters
                    .iter()
                    .any(|filter| glob_match(filter, &tool.name))
            })
            .filter(|tool| {
                if tool.is_namespace_anchor() {
                    return true;
                }
                let longest = anchors
                    .iter()
                    .filter(|ns| tool.name.starts_with(**ns))
                    .max_by_key(|ns| ns.len());
                match longest {
                    Some(ns) => current_agent_tool.starts_with(*ns),
                    None => true,
                }
            })
            .cloned()
            .collect()
    }

    fn fill_placeholders(template: &str, placeholders: &HashMap<String, String>) -> String {
        let now = chrono::Local::now();
        let mut out = template
            .replace("{today}", &now.format("%Y-%m-%d").to_string())
            .replace("{now}", &now.format("%H:%M:%S").to_string());
        for (name, value) in placeholders {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }

    /// Run a full turn loop against `history`, streaming tokens through `output`. The only side
    /// effect is `output` having been filled; `history` is not mutated in place (the caller's copy
    /// is independent of the working copy the loop extends internally).
    pub async fn run(
        &self,
        mut history: Vec<ChatMessage>,
        output: &mut OutputWriter,
        explicit_agent: Option<&str>,
        task: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), GatewayError> {
        let active_agent_name = self.determine_active_agent(&history, explicit_agent).await;
        let pinned = explicit_agent.is_some();

        let state = Arc::new(Mutex::new(TurnState {
            active_agent: active_agent_name,
            active_skills: Vec::new(),
            extra_system_prompt: String::new(),
            kwargs: HashMap::new(),
        }));

        for step in 0..self.max_steps {
            let current_agent = state.lock().unwrap().active_agent.clone();
            let definition = self
                .agents
                .get_agent(&current_agent)
                .await
                .ok_or_else(|| GatewayError::UnknownHandler {
                    name: current_agent.clone(),
                    known: self.agents.agent_names().await,
                })?;

            let active_skill_names = self.determine_active_skills(&history, &definition.skills);
            {
                let mut guard = state.lock().unwrap();
                for name in &active_skill_names {
                    if !guard.active_skills.contains(name) {
                        guard.active_skills.push(name.clone());
                    }
                }
            }

            let mut tool_filters = definition.tools.clone();
            let mut declared_skills = Vec::new();
            for name in &state.lock().unwrap().active_skills {
                if let Some(skill) = self.agents.get_skill(name).await {
                    tool_filters.extend(skill.tools.clone());
                    declared_skills.push(skill);
                }
            }

            let mut all_tools = self.mcp_tools.clone();
            if !pinned {
                let agent_names = self.agents.agent_names().await;
                all_tools.extend(self.synthesize_handover_tools(&agent_names, state.clone()));
            }
            let skill_candidates: Vec<crate::gateway::agents::registry::Skill> = {
                let mut out = Vec::new();
                for name in &definition.skills {
                    if let Some(skill) = self.agents.get_skill(name).await {
                        out.push(skill);
                    }
                }
                out
            };
            all_tools.extend(self.synthesize_skill_tools(&skill_candidates, state.clone()));

            let is_last_step = step == self.max_steps - 1;
            let visible = if is_last_step {
                Vec::new()
            } else {
                Self::visible_tools(&all_tools, &tool_filters, &current_agent)
            };

            let system_prompt = {
                let guard = state.lock().unwrap();
                let placeholders: HashMap<String, String> = if guard.kwargs.is_empty() {
                    let mut merged = context.clone();
                    merged.insert("task".to_string(), task.to_string());
                    merged
                } else {
                    guard.kwargs.clone()
                };
                let filled = Self::fill_placeholders(&definition.prompt_template, &placeholders);
                format!("{}{}", filled, guard.extra_system_prompt)
            };

            let windowed: Vec<ChatMessage> = history
                .iter()
                .rev()
                .take(HISTORY_WINDOW)
                .rev()
                .cloned()
                .collect();

            let model_name = definition.model.clone().unwrap_or_else(|| self.default_model.clone());
            let (connector, upstream_model) = self.model_provider.get_llm(&model_name)?;

            let mut response = connector
                .chat(
                    &upstream_model,
                    windowed,
                    visible.clone(),
                    system_prompt,
                    true,
                    true,
                )
                .await?;

            let mut stream = response.stream();
            let mut router = ThinkRouter::default();
            use futures_util::StreamExt;
            while let Some(token) = stream.next().await {
                router.route(&token, output).await;
            }

            let tool_calls = response.tool_calls().await?;
            let visible_text = response.text().await?;

            history.push(ChatMessage::assistant(visible_text.clone(), tool_calls.clone()));

            if tool_calls.is_empty() {
                if !visible_text.trim().is_empty() {
                    return Ok(());
                }
                continue;
            }

            for tc in &tool_calls {
                match tc {
                    ToolCallOrError::Call(call) => {
                        output
                            .thought(&format!("Calling tool `{}`...\n", call.tool.name))
                            .await;
                        let result = self.invoke_tool(call).await;
                        output.thought(&format!("Result: {}\n", result)).await;
                        history.push(ChatMessage::tool(result, call.id.clone()));
                    }
                    ToolCallOrError::Error(message) => {
                        output.thought(&format!("Tool call failed: {}\n", message)).await;
                        history.push(ChatMessage::tool(message.clone(), Uuid::new_v4().to_string()));
                    }
                }
            }
        }

        Ok(())
    }

    async fn invoke_tool(&self, call: &ToolCall) -> String {
        call.tool.call(call.params.clone()).await
    }
}

/// Case-sensitive glob match: `filter` either equals `name` exactly, or ends with `*` and `name`
/// starts with the prefix before the `*`.
fn glob_match(filter: &str, name: &str) -> bool {
    if filter == name {
        return true;
    }
    if let Some(prefix) = filter.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    false
}

/// Routes streamed text into the output writer's `default`/`thought` voices by tracking
/// `<think>`/`</think>` boundaries across chunk edges — distinct from [`crate::gateway::response`]'s
/// parsers, which only care about `[CALL]` spans; this one only cares about thought framing.
#[derive(Default)]
struct ThinkRouter {
    in_thought: bool,
    pending: String,
}

impl ThinkRouter {
    async fn route(&mut self, chunk: &str, output: &mut OutputWriter) {
        self.pending.push_str(chunk);
        loop {
            let marker = if self.in_thought { "</think>" } else { "<think>" };
            match self.pending.find(marker) {
                Some(idx) => {
                    let before: String = self.pending.drain(..idx).collect();
                    self.pending.drain(..marker.len());
                    if !before.is_empty() {
                        self.emit(&before, output).await;
                    }
                    self.in_thought = !self.in_thought;
                }
                None => {
                    // Keep enough trailing text unflushed to detect a marker split across chunks.
                    let keep = marker.len().saturating_sub(1).min(self.pending.len());
                    let flush_len = self.pending.len() - keep;
                    let flushed: String = self.pending.drain(..flush_len).collect();
                    if !flushed.is_empty() {
                        self.emit(&flushed, output).await;
                    }
                    break;
                }
            }
        }
    }

    async fn emit(&self, text: &str, output: &mut OutputWriter) {
        if self.in_thought {
            output.thought(text).await;
        } else {
            output.default(text).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_exact_and_wildcard() {
        assert!(glob_match("fs.read", "fs.read"));
        assert!(glob_match("fs.*", "fs.read"));
        assert!(!glob_match("fs.*", "net.read"));
        assert!(!glob_match("fs.read", "fs.write"));
    }

    #[test]
    fn most_recent_marker_finds_last_match() {
        let history = vec![
            ChatMessage::assistant("Successfully switched to agent: `billing`", vec![]),
            ChatMessage::assistant("Successfully switched to agent: `support`", vec![]),
        ];
        assert_eq!(
            most_recent_marker(&history, "Successfully switched to agent: "),
            Some("support".to_string())
        );
    }

    fn plain_tool(name: &str) -> Tool {
        Tool::new(name, "", HashMap::new(), |_p| Box::pin(async { String::new() }))
    }

    #[test]
    fn visible_tools_excludes_self_handover_tool() {
        let tools = vec![plain_tool("agent.billing"), plain_tool("agent.support"), plain_tool("fs.read")];
        let visible = Runner::visible_tools(&tools, &["*".to_string()], "billing");
        let names: Vec<&str> = visible.iter().map(|t| t.name.as_str()).collect();
        assert!(!names.contains(&"agent.billing"));
        assert!(names.contains(&"agent.support"));
        assert!(names.contains(&"fs.read"));
    }

    #[test]
    fn visible_tools_is_monotone_under_filter_intersection() {
        let tools = vec![plain_tool("fs.read"), plain_tool("fs.write"), plain_tool("net.fetch")];
        let wide = Runner::visible_tools(&tools, &["*".to_string()], "auto");
        let narrow = Runner::visible_tools(&tools, &["fs.*".to_string()], "auto");
        let narrow_names: std::collections::HashSet<&str> = narrow.iter().map(|t| t.name.as_str()).collect();
        let wide_names: std::collections::HashSet<&str> = wide.iter().map(|t| t.name.as_str()).collect();
        assert!(narrow_names.is_subset(&wide_names));
    }

    #[test]
    fn namespace_anchor_gates_sibling_tools_to_the_matching_agent() {
        // Anchors are named `agent.<name>.__main__` (e.g. the original's own
        // `agent.code.__main__` example) since the namespace prefix is matched against
        // `agent.<current_agent>`, not the bare agent name.
        let tools = vec![
            plain_tool("agent.billing.__main__"),
            plain_tool("agent.billing.refund"),
            plain_tool("agent.support.ticket"),
        ];
        let visible_to_billing = Runner::visible_tools(&tools, &["*".to_string()], "billing");
        let names: Vec<&str> = visible_to_billing.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"agent.billing.refund"), "the anchor's own agent should see its siblings");

        let visible_to_support = Runner::visible_tools(&tools, &["*".to_string()], "support");
        let names: Vec<&str> = visible_to_support.iter().map(|t| t.name.as_str()).collect();
        assert!(
            !names.contains(&"agent.billing.refund"),
            "an unrelated agent must not see a tool gated behind another namespace's anchor"
        );
        assert!(names.contains(&"agent.support.ticket"));
    }
}
