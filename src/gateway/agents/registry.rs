//! Loads `*.agent.md` / `*.skill.md` files into [`AgentDefinition`]/[`Skill`] values and keeps
//! them live via a debounced filesystem watcher.
//!
//! Grounded on the original's agent-file bootstrap (discover on startup, reload on change, drop
//! on delete) and on `hi-youichi-loom`'s use of `serde_yaml` for embedded frontmatter metadata.
//! File watching itself has no analogue in the teacher or the rest of the pack; `notify` plus
//! `notify-debouncer-mini` are the standard ecosystem crates for this, matching the original's use
//! of Python's `watchdog`.

use crate::gateway::error::GatewayError;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const DEFAULT_AGENT_TEMPLATE: &str = include_str!("../templates/default_agent.md");

/// Accepts either a YAML sequence of strings or a single comma-separated scalar string for
/// `tools:`/`skills:` frontmatter fields, matching `_load_agent_from_file`'s
/// `if isinstance(tools, str): tools = [s.strip() for s in tools.split(",")]`.
fn string_or_comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        String(String),
        Seq(Vec<String>),
    }

    match StringOrSeq::deserialize(deserializer)? {
        StringOrSeq::String(s) => Ok(s.split(',').map(|part| part.trim().to_string()).filter(|p| !p.is_empty()).collect()),
        StringOrSeq::Seq(v) => Ok(v),
    }
}

/// Parsed `---`-delimited YAML frontmatter of a `*.agent.md` file.
#[derive(Debug, Clone, Deserialize, Default)]
struct AgentFrontmatter {
    name: Option<String>,
    #[serde(default)]
    description: String,
    model: Option<String>,
    #[serde(default, deserialize_with = "string_or_comma_list")]
    tools: Vec<String>,
    #[serde(default, deserialize_with = "string_or_comma_list")]
    skills: Vec<String>,
    #[serde(default)]
    system_prompt_last: bool,
}

/// One agent, loaded from a `*.agent.md` file and kept current by the registry's watcher.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub model: Option<String>,
    /// Glob filters (`"namespace.*"` or an exact tool name) selecting which tools this agent sees.
    pub tools: Vec<String>,
    pub skills: Vec<String>,
    pub system_prompt_last: bool,
    /// Raw prompt template body, with `{task}` / `{today}` / `{now}` / `{<context>}` placeholders.
    pub prompt_template: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct SkillFrontmatter {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "string_or_comma_list")]
    tools: Vec<String>,
}

/// One skill, loaded from a `*.skill.md` file.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
    pub prompt: String,
}

/// Splits a `---\n<yaml>\n---\n<body>` document into its frontmatter and body.
fn split_frontmatter(text: &str) -> Result<(&str, &str), GatewayError> {
    let rest = text
        .strip_prefix("---")
        .ok_or_else(|| GatewayError::FileLoadError("missing frontmatter delimiter".to_string()))?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest
        .find("\n---")
        .ok_or_else(|| GatewayError::FileLoadError("unterminated frontmatter".to_string()))?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');
    Ok((yaml, body))
}

/// Derive a dotted name from a file path relative to its root: separators become dots, the
/// `.agent.md`/`.skill.md` suffix is stripped.
fn derive_name(root: &Path, path: &Path, suffix: &str) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let as_str = relative.to_string_lossy().replace(std::path::MAIN_SEPARATOR, ".");
    as_str.strip_suffix(suffix).unwrap_or(&as_str).to_string()
}

fn load_agent_file(root: &Path, path: &Path, text: &str) -> Result<AgentDefinition, GatewayError> {
    let (yaml, body) = split_frontmatter(text)?;
    let frontmatter: AgentFrontmatter = serde_yaml::from_str(yaml)
        .map_err(|e| GatewayError::FileLoadError(format!("{}: invalid frontmatter: {}", path.display(), e)))?;
    let derived = derive_name(root, path, ".agent.md");
    Ok(AgentDefinition {
        name: frontmatter.name.unwrap_or(derived),
        description: frontmatter.description,
        model: frontmatter.model,
        tools: frontmatter.tools,
        skills: frontmatter.skills,
        system_prompt_last: frontmatter.system_prompt_last,
        prompt_template: body.to_string(),
    })
}

fn load_skill_file(root: &Path, path: &Path, text: &str) -> Result<Skill, GatewayError> {
    let (yaml, body) = split_frontmatter(text)?;
    let frontmatter: SkillFrontmatter = serde_yaml::from_str(yaml)
        .map_err(|e| GatewayError::FileLoadError(format!("{}: invalid frontmatter: {}", path.display(), e)))?;
    let derived = derive_name(root, path, ".skill.md");
    Ok(Skill {
        name: frontmatter.name.unwrap_or(derived),
        description: frontmatter.description,
        tools: frontmatter.tools,
        prompt: body.to_string(),
    })
}

fn walk_files(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path, suffix));
        } else if path.to_string_lossy().ends_with(suffix) {
            out.push(path);
        }
    }
    out
}

/// Live, file-backed set of agents and skills. Holds its watcher for as long as the registry is
/// alive; dropping the registry stops the watch.
pub struct AgentRegistry {
    agents_dir: PathBuf,
    skills_dir: PathBuf,
    agents: Arc<RwLock<HashMap<String, AgentDefinition>>>,
    skills: Arc<RwLock<HashMap<String, Skill>>>,
    _watcher: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl AgentRegistry {
    /// Ensure `agents_dir/auto.agent.md` exists (writing the bundled default template if not),
    /// load every `*.agent.md`/`*.skill.md` under `agents_dir`/`skills_dir`, and start watching
    /// both trees for changes.
    pub async fn bootstrap(agents_dir: PathBuf, skills_dir: PathBuf) -> Result<Self, GatewayError> {
        std::fs::create_dir_all(&agents_dir)?;
        std::fs::create_dir_all(&skills_dir)?;

        let default_agent_path = agents_dir.join("auto.agent.md");
        if !default_agent_path.is_file() {
            std::fs::write(&default_agent_path, DEFAULT_AGENT_TEMPLATE)?;
        }

        let agents: HashMap<String, AgentDefinition> = walk_files(&agents_dir, ".agent.md")
            .into_iter()
            .filter_map(|path| {
                let text = std::fs::read_to_string(&path).ok()?;
                match load_agent_file(&agents_dir, &path, &text) {
                    Ok(def) => Some((def.name.clone(), def)),
                    Err(e) => {
                        log::warn!("skipping agent file {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .collect();

        let skills: HashMap<String, Skill> = walk_files(&skills_dir, ".skill.md")
            .into_iter()
            .filter_map(|path| {
                let text = std::fs::read_to_string(&path).ok()?;
                match load_skill_file(&skills_dir, &path, &text) {
                    Ok(skill) => Some((skill.name.clone(), skill)),
                    Err(e) => {
                        log::warn!("skipping skill file {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .collect();

        let agents = Arc::new(RwLock::new(agents));
        let skills = Arc::new(RwLock::new(skills));

        let watcher = Self::start_watcher(
            agents_dir.clone(),
            skills_dir.clone(),
            agents.clone(),
            skills.clone(),
        )?;

        Ok(AgentRegistry {
            agents_dir,
            skills_dir,
            agents,
            skills,
            _watcher: watcher,
        })
    }

    fn start_watcher(
        agents_dir: PathBuf,
        skills_dir: PathBuf,
        agents: Arc<RwLock<HashMap<String, AgentDefinition>>>,
        skills: Arc<RwLock<HashMap<String, Skill>>>,
    ) -> Result<notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>, GatewayError> {
        let (tx, rx) = std::sync::mpsc::channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(Duration::from_millis(100), tx)
            .map_err(|e| GatewayError::ConfigError(format!("failed to start file watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&agents_dir, notify::RecursiveMode::Recursive)
            .map_err(|e| GatewayError::ConfigError(format!("failed to watch {}: {}", agents_dir.display(), e)))?;
        debouncer
            .watcher()
            .watch(&skills_dir, notify::RecursiveMode::Recursive)
            .map_err(|e| GatewayError::ConfigError(format!("failed to watch {}: {}", skills_dir.display(), e)))?;

        std::thread::spawn(move || {
            for result in rx {
                let Ok(events) = result else { continue };
                for event in events {
                    Self::handle_change(&agents_dir, &skills_dir, &agents, &skills, &event.path);
                }
            }
        });

        Ok(debouncer)
    }

    /// Reload, or remove, whichever of the two maps `path` belongs to. Runs on the watcher's
    /// blocking thread, so it uses `blocking_write` rather than spawning back onto the runtime.
    fn handle_change(
        agents_dir: &Path,
        skills_dir: &Path,
        agents: &Arc<RwLock<HashMap<String, AgentDefinition>>>,
        skills: &Arc<RwLock<HashMap<String, Skill>>>,
        path: &Path,
    ) {
        let is_agent = path.to_string_lossy().ends_with(".agent.md");
        let is_skill = path.to_string_lossy().ends_with(".skill.md");
        if !is_agent && !is_skill {
            return;
        }

        if !path.is_file() {
            // Deleted: find and remove whichever entry was backed by this path. Cheap linear
            // scan; agent/skill counts are small (dozens at most).
            if is_agent {
                let derived = derive_name(agents_dir, path, ".agent.md");
                agents.blocking_write().remove(&derived);
            } else {
                let derived = derive_name(skills_dir, path, ".skill.md");
                skills.blocking_write().remove(&derived);
            }
            return;
        }

        let Ok(text) = std::fs::read_to_string(path) else {
            return;
        };

        if is_agent {
            match load_agent_file(agents_dir, path, &text) {
                Ok(def) => {
                    agents.blocking_write().insert(def.name.clone(), def);
                }
                Err(e) => log::warn!("failed to reload agent file {}: {}", path.display(), e),
            }
        } else {
            match load_skill_file(skills_dir, path, &text) {
                Ok(skill) => {
                    skills.blocking_write().insert(skill.name.clone(), skill);
                }
                Err(e) => log::warn!("failed to reload skill file {}: {}", path.display(), e),
            }
        }
    }

    pub async fn get_agent(&self, name: &str) -> Option<AgentDefinition> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn get_skill(&self, name: &str) -> Option<Skill> {
        self.skills.read().await.get(name).cloned()
    }

    pub async fn agent_names(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    pub fn agents_dir(&self) -> &Path {
        &self.agents_dir
    }

    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_frontmatter_separates_yaml_and_body() {
        let text = "---\nname: auto\ndescription: x\n---\nHello {task}\n";
        let (yaml, body) = split_frontmatter(text).unwrap();
        assert!(yaml.contains("name: auto"));
        assert_eq!(body, "Hello {task}\n");
    }

    #[test]
    fn derive_name_converts_separators_to_dots() {
        let root = Path::new("/agents");
        let path = Path::new("/agents/support/billing.agent.md");
        assert_eq!(derive_name(root, path, ".agent.md"), "support.billing");
    }

    #[test]
    fn load_agent_file_falls_back_to_derived_name() {
        let text = "---\ndescription: handles things\n---\nBody\n";
        let def = load_agent_file(Path::new("/agents"), Path::new("/agents/auto.agent.md"), text).unwrap();
        assert_eq!(def.name, "auto");
        assert_eq!(def.description, "handles things");
    }

    #[test]
    fn load_agent_file_accepts_comma_string_tools_and_skills() {
        let text = "---\nname: support\ntools: \"fs.*, net.*\"\nskills: billing, refunds\n---\nBody\n";
        let def = load_agent_file(Path::new("/agents"), Path::new("/agents/support.agent.md"), text).unwrap();
        assert_eq!(def.tools, vec!["fs.*".to_string(), "net.*".to_string()]);
        assert_eq!(def.skills, vec!["billing".to_string(), "refunds".to_string()]);
    }

    #[test]
    fn load_skill_file_accepts_comma_string_tools() {
        let text = "---\nname: billing\ntools: \"billing.*, ledger.read\"\n---\nBody\n";
        let skill = load_skill_file(Path::new("/skills"), Path::new("/skills/billing.skill.md"), text).unwrap();
        assert_eq!(skill.tools, vec!["billing.*".to_string(), "ledger.read".to_string()]);
    }
}
