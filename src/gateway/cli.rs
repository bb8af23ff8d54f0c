//! Command-line surface: `server`, `ui` (out-of-scope stub), and a default direct-chat mode.
//!
//! Grounded on `api/cli.py::cli_chat` (direct mode: resolve a handler, run one turn, optionally
//! log the output buffer, exit 22 on an unknown agent) and `api/server.py`'s own entrypoint for
//! `server`. Argument/subcommand shape learned from `hi-youichi-loom/cli` and
//! `PPRAMANIK62-kaze`, both `clap` derive-based CLIs.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "quack-gateway", about = "OpenAI-compatible multi-agent chat gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file name, resolved against the repo/user/cwd search path.
    #[arg(long, global = true, default_value = "config.json")]
    pub config: String,

    /// Enable debug logging and config dump.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Working directory to resolve relative agent/skill/config paths against.
    #[arg(long, global = true)]
    pub workdir: Option<String>,

    /// `--name=value` / `--flag` configuration overrides, repeatable.
    #[arg(long = "set", global = true)]
    pub overrides: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the HTTP API on the configured (or overridden) host:port.
    Server,
    /// Out-of-scope stub: the GUI launcher lives outside this crate.
    Ui,
    /// Run a single chat turn directly against an agent and print (or log) the result.
    Chat(ChatArgs),
}

#[derive(Debug, clap::Args)]
pub struct ChatArgs {
    /// Agent name to pin for this turn; unset resolves via the usual handover rules.
    #[arg(long)]
    pub agent: Option<String>,

    /// Literal text, or a path to a file containing it.
    #[arg(long)]
    pub input: String,

    /// Append the rendered output buffer to this path.
    #[arg(long)]
    pub output: Option<String>,
}

/// Exit code for "configuration file could not be found/parsed" — matches the original's `exit(1)`.
pub const EXIT_CONFIG_NOT_FOUND: i32 = 1;

/// Exit code for "named agent does not exist" — matches the original's `exit(22)`.
pub const EXIT_UNKNOWN_AGENT: i32 = 22;
