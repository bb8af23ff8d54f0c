//! Entry point: parse the CLI, load configuration, warm up connectors and agents, then either
//! serve the HTTP API or run one direct chat turn.
//!
//! Grounded on `api/server.py`'s module-level entrypoint and `api/cli.py::cli_chat`.

use clap::Parser;
use quack_gateway::gateway::agents::{AgentRegistry, Runner};
use quack_gateway::gateway::cli::{Cli, Commands, EXIT_CONFIG_NOT_FOUND, EXIT_UNKNOWN_AGENT};
use quack_gateway::gateway::config;
use quack_gateway::gateway::handler::{AgentChatHandler, ChatHandlerRegistry, ProxyChatHandlerProvider};
use quack_gateway::gateway::model_provider::ModelProvider;
use quack_gateway::gateway::output_writer::OutputWriter;
use quack_gateway::gateway::server;
use quack_gateway::gateway::types::ChatMessage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let code_home = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let mut gateway_config = match config::read_config(&cli.config, &code_home) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(EXIT_CONFIG_NOT_FOUND);
        }
    };

    if let Err(e) = config::apply_overrides(&mut gateway_config, &cli.overrides) {
        eprintln!("invalid --set override: {}", e);
        std::process::exit(EXIT_CONFIG_NOT_FOUND);
    }

    apply_legacy_env_fallback(&mut gateway_config);

    if let Some(workdir) = &cli.workdir {
        if let Err(e) = std::env::set_current_dir(workdir) {
            eprintln!("failed to change to workdir '{}': {}", workdir, e);
            std::process::exit(EXIT_CONFIG_NOT_FOUND);
        }
    }

    match cli.command.unwrap_or(Commands::Server) {
        Commands::Ui => {
            println!("The graphical launcher lives outside this crate; run 'quack-gateway server' instead.");
            std::process::exit(0);
        }
        Commands::Server => run_server(gateway_config).await,
        Commands::Chat(args) => run_direct(gateway_config, args).await,
    }
}

/// Legacy single-connection fallback: when no `llms` map is configured, build one from
/// `API_ENDPOINT`/`API_KEY`/`PROVIDER`/`MODEL`/`DEFAULT_MODEL`/`SYSTEM_PROMPT_LAST`.
fn apply_legacy_env_fallback(config: &mut config::GatewayConfig) {
    if !config.llms.is_empty() {
        return;
    }
    let endpoint = std::env::var("API_ENDPOINT").ok();
    let model = std::env::var("MODEL").ok();
    let (Some(endpoint), Some(model)) = (endpoint, model) else {
        return;
    };
    let provider = std::env::var("PROVIDER").unwrap_or_else(|_| "OpenAI".to_string());
    let api_key = std::env::var("API_KEY").unwrap_or_default();
    let system_prompt_last = std::env::var("SYSTEM_PROMPT_LAST")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let default_model = std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| model.clone());

    let mut connection_config = config::ModelConnectionConfig::default();
    connection_config.system_prompt_last = system_prompt_last;

    config.llms.insert(
        "default".to_string(),
        config::ModelConnectionSpec {
            api_endpoint: endpoint,
            api_key,
            provider,
            model,
            config: connection_config,
        },
    );
    if config.default_model.is_empty() {
        config.default_model = default_model;
    }
}

async fn bootstrap(config: &config::GatewayConfig) -> (Arc<ModelProvider>, Arc<AgentRegistry>, Arc<Runner>) {
    let model_provider = Arc::new(
        ModelProvider::warm_up(config)
            .await
            .unwrap_or_else(|e| {
                eprintln!("failed to warm up model connectors: {}", e);
                std::process::exit(EXIT_CONFIG_NOT_FOUND);
            }),
    );

    let agents_dir = PathBuf::from(&config.agents_dir);
    let skills_dir = PathBuf::from(&config.skills_dir);
    let agent_registry = Arc::new(
        AgentRegistry::bootstrap(agents_dir, skills_dir)
            .await
            .unwrap_or_else(|e| {
                eprintln!("failed to bootstrap agent registry: {}", e);
                std::process::exit(EXIT_CONFIG_NOT_FOUND);
            }),
    );

    let runner = Arc::new(
        Runner::bootstrap(
            model_provider.clone(),
            agent_registry.clone(),
            &config.mcps,
            config.default_model.clone(),
            "auto".to_string(),
            config.max_steps,
        )
        .await,
    );

    (model_provider, agent_registry, runner)
}

async fn run_server(config: config::GatewayConfig) {
    let (model_provider, agent_registry, runner) = bootstrap(&config).await;

    let mut registry = ChatHandlerRegistry::new();
    for name in agent_registry.agent_names().await {
        registry.register_handler(name.clone(), Arc::new(AgentChatHandler::new(runner.clone(), name)));
    }
    registry.register_handler_provider(Arc::new(ProxyChatHandlerProvider::new(
        model_provider.clone(),
        &config.proxy,
    )));

    let state = Arc::new(server::AppState {
        registry: Arc::new(registry),
        workspaces: server::workspaces_from_config(&config),
    });

    let app = server::build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    log::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("failed to bind {}: {}", addr, e);
        std::process::exit(EXIT_CONFIG_NOT_FOUND);
    });
    axum::serve(listener, app).await.expect("server exited unexpectedly");
}

async fn run_direct(config: config::GatewayConfig, args: quack_gateway::gateway::cli::ChatArgs) {
    let (_model_provider, agent_registry, runner) = bootstrap(&config).await;

    if let Some(agent) = &args.agent {
        if agent_registry.get_agent(agent).await.is_none() {
            eprintln!("unknown agent '{}'", agent);
            std::process::exit(EXIT_UNKNOWN_AGENT);
        }
    }

    let input_path = PathBuf::from(&args.input);
    let text = if input_path.is_file() {
        std::fs::read_to_string(&input_path).unwrap_or(args.input.clone())
    } else {
        args.input.clone()
    };

    let history = vec![ChatMessage::user(text.clone())];
    let mut output = OutputWriter::stdout();

    if let Err(e) = runner
        .run(history, &mut output, args.agent.as_deref(), &text, &HashMap::new())
        .await
    {
        eprintln!("chat turn failed: {}", e);
    }

    if let Some(path) = &args.output {
        if let Err(e) = std::fs::write(path, output.output_buffer()) {
            eprintln!("failed to write output log to '{}': {}", path, e);
        }
    }
}
