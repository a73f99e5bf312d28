use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing::info;

mod app;
mod chat;
mod http;
mod mcp_bridge;
mod mcp_lifecycle;
mod scheduler_exec;
mod stop;
mod tools;
mod update;
mod ws;

/// Openclaw gateway — the always-on process behind every channel.
#[derive(Parser)]
#[command(name = "openclaw-gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default when no subcommand is given).
    Serve,
    /// Run as an MCP stdio server for Claude Code, instead of serving HTTP/WS.
    McpBridge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openclaw_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > OPENCLAW_CONFIG env > ~/.openclaw/openclaw.toml
    let config_path = std::env::var("OPENCLAW_CONFIG").ok();
    let config = openclaw_core::config::OpenclawConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            openclaw_core::config::OpenclawConfig::default()
        });

    if matches!(cli.command, Some(Command::McpBridge)) {
        return mcp_bridge::run(&config);
    }

    // Only relevant when `claude-cli` is the configured provider; registers
    // (or unregisters) this binary as an MCP server entry in ~/.claude.json.
    mcp_lifecycle::ensure_mcp_registration(&config);

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let db_path = config.database.path.clone();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let agent_runtime = build_agent_runtime(&config)?;
    let users_conn = Connection::open(&db_path)?;
    let users = openclaw_users::resolver::UserResolver::new(Arc::new(Mutex::new(users_conn)));
    let memory = openclaw_memory::manager::MemoryManager::new(Connection::open(&db_path)?);
    let sessions = openclaw_sessions::manager::SessionManager::new(Connection::open(&db_path)?);
    let terminal = openclaw_terminal::manager::TerminalManager::new();

    let transcripts_dir = std::path::Path::new(&db_path)
        .parent()
        .map(|p| p.join("transcripts"))
        .unwrap_or_else(|| std::path::PathBuf::from("transcripts"));
    let transcripts = openclaw_sessions::transcript::TranscriptStore::new(transcripts_dir);

    let state = app::AppState::new(
        config,
        agent_runtime,
        users,
        memory,
        sessions,
        Connection::open(&db_path)?,
        terminal,
        transcripts,
    )?;
    let router = app::build_router(state.clone());

    // Drive the cron master timer for the lifetime of the process; the
    // shutdown sender is held open here and only fires if a future graceful
    // shutdown hook closes it.
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(state.scheduler.clone().run_loop(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("OpenClaw gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Build the agent runtime from whichever provider is configured, preferring
/// Anthropic, then an OpenAI-compatible endpoint, then falling back to a
/// local Ollama instance so the gateway always has a usable default.
fn build_agent_runtime(
    config: &openclaw_core::config::OpenclawConfig,
) -> anyhow::Result<openclaw_agent::runtime::AgentRuntime> {
    use openclaw_agent::provider::LlmProvider;

    let provider: Box<dyn LlmProvider> = if let Some(anthropic) = &config.providers.anthropic {
        Box::new(openclaw_agent::anthropic::AnthropicProvider::new(
            anthropic.api_key.clone(),
            Some(anthropic.base_url.clone()),
        ))
    } else if let Some(openai) = &config.providers.openai {
        Box::new(openclaw_agent::openai::OpenAiProvider::new(
            openai.api_key.clone(),
            Some(openai.base_url.clone()),
        ))
    } else {
        let base = config
            .providers
            .ollama
            .as_ref()
            .map(|o| o.base_url.clone());
        Box::new(openclaw_agent::ollama::OllamaProvider::new(base))
    };

    let prompt =
        openclaw_agent::prompt::PromptBuilder::load(config.agent.soul_path.as_deref(), None);

    Ok(openclaw_agent::runtime::AgentRuntime::new(
        provider,
        prompt,
        config.agent.model.clone(),
    ))
}
