use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use waypoint_engine::providers::ProcessToolProvider;
use waypoint_engine::registry::{ToolRegistry, ToolSource};
use waypoint_engine::runner::RunnerConfig;
use waypoint_engine::tools::{infra_tools, DocsSearchTool, HttpInfraBackend, ProjectLookupTool};
use waypoint_llm::OpenAiGateway;
use waypoint_server::{AppState, ServerConfig};
use waypoint_store::Database;
use waypoint_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "waypoint", about = "Conversational deployment assistant server")]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "WAYPOINT_PORT", default_value_t = 8080)]
    port: u16,

    /// Path to the SQLite database file.
    #[arg(long, env = "WAYPOINT_DB", default_value = "waypoint.db")]
    db_path: PathBuf,

    /// Base URL of the OpenAI-compatible model gateway.
    #[arg(long, env = "WAYPOINT_GATEWAY_URL", default_value = "https://api.openai.com/v1")]
    gateway_url: String,

    /// API key for the model gateway.
    #[arg(long, env = "WAYPOINT_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Model name sent on every completion request.
    #[arg(long, env = "WAYPOINT_MODEL", default_value = "gpt-4o")]
    model: String,

    /// Base URL of the documentation search service.
    #[arg(long, env = "WAYPOINT_DOCS_URL")]
    docs_url: Option<String>,

    /// Base URL of the infrastructure backend.
    #[arg(long, env = "WAYPOINT_INFRA_URL")]
    infra_url: Option<String>,

    /// External tool providers as `name=command` pairs. Each command is
    /// queried once at startup for its tool list.
    #[arg(long = "tool-provider", value_name = "NAME=COMMAND")]
    tool_providers: Vec<String>,

    /// Model rounds allowed per turn before the turn is aborted.
    #[arg(long, default_value_t = 25)]
    max_rounds: u32,

    /// Recent messages included in each model request.
    #[arg(long, default_value_t = 30)]
    context_window: u32,

    /// Per-tool execution timeout in seconds.
    #[arg(long, default_value_t = 120)]
    tool_timeout_secs: u64,

    /// System prompt prepended to every model request.
    #[arg(long, env = "WAYPOINT_SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    /// Emit logs as one JSON object per line.
    #[arg(long)]
    json_logs: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        log_level: args.log_level,
        module_levels: Vec::new(),
        json_output: args.json_logs,
    });

    tracing::info!("starting waypoint server");

    if let Some(parent) = args.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }
    let db = Database::open(&args.db_path)
        .with_context(|| format!("opening database at {}", args.db_path.display()))?;
    tracing::info!(path = %args.db_path.display(), "database opened");

    let registry = build_registry(&args, db.clone()).await;
    tracing::info!(tools = registry.count(), "tool registry built");

    let provider = Arc::new(OpenAiGateway::new(
        args.gateway_url.clone(),
        SecretString::from(args.api_key.clone()),
        args.model.clone(),
    ));

    let runner_config = RunnerConfig {
        context_window: args.context_window,
        max_rounds: args.max_rounds,
        tool_timeout: Duration::from_secs(args.tool_timeout_secs),
        system_prompt: args.system_prompt.clone(),
        ..RunnerConfig::default()
    };

    let state = AppState::new(db, provider, Arc::new(registry), runner_config);
    let handle = waypoint_server::start(ServerConfig { port: args.port }, state)
        .await
        .context("starting HTTP server")?;

    tracing::info!(port = handle.port, "waypoint server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("shutting down");

    Ok(())
}

/// Assemble the tool registry: built-in tools first, then any tools the
/// configured external providers advertise. The registry is immutable
/// once the server starts.
async fn build_registry(args: &Args, db: Database) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(ProjectLookupTool::new(db)), ToolSource::BuiltIn);

    if let Some(docs_url) = &args.docs_url {
        registry.register(Arc::new(DocsSearchTool::new(docs_url)), ToolSource::BuiltIn);
    } else {
        tracing::warn!("no docs search URL configured; docs_search tool disabled");
    }

    if let Some(infra_url) = &args.infra_url {
        let backend = Arc::new(HttpInfraBackend::new(infra_url));
        for tool in infra_tools(backend) {
            registry.register(tool, ToolSource::BuiltIn);
        }
    } else {
        tracing::warn!("no infra backend URL configured; deployment tools disabled");
    }

    for spec in &args.tool_providers {
        let Some((name, command)) = spec.split_once('=') else {
            tracing::warn!(spec = %spec, "ignoring malformed tool provider (expected name=command)");
            continue;
        };
        let provider = ProcessToolProvider::new(name, command)
            .with_invoke_timeout(Duration::from_secs(args.tool_timeout_secs));
        let count = provider.register_with(&mut registry).await;
        tracing::info!(provider = name, tools = count, "registered provider tools");
    }

    registry
}
