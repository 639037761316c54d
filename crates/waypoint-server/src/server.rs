use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use waypoint_core::events::ChatEvent;
use waypoint_core::provider::LlmProvider;
use waypoint_engine::registry::ToolRegistry;
use waypoint_engine::runner::{ChatRunner, RunnerConfig};
use waypoint_engine::GenerationService;
use waypoint_store::Database;

use crate::handlers;
use crate::orchestrator::ChatOrchestrator;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub runner: Arc<ChatRunner>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub generation: Arc<GenerationService>,
    pub event_tx: broadcast::Sender<ChatEvent>,
    /// Tick interval of the status poll stream.
    pub poll_interval: Duration,
}

impl AppState {
    /// Wire the engine together: one event bus, one runner over the shared
    /// registry, one generation service.
    pub fn new(
        db: Database,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        runner_config: RunnerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let runner = Arc::new(ChatRunner::new(
            Arc::clone(&provider),
            registry,
            db.clone(),
            event_tx.clone(),
            runner_config,
        ));
        let generation = Arc::new(GenerationService::new(db.clone(), provider));

        Self {
            db,
            runner,
            orchestrator: Arc::new(ChatOrchestrator::new()),
            generation,
            event_tx,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::post_chat))
        .route("/api/tasks/{id}/generate", post(handlers::post_generate))
        .route("/api/tasks/{id}/status", get(handlers::get_task_status))
        .route(
            "/api/tasks/{id}/status/stream",
            get(handlers::get_task_status_stream),
        )
        .route("/api/deployments/{id}", get(handlers::get_deployment))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle keeping it alive.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "waypoint server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

/// Handle returned by `start()`; keeps the accept loop alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}
