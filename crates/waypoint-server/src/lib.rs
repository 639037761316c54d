pub mod handlers;
pub mod orchestrator;
pub mod server;

pub use orchestrator::{ChatOrchestrator, TurnGuard};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
