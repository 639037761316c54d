use waypoint_core::errors::GatewayError;
use waypoint_core::tools::ToolError;
use waypoint_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("turn aborted")]
    Aborted,

    #[error("max tool rounds exceeded: {0}")]
    MaxRoundsExceeded(u32),

    #[error("{0}")]
    Internal(String),
}
