use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::deploy::DeploymentStage;
use crate::ids::{ConversationId, ProjectId, UserId};

/// Tools declare whether they can run in parallel with others.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Safe to run in parallel (lookups, searches).
    Concurrent,
    /// Must run alone (infrastructure mutations).
    Sequential,
}

/// Context available to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub user_email: String,
    pub abort_signal: CancellationToken,
}

/// Tool definition advertised to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each tool.
///
/// Expected failure modes (not-found, invalid input) come back as
/// `ToolError` and are fed to the model as structured error payloads; they
/// never abort the turn.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    /// The deployment stage this tool advances, if any. Declared here at
    /// registration time; the registry only falls back to name heuristics
    /// for tools that return `None`.
    fn deployment_stage(&self) -> Option<DeploymentStage> {
        None
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}
