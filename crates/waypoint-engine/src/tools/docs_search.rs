use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::instrument;

use waypoint_core::tools::{Tool, ToolContext, ToolError};

const DEFAULT_LIMIT: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Semantic search against an external documentation search service.
/// Transport and HTTP failures come back as structured tool errors the
/// model can react to.
pub struct DocsSearchTool {
    client: reqwest::Client,
    base_url: String,
}

impl DocsSearchTool {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Tool for DocsSearchTool {
    fn name(&self) -> &str {
        "docs_search"
    }

    fn description(&self) -> &str {
        "Search the product documentation. Returns the most relevant passages \
         for a natural-language query."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural-language search query"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of passages to return"
                }
            },
            "required": ["query"]
        })
    }

    #[instrument(skip(self, args, _ctx))]
    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("query is required".into()))?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_LIMIT);

        let resp = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&json!({"query": query, "limit": limit}))
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("search request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "search service returned {}",
                resp.status()
            )));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid search response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use waypoint_core::ids::{ConversationId, ProjectId, UserId};

    fn ctx() -> ToolContext {
        ToolContext {
            conversation_id: ConversationId::new(),
            project_id: ProjectId::new(),
            user_id: UserId::new(),
            user_email: "alice@acme.dev".into(),
            abort_signal: CancellationToken::new(),
        }
    }

    #[test]
    fn schema_requires_query() {
        let tool = DocsSearchTool::new("http://localhost:9");
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"][0], "query");
    }

    #[tokio::test]
    async fn missing_query_is_invalid_arguments() {
        let tool = DocsSearchTool::new("http://localhost:9");
        let result = tool.execute(json!({"limit": 3}), &ctx()).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn unreachable_service_is_execution_failure() {
        // Port 9 (discard) refuses connections on the loopback.
        let tool = DocsSearchTool::new("http://127.0.0.1:9");
        let result = tool.execute(json!({"query": "deployments"}), &ctx()).await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed(_))));
    }
}
