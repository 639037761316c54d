use async_trait::async_trait;
use serde_json::{json, Value};

use waypoint_core::tools::{Tool, ToolContext, ToolError};
use waypoint_store::tasks::TaskRepo;
use waypoint_store::Database;

const DEFAULT_LIMIT: u32 = 20;

/// Looks up tasks of the current project by title substring.
pub struct ProjectLookupTool {
    tasks: TaskRepo,
}

impl ProjectLookupTool {
    pub fn new(db: Database) -> Self {
        Self { tasks: TaskRepo::new(db) }
    }
}

#[async_trait]
impl Tool for ProjectLookupTool {
    fn name(&self) -> &str {
        "project_lookup"
    }

    fn description(&self) -> &str {
        "Search the current project's tasks by title. Returns matching tasks \
         with their story-generation state."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Substring to match against task titles"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of tasks to return"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("query is required".into()))?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_LIMIT);

        let rows = self
            .tasks
            .search(&ctx.project_id, query, limit)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let tasks: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "id": row.id.as_str(),
                    "title": row.title,
                    "generation_status": row.generation_status,
                    "has_stories": row.stories.is_some(),
                })
            })
            .collect();

        Ok(json!({"tasks": tasks, "count": tasks.len()}))
    }
}
