use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        })
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A single chat message. Tool calls and results are only present on
/// assistant messages produced after tool use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultBlock>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool call requested by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// What a tool execution produced: exactly one of a result payload or a
/// structured error. The enum makes "both" and "neither" unrepresentable.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutcome {
    Result { value: serde_json::Value },
    Error { message: String },
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The payload the model sees on the next round. Errors are fed back as
    /// `{"error": message}` so the model can react instead of the turn aborting.
    pub fn as_model_payload(&self) -> serde_json::Value {
        match self {
            Self::Result { value } => value.clone(),
            Self::Error { message } => serde_json::json!({ "error": message }),
        }
    }
}

/// Outcome of one tool call, paired back to the call by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_call_id: ToolCallId,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}
