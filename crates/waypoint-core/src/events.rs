use serde::{Deserialize, Serialize};

use crate::deploy::{DeploymentStage, DeploymentStatus, StageStatus};
use crate::ids::{ConversationId, DeploymentId, ToolCallId};

/// Frames streamed to the client during a chat turn. Serialized as SSE data
/// payloads; every turn ends with `turn_complete` or `error`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    #[serde(rename = "turn_start")]
    TurnStart {
        conversation_id: ConversationId,
    },

    #[serde(rename = "text_delta")]
    TextDelta {
        conversation_id: ConversationId,
        delta: String,
    },

    #[serde(rename = "tool_start")]
    ToolStart {
        conversation_id: ConversationId,
        tool_call_id: ToolCallId,
        tool_name: String,
    },

    #[serde(rename = "tool_end")]
    ToolEnd {
        conversation_id: ConversationId,
        tool_call_id: ToolCallId,
        is_error: bool,
        duration_ms: u64,
    },

    #[serde(rename = "deployment_update")]
    DeploymentUpdate {
        conversation_id: ConversationId,
        deployment_id: DeploymentId,
        stage: DeploymentStage,
        stage_status: StageStatus,
        status: DeploymentStatus,
    },

    #[serde(rename = "turn_complete")]
    TurnComplete {
        conversation_id: ConversationId,
        rounds: u32,
    },

    #[serde(rename = "error")]
    Error {
        conversation_id: ConversationId,
        message: String,
    },
}

impl ChatEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::TurnStart { conversation_id, .. }
            | Self::TextDelta { conversation_id, .. }
            | Self::ToolStart { conversation_id, .. }
            | Self::ToolEnd { conversation_id, .. }
            | Self::DeploymentUpdate { conversation_id, .. }
            | Self::TurnComplete { conversation_id, .. }
            | Self::Error { conversation_id, .. } => conversation_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::DeploymentUpdate { .. } => "deployment_update",
            Self::TurnComplete { .. } => "turn_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Frames after which no further frames are sent for this turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::Error { .. })
    }
}
