use serde::{Deserialize, Serialize};

use crate::chat::ToolCallBlock;
use crate::errors::GatewayError;
use crate::ids::ToolCallId;

/// Events emitted during model streaming. Ordering contract:
///
/// Start → (TextDelta | ToolCallStart → ToolCallDelta* → ToolCallEnd)* → Done
///
/// Error can appear at any point and is terminal.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,

    TextDelta { delta: String },

    ToolCallStart { tool_call_id: ToolCallId, name: String },
    ToolCallDelta { tool_call_id: ToolCallId, arguments_delta: String },
    ToolCallEnd { tool_call: ToolCallBlock },

    Done { completion: Completion },
    Error { error: GatewayError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// One fully-accumulated model response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallBlock>,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ModelUsage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
            usage: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let done = StreamEvent::Done { completion: Completion::text("hi") };
        assert!(done.is_terminal());

        let err = StreamEvent::Error { error: GatewayError::ProviderOverloaded };
        assert!(err.is_terminal());

        let delta = StreamEvent::TextDelta { delta: "x".into() };
        assert!(!delta.is_terminal());
    }

    #[test]
    fn completion_text_constructor() {
        let c = Completion::text("done");
        assert_eq!(c.stop_reason, StopReason::EndTurn);
        assert!(!c.has_tool_calls());
    }

    #[test]
    fn completion_serde_skips_empty_fields() {
        let json = serde_json::to_value(Completion::text("ok")).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("usage").is_none());
        assert_eq!(json["stop_reason"], "end_turn");
    }
}
