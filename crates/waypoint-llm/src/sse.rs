use serde::Deserialize;
use serde_json::Value;

use waypoint_core::chat::ToolCallBlock;
use waypoint_core::ids::ToolCallId;
use waypoint_core::stream::{Completion, ModelUsage, StopReason, StreamEvent};

/// State machine for parsing OpenAI-compatible chat-completions SSE chunks.
///
/// Each `data:` payload is one JSON chunk carrying content and tool-call
/// deltas; `data: [DONE]` closes the stream. Tool-call arguments arrive as
/// string fragments keyed by index and are only parsed once complete.
pub struct ChunkParser {
    started: bool,
    text: String,
    tool_calls: Vec<ToolCallAccumulator>,
    finish_reason: Option<String>,
    usage: Option<ModelUsage>,
    done_emitted: bool,
}

struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments_json: String,
    started: bool,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            started: false,
            text: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
            usage: None,
            done_emitted: false,
        }
    }

    /// Parse one `data:` payload and return zero or more StreamEvents.
    pub fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
        if data.trim() == "[DONE]" {
            return self.finish();
        }

        let chunk: CompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) => return Vec::new(), // tolerate unknown frames
        };

        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(ModelUsage {
                input_tokens: usage.prompt_tokens.unwrap_or(0),
                output_tokens: usage.completion_tokens.unwrap_or(0),
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                self.text.push_str(&content);
                events.push(StreamEvent::TextDelta { delta: content });
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let idx = tc.index;
            while self.tool_calls.len() <= idx {
                self.tool_calls.push(ToolCallAccumulator {
                    id: String::new(),
                    name: String::new(),
                    arguments_json: String::new(),
                    started: false,
                });
            }
            let acc = &mut self.tool_calls[idx];

            if let Some(id) = tc.id {
                acc.id = id;
            }
            if let Some(function) = tc.function {
                if let Some(name) = function.name {
                    acc.name = name;
                }
                if !acc.started && !acc.id.is_empty() && !acc.name.is_empty() {
                    acc.started = true;
                    events.push(StreamEvent::ToolCallStart {
                        tool_call_id: ToolCallId::from_raw(&acc.id),
                        name: acc.name.clone(),
                    });
                }
                if let Some(fragment) = function.arguments {
                    if !fragment.is_empty() {
                        acc.arguments_json.push_str(&fragment);
                        events.push(StreamEvent::ToolCallDelta {
                            tool_call_id: ToolCallId::from_raw(&acc.id),
                            arguments_delta: fragment,
                        });
                    }
                }
            }
        }

        events
    }

    /// Build the terminal events: ToolCallEnd per accumulated call, then Done.
    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done_emitted {
            return Vec::new();
        }
        self.done_emitted = true;

        let mut events = Vec::new();
        let mut calls = Vec::new();

        for acc in &self.tool_calls {
            let arguments: Value = serde_json::from_str(&acc.arguments_json)
                .unwrap_or(Value::Object(serde_json::Map::new()));
            let call = ToolCallBlock {
                id: ToolCallId::from_raw(&acc.id),
                name: acc.name.clone(),
                arguments,
            };
            events.push(StreamEvent::ToolCallEnd { tool_call: call.clone() });
            calls.push(call);
        }

        let stop_reason = match self.finish_reason.as_deref() {
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            _ if !calls.is_empty() => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };

        events.push(StreamEvent::Done {
            completion: Completion {
                text: std::mem::take(&mut self.text),
                tool_calls: calls,
                stop_reason,
                usage: self.usage,
            },
        });

        events
    }
}

/// Parse raw SSE text into `data:` payloads. Comment lines and event names
/// are ignored; the chat-completions stream only uses data frames.
pub fn parse_sse_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .map(|data| data.trim_start().to_string())
        .filter(|data| !data.is_empty())
        .collect()
}

// --- Deserialization types for chat-completions chunks ---

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_stream() {
        let mut parser = ChunkParser::new();

        let events = parser.parse_data(
            r#"{"choices":[{"delta":{"role":"assistant","content":"Hello"},"finish_reason":null}]}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Start));
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "Hello"));

        let events = parser.parse_data(
            r#"{"choices":[{"delta":{"content":" world!"},"finish_reason":null}]}"#,
        );
        assert_eq!(events.len(), 1);

        parser.parse_data(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);

        let events = parser.parse_data("[DONE]");
        assert_eq!(events.len(), 1);
        if let StreamEvent::Done { completion } = &events[0] {
            assert_eq!(completion.text, "Hello world!");
            assert_eq!(completion.stop_reason, StopReason::EndTurn);
            assert!(completion.tool_calls.is_empty());
        } else {
            panic!("expected Done");
        }
    }

    #[test]
    fn parse_tool_call_stream() {
        let mut parser = ChunkParser::new();

        parser.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"setup_dns","arguments":""}}]},"finish_reason":null}]}"#,
        );
        parser.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"domain\""}}]},"finish_reason":null}]}"#,
        );
        parser.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"acme.dev\"}"}}]},"finish_reason":null}]}"#,
        );
        parser.parse_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);

        let events = parser.parse_data("[DONE]");
        assert_eq!(events.len(), 2); // ToolCallEnd + Done
        if let StreamEvent::ToolCallEnd { tool_call } = &events[0] {
            assert_eq!(tool_call.name, "setup_dns");
            assert_eq!(tool_call.arguments["domain"], "acme.dev");
        } else {
            panic!("expected ToolCallEnd");
        }
        if let StreamEvent::Done { completion } = &events[1] {
            assert_eq!(completion.stop_reason, StopReason::ToolUse);
            assert_eq!(completion.tool_calls.len(), 1);
        } else {
            panic!("expected Done");
        }
    }

    #[test]
    fn tool_call_start_emitted_once() {
        let mut parser = ChunkParser::new();
        let events = parser.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"name":"deploy_code","arguments":"{"}}]},"finish_reason":null}]}"#,
        );
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolCallStart { .. }))
            .count();
        assert_eq!(starts, 1);

        let events = parser.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"}"}}]},"finish_reason":null}]}"#,
        );
        assert!(events
            .iter()
            .all(|e| !matches!(e, StreamEvent::ToolCallStart { .. })));
    }

    #[test]
    fn usage_captured_from_final_chunk() {
        let mut parser = ChunkParser::new();
        parser.parse_data(r#"{"choices":[{"delta":{"content":"ok"},"finish_reason":"stop"}]}"#);
        parser.parse_data(r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":8}}"#);

        let events = parser.parse_data("[DONE]");
        if let StreamEvent::Done { completion } = &events[0] {
            let usage = completion.usage.unwrap();
            assert_eq!(usage.input_tokens, 120);
            assert_eq!(usage.output_tokens, 8);
        } else {
            panic!("expected Done");
        }
    }

    #[test]
    fn length_finish_maps_to_max_tokens() {
        let mut parser = ChunkParser::new();
        parser.parse_data(r#"{"choices":[{"delta":{"content":"truncat"},"finish_reason":"length"}]}"#);
        let events = parser.parse_data("[DONE]");
        assert!(matches!(
            &events[0],
            StreamEvent::Done { completion } if completion.stop_reason == StopReason::MaxTokens
        ));
    }

    #[test]
    fn done_only_emitted_once() {
        let mut parser = ChunkParser::new();
        parser.parse_data(r#"{"choices":[{"delta":{"content":"x"},"finish_reason":"stop"}]}"#);
        assert_eq!(parser.parse_data("[DONE]").len(), 1);
        assert!(parser.parse_data("[DONE]").is_empty());
    }

    #[test]
    fn garbage_frames_are_ignored() {
        let mut parser = ChunkParser::new();
        assert!(parser.parse_data("not json at all").is_empty());
    }

    #[test]
    fn parse_sse_lines_extracts_data() {
        let raw = "data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n";
        let frames = parse_sse_lines(raw);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], "[DONE]");
    }

    #[test]
    fn parse_sse_lines_skips_comments() {
        let raw = ": keep-alive\n\ndata: {\"a\":1}\n\n";
        let frames = parse_sse_lines(raw);
        assert_eq!(frames.len(), 1);
    }
}
