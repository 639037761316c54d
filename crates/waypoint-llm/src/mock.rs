//! Deterministic provider for engine and server tests. Responses are
//! consumed in order; each call to `stream` takes the next one.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use waypoint_core::chat::ToolCallBlock;
use waypoint_core::errors::GatewayError;
use waypoint_core::ids::ToolCallId;
use waypoint_core::provider::{EventStream, LlmProvider, ModelContext, StreamOptions};
use waypoint_core::stream::{Completion, StopReason, StreamEvent};

pub enum MockResponse {
    /// Emit these events in order, then end the stream.
    Stream(Vec<StreamEvent>),
    /// Fail the request before any stream is produced.
    Error(GatewayError),
    /// Wait, then behave as the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A plain text turn: Start, one delta, Done with EndTurn.
    pub fn stream_text(text: &str) -> Self {
        MockResponse::Stream(vec![
            StreamEvent::Start,
            StreamEvent::TextDelta { delta: text.to_string() },
            StreamEvent::Done {
                completion: Completion {
                    text: text.to_string(),
                    tool_calls: Vec::new(),
                    stop_reason: StopReason::EndTurn,
                    usage: None,
                },
            },
        ])
    }

    /// A turn that requests exactly one tool call.
    pub fn stream_tool_call(id: &str, name: &str, arguments: Value) -> Self {
        let call = ToolCallBlock {
            id: ToolCallId::from_raw(id),
            name: name.to_string(),
            arguments,
        };
        MockResponse::Stream(vec![
            StreamEvent::Start,
            StreamEvent::ToolCallStart {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
            },
            StreamEvent::ToolCallEnd { tool_call: call.clone() },
            StreamEvent::Done {
                completion: Completion {
                    text: String::new(),
                    tool_calls: vec![call],
                    stop_reason: StopReason::ToolUse,
                    usage: None,
                },
            },
        ])
    }

    /// A stream that starts and then dies mid-flight.
    pub fn stream_error(message: &str) -> Self {
        MockResponse::Stream(vec![
            StreamEvent::Start,
            StreamEvent::Error {
                error: GatewayError::StreamInterrupted(message.to_string()),
            },
        ])
    }
}

pub struct MockProvider {
    responses: Mutex<Vec<Option<MockResponse>>>,
    cursor: Mutex<usize>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Some).collect()),
            cursor: Mutex::new(0),
        }
    }

    /// Number of stream calls made so far.
    pub fn call_count(&self) -> usize {
        *self.cursor.lock()
    }

    fn take_next(&self) -> Option<MockResponse> {
        let mut cursor = self.cursor.lock();
        let mut responses = self.responses.lock();
        let idx = *cursor;
        *cursor += 1;
        responses.get_mut(idx).and_then(Option::take)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        _context: &ModelContext,
        _options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let mut response = self.take_next().ok_or_else(|| {
            GatewayError::InvalidRequest("mock provider exhausted".to_string())
        })?;

        while let MockResponse::Delay(duration, inner) = response {
            tokio::time::sleep(duration).await;
            response = *inner;
        }

        match response {
            MockResponse::Stream(events) => {
                Ok(Box::pin(tokio_stream::iter(events)) as EventStream)
            }
            MockResponse::Error(error) => Err(error),
            MockResponse::Delay(..) => unreachable!("delays resolved above"),
        }
    }
}
