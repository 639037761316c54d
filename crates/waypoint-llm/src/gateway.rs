use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;

use waypoint_core::chat::{ChatMessage, Role};
use waypoint_core::errors::GatewayError;
use waypoint_core::provider::{EventStream, LlmProvider, ModelContext, StreamOptions};
use waypoint_core::stream::StreamEvent;

use crate::sse::{self, ChunkParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streaming provider for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiGateway {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiGateway {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    fn build_body(&self, context: &ModelContext, options: &StreamOptions) -> Value {
        let mut messages = Vec::new();

        if let Some(system) = &context.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &context.messages {
            append_wire_messages(&mut messages, message);
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if !context.tools.is_empty() {
            body["tools"] = Value::Array(
                context
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters_schema,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if !options.stop_sequences.is_empty() {
            body["stop"] = json!(options.stop_sequences);
        }

        body
    }
}

/// Translate one stored message into its wire form. Assistant messages with
/// tool rounds expand into an assistant frame carrying the calls plus one
/// `tool` frame per result, which is how the history replays on the next
/// request.
fn append_wire_messages(out: &mut Vec<Value>, message: &ChatMessage) {
    match message.role {
        Role::System => out.push(json!({"role": "system", "content": message.content})),
        Role::User => out.push(json!({"role": "user", "content": message.content})),
        Role::Assistant => {
            let mut frame = json!({"role": "assistant"});
            frame["content"] = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            if !message.tool_calls.is_empty() {
                frame["tool_calls"] = Value::Array(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id.as_str(),
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            out.push(frame);

            for result in &message.tool_results {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": result.tool_call_id.as_str(),
                    "content": result.outcome.as_model_payload().to_string(),
                }));
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiGateway {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn supports_tools(&self) -> bool {
        true
    }

    #[instrument(skip(self, context, options), fields(model = %self.model))]
    async fn stream(
        &self,
        context: &ModelContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let body = self.build_body(context, options);
        let url = format!("{}/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }

        let byte_stream = resp.bytes_stream();
        Ok(Box::pin(SseStream::new(byte_stream)))
    }
}

/// Wraps a byte stream from reqwest and yields StreamEvents.
/// Includes an idle timeout: if no data arrives within `idle_duration`,
/// emits a StreamInterrupted error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: ChunkParser,
    buffer: String,
    pending: Vec<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChunkParser::new(),
            buffer: String::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes);
                    self.buffer.push_str(&text);

                    // Process complete SSE frames from the buffer
                    while let Some(pos) = self.buffer.find("\n\n") {
                        let chunk = self.buffer[..pos + 2].to_string();
                        self.buffer = self.buffer[pos + 2..].to_string();

                        for data in sse::parse_sse_lines(&chunk) {
                            let events = self.parser.parse_data(&data);
                            self.pending.extend(events);
                        }
                    }

                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(StreamEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        for data in sse::parse_sse_lines(&remaining) {
                            let events = self.parser.parse_data(&data);
                            self.pending.extend(events);
                        }
                        if !self.pending.is_empty() {
                            return std::task::Poll::Ready(Some(self.pending.remove(0)));
                        }
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        return std::task::Poll::Ready(Some(StreamEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}
