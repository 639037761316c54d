use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::chat::ChatMessage;
use crate::errors::GatewayError;
use crate::stream::StreamEvent;
use crate::tools::ToolDefinition;

/// Everything the model sees on one round: system prompt, the context
/// window of prior messages (oldest-first), and the advertised tool set.
#[derive(Clone, Debug, Default)]
pub struct ModelContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Options controlling model generation behavior.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Trait implemented by each model provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn supports_tools(&self) -> bool;

    async fn stream(
        &self,
        context: &ModelContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError>;
}
