use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use waypoint_core::chat::{ChatMessage, Role, ToolCallBlock, ToolOutcome, ToolResultBlock};
use waypoint_core::events::ChatEvent;
use waypoint_core::ids::{ConversationId, ProjectId, UserId};
use waypoint_core::provider::{LlmProvider, ModelContext, StreamOptions};
use waypoint_core::stream::{Completion, StreamEvent};
use waypoint_core::tools::{ExecutionMode, ToolContext, ToolError};
use waypoint_store::conversations::ConversationRepo;
use waypoint_store::messages::MessageRepo;
use waypoint_store::Database;

use crate::deploy::DeploymentTracker;
use crate::error::EngineError;
use crate::registry::ToolRegistry;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TITLE_CHARS: usize = 64;

/// Configuration for the chat turn runner.
pub struct RunnerConfig {
    /// How many recent messages the model sees each round.
    pub context_window: u32,
    /// Hard bound on model rounds within one turn.
    pub max_rounds: u32,
    pub tool_timeout: Duration,
    pub stream_options: StreamOptions,
    pub system_prompt: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            context_window: 30,
            max_rounds: 25,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            stream_options: StreamOptions::default(),
            system_prompt: None,
        }
    }
}

/// One inbound chat turn, already resolved to a conversation.
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub user_email: String,
    pub content: String,
    /// Role the inbound message is persisted under. Almost always `User`;
    /// callers may inject `System` notes into a conversation.
    pub role: Role,
}

/// How a turn ended.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub rounds: u32,
    pub cancelled: bool,
}

/// Runs one chat turn: persist the user message, then loop
/// model-stream → tool-execution rounds until the model stops asking for
/// tools, the round bound is hit, or the turn is cancelled.
pub struct ChatRunner {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    tracker: DeploymentTracker,
    conversations: ConversationRepo,
    messages: MessageRepo,
    event_tx: broadcast::Sender<ChatEvent>,
    config: RunnerConfig,
}

impl ChatRunner {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        db: Database,
        event_tx: broadcast::Sender<ChatEvent>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            tracker: DeploymentTracker::new(db.clone()),
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db),
            event_tx,
            config,
        }
    }

    fn send_event(&self, event: ChatEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("no event receivers, chat event dropped");
        }
    }

    #[instrument(skip(self, request, cancel), fields(conversation_id = %request.conversation_id))]
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let conversation_id = request.conversation_id.clone();

        // The inbound message is durable before any model or tool work starts.
        self.messages.append(
            &conversation_id,
            &ChatMessage::new(request.role, &request.content),
        )?;
        // Titles derive from user messages only.
        if request.role == Role::User {
            self.conversations
                .set_title_if_unset(&conversation_id, &derive_title(&request.content))?;
        }

        self.send_event(ChatEvent::TurnStart {
            conversation_id: conversation_id.clone(),
        });

        let tool_defs = self.registry.definitions();

        for round in 1..=self.config.max_rounds {
            let history: Vec<ChatMessage> = self
                .messages
                .recent(&conversation_id, self.config.context_window)?
                .iter()
                .map(|row| row.to_chat_message())
                .collect();

            let context = ModelContext {
                system_prompt: self.config.system_prompt.clone(),
                messages: history,
                tools: tool_defs.clone(),
            };

            let completion = match self.stream_round(&conversation_id, &context).await {
                Ok(completion) => completion,
                Err(err) => {
                    self.send_event(ChatEvent::Error {
                        conversation_id: conversation_id.clone(),
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            };

            if completion.tool_calls.is_empty() {
                self.messages
                    .append(&conversation_id, &ChatMessage::assistant(&completion.text))?;
                self.send_event(ChatEvent::TurnComplete {
                    conversation_id: conversation_id.clone(),
                    rounds: round,
                });
                return Ok(TurnOutcome { rounds: round, cancelled: false });
            }

            let results = self
                .execute_tools(&completion.tool_calls, &request, &cancel)
                .await;

            // The round persists as one assistant message carrying both the
            // calls and their results, before the next model round starts.
            self.messages.append(
                &conversation_id,
                &ChatMessage {
                    role: Role::Assistant,
                    content: completion.text.clone(),
                    tool_calls: completion.tool_calls.clone(),
                    tool_results: results.clone(),
                },
            )?;

            self.record_deployment_stages(&completion.tool_calls, &results, &request)?;

            // A fired token lets the in-flight round finish (message and
            // stage writes above) but starts no further model round.
            if cancel.is_cancelled() {
                self.send_event(ChatEvent::TurnComplete {
                    conversation_id: conversation_id.clone(),
                    rounds: round,
                });
                return Ok(TurnOutcome { rounds: round, cancelled: true });
            }
        }

        self.send_event(ChatEvent::Error {
            conversation_id: conversation_id.clone(),
            message: format!("max tool rounds exceeded: {}", self.config.max_rounds),
        });
        Err(EngineError::MaxRoundsExceeded(self.config.max_rounds))
    }

    /// One model round: stream, fan text deltas out, return the completion.
    async fn stream_round(
        &self,
        conversation_id: &ConversationId,
        context: &ModelContext,
    ) -> Result<Completion, EngineError> {
        let mut stream = self
            .provider
            .stream(context, &self.config.stream_options)
            .await?;

        let mut completion: Option<Completion> = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { delta } => {
                    self.send_event(ChatEvent::TextDelta {
                        conversation_id: conversation_id.clone(),
                        delta,
                    });
                }
                StreamEvent::Done { completion: c } => {
                    completion = Some(c);
                }
                StreamEvent::Error { error } => {
                    return Err(EngineError::Gateway(error));
                }
                _ => {}
            }
        }

        completion.ok_or_else(|| EngineError::Internal("stream ended without Done".into()))
    }

    /// Execute a round's tool calls. Concurrent-mode tools fan out on
    /// tokio::spawn; Sequential tools run one at a time after them. Every
    /// failure mode (ToolError, timeout, panic, unknown tool) collapses to
    /// a ToolOutcome::Error the model sees next round.
    async fn execute_tools(
        &self,
        tool_calls: &[ToolCallBlock],
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Vec<ToolResultBlock> {
        let tool_ctx = ToolContext {
            conversation_id: request.conversation_id.clone(),
            project_id: request.project_id.clone(),
            user_id: request.user_id.clone(),
            user_email: request.user_email.clone(),
            abort_signal: cancel.clone(),
        };

        let mut slots: Vec<Option<ToolResultBlock>> = vec![None; tool_calls.len()];
        let mut concurrent = Vec::new();
        let mut sequential = Vec::new();

        for (idx, call) in tool_calls.iter().enumerate() {
            let mode = self
                .registry
                .get(&call.name)
                .map(|t| t.execution_mode())
                .unwrap_or(ExecutionMode::Sequential);
            match mode {
                ExecutionMode::Concurrent => concurrent.push((idx, call)),
                ExecutionMode::Sequential => sequential.push((idx, call)),
            }
        }

        let mut handles = Vec::new();
        for (idx, call) in &concurrent {
            let Some(tool) = self.registry.get(&call.name) else {
                slots[*idx] = Some(self.run_unknown(&request.conversation_id, call));
                continue;
            };
            let call = (*call).clone();
            let ctx = tool_ctx.clone();
            let tx = self.event_tx.clone();
            let conversation_id = request.conversation_id.clone();
            let timeout = self.config.tool_timeout;
            let idx = *idx;

            handles.push(tokio::spawn(async move {
                (idx, run_tool(tool, call, ctx, conversation_id, tx, timeout).await)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(join_err) => {
                    // The task itself failed; the per-call ToolEnd was
                    // already emitted or never will be, but the model still
                    // gets an error outcome via the unmatched slot below.
                    error!(error = %join_err, "tool task failed to join");
                }
            }
        }

        for (idx, call) in sequential {
            let Some(tool) = self.registry.get(&call.name) else {
                slots[idx] = Some(self.run_unknown(&request.conversation_id, call));
                continue;
            };
            slots[idx] = Some(
                run_tool(
                    tool,
                    call.clone(),
                    tool_ctx.clone(),
                    request.conversation_id.clone(),
                    self.event_tx.clone(),
                    self.config.tool_timeout,
                )
                .await,
            );
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| ToolResultBlock {
                    tool_call_id: tool_calls[idx].id.clone(),
                    outcome: ToolOutcome::Error {
                        message: "tool execution failed".into(),
                    },
                    duration_ms: 0,
                })
            })
            .collect()
    }

    fn run_unknown(
        &self,
        conversation_id: &ConversationId,
        call: &ToolCallBlock,
    ) -> ToolResultBlock {
        warn!(tool = %call.name, "model requested unknown tool");
        self.send_event(ChatEvent::ToolStart {
            conversation_id: conversation_id.clone(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
        });
        self.send_event(ChatEvent::ToolEnd {
            conversation_id: conversation_id.clone(),
            tool_call_id: call.id.clone(),
            is_error: true,
            duration_ms: 0,
        });
        ToolResultBlock {
            tool_call_id: call.id.clone(),
            outcome: ToolOutcome::Error {
                message: format!("unknown tool: {}", call.name),
            },
            duration_ms: 0,
        }
    }

    /// Route deployment-class results to the tracker, synchronously, in
    /// call order. Each recorded stage fans out a deployment_update frame.
    fn record_deployment_stages(
        &self,
        tool_calls: &[ToolCallBlock],
        results: &[ToolResultBlock],
        request: &TurnRequest,
    ) -> Result<(), EngineError> {
        for (call, result) in tool_calls.iter().zip(results) {
            let Some(stage) = self.registry.stage_for(&call.name) else {
                continue;
            };

            let deployment = self.tracker.resolve_deployment(
                &call.arguments,
                &request.project_id,
                &request.user_id,
                &request.user_email,
            )?;
            let record = self
                .tracker
                .record(&deployment, call, &result.outcome, stage)?;

            self.send_event(ChatEvent::DeploymentUpdate {
                conversation_id: request.conversation_id.clone(),
                deployment_id: record.deployment.id.clone(),
                stage,
                stage_status: record.stage_row.status,
                status: record.status,
            });
        }
        Ok(())
    }
}

/// Execute a single tool with timeout and panic containment, emitting
/// tool_start/tool_end frames around it.
async fn run_tool(
    tool: Arc<dyn waypoint_core::tools::Tool>,
    call: ToolCallBlock,
    ctx: ToolContext,
    conversation_id: ConversationId,
    tx: broadcast::Sender<ChatEvent>,
    timeout: Duration,
) -> ToolResultBlock {
    if tx
        .send(ChatEvent::ToolStart {
            conversation_id: conversation_id.clone(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
        })
        .is_err()
    {
        warn!(tool = %call.name, "no event receivers, tool_start dropped");
    }

    let start = Instant::now();
    let result = tokio::time::timeout(
        timeout,
        std::panic::AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
    )
    .await;
    let duration = start.elapsed();

    let outcome = match result {
        Ok(Ok(Ok(value))) => ToolOutcome::Result { value },
        Ok(Ok(Err(e))) => ToolOutcome::Error { message: e.to_string() },
        Ok(Err(panic)) => {
            error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked");
            ToolOutcome::Error { message: "internal error: tool crashed".into() }
        }
        Err(_) => {
            warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool timed out");
            ToolOutcome::Error {
                message: ToolError::Timeout(timeout).to_string(),
            }
        }
    };

    if tx
        .send(ChatEvent::ToolEnd {
            conversation_id,
            tool_call_id: call.id.clone(),
            is_error: outcome.is_error(),
            duration_ms: duration.as_millis() as u64,
        })
        .is_err()
    {
        warn!(tool = %call.name, "no event receivers, tool_end dropped");
    }

    ToolResultBlock {
        tool_call_id: call.id,
        outcome,
        duration_ms: duration.as_millis() as u64,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Conversation title from the first user message: the whole message when
/// short, otherwise cut back to a word boundary within the limit.
pub fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= MAX_TITLE_CHARS {
        return trimmed.to_string();
    }

    let head: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    match head.rfind(' ') {
        Some(pos) if pos > 0 => head[..pos].trim_end().to_string(),
        _ => head,
    }
}
