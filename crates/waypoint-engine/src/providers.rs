//! Subprocess capability providers. An external command contributes tools
//! by answering a discovery call with one JSON descriptor per stdout line;
//! each contributed tool is invoked by re-running the command with the
//! arguments on stdin.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use waypoint_core::deploy::DeploymentStage;
use waypoint_core::tools::{ExecutionMode, Tool, ToolContext, ToolError};

use crate::registry::{ToolRegistry, ToolSource};

const OP_ENV: &str = "WAYPOINT_OP";
const TOOL_ENV: &str = "WAYPOINT_TOOL";
const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(120);

/// One line of discovery output.
#[derive(Clone, Debug, Deserialize)]
struct ToolDescriptor {
    name: String,
    description: String,
    #[serde(alias = "parameters")]
    parameters_schema: serde_json::Value,
    #[serde(default)]
    execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    deployment_stage: Option<DeploymentStage>,
}

/// Tools contributed by an external command. The command is run through
/// `bash -c` with `WAYPOINT_OP=list` for discovery and
/// `WAYPOINT_OP=invoke` + `WAYPOINT_TOOL=<name>` for execution.
pub struct ProcessToolProvider {
    name: String,
    command: String,
    invoke_timeout: Duration,
}

impl ProcessToolProvider {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Discover this provider's tools. A provider that fails discovery (
    /// spawn failure, nonzero exit, timeout) contributes no tools; the
    /// rest of the registry is unaffected. Malformed lines are skipped.
    pub async fn discover(&self) -> Vec<Arc<dyn Tool>> {
        let output = match self.run_list().await {
            Ok(output) => output,
            Err(err) => {
                warn!(provider = %self.name, error = %err, "tool discovery failed");
                return Vec::new();
            }
        };

        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ToolDescriptor>(line) {
                Ok(descriptor) => {
                    debug!(provider = %self.name, tool = %descriptor.name, "discovered tool");
                    tools.push(Arc::new(ProcessTool {
                        descriptor,
                        command: self.command.clone(),
                        timeout: self.invoke_timeout,
                    }));
                }
                Err(err) => {
                    warn!(provider = %self.name, error = %err, "skipping malformed descriptor line");
                }
            }
        }
        tools
    }

    /// Discover and register everything this provider offers.
    pub async fn register_with(&self, registry: &mut ToolRegistry) -> usize {
        let tools = self.discover().await;
        let count = tools.len();
        for tool in tools {
            registry.register(tool, ToolSource::Provider(self.name.clone()));
        }
        count
    }

    async fn run_list(&self) -> Result<String, ToolError> {
        let output = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .env(OP_ENV, "list")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn provider: {e}")))?;

        if !output.status.success() {
            return Err(ToolError::ExecutionFailed(format!(
                "provider exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// A single provider-contributed tool.
struct ProcessTool {
    descriptor: ToolDescriptor,
    command: String,
    timeout: Duration,
}

#[async_trait]
impl Tool for ProcessTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.descriptor.parameters_schema.clone()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.descriptor
            .execution_mode
            .clone()
            .unwrap_or(ExecutionMode::Sequential)
    }

    fn deployment_stage(&self) -> Option<DeploymentStage> {
        self.descriptor.deployment_stage
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .env(OP_ENV, "invoke")
            .env(TOOL_ENV, &self.descriptor.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn provider: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = args.to_string();
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to write args: {e}")))?;
            drop(stdin);
        }

        // Take the pipes before the select so the child can be killed on
        // timeout or cancellation without wait_with_output consuming it.
        let mut stdout_pipe = child.stdout.take();
        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| ToolError::ExecutionFailed(format!("process wait failed: {e}")))?
            }
            () = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                stdout_handle.abort();
                warn!(tool = %self.descriptor.name, timeout_secs = self.timeout.as_secs(), "provider tool timed out");
                return Err(ToolError::Timeout(self.timeout));
            }
            () = ctx.abort_signal.cancelled() => {
                let _ = child.kill().await;
                stdout_handle.abort();
                debug!(tool = %self.descriptor.name, "provider tool cancelled");
                return Err(ToolError::Cancelled);
            }
        };

        let stdout = stdout_handle.await.unwrap_or_default();
        if !status.success() {
            return Err(ToolError::ExecutionFailed(format!(
                "tool exited with {}",
                status.code().unwrap_or(-1)
            )));
        }

        serde_json::from_slice(&stdout)
            .map_err(|e| ToolError::ExecutionFailed(format!("tool output is not JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
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

    const LIST_ONE: &str = r#"if [ "$WAYPOINT_OP" = list ]; then
        echo '{"name":"remote_echo","description":"echoes stdin","parameters":{"type":"object"}}'
    else
        cat
    fi"#;

    #[tokio::test]
    async fn discovery_parses_descriptor_lines() {
        let provider = ProcessToolProvider::new("test", LIST_ONE);
        let tools = provider.discover().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "remote_echo");
        assert_eq!(tools[0].execution_mode(), ExecutionMode::Sequential);
    }

    #[tokio::test]
    async fn discovery_skips_malformed_lines() {
        let command = r#"echo 'not json'
            echo '{"name":"good_tool","description":"d","parameters":{"type":"object"},"execution_mode":"concurrent"}'"#;
        let provider = ProcessToolProvider::new("test", command);
        let tools = provider.discover().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "good_tool");
        assert_eq!(tools[0].execution_mode(), ExecutionMode::Concurrent);
    }

    #[tokio::test]
    async fn failed_discovery_contributes_no_tools() {
        let provider = ProcessToolProvider::new("test", "exit 3");
        assert!(provider.discover().await.is_empty());
    }

    #[tokio::test]
    async fn discovered_stage_declaration_is_honored() {
        let command = r#"echo '{"name":"remote_dns","description":"d","parameters":{},"deployment_stage":"setting_up_dns"}'"#;
        let provider = ProcessToolProvider::new("test", command);
        let tools = provider.discover().await;
        assert_eq!(
            tools[0].deployment_stage(),
            Some(DeploymentStage::SettingUpDns)
        );
    }

    #[tokio::test]
    async fn register_with_adds_provider_tools() {
        let provider = ProcessToolProvider::new("infra-cli", LIST_ONE);
        let mut registry = ToolRegistry::new();
        let count = provider.register_with(&mut registry).await;
        assert_eq!(count, 1);
        assert!(registry.contains("remote_echo"));
        assert_eq!(
            registry.source("remote_echo"),
            Some(&ToolSource::Provider("infra-cli".into()))
        );
    }

    #[tokio::test]
    async fn invoke_round_trips_json() {
        let provider = ProcessToolProvider::new("test", LIST_ONE);
        let tools = provider.discover().await;
        let result = tools[0].execute(json!({"x": 1}), &ctx()).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn invoke_timeout_kills_process() {
        let command = r#"if [ "$WAYPOINT_OP" = list ]; then
            echo '{"name":"slow","description":"d","parameters":{}}'
        else
            sleep 30
        fi"#;
        let provider =
            ProcessToolProvider::new("test", command).with_invoke_timeout(Duration::from_millis(100));
        let tools = provider.discover().await;

        let start = std::time::Instant::now();
        let result = tools[0].execute(json!({}), &ctx()).await;
        assert!(matches!(result, Err(ToolError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn invoke_cancellation_kills_process() {
        let command = r#"if [ "$WAYPOINT_OP" = list ]; then
            echo '{"name":"slow","description":"d","parameters":{}}'
        else
            sleep 30
        fi"#;
        let provider = ProcessToolProvider::new("test", command);
        let tools = provider.discover().await;
        let tool = Arc::clone(&tools[0]);

        let context = ctx();
        let cancel = context.abort_signal.clone();
        let handle = tokio::spawn(async move { tool.execute(json!({}), &context).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ToolError::Cancelled)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_execution_failure() {
        let command = r#"if [ "$WAYPOINT_OP" = list ]; then
            echo '{"name":"broken","description":"d","parameters":{}}'
        else
            exit 7
        fi"#;
        let provider = ProcessToolProvider::new("test", command);
        let tools = provider.discover().await;
        let result = tools[0].execute(json!({}), &ctx()).await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed(_))));
    }
}
