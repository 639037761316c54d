//! The infrastructure tool suite. Each tool maps one backend operation to
//! one deployment stage, declared at registration so the tracker never
//! guesses from the tool name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::instrument;

use waypoint_core::deploy::DeploymentStage;
use waypoint_core::tools::{ExecutionMode, Tool, ToolContext, ToolError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Transport to the infrastructure control plane. One method keyed by
/// operation name; implementations decide how operations reach the backend.
#[async_trait]
pub trait InfraBackend: Send + Sync {
    async fn call(&self, operation: &str, args: &Value) -> Result<Value, ToolError>;
}

/// HTTP control-plane client: `POST {base}/operations/{operation}`.
pub struct HttpInfraBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInfraBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InfraBackend for HttpInfraBackend {
    #[instrument(skip(self, args))]
    async fn call(&self, operation: &str, args: &Value) -> Result<Value, ToolError> {
        let resp = self
            .client
            .post(format!("{}/operations/{operation}", self.base_url))
            .json(args)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("infra request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "infra backend returned {}",
                resp.status()
            )));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid infra response: {e}")))
    }
}

struct InfraToolSpec {
    name: &'static str,
    description: &'static str,
    operation: &'static str,
    stage: DeploymentStage,
    extra_properties: &'static [(&'static str, &'static str)],
}

const INFRA_TOOLS: &[InfraToolSpec] = &[
    InfraToolSpec {
        name: "lightsail_create_instance",
        description: "Create the virtual machine that will host the project.",
        operation: "create_instance",
        stage: DeploymentStage::CreatingVm,
        extra_properties: &[
            ("region", "AWS region for the instance"),
            ("bundle_id", "Instance size bundle"),
        ],
    },
    InfraToolSpec {
        name: "provision_resources",
        description: "Provision databases, storage and networking for the deployment.",
        operation: "provision",
        stage: DeploymentStage::Provisioning,
        extra_properties: &[],
    },
    InfraToolSpec {
        name: "configure_environment",
        description: "Write environment configuration and secrets onto the instance.",
        operation: "configure",
        stage: DeploymentStage::ConfiguringEnvironment,
        extra_properties: &[],
    },
    InfraToolSpec {
        name: "deploy_code",
        description: "Build and deploy the project's code to the instance.",
        operation: "deploy",
        stage: DeploymentStage::DeployingCode,
        extra_properties: &[("branch", "Branch to deploy")],
    },
    InfraToolSpec {
        name: "setup_dns",
        description: "Point the project's domain at the deployed instance.",
        operation: "dns",
        stage: DeploymentStage::SettingUpDns,
        extra_properties: &[("domain", "Domain name to configure")],
    },
    InfraToolSpec {
        name: "run_health_check",
        description: "Verify the deployed site responds. Completing this finishes the deployment.",
        operation: "health_check",
        stage: DeploymentStage::HealthCheck,
        extra_properties: &[],
    },
];

struct InfraTool {
    spec: &'static InfraToolSpec,
    backend: Arc<dyn InfraBackend>,
}

#[async_trait]
impl Tool for InfraTool {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn description(&self) -> &str {
        self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        properties.insert(
            "deployment_id".into(),
            json!({
                "type": "string",
                "description": "Existing deployment to continue, if any"
            }),
        );
        for (name, description) in self.spec.extra_properties {
            properties.insert(
                (*name).into(),
                json!({"type": "string", "description": description}),
            );
        }
        json!({"type": "object", "properties": properties})
    }

    // Infrastructure mutations never run in parallel with each other.
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    fn deployment_stage(&self) -> Option<DeploymentStage> {
        Some(self.spec.stage)
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        self.backend.call(self.spec.operation, &args).await
    }
}

/// The full infrastructure suite over one backend.
pub fn infra_tools(backend: Arc<dyn InfraBackend>) -> Vec<Arc<dyn Tool>> {
    INFRA_TOOLS
        .iter()
        .map(|spec| {
            Arc::new(InfraTool {
                spec,
                backend: Arc::clone(&backend),
            }) as Arc<dyn Tool>
        })
        .collect()
}
