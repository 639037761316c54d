use std::collections::HashMap;
use std::sync::Arc;

use waypoint_core::deploy::DeploymentStage;
use waypoint_core::tools::{Tool, ToolDefinition};

/// Source of a registered tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    BuiltIn,
    Provider(String),
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Maps a tool name to the deployment stage it advances. Used only for
/// tools that did not declare a stage themselves.
pub trait StageResolver: Send + Sync {
    fn resolve(&self, tool_name: &str) -> Option<DeploymentStage>;
}

/// Substring heuristics over the tool name. This is the fallback path;
/// tools registered with an explicit `deployment_stage` never reach it.
pub struct KeywordStageResolver;

impl StageResolver for KeywordStageResolver {
    fn resolve(&self, tool_name: &str) -> Option<DeploymentStage> {
        let name = tool_name.to_ascii_lowercase();
        if name.contains("lightsail") || name.contains("instance") || name.contains("vm") {
            Some(DeploymentStage::CreatingVm)
        } else if name.contains("provision") {
            Some(DeploymentStage::Provisioning)
        } else if name.contains("configure") || name.contains("environment") {
            Some(DeploymentStage::ConfiguringEnvironment)
        } else if name.contains("deploy") {
            Some(DeploymentStage::DeployingCode)
        } else if name.contains("dns") || name.contains("domain") {
            Some(DeploymentStage::SettingUpDns)
        } else if name.contains("health") {
            Some(DeploymentStage::HealthCheck)
        } else {
            None
        }
    }
}

/// Registry of available tools. Built once at startup and shared read-only
/// with every turn.
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
    stage_resolver: Box<dyn StageResolver>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            stage_resolver: Box::new(KeywordStageResolver),
        }
    }

    pub fn with_stage_resolver(mut self, resolver: Box<dyn StageResolver>) -> Self {
        self.stage_resolver = resolver;
        self
    }

    /// Register a tool. Re-registering a name replaces the previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.name().to_string();
        self.tools.insert(name, ToolEntry { tool, source });
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    /// Get the source of a tool.
    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools.get(name).map(|e| &e.source)
    }

    /// Check if a tool is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions advertised to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|e| e.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Total tool count.
    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Whether a call to this tool name is a deployment-class call, and
    /// which stage it advances. Declared stages win; the resolver handles
    /// tools that declared none, and names the model requested that were
    /// never registered, so a hallucinated infrastructure call still lands
    /// in the stage log (as a failed stage) instead of vanishing.
    pub fn stage_for(&self, name: &str) -> Option<DeploymentStage> {
        match self.tools.get(name) {
            Some(entry) => entry
                .tool
                .deployment_stage()
                .or_else(|| self.stage_resolver.resolve(name)),
            None => self.stage_resolver.resolve(name),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use waypoint_core::tools::{ExecutionMode, ToolContext, ToolError};

    struct DummyTool {
        name: String,
        stage: Option<DeploymentStage>,
    }

    impl DummyTool {
        fn new(name: &str) -> Self {
            Self { name: name.to_string(), stage: None }
        }

        fn with_stage(name: &str, stage: DeploymentStage) -> Self {
            Self { name: name.to_string(), stage: Some(stage) }
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn execution_mode(&self) -> ExecutionMode {
            ExecutionMode::Concurrent
        }
        fn deployment_stage(&self) -> Option<DeploymentStage> {
            self.stage
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("project_lookup")), ToolSource::BuiltIn);

        assert!(registry.contains("project_lookup"));
        assert!(!registry.contains("docs_search"));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("project_lookup").is_some());
        assert_eq!(registry.source("project_lookup"), Some(&ToolSource::BuiltIn));
    }

    #[test]
    fn names_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("setup_dns")), ToolSource::BuiltIn);
        registry.register(Arc::new(DummyTool::new("deploy_code")), ToolSource::BuiltIn);
        registry.register(Arc::new(DummyTool::new("project_lookup")), ToolSource::BuiltIn);

        assert_eq!(
            registry.names(),
            vec!["deploy_code", "project_lookup", "setup_dns"]
        );
    }

    #[test]
    fn definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("docs_search")), ToolSource::BuiltIn);
        registry.register(Arc::new(DummyTool::new("deploy_code")), ToolSource::BuiltIn);

        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "deploy_code");
        assert_eq!(defs[1].name, "docs_search");
    }

    #[test]
    fn declared_stage_wins_over_keywords() {
        let mut registry = ToolRegistry::new();
        // Name says dns, declaration says provisioning. Declaration wins.
        registry.register(
            Arc::new(DummyTool::with_stage("setup_dns", DeploymentStage::Provisioning)),
            ToolSource::BuiltIn,
        );
        assert_eq!(registry.stage_for("setup_dns"), Some(DeploymentStage::Provisioning));
    }

    #[test]
    fn keyword_fallback_for_undeclared_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("run_health_check")), ToolSource::BuiltIn);
        registry.register(Arc::new(DummyTool::new("provision_db")), ToolSource::BuiltIn);
        registry.register(Arc::new(DummyTool::new("project_lookup")), ToolSource::BuiltIn);

        assert_eq!(registry.stage_for("run_health_check"), Some(DeploymentStage::HealthCheck));
        assert_eq!(registry.stage_for("provision_db"), Some(DeploymentStage::Provisioning));
        // Not a deployment-class tool.
        assert_eq!(registry.stage_for("project_lookup"), None);
    }

    #[test]
    fn unregistered_names_classified_by_keywords() {
        let registry = ToolRegistry::new();
        assert_eq!(
            registry.stage_for("deploy_anything"),
            Some(DeploymentStage::DeployingCode)
        );
        assert_eq!(registry.stage_for("setup_dns_records"), Some(DeploymentStage::SettingUpDns));
        // Unregistered and not infrastructure-shaped: not tracked.
        assert_eq!(registry.stage_for("mystery_tool"), None);
    }

    #[test]
    fn custom_stage_resolver() {
        struct Fixed;
        impl StageResolver for Fixed {
            fn resolve(&self, _tool_name: &str) -> Option<DeploymentStage> {
                Some(DeploymentStage::CreatingVm)
            }
        }

        let mut registry = ToolRegistry::new().with_stage_resolver(Box::new(Fixed));
        registry.register(Arc::new(DummyTool::new("anything")), ToolSource::BuiltIn);
        assert_eq!(registry.stage_for("anything"), Some(DeploymentStage::CreatingVm));
    }

    #[test]
    fn provider_source_tracked() {
        let mut registry = ToolRegistry::new();
        registry.register(
            Arc::new(DummyTool::new("external_tool")),
            ToolSource::Provider("infra-cli".into()),
        );
        assert_eq!(
            registry.source("external_tool"),
            Some(&ToolSource::Provider("infra-cli".into()))
        );
    }
}
