use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use waypoint_core::chat::{ToolCallBlock, ToolOutcome};
use waypoint_core::deploy::{DeploymentStage, DeploymentStatus, StageStatus};
use waypoint_core::ids::{ProjectId, UserId};
use waypoint_store::deployments::{DeploymentRepo, DeploymentRow, StageRow};
use waypoint_store::Database;

use crate::error::EngineError;

/// Records deployment-class tool calls against the append-only stage log
/// and keeps the derived overall status current.
pub struct DeploymentTracker {
    deployments: DeploymentRepo,
}

/// What one recorded stage did to the deployment.
#[derive(Clone, Debug)]
pub struct StageRecord {
    pub deployment: DeploymentRow,
    pub stage_row: StageRow,
    pub status: DeploymentStatus,
}

impl DeploymentTracker {
    pub fn new(db: Database) -> Self {
        Self {
            deployments: DeploymentRepo::new(db),
        }
    }

    /// Derive a stage status from a tool outcome. An error payload is a
    /// failed stage; a result saying `success: true` or `status:
    /// "completed"` is completed; an explicit `success: false` is failed;
    /// anything else is still in progress.
    pub fn status_for(outcome: &ToolOutcome) -> StageStatus {
        match outcome {
            ToolOutcome::Error { .. } => StageStatus::Failed,
            ToolOutcome::Result { value } => {
                if value.get("success").and_then(Value::as_bool) == Some(false) {
                    return StageStatus::Failed;
                }
                let success = value.get("success").and_then(Value::as_bool) == Some(true);
                let completed =
                    value.get("status").and_then(Value::as_str) == Some("completed");
                if success || completed {
                    StageStatus::Completed
                } else {
                    StageStatus::InProgress
                }
            }
        }
    }

    /// Find the deployment a tool call belongs to. An explicit
    /// `deployment_id` argument that resolves wins; otherwise the project's
    /// open deployment is reused; otherwise a new one is created.
    #[instrument(skip(self, args), fields(project_id = %project_id))]
    pub fn resolve_deployment(
        &self,
        args: &Value,
        project_id: &ProjectId,
        initiator_id: &UserId,
        initiator_email: &str,
    ) -> Result<DeploymentRow, EngineError> {
        if let Some(raw) = args.get("deployment_id").and_then(Value::as_str) {
            let id = waypoint_core::ids::DeploymentId::from_raw(raw);
            if let Ok(deployment) = self.deployments.get(&id) {
                return Ok(deployment);
            }
        }

        if let Some(open) = self.deployments.find_open(project_id)? {
            return Ok(open);
        }

        let created = self
            .deployments
            .create(project_id, initiator_id, initiator_email)?;
        info!(deployment_id = %created.id, "created deployment");
        Ok(created)
    }

    /// Append one stage row for a tool call's outcome and update the
    /// derived overall status. Called synchronously from the turn loop
    /// between rounds, so the log reflects call order.
    #[instrument(skip(self, call, outcome), fields(deployment_id = %deployment.id, stage = %stage, tool = %call.name))]
    pub fn record(
        &self,
        deployment: &DeploymentRow,
        call: &ToolCallBlock,
        outcome: &ToolOutcome,
        stage: DeploymentStage,
    ) -> Result<StageRecord, EngineError> {
        let stage_status = Self::status_for(outcome);

        let (log, error) = match outcome {
            ToolOutcome::Result { value } => (value.to_string(), None),
            ToolOutcome::Error { message } => (message.clone(), Some(message.as_str())),
        };
        let metadata = json!({
            "arguments": call.arguments,
            "tool_call_id": call.id.as_str(),
            "recorded_at": Utc::now().to_rfc3339(),
        });

        let stage_row = self.deployments.append_stage(
            &deployment.id,
            stage,
            stage_status,
            &call.name,
            &log,
            &metadata,
            error,
        )?;

        // Stage rows always land; the derived status only moves along the
        // transition table. A call addressed at a completed deployment still
        // gets logged, but cannot reopen it.
        let derived = DeploymentStatus::after_stage(stage, stage_status);
        let status = if deployment.status.can_transition(derived) {
            self.deployments.update_status(&deployment.id, derived)?;
            derived
        } else {
            warn!(
                deployment_id = %deployment.id,
                from = %deployment.status,
                to = %derived,
                "illegal deployment status transition skipped"
            );
            deployment.status
        };

        Ok(StageRecord {
            deployment: deployment.clone(),
            stage_row,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::ids::ToolCallId;
    use waypoint_store::projects::ProjectRepo;

    fn setup() -> (DeploymentTracker, DeploymentRepo, ProjectId) {
        let db = Database::in_memory().unwrap();
        let projects = ProjectRepo::new(db.clone());
        let project = projects.get_or_create("acme").unwrap();
        (
            DeploymentTracker::new(db.clone()),
            DeploymentRepo::new(db),
            project.id,
        )
    }

    fn initiator() -> UserId {
        UserId::from_raw("user_alice")
    }

    fn call(name: &str, args: Value) -> ToolCallBlock {
        ToolCallBlock {
            id: ToolCallId::new(),
            name: name.to_string(),
            arguments: args,
        }
    }

    #[test]
    fn status_for_outcomes() {
        let ok = ToolOutcome::Result { value: json!({"success": true}) };
        assert_eq!(DeploymentTracker::status_for(&ok), StageStatus::Completed);

        let completed = ToolOutcome::Result { value: json!({"status": "completed"}) };
        assert_eq!(DeploymentTracker::status_for(&completed), StageStatus::Completed);

        let explicit_failure = ToolOutcome::Result { value: json!({"success": false}) };
        assert_eq!(DeploymentTracker::status_for(&explicit_failure), StageStatus::Failed);

        let err = ToolOutcome::Error { message: "instance quota exceeded".into() };
        assert_eq!(DeploymentTracker::status_for(&err), StageStatus::Failed);

        let pending = ToolOutcome::Result { value: json!({"instance": "i-123"}) };
        assert_eq!(DeploymentTracker::status_for(&pending), StageStatus::InProgress);
    }

    #[test]
    fn resolve_creates_when_no_open_deployment() {
        let (tracker, repo, project_id) = setup();
        let dep = tracker
            .resolve_deployment(&json!({}), &project_id, &initiator(), "alice@acme.dev")
            .unwrap();
        assert_eq!(dep.status, DeploymentStatus::Initializing);
        assert_eq!(repo.get(&dep.id).unwrap().id, dep.id);
    }

    #[test]
    fn resolve_reuses_open_deployment() {
        let (tracker, _, project_id) = setup();
        let first = tracker
            .resolve_deployment(&json!({}), &project_id, &initiator(), "alice@acme.dev")
            .unwrap();
        let second = tracker
            .resolve_deployment(&json!({}), &project_id, &initiator(), "alice@acme.dev")
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn resolve_honors_explicit_deployment_id() {
        let (tracker, repo, project_id) = setup();
        let first = repo.create(&project_id, &initiator(), "alice@acme.dev").unwrap();
        // Close it so the open-deployment path would not find it.
        repo.update_status(&first.id, DeploymentStatus::Completed).unwrap();

        let resolved = tracker
            .resolve_deployment(
                &json!({"deployment_id": first.id.as_str()}),
                &project_id,
                &initiator(),
                "alice@acme.dev",
            )
            .unwrap();
        assert_eq!(resolved.id, first.id);
    }

    #[test]
    fn unresolvable_explicit_id_falls_through_to_create() {
        let (tracker, _, project_id) = setup();
        let resolved = tracker
            .resolve_deployment(
                &json!({"deployment_id": "dep_nonexistent"}),
                &project_id,
                &initiator(),
                "alice@acme.dev",
            )
            .unwrap();
        assert_ne!(resolved.id.as_str(), "dep_nonexistent");
    }

    #[test]
    fn record_successful_vm_creation() {
        let (tracker, repo, project_id) = setup();
        let dep = tracker
            .resolve_deployment(&json!({}), &project_id, &initiator(), "alice@acme.dev")
            .unwrap();

        let record = tracker
            .record(
                &dep,
                &call("lightsail_create_instance", json!({"region": "us-east-1"})),
                &ToolOutcome::Result { value: json!({"success": true, "instance": "i-123"}) },
                DeploymentStage::CreatingVm,
            )
            .unwrap();

        assert_eq!(record.stage_row.stage, DeploymentStage::CreatingVm);
        assert_eq!(record.stage_row.status, StageStatus::Completed);
        assert_eq!(record.status, DeploymentStatus::InProgress);
        assert_eq!(repo.get(&dep.id).unwrap().status, DeploymentStatus::InProgress);
    }

    #[test]
    fn record_terminal_stage_completes_deployment() {
        let (tracker, repo, project_id) = setup();
        let dep = tracker
            .resolve_deployment(&json!({}), &project_id, &initiator(), "alice@acme.dev")
            .unwrap();

        let record = tracker
            .record(
                &dep,
                &call("run_health_check", json!({})),
                &ToolOutcome::Result { value: json!({"success": true}) },
                DeploymentStage::HealthCheck,
            )
            .unwrap();

        assert_eq!(record.status, DeploymentStatus::Completed);
        assert_eq!(repo.get(&dep.id).unwrap().status, DeploymentStatus::Completed);
    }

    #[test]
    fn record_failure_writes_error_row_and_fails_deployment() {
        let (tracker, repo, project_id) = setup();
        let dep = tracker
            .resolve_deployment(&json!({}), &project_id, &initiator(), "alice@acme.dev")
            .unwrap();

        tracker
            .record(
                &dep,
                &call("setup_dns", json!({"domain": "acme.dev"})),
                &ToolOutcome::Error { message: "zone not found".into() },
                DeploymentStage::SettingUpDns,
            )
            .unwrap();

        assert_eq!(repo.get(&dep.id).unwrap().status, DeploymentStatus::Failed);
        let log = repo.stages(&dep.id).unwrap();
        assert_eq!(log[0].error.as_deref(), Some("zone not found"));
        assert_eq!(log[0].metadata["arguments"]["domain"], "acme.dev");
    }

    #[test]
    fn record_on_completed_deployment_logs_but_keeps_status() {
        let (tracker, repo, project_id) = setup();
        let created = repo.create(&project_id, &initiator(), "alice@acme.dev").unwrap();
        repo.update_status(&created.id, DeploymentStatus::Completed).unwrap();
        let dep = repo.get(&created.id).unwrap();

        // Addressed explicitly at a closed deployment: the stage row lands,
        // the terminal status does not move.
        let record = tracker
            .record(
                &dep,
                &call("provision_resources", json!({"deployment_id": dep.id.as_str()})),
                &ToolOutcome::Result { value: json!({"success": true}) },
                DeploymentStage::Provisioning,
            )
            .unwrap();

        assert_eq!(record.status, DeploymentStatus::Completed);
        assert_eq!(repo.get(&dep.id).unwrap().status, DeploymentStatus::Completed);
        assert_eq!(repo.stages(&dep.id).unwrap().len(), 1);
    }

    #[test]
    fn stage_log_grows_one_row_per_call() {
        let (tracker, repo, project_id) = setup();
        let dep = tracker
            .resolve_deployment(&json!({}), &project_id, &initiator(), "alice@acme.dev")
            .unwrap();

        for (tool, stage) in [
            ("lightsail_create_instance", DeploymentStage::CreatingVm),
            ("provision_resources", DeploymentStage::Provisioning),
            ("configure_environment", DeploymentStage::ConfiguringEnvironment),
            ("deploy_code", DeploymentStage::DeployingCode),
        ] {
            tracker
                .record(
                    &dep,
                    &call(tool, json!({})),
                    &ToolOutcome::Result { value: json!({"success": true}) },
                    stage,
                )
                .unwrap();
        }

        let log = repo.stages(&dep.id).unwrap();
        assert_eq!(log.len(), 4);
        assert!(log.windows(2).all(|w| w[0].seq + 1 == w[1].seq));
    }
}
