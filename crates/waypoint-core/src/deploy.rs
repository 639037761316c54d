use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named phases of a deployment's lifecycle. Stage rows are logged, never
/// mutated; `HealthCheck` is the terminal stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStage {
    Initializing,
    CreatingVm,
    Provisioning,
    ConfiguringEnvironment,
    DeployingCode,
    SettingUpDns,
    HealthCheck,
}

impl DeploymentStage {
    /// A completed terminal stage completes the whole deployment.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HealthCheck)
    }
}

impl fmt::Display for DeploymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::CreatingVm => "creating_vm",
            Self::Provisioning => "provisioning",
            Self::ConfiguringEnvironment => "configuring_environment",
            Self::DeployingCode => "deploying_code",
            Self::SettingUpDns => "setting_up_dns",
            Self::HealthCheck => "health_check",
        })
    }
}

impl FromStr for DeploymentStage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "creating_vm" => Ok(Self::CreatingVm),
            "provisioning" => Ok(Self::Provisioning),
            "configuring_environment" => Ok(Self::ConfiguringEnvironment),
            "deploying_code" => Ok(Self::DeployingCode),
            "setting_up_dns" => Ok(Self::SettingUpDns),
            "health_check" => Ok(Self::HealthCheck),
            other => Err(format!("unknown deployment stage: {other}")),
        }
    }
}

/// Per-stage status, derived from the tool outcome that produced the stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

impl FromStr for StageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown stage status: {other}")),
        }
    }
}

/// Overall deployment status, derived from the latest recorded stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Initializing,
    InProgress,
    Completed,
    Failed,
}

impl DeploymentStatus {
    /// Derive the overall status from the stage just recorded.
    ///
    /// Not sticky on `Failed`: the derivation looks only at the latest stage,
    /// so a completed stage after a failed one moves the deployment back to
    /// in_progress/completed. The stage log is the audit source of truth;
    /// callers that need "ever failed" must read the log.
    pub fn after_stage(stage: DeploymentStage, status: StageStatus) -> Self {
        match status {
            StageStatus::Failed => Self::Failed,
            StageStatus::Completed if stage.is_terminal() => Self::Completed,
            StageStatus::Completed | StageStatus::InProgress => Self::InProgress,
        }
    }

    /// A deployment accepting further stage writes.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Initializing | Self::InProgress)
    }

    /// Legal transitions of the overall status field. Completed is the one
    /// terminal state; it admits no further transitions.
    pub fn can_transition(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::InProgress)
                | (Self::Initializing, Self::Completed)
                | (Self::Initializing, Self::Failed)
                | (Self::InProgress, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Failed, Self::InProgress)
                | (Self::Failed, Self::Failed)
                | (Self::Failed, Self::Completed)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_display_parse_roundtrip() {
        let stages = [
            DeploymentStage::Initializing,
            DeploymentStage::CreatingVm,
            DeploymentStage::Provisioning,
            DeploymentStage::ConfiguringEnvironment,
            DeploymentStage::DeployingCode,
            DeploymentStage::SettingUpDns,
            DeploymentStage::HealthCheck,
        ];
        for stage in stages {
            let parsed: DeploymentStage = stage.to_string().parse().unwrap();
            assert_eq!(stage, parsed);
        }
    }

    #[test]
    fn only_health_check_is_terminal() {
        assert!(DeploymentStage::HealthCheck.is_terminal());
        assert!(!DeploymentStage::CreatingVm.is_terminal());
        assert!(!DeploymentStage::SettingUpDns.is_terminal());
    }

    #[test]
    fn completed_non_terminal_stage_keeps_deployment_in_progress() {
        let status =
            DeploymentStatus::after_stage(DeploymentStage::CreatingVm, StageStatus::Completed);
        assert_eq!(status, DeploymentStatus::InProgress);
    }

    #[test]
    fn completed_terminal_stage_completes_deployment() {
        let status =
            DeploymentStatus::after_stage(DeploymentStage::HealthCheck, StageStatus::Completed);
        assert_eq!(status, DeploymentStatus::Completed);
    }

    #[test]
    fn failed_stage_fails_deployment() {
        let status =
            DeploymentStatus::after_stage(DeploymentStage::Provisioning, StageStatus::Failed);
        assert_eq!(status, DeploymentStatus::Failed);
    }

    #[test]
    fn failed_is_not_sticky_across_stages() {
        let failed =
            DeploymentStatus::after_stage(DeploymentStage::Provisioning, StageStatus::Failed);
        assert_eq!(failed, DeploymentStatus::Failed);
        let next =
            DeploymentStatus::after_stage(DeploymentStage::DeployingCode, StageStatus::Completed);
        assert_eq!(next, DeploymentStatus::InProgress);
        assert!(failed.can_transition(next));
    }

    #[test]
    fn open_statuses() {
        assert!(DeploymentStatus::Initializing.is_open());
        assert!(DeploymentStatus::InProgress.is_open());
        assert!(!DeploymentStatus::Completed.is_open());
        assert!(!DeploymentStatus::Failed.is_open());
    }

    #[test]
    fn completed_is_terminal_in_transition_table() {
        assert!(!DeploymentStatus::Completed.can_transition(DeploymentStatus::InProgress));
        assert!(!DeploymentStatus::Completed.can_transition(DeploymentStatus::Failed));
        // A deployment whose first recorded stage is the terminal one goes
        // straight from initializing to completed.
        assert!(DeploymentStatus::Initializing.can_transition(DeploymentStatus::Completed));
    }

    #[test]
    fn status_serde_matches_db_strings() {
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::InProgress).unwrap(),
            r#""in_progress""#
        );
        assert_eq!(
            serde_json::to_string(&StageStatus::Completed).unwrap(),
            r#""completed""#
        );
        assert_eq!(
            serde_json::to_string(&DeploymentStage::SettingUpDns).unwrap(),
            r#""setting_up_dns""#
        );
    }
}
