use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use waypoint_core::deploy::{DeploymentStage, DeploymentStatus, StageStatus};
use waypoint_core::ids::{DeploymentId, ProjectId, StageId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRow {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub initiator_id: UserId,
    pub initiator_email: String,
    pub status: DeploymentStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// One immutable entry in a deployment's stage log. This repo exposes no
/// way to update or delete a stage row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageRow {
    pub id: StageId,
    pub deployment_id: DeploymentId,
    pub seq: i64,
    pub stage: DeploymentStage,
    pub status: StageStatus,
    pub tool_name: String,
    pub log: String,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub created_at: String,
}

pub struct DeploymentRepo {
    db: Database,
}

impl DeploymentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new deployment in the initializing state.
    #[instrument(skip(self), fields(project_id = %project_id, initiator = %initiator_id))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        initiator_id: &UserId,
        initiator_email: &str,
    ) -> Result<DeploymentRow, StoreError> {
        let id = DeploymentId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deployments (id, project_id, initiator_id, initiator_email, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'initializing', ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    project_id.as_str(),
                    initiator_id.as_str(),
                    initiator_email,
                    now,
                    now,
                ],
            )?;

            Ok(DeploymentRow {
                id,
                project_id: project_id.clone(),
                initiator_id: initiator_id.clone(),
                initiator_email: initiator_email.to_string(),
                status: DeploymentStatus::Initializing,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a deployment by ID.
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub fn get(&self, id: &DeploymentId) -> Result<DeploymentRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, initiator_id, initiator_email, status, created_at, updated_at
                 FROM deployments WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_deployment(row),
                None => Err(StoreError::NotFound(format!("deployment {id}"))),
            }
        })
    }

    /// The project's most recent open (initializing or in_progress)
    /// deployment, if any.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn find_open(
        &self,
        project_id: &ProjectId,
    ) -> Result<Option<DeploymentRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, initiator_id, initiator_email, status, created_at, updated_at
                 FROM deployments
                 WHERE project_id = ?1 AND status IN ('initializing', 'in_progress')
                 ORDER BY created_at DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([project_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_deployment(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Update the derived overall status. The transition table is enforced
    /// here: an illegal move (anything out of completed, or skipping ahead)
    /// is rejected with Conflict and leaves the row untouched. The read and
    /// the write share one connection lock, so the check cannot race.
    #[instrument(skip(self), fields(deployment_id = %id, status = %status))]
    pub fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM deployments WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(StoreError::NotFound(format!("deployment {id}")));
            };
            let current: DeploymentStatus =
                row_helpers::parse_enum(&current, "deployments", "status")?;
            if !current.can_transition(status) {
                return Err(StoreError::Conflict(format!(
                    "deployment {id} cannot move from {current} to {status}"
                )));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE deployments SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Append one stage row. Seq is assigned from the current log length,
    /// so rows read back in call order.
    #[instrument(skip(self, metadata, error), fields(deployment_id = %deployment_id, stage = %stage, status = %status, tool_name))]
    #[allow(clippy::too_many_arguments)]
    pub fn append_stage(
        &self,
        deployment_id: &DeploymentId,
        stage: DeploymentStage,
        status: StageStatus,
        tool_name: &str,
        log: &str,
        metadata: &serde_json::Value,
        error: Option<&str>,
    ) -> Result<StageRow, StoreError> {
        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM deployments WHERE id = ?1)",
                [deployment_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("deployment {deployment_id}")));
            }

            let max_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), -1) FROM deployment_stages WHERE deployment_id = ?1",
                [deployment_id.as_str()],
                |row| row.get(0),
            )?;

            let id = StageId::new();
            let now = Utc::now().to_rfc3339();
            let seq = max_seq + 1;

            conn.execute(
                "INSERT INTO deployment_stages (id, deployment_id, seq, stage, status, tool_name, log, metadata, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    deployment_id.as_str(),
                    seq,
                    stage.to_string(),
                    status.to_string(),
                    tool_name,
                    log,
                    serde_json::to_string(metadata)?,
                    error,
                    now,
                ],
            )?;

            Ok(StageRow {
                id,
                deployment_id: deployment_id.clone(),
                seq,
                stage,
                status,
                tool_name: tool_name.to_string(),
                log: log.to_string(),
                metadata: metadata.clone(),
                error: error.map(String::from),
                created_at: now,
            })
        })
    }

    /// The full stage log in append order.
    #[instrument(skip(self), fields(deployment_id = %deployment_id))]
    pub fn stages(&self, deployment_id: &DeploymentId) -> Result<Vec<StageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, deployment_id, seq, stage, status, tool_name, log, metadata, error, created_at
                 FROM deployment_stages WHERE deployment_id = ?1
                 ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query([deployment_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_stage(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> Result<DeploymentRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "deployments", "status")?;

    Ok(DeploymentRow {
        id: DeploymentId::from_raw(row_helpers::get::<String>(row, 0, "deployments", "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(
            row, 1, "deployments", "project_id",
        )?),
        initiator_id: UserId::from_raw(row_helpers::get::<String>(
            row, 2, "deployments", "initiator_id",
        )?),
        initiator_email: row_helpers::get(row, 3, "deployments", "initiator_email")?,
        status: row_helpers::parse_enum(&status_str, "deployments", "status")?,
        created_at: row_helpers::get(row, 5, "deployments", "created_at")?,
        updated_at: row_helpers::get(row, 6, "deployments", "updated_at")?,
    })
}

fn row_to_stage(row: &rusqlite::Row<'_>) -> Result<StageRow, StoreError> {
    let stage_str: String = row_helpers::get(row, 3, "deployment_stages", "stage")?;
    let status_str: String = row_helpers::get(row, 4, "deployment_stages", "status")?;
    let metadata_str: String = row_helpers::get(row, 7, "deployment_stages", "metadata")?;

    Ok(StageRow {
        id: StageId::from_raw(row_helpers::get::<String>(row, 0, "deployment_stages", "id")?),
        deployment_id: DeploymentId::from_raw(row_helpers::get::<String>(
            row, 1, "deployment_stages", "deployment_id",
        )?),
        seq: row_helpers::get(row, 2, "deployment_stages", "seq")?,
        stage: row_helpers::parse_enum(&stage_str, "deployment_stages", "stage")?,
        status: row_helpers::parse_enum(&status_str, "deployment_stages", "status")?,
        tool_name: row_helpers::get(row, 5, "deployment_stages", "tool_name")?,
        log: row_helpers::get(row, 6, "deployment_stages", "log")?,
        metadata: row_helpers::parse_json(&metadata_str, "deployment_stages", "metadata")?,
        error: row_helpers::get_opt(row, 8, "deployment_stages", "error")?,
        created_at: row_helpers::get(row, 9, "deployment_stages", "created_at")?,
    })
}
