use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use waypoint_core::ids::ProjectId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: ProjectId,
    pub name: String,
    pub created_at: String,
}

pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get or create a project by name.
    #[instrument(skip(self), fields(name))]
    pub fn get_or_create(&self, name: &str) -> Result<ProjectRow, StoreError> {
        self.db.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, name, created_at FROM projects WHERE name = ?1",
                    [name],
                    |row| {
                        Ok(ProjectRow {
                            id: ProjectId::from_raw(row.get::<_, String>(0)?),
                            name: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    },
                )
                .ok();

            if let Some(project) = existing {
                return Ok(project);
            }

            let id = ProjectId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_str(), name, now],
            )?;

            Ok(ProjectRow {
                id,
                name: name.to_string(),
                created_at: now,
            })
        })
    }

    /// Get a project by ID.
    #[instrument(skip(self), fields(project_id = %id))]
    pub fn get(&self, id: &ProjectId) -> Result<ProjectRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok(ProjectRow {
                        id: ProjectId::from_raw(row.get::<_, String>(0)?),
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .map_err(|_| StoreError::NotFound(format!("project {id}")))
        })
    }
}
