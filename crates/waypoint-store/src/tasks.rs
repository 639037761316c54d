use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use waypoint_core::generation::GenerationStatus;
use waypoint_core::ids::{ProjectId, TaskId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    pub stories: Option<serde_json::Value>,
    pub generation_status: GenerationStatus,
    pub created_at: String,
    pub updated_at: String,
}

pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new task with no stories yet.
    #[instrument(skip(self), fields(project_id = %project_id, title))]
    pub fn create(&self, project_id: &ProjectId, title: &str) -> Result<TaskRow, StoreError> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, project_id, title, generation_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'not_started', ?4, ?5)",
                rusqlite::params![id.as_str(), project_id.as_str(), title, now, now],
            )?;

            Ok(TaskRow {
                id,
                project_id: project_id.clone(),
                title: title.to_string(),
                stories: None,
                generation_status: GenerationStatus::NotStarted,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a task by ID.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn get(&self, id: &TaskId) -> Result<TaskRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, title, stories, generation_status, created_at, updated_at
                 FROM tasks WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("task {id}"))),
            }
        })
    }

    /// Claim the single generation slot for a task. The conditional UPDATE
    /// flips not_started → generating in one statement; zero affected rows
    /// means another generation is already in flight (or the task is done),
    /// which surfaces as Conflict.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn begin_generation(&self, id: &TaskId) -> Result<(), StoreError> {
        self.transition(id, GenerationStatus::Generating)
    }

    /// Record the end of a generation run. Stories (when present) and the
    /// done status are written in one transaction so pollers never observe
    /// one without the other. Only a generating task can finish.
    #[instrument(skip(self, stories), fields(task_id = %id, has_stories = stories.is_some()))]
    pub fn finish_generation(
        &self,
        id: &TaskId,
        stories: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let guard = allowed_predecessors(GenerationStatus::Done);
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            let changed = match stories {
                Some(stories) => tx.execute(
                    &format!(
                        "UPDATE tasks SET stories = ?1, generation_status = 'done', updated_at = ?2
                         WHERE id = ?3 AND generation_status IN ({guard})"
                    ),
                    rusqlite::params![serde_json::to_string(stories)?, now, id.as_str()],
                )?,
                None => tx.execute(
                    &format!(
                        "UPDATE tasks SET generation_status = 'done', updated_at = ?1
                         WHERE id = ?2 AND generation_status IN ({guard})"
                    ),
                    rusqlite::params![now, id.as_str()],
                )?,
            };
            if changed == 0 {
                return Err(refused_transition(&tx, id, GenerationStatus::Done));
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Re-arm a finished task for another generation pass (done → not_started).
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn rearm_generation(&self, id: &TaskId) -> Result<(), StoreError> {
        self.transition(id, GenerationStatus::NotStarted)
    }

    /// Move the generation status along the transition table. The UPDATE only
    /// matches rows whose current status may legally move to `next`, so the
    /// check and the write are one atomic statement.
    fn transition(&self, id: &TaskId, next: GenerationStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                &format!(
                    "UPDATE tasks SET generation_status = ?1, updated_at = ?2
                     WHERE id = ?3 AND generation_status IN ({})",
                    allowed_predecessors(next)
                ),
                rusqlite::params![next.to_string(), now, id.as_str()],
            )?;
            if changed == 1 {
                Ok(())
            } else {
                Err(refused_transition(conn, id, next))
            }
        })
    }

    /// Search a project's tasks by title substring.
    #[instrument(skip(self), fields(project_id = %project_id, query))]
    pub fn search(
        &self,
        project_id: &ProjectId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<TaskRow>, StoreError> {
        self.db.with_conn(|conn| {
            let pattern = format!("%{}%", row_helpers::escape_like(query));
            let mut stmt = conn.prepare(
                "SELECT id, project_id, title, stories, generation_status, created_at, updated_at
                 FROM tasks WHERE project_id = ?1 AND title LIKE ?2 ESCAPE '\\'
                 ORDER BY created_at DESC LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![project_id.as_str(), pattern, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }
}

/// SQL literal set of statuses that may legally move to `next`, straight
/// from the transition table.
fn allowed_predecessors(next: GenerationStatus) -> String {
    [
        GenerationStatus::NotStarted,
        GenerationStatus::Generating,
        GenerationStatus::Done,
    ]
    .iter()
    .filter(|s| s.can_transition(next))
    .map(|s| format!("'{s}'"))
    .collect::<Vec<_>>()
    .join(", ")
}

/// Classify a refused transition: an unknown task is NotFound, anything
/// else is a Conflict naming the current status.
fn refused_transition(
    conn: &rusqlite::Connection,
    id: &TaskId,
    next: GenerationStatus,
) -> StoreError {
    let current = conn
        .query_row(
            "SELECT generation_status FROM tasks WHERE id = ?1",
            [id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional();
    match current {
        Ok(Some(current)) => {
            StoreError::Conflict(format!("task {id} cannot move from {current} to {next}"))
        }
        Ok(None) => StoreError::NotFound(format!("task {id}")),
        Err(e) => e.into(),
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<TaskRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "tasks", "generation_status")?;
    let stories_raw: Option<String> = row_helpers::get_opt(row, 3, "tasks", "stories")?;
    let stories = match stories_raw {
        Some(raw) => Some(row_helpers::parse_json(&raw, "tasks", "stories")?),
        None => None,
    };

    Ok(TaskRow {
        id: TaskId::from_raw(row_helpers::get::<String>(row, 0, "tasks", "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, "tasks", "project_id")?),
        title: row_helpers::get(row, 2, "tasks", "title")?,
        stories,
        generation_status: row_helpers::parse_enum(&status_str, "tasks", "generation_status")?,
        created_at: row_helpers::get(row, 5, "tasks", "created_at")?,
        updated_at: row_helpers::get(row, 6, "tasks", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;
    use serde_json::json;

    fn setup() -> (Database, ProjectId) {
        let db = Database::in_memory().unwrap();
        let projects = ProjectRepo::new(db.clone());
        let project = projects.get_or_create("acme").unwrap();
        (db, project.id)
    }

    #[test]
    fn create_task_not_started() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();
        assert!(task.id.as_str().starts_with("task_"));
        assert_eq!(task.generation_status, GenerationStatus::NotStarted);
        assert!(task.stories.is_none());
    }

    #[test]
    fn begin_generation_claims_slot() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();

        repo.begin_generation(&task.id).unwrap();
        assert_eq!(
            repo.get(&task.id).unwrap().generation_status,
            GenerationStatus::Generating
        );
    }

    #[test]
    fn second_begin_generation_conflicts() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();

        repo.begin_generation(&task.id).unwrap();
        let second = repo.begin_generation(&task.id);
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn begin_generation_unknown_task_is_not_found() {
        let (db, _) = setup();
        let repo = TaskRepo::new(db);
        let result = repo.begin_generation(&TaskId::from_raw("task_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn finish_generation_with_stories() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();
        repo.begin_generation(&task.id).unwrap();

        let stories = json!([
            {"title": "As a shopper I can pay by card"},
            {"title": "As a shopper I see an order confirmation"}
        ]);
        repo.finish_generation(&task.id, Some(&stories)).unwrap();

        let fetched = repo.get(&task.id).unwrap();
        assert_eq!(fetched.generation_status, GenerationStatus::Done);
        assert_eq!(fetched.stories.unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn finish_generation_without_stories_still_marks_done() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();
        repo.begin_generation(&task.id).unwrap();

        repo.finish_generation(&task.id, None).unwrap();

        let fetched = repo.get(&task.id).unwrap();
        assert_eq!(fetched.generation_status, GenerationStatus::Done);
        assert!(fetched.stories.is_none());
    }

    #[test]
    fn finish_without_begin_conflicts() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();

        // not_started → done skips the generating state.
        let result = repo.finish_generation(&task.id, None);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(
            repo.get(&task.id).unwrap().generation_status,
            GenerationStatus::NotStarted
        );
    }

    #[test]
    fn finish_unknown_task_is_not_found() {
        let (db, _) = setup();
        let repo = TaskRepo::new(db);
        let result = repo.finish_generation(&TaskId::from_raw("task_nonexistent"), None);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn rearm_after_done_allows_new_generation() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();
        repo.begin_generation(&task.id).unwrap();
        repo.finish_generation(&task.id, None).unwrap();

        repo.rearm_generation(&task.id).unwrap();
        repo.begin_generation(&task.id).unwrap();
        assert_eq!(
            repo.get(&task.id).unwrap().generation_status,
            GenerationStatus::Generating
        );
    }

    #[test]
    fn rearm_while_generating_conflicts() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&project_id, "Checkout flow").unwrap();
        repo.begin_generation(&task.id).unwrap();
        assert!(matches!(
            repo.rearm_generation(&task.id),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn search_by_title() {
        let (db, project_id) = setup();
        let repo = TaskRepo::new(db);
        repo.create(&project_id, "Checkout flow").unwrap();
        repo.create(&project_id, "Login page").unwrap();
        repo.create(&project_id, "Checkout analytics").unwrap();

        let hits = repo.search(&project_id, "Checkout", 10).unwrap();
        assert_eq!(hits.len(), 2);

        let none = repo.search(&project_id, "100%", 10).unwrap();
        assert!(none.is_empty());
    }
}
