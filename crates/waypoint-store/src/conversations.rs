use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use waypoint_core::ids::{ConversationId, ProjectId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new conversation.
    #[instrument(skip(self), fields(project_id = %project_id, user_id = %user_id))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        user_id: &UserId,
    ) -> Result<ConversationRow, StoreError> {
        let id = ConversationId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, project_id, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), project_id.as_str(), user_id.as_str(), now, now],
            )?;

            Ok(ConversationRow {
                id,
                project_id: project_id.clone(),
                user_id: user_id.clone(),
                title: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a conversation by ID.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, user_id, title, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    /// Resolve the conversation for an incoming chat request.
    ///
    /// A supplied id is returned only when the stored conversation belongs to
    /// both the given project and user; any mismatch or unknown id falls
    /// through to creating a fresh conversation. A conversation is never
    /// reassigned across users or projects.
    #[instrument(skip(self), fields(project_id = %project_id, user_id = %user_id))]
    pub fn get_or_create(
        &self,
        project_id: &ProjectId,
        user_id: &UserId,
        conversation_id: Option<&ConversationId>,
    ) -> Result<ConversationRow, StoreError> {
        if let Some(id) = conversation_id {
            match self.get(id) {
                Ok(row) if row.project_id == *project_id && row.user_id == *user_id => {
                    return Ok(row);
                }
                Ok(_) => {
                    debug!(conversation_id = %id, "ownership mismatch, creating new conversation");
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(conversation_id = %id, "unknown conversation, creating new");
                }
                Err(e) => return Err(e),
            }
        }
        self.create(project_id, user_id)
    }

    /// Set the title if it has never been set. Returns whether the write
    /// took effect; a second call is a no-op by construction.
    #[instrument(skip(self, title), fields(conversation_id = %id))]
    pub fn set_title_if_unset(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2
                 WHERE id = ?3 AND title IS NULL",
                rusqlite::params![title, now, id.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Bump updated_at, e.g. after appending messages.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn touch(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// List a user's conversations in a project, newest first.
    #[instrument(skip(self), fields(project_id = %project_id, user_id = %user_id))]
    pub fn list(
        &self,
        project_id: &ProjectId,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, user_id, title, created_at, updated_at
                 FROM conversations WHERE project_id = ?1 AND user_id = ?2
                 ORDER BY updated_at DESC LIMIT ?3",
            )?;
            let mut rows =
                stmt.query(rusqlite::params![project_id.as_str(), user_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(
            row, 1, "conversations", "project_id",
        )?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "conversations", "user_id")?),
        title: row_helpers::get_opt(row, 3, "conversations", "title")?,
        created_at: row_helpers::get(row, 4, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 5, "conversations", "updated_at")?,
    })
}
