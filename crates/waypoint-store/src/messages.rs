use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use waypoint_core::chat::{ChatMessage, Role, ToolCallBlock, ToolResultBlock};
use waypoint_core::ids::{ConversationId, MessageId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored message row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCallBlock>,
    pub tool_results: Vec<ToolResultBlock>,
    pub created_at: String,
}

impl MessageRow {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_results: self.tool_results.clone(),
        }
    }
}

/// Per-conversation append lock. Appends read the current max seq and
/// insert seq+1; the lock makes that read-modify-write atomic so arrival
/// order is total even when wall clocks collide.
struct ConversationLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct MessageRepo {
    db: Database,
    conversation_locks: Mutex<ConversationLocks>,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            conversation_locks: Mutex::new(ConversationLocks::new()),
        }
    }

    /// Append a message to a conversation in strict arrival order.
    #[instrument(skip(self, message), fields(conversation_id = %conversation_id, role = %message.role))]
    pub fn append(
        &self,
        conversation_id: &ConversationId,
        message: &ChatMessage,
    ) -> Result<MessageRow, StoreError> {
        let lock = self.conversation_locks.lock().get(conversation_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }

            let max_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), -1) FROM messages WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;

            let id = MessageId::new();
            let now = Utc::now().to_rfc3339();
            let seq = max_seq + 1;

            let tool_calls_json = if message.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&message.tool_calls)?)
            };
            let tool_results_json = if message.tool_results.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&message.tool_results)?)
            };

            conn.execute(
                "INSERT INTO messages (id, conversation_id, seq, role, content, tool_calls, tool_results, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id.as_str(),
                    seq,
                    message.role.to_string(),
                    message.content,
                    tool_calls_json,
                    tool_results_json,
                    now,
                ],
            )?;

            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, conversation_id.as_str()],
            )?;

            Ok(MessageRow {
                id,
                conversation_id: conversation_id.clone(),
                seq,
                role: message.role,
                content: message.content.clone(),
                tool_calls: message.tool_calls.clone(),
                tool_results: message.tool_results.clone(),
                created_at: now,
            })
        })
    }

    /// The last `limit` messages in chronological order. Fetched newest-first
    /// on the (conversation_id, seq) index, then reversed.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, limit))]
    pub fn recent(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, seq, role, content, tool_calls, tool_results, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY seq DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![conversation_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    /// Count messages in a conversation.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn count(&self, conversation_id: &ConversationId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role_str: String = row_helpers::get(row, 3, "messages", "role")?;
    let tool_calls_raw: Option<String> = row_helpers::get_opt(row, 5, "messages", "tool_calls")?;
    let tool_results_raw: Option<String> =
        row_helpers::get_opt(row, 6, "messages", "tool_results")?;

    let tool_calls = match tool_calls_raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::CorruptRow {
            table: "messages",
            column: "tool_calls",
            detail: format!("invalid JSON: {e}"),
        })?,
        None => Vec::new(),
    };
    let tool_results = match tool_results_raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::CorruptRow {
            table: "messages",
            column: "tool_results",
            detail: format!("invalid JSON: {e}"),
        })?,
        None => Vec::new(),
    };

    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row, 1, "messages", "conversation_id",
        )?),
        seq: row_helpers::get(row, 2, "messages", "seq")?,
        role: row_helpers::parse_enum(&role_str, "messages", "role")?,
        content: row_helpers::get(row, 4, "messages", "content")?,
        tool_calls,
        tool_results,
        created_at: row_helpers::get(row, 7, "messages", "created_at")?,
    })
}
