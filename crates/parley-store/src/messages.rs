use async_trait::async_trait;
use tracing::instrument;

use parley_core::ids::{ConversationId, MessageId, RunId, UserId};
use parley_core::messages::{Attachment, MessageStatus, Role, TurnMessage};
use parley_core::store::{MessageStore, PersistenceFailure};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_COLUMNS: &str =
    "SELECT id, conversation_id, role, content, status, user_id, run_id, attachments, created_at FROM messages";

/// Append-only message log. Rows are never updated.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message and return its sequence number. The sequence is read
    /// and written inside one transaction on the shared connection, so
    /// concurrent appends to a conversation stay dense.
    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id, message_id = %message.id))]
    pub fn insert(&self, message: &TurnMessage) -> Result<i64, StoreError> {
        message.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;

        self.db.with_tx(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
                [message.conversation_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("conversation {}", message.conversation_id)));
            }

            let duplicate: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
                [message.id.as_str()],
                |row| row.get(0),
            )?;
            if duplicate {
                return Err(StoreError::Conflict(format!("message {} already stored", message.id)));
            }

            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), -1) + 1 FROM messages WHERE conversation_id = ?1",
                [message.conversation_id.as_str()],
                |row| row.get(0),
            )?;

            let attachments = if message.attachments.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&message.attachments)?)
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sequence, role, content, status, user_id, run_id, attachments, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    message.id.as_str(),
                    message.conversation_id.as_str(),
                    sequence,
                    message.role.as_str(),
                    message.content,
                    message.status.as_str(),
                    message.user_id.as_ref().map(|u| u.as_str()),
                    message.run_id.as_ref().map(|r| r.as_str()),
                    attachments,
                    message.created_at,
                ],
            )?;
            Ok(sequence)
        })
    }

    /// The most recent `limit` messages, oldest first.
    pub fn recent(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<TurnMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE conversation_id = ?1 ORDER BY sequence DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![conversation_id.as_str(), limit as i64])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    pub fn count_for(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub fn get(&self, message_id: &MessageId) -> Result<Option<TurnMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query([message_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_message(row)?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<TurnMessage, StoreError> {
    const T: &str = "messages";
    let role: String = row_helpers::get(row, 2, T, "role")?;
    let status: String = row_helpers::get(row, 4, T, "status")?;
    let attachments: Option<String> = row_helpers::get_opt(row, 7, T, "attachments")?;
    let attachments: Vec<Attachment> = match attachments {
        Some(raw) => row_helpers::parse_json(&raw, T, "attachments")?,
        None => Vec::new(),
    };

    Ok(TurnMessage {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(row, 1, T, "conversation_id")?),
        role: row_helpers::parse_with(&role, Role::parse, T, "role")?,
        content: row_helpers::get(row, 3, T, "content")?,
        status: row_helpers::parse_with(&status, MessageStatus::parse, T, "status")?,
        user_id: row_helpers::get_opt::<String>(row, 5, T, "user_id")?.map(UserId::from_raw),
        run_id: row_helpers::get_opt::<String>(row, 6, T, "run_id")?.map(RunId::from_raw),
        attachments,
        created_at: row_helpers::get(row, 8, T, "created_at")?,
    })
}

#[async_trait]
impl MessageStore for MessageRepo {
    async fn append(&self, message: &TurnMessage) -> Result<(), PersistenceFailure> {
        let repo = self.clone();
        let message = message.clone();
        crate::blocking(move || repo.insert(&message).map(|_| ())).await
    }

    async fn list(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<TurnMessage>, PersistenceFailure> {
        let repo = self.clone();
        let id = conversation_id.clone();
        crate::blocking(move || repo.recent(&id, limit)).await
    }

    async fn count(&self, conversation_id: &ConversationId) -> Result<usize, PersistenceFailure> {
        let repo = self.clone();
        let id = conversation_id.clone();
        crate::blocking(move || repo.count_for(&id)).await
    }

    async fn find(&self, message_id: &MessageId) -> Result<Option<TurnMessage>, PersistenceFailure> {
        let repo = self.clone();
        let id = message_id.clone();
        crate::blocking(move || repo.get(&id)).await
    }
}
