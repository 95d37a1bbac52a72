use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use parley_core::ids::{ConversationId, MessageId};
use parley_core::store::{AuditEntry, AuditLog, PersistenceFailure};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Untruncated tool outputs, kept for audit after the backend saw a shortened copy.
#[derive(Clone)]
pub struct AuditRepo {
    db: Database,
}

impl AuditRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, entry), fields(conversation_id = %entry.conversation_id, source = %entry.source))]
    pub fn insert(&self, entry: &AuditEntry) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_output_audit
                 (conversation_id, turn_id, source, original, original_bytes, truncated_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    entry.conversation_id.as_str(),
                    entry.turn_id.as_str(),
                    entry.source,
                    entry.original,
                    entry.original_bytes as i64,
                    entry.truncated_bytes as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_for_turn(&self, conversation_id: &ConversationId, turn_id: &MessageId) -> Result<Vec<AuditEntry>, StoreError> {
        const T: &str = "tool_output_audit";
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source, original, original_bytes, truncated_bytes FROM tool_output_audit
                 WHERE conversation_id = ?1 AND turn_id = ?2 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([conversation_id.as_str(), turn_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(AuditEntry {
                    conversation_id: conversation_id.clone(),
                    turn_id: turn_id.clone(),
                    source: row_helpers::get(row, 0, T, "source")?,
                    original: row_helpers::get(row, 1, T, "original")?,
                    original_bytes: row_helpers::get::<i64>(row, 2, T, "original_bytes")? as usize,
                    truncated_bytes: row_helpers::get::<i64>(row, 3, T, "truncated_bytes")? as usize,
                });
            }
            Ok(out)
        })
    }
}

#[async_trait]
impl AuditLog for AuditRepo {
    async fn record(&self, entry: AuditEntry) -> Result<(), PersistenceFailure> {
        let repo = self.clone();
        crate::blocking(move || repo.insert(&entry).map(|_| ())).await
    }
}
