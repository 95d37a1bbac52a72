use async_trait::async_trait;
use tracing::instrument;

use parley_core::ids::{ConversationId, UserId};
use parley_core::messages::Conversation;
use parley_core::store::{ConversationStore, PersistenceFailure};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone)]
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, conversation), fields(conversation_id = %conversation.id))]
    pub fn insert(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO conversations (id, owner, title, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    conversation.id.as_str(),
                    conversation.owner.as_str(),
                    conversation.title,
                    conversation.created_at,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("conversation {} exists", conversation.id)));
            }
            Ok(())
        })
    }

    pub fn find(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, owner, title, created_at FROM conversations WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(Conversation {
                    id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
                    owner: UserId::from_raw(row_helpers::get::<String>(row, 1, "conversations", "owner")?),
                    title: row_helpers::get_opt(row, 2, "conversations", "title")?,
                    created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
                })),
                None => Ok(None),
            }
        })
    }

    pub fn delete_if_empty(&self, id: &ConversationId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM conversations
                 WHERE id = ?1 AND NOT EXISTS (SELECT 1 FROM messages WHERE conversation_id = ?1)",
                [id.as_str()],
            )?;
            Ok(deleted > 0)
        })
    }

    pub fn count_for_owner(&self, owner: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversations WHERE owner = ?1",
                [owner.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

#[async_trait]
impl ConversationStore for ConversationRepo {
    async fn create(&self, conversation: &Conversation) -> Result<(), PersistenceFailure> {
        let repo = self.clone();
        let conversation = conversation.clone();
        crate::blocking(move || repo.insert(&conversation)).await
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<Conversation>, PersistenceFailure> {
        let repo = self.clone();
        let id = id.clone();
        crate::blocking(move || repo.find(&id)).await
    }

    async fn discard_empty(&self, id: &ConversationId) -> Result<bool, PersistenceFailure> {
        let repo = self.clone();
        let id = id.clone();
        crate::blocking(move || repo.delete_if_empty(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find() {
        let repo = ConversationRepo::new(Database::in_memory().unwrap());
        let mut conv = Conversation::new(UserId::from_raw("u1"));
        conv.title = Some("Hello".into());
        repo.insert(&conv).unwrap();

        let found = repo.find(&conv.id).unwrap().unwrap();
        assert_eq!(found, conv);
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let repo = ConversationRepo::new(Database::in_memory().unwrap());
        let conv = Conversation::new(UserId::from_raw("u1"));
        repo.insert(&conv).unwrap();
        assert!(matches!(repo.insert(&conv), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn only_empty_conversations_are_discarded() {
        let db = Database::in_memory().unwrap();
        let repo = ConversationRepo::new(db.clone());
        let owner = UserId::from_raw("u1");
        let empty = Conversation::new(owner.clone());
        let used = Conversation::new(owner.clone());
        repo.insert(&empty).unwrap();
        repo.insert(&used).unwrap();
        crate::MessageRepo::new(db)
            .insert(&parley_core::messages::TurnMessage::user(
                parley_core::ids::MessageId::from_raw("m1"),
                used.id.clone(),
                owner.clone(),
                "hi",
            ))
            .unwrap();

        assert!(repo.delete_if_empty(&empty.id).unwrap());
        assert!(!repo.delete_if_empty(&used.id).unwrap());
        assert!(!repo.delete_if_empty(&ConversationId::from_raw("nope")).unwrap());
        assert_eq!(repo.count_for_owner(&owner).unwrap(), 1);
    }

    #[tokio::test]
    async fn trait_get_missing_is_none() {
        let repo = ConversationRepo::new(Database::in_memory().unwrap());
        let found = ConversationStore::get(&repo, &ConversationId::from_raw("nope")).await.unwrap();
        assert!(found.is_none());
    }
}
