pub mod audit;
pub mod connection_log;
pub mod conversations;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;

pub use audit::AuditRepo;
pub use connection_log::ConnectionEventRepo;
pub use conversations::ConversationRepo;
pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRepo;

use std::path::Path;

use parley_core::store::PersistenceFailure;

/// All repositories over one shared database.
#[derive(Clone)]
pub struct Store {
    pub conversations: ConversationRepo,
    pub messages: MessageRepo,
    pub connections: ConnectionEventRepo,
    pub audit: AuditRepo,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_db(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_db(Database::in_memory()?))
    }

    pub fn from_db(db: Database) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            connections: ConnectionEventRepo::new(db.clone()),
            audit: AuditRepo::new(db),
        }
    }
}

/// Run a synchronous repository call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, PersistenceFailure>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceFailure::new(format!("store task failed: {e}")))?
        .map_err(PersistenceFailure::from)
}
