use async_trait::async_trait;

use parley_core::ids::ClientId;
use parley_core::store::{ConnectionEvent, ConnectionLog, PersistenceFailure};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored connection lifecycle row.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionEventRow {
    pub id: i64,
    pub kind: String,
    pub client_id: String,
    pub user_id: Option<String>,
    pub reason: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: String,
}

#[derive(Clone)]
pub struct ConnectionEventRepo {
    db: Database,
}

impl ConnectionEventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, event: &ConnectionEvent) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connection_events (kind, client_id, user_id, reason, duration_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event.kind.as_str(),
                    event.client_id.as_str(),
                    event.user_id.as_ref().map(|u| u.as_str()),
                    event.reason,
                    event.duration_ms.map(|d| d as i64),
                    event.timestamp,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_for_client(&self, client_id: &ClientId) -> Result<Vec<ConnectionEventRow>, StoreError> {
        const T: &str = "connection_events";
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, client_id, user_id, reason, duration_ms, timestamp
                 FROM connection_events WHERE client_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([client_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(ConnectionEventRow {
                    id: row_helpers::get(row, 0, T, "id")?,
                    kind: row_helpers::get(row, 1, T, "kind")?,
                    client_id: row_helpers::get(row, 2, T, "client_id")?,
                    user_id: row_helpers::get_opt(row, 3, T, "user_id")?,
                    reason: row_helpers::get_opt(row, 4, T, "reason")?,
                    duration_ms: row_helpers::get_opt(row, 5, T, "duration_ms")?,
                    timestamp: row_helpers::get(row, 6, T, "timestamp")?,
                });
            }
            Ok(out)
        })
    }
}

#[async_trait]
impl ConnectionLog for ConnectionEventRepo {
    async fn record(&self, event: ConnectionEvent) -> Result<(), PersistenceFailure> {
        let repo = self.clone();
        crate::blocking(move || repo.insert(&event).map(|_| ())).await
    }
}
