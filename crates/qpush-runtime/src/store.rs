//! Transactional message store backing the store provider.
//!
//! Each message is one row carrying a `delivered` flag. Rows are marked
//! delivered in the same transaction that selects them, so a message is handed
//! out at most once.
//!
//! SQLite calls block, so every statement runs on tokio's blocking pool while
//! holding the connection mutex.

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// One persisted message row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub queue: String,
    /// Serialized message body
    pub message: String,
    pub delivered: bool,
    /// Byte length of `message`
    pub length: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Narrow persistence interface consumed by the store provider
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append an undelivered row and return its id
    async fn insert(&self, queue: &str, message: &str) -> Result<i64, QueueError>;

    /// Oldest undelivered rows, marked delivered before they are returned
    async fn take_undelivered(
        &self,
        queue: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, QueueError>;

    /// Mark one row delivered; `false` when the row does not exist
    async fn acknowledge(&self, queue: &str, id: i64) -> Result<bool, QueueError>;

    /// Remove every row of a queue, returning how many were removed
    async fn purge(&self, queue: &str) -> Result<u64, QueueError>;

    async fn find(&self, queue: &str, id: i64) -> Result<Option<StoredMessage>, QueueError>;

    /// Count rows, optionally filtered by delivery state
    async fn count(&self, queue: &str, delivered: Option<bool>) -> Result<u64, QueueError>;
}

fn storage_error(e: rusqlite::Error) -> QueueError {
    QueueError::Storage {
        message: e.to_string(),
    }
}

const COLUMNS: &str = "id, queue, message, delivered, length, created_at, updated_at";

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        queue: row.get(1)?,
        message: row.get(2)?,
        delivered: row.get(3)?,
        length: row.get(4)?,
        created_at: parse_time(row, 5)?,
        updated_at: parse_time(row, 6)?,
    })
}

/// SQLite implementation of [`MessageStore`]
#[derive(Clone)]
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMessageStore {
    /// Open (or create) a database file and ensure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage_error)?;
        debug!(path = %path.display(), "message store opened");
        Self::init(conn)
    }

    /// Database that lives only as long as this store
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS qpush_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                queue       TEXT NOT NULL,
                message     TEXT NOT NULL,
                delivered   INTEGER NOT NULL DEFAULT 0,
                length      INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS qpush_messages_queue_delivered
                ON qpush_messages (queue, delivered, id);",
        )
        .map_err(storage_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut conn).map_err(storage_error)
        })
        .await
        .map_err(|e| QueueError::Storage {
            message: format!("store task failed: {}", e),
        })?
    }
}

impl std::fmt::Debug for SqliteMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMessageStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert(&self, queue: &str, message: &str) -> Result<i64, QueueError> {
        let queue = queue.to_string();
        let message = message.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO qpush_messages (queue, message, delivered, length, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?4, ?4)",
                params![queue, message, message.len() as i64, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn take_undelivered(
        &self,
        queue: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        let queue = queue.to_string();
        let now = Utc::now();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let mut rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM qpush_messages
                     WHERE queue = ?1 AND delivered = 0
                     ORDER BY id ASC LIMIT ?2",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![queue, i64::from(limit)], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            for row in rows.iter_mut() {
                tx.execute(
                    "UPDATE qpush_messages SET delivered = 1, updated_at = ?1 WHERE id = ?2",
                    params![now.to_rfc3339(), row.id],
                )?;
                row.delivered = true;
                row.updated_at = now;
            }

            tx.commit()?;
            Ok(rows)
        })
        .await
    }

    async fn acknowledge(&self, queue: &str, id: i64) -> Result<bool, QueueError> {
        let queue = queue.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE qpush_messages SET delivered = 1, updated_at = ?1
                     WHERE queue = ?2 AND id = ?3",
                    params![now, queue, id],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let queue = queue.to_string();
        let removed = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM qpush_messages WHERE queue = ?1", params![queue])
            })
            .await?;
        Ok(removed as u64)
    }

    async fn find(&self, queue: &str, id: i64) -> Result<Option<StoredMessage>, QueueError> {
        let queue = queue.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM qpush_messages WHERE queue = ?1 AND id = ?2",
                    COLUMNS
                ),
                params![queue, id],
                row_to_message,
            )
            .optional()
        })
        .await
    }

    async fn count(&self, queue: &str, delivered: Option<bool>) -> Result<u64, QueueError> {
        let queue = queue.to_string();
        let count: i64 = self
            .with_conn(move |conn| match delivered {
                Some(delivered) => conn.query_row(
                    "SELECT COUNT(*) FROM qpush_messages WHERE queue = ?1 AND delivered = ?2",
                    params![queue, delivered],
                    |row| row.get(0),
                ),
                None => conn.query_row(
                    "SELECT COUNT(*) FROM qpush_messages WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                ),
            })
            .await?;
        Ok(count as u64)
    }
}
