//! Server log storage
//!
//! Log entries are produced on hot paths (login, join) where waiting for
//! sqlite is not acceptable, so [`DbLog`] hands them to a background task
//! that owns the inserts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::db::sql;
use crate::server_log::{LogEntry, ServerLog};

/// Row type for log queries
type LogRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn entry_from_row(row: LogRow) -> Option<LogEntry> {
    let timestamp = DateTime::parse_from_rfc3339(&row.0)
        .ok()?
        .with_timezone(&Utc);
    Some(LogEntry {
        timestamp,
        level: row.1.parse().ok()?,
        topic: row.2.parse().ok()?,
        user: row.3,
        session: row.4,
        message: row.5,
    })
}

/// Database access for the `serverlog` table
#[derive(Clone)]
pub struct LogDb {
    pool: SqlitePool,
}

impl LogDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, entry: &LogEntry) -> Result<(), sqlx::Error> {
        sqlx::query(sql::SQL_INSERT_LOG_ENTRY)
            .bind(entry.timestamp.to_rfc3339())
            .bind(entry.level.as_ref())
            .bind(entry.topic.as_ref())
            .bind(entry.user.as_deref())
            .bind(entry.session.as_deref())
            .bind(&entry.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Newest entries first
    ///
    /// Rows with an unknown level or topic are skipped.
    pub async fn recent(&self, limit: i64) -> Result<Vec<LogEntry>, sqlx::Error> {
        let rows: Vec<LogRow> = sqlx::query_as(sql::SQL_SELECT_RECENT_LOG_ENTRIES)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(entry_from_row).collect())
    }

    /// Delete entries older than `before`, returning how many were removed
    pub async fn purge_before(&self, before: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql::SQL_DELETE_LOG_ENTRIES_BEFORE)
            .bind(before.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Entries queued for the writer before new ones are dropped
pub const LOG_QUEUE_CAPACITY: usize = 4096;

/// [`ServerLog`] sink writing to sqlite in the background
#[derive(Clone)]
pub struct DbLog {
    tx: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl DbLog {
    /// Start the writer task
    ///
    /// The task ends once every `DbLog` clone has been dropped and the
    /// queue is drained.
    pub fn spawn(db: LogDb) -> (Self, JoinHandle<()>) {
        Self::spawn_with_capacity(db, LOG_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(db: LogDb, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = db.insert(&entry).await {
                    warn!("failed to store log entry: {e}");
                }
            }
        });
        let log = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (log, handle)
    }

    /// Entries lost because the writer could not keep up
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ServerLog for DbLog {
    fn write(&self, entry: LogEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "server log queue full, dropping entries");
                }
            }
            // The writer task is gone, i.e. during shutdown
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::create_test_db;
    use crate::server_log::{LogLevel, LogTopic};
    use chrono::Duration;

    #[tokio::test]
    async fn test_insert_and_recent() {
        let db = LogDb::new(create_test_db().await);
        db.insert(&LogEntry::new(LogLevel::Info, LogTopic::Status, "first"))
            .await
            .unwrap();
        db.insert(
            &LogEntry::new(LogLevel::Warn, LogTopic::Ban, "second")
                .user("mallory")
                .session("s1"),
        )
        .await
        .unwrap();

        let entries = db.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "second");
        assert_eq!(entries[0].topic, LogTopic::Ban);
        assert_eq!(entries[0].user.as_deref(), Some("mallory"));
        assert_eq!(entries[1].session, None);

        assert_eq!(db.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_before() {
        let db = LogDb::new(create_test_db().await);
        let mut old = LogEntry::new(LogLevel::Info, LogTopic::Status, "old");
        old.timestamp = Utc::now() - Duration::days(30);
        db.insert(&old).await.unwrap();
        db.insert(&LogEntry::new(LogLevel::Info, LogTopic::Status, "new"))
            .await
            .unwrap();

        let removed = db.purge_before(Utc::now() - Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        let entries = db.recent(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "new");
    }

    #[tokio::test]
    async fn test_background_writer_drains_on_drop() {
        let db = LogDb::new(create_test_db().await);
        let (log, handle) = DbLog::spawn(db.clone());
        for i in 0..5 {
            log.write(LogEntry::new(LogLevel::Info, LogTopic::Join, format!("join {i}")));
        }
        drop(log);
        handle.await.unwrap();

        assert_eq!(db.recent(10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let db = LogDb::new(create_test_db().await);
        let (log, handle) = DbLog::spawn_with_capacity(db.clone(), 2);
        // The writer cannot run until this task yields
        for i in 0..5 {
            log.write(LogEntry::new(LogLevel::Info, LogTopic::Join, format!("join {i}")));
        }
        assert_eq!(log.dropped(), 3);
        drop(log);
        handle.await.unwrap();

        assert_eq!(db.recent(10).await.unwrap().len(), 2);
    }
}
