//! Database layer: accounts, server log and password hashing

mod accounts;
mod log;
mod password;
pub mod sql;

use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub use accounts::{AccountDb, AccountRecord};
pub use log::{DbLog, LogDb};
pub use password::{PasswordError, hash_password, verify_password};

/// Directory name under the platform data directory
const DATA_DIR_NAME: &str = "easel";

/// Database file name
const DATABASE_FILENAME: &str = "easel.db";

/// Handles to every table group
#[derive(Clone)]
pub struct Database {
    pub accounts: AccountDb,
    pub log: LogDb,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            accounts: AccountDb::new(pool.clone()),
            log: LogDb::new(pool),
        }
    }
}

/// Platform default database location, creating its directory
///
/// Linux: `~/.local/share/easel/easel.db`
pub fn default_database_path() -> Result<PathBuf, String> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| "could not determine the platform data directory".to_string())?
        .join(DATA_DIR_NAME);
    fs::create_dir_all(&data_dir)
        .map_err(|e| format!("could not create {}: {e}", data_dir.display()))?;
    Ok(data_dir.join(DATABASE_FILENAME))
}

/// Open (creating if needed) the database and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
pub mod testing {
    use std::str::FromStr;

    use super::*;

    /// Fresh in-memory database with migrations applied
    ///
    /// A single connection, because every connection to `:memory:` is a
    /// separate database.
    pub async fn create_test_db() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_db_creates_file_and_is_reopenable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");

        let pool = init_db(&path).await.unwrap();
        let db = Database::new(pool.clone());
        db.accounts
            .create_account("alice", "$FAST$pw", &[])
            .await
            .unwrap();
        pool.close().await;
        assert!(path.exists());

        let db = Database::new(init_db(&path).await.unwrap());
        assert!(db.accounts.get_account("alice").await.unwrap().is_some());
    }
}
