//! Account database operations

use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use sqlx::sqlite::SqlitePool;

use crate::db::sql;
use crate::login::{Account, AccountLookup, LoginError};

/// An account row from the database
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub flags: Vec<String>,
    pub locked: bool,
    pub created_at: i64,
}

/// Row type for account queries
type AccountRow = (i64, String, String, String, bool, i64);

impl From<AccountRow> for AccountRecord {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.0,
            username: row.1,
            password_hash: row.2,
            flags: split_flags(&row.3),
            locked: row.4,
            created_at: row.5,
        }
    }
}

impl From<AccountRecord> for Account {
    fn from(record: AccountRecord) -> Self {
        Self {
            username: record.username,
            password_hash: record.password_hash,
            flags: record.flags,
            locked: record.locked,
        }
    }
}

fn split_flags(flags: &str) -> Vec<String> {
    flags
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_uppercase)
        .collect()
}

/// Database access for accounts
#[derive(Clone)]
pub struct AccountDb {
    pool: SqlitePool,
}

impl AccountDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Look up an account by username (case-insensitive)
    pub async fn get_account(&self, username: &str) -> Result<Option<AccountRecord>, sqlx::Error> {
        let row: Option<AccountRow> = sqlx::query_as(sql::SQL_SELECT_ACCOUNT_BY_USERNAME)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(AccountRecord::from))
    }

    /// Create an account with an already hashed password
    pub async fn create_account(
        &self,
        username: &str,
        password_hash: &str,
        flags: &[&str],
    ) -> Result<AccountRecord, sqlx::Error> {
        sqlx::query(sql::SQL_INSERT_ACCOUNT)
            .bind(username)
            .bind(password_hash)
            .bind(flags.join(","))
            .bind(Self::now())
            .execute(&self.pool)
            .await?;

        self.get_account(username)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Returns true if the account existed
    pub async fn set_password_hash(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(sql::SQL_UPDATE_ACCOUNT_PASSWORD)
            .bind(password_hash)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns true if the account existed
    pub async fn set_locked(&self, username: &str, locked: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(sql::SQL_UPDATE_ACCOUNT_LOCKED)
            .bind(locked)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns true if the account existed
    pub async fn delete_account(&self, username: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(sql::SQL_DELETE_ACCOUNT)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl AccountLookup for AccountDb {
    fn find_account<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<Account>, LoginError>> {
        Box::pin(async move {
            self.get_account(username)
                .await
                .map(|record| record.map(Account::from))
                .map_err(|e| LoginError::Internal(e.to_string()))
        })
    }
}
