//! SQL query constants for database operations
//!
//! This module contains all SQL queries used by the database layer.
//! Each query is documented with its parameters and special behaviors.

// ========================================================================
// Account Query Operations
// ========================================================================

/// Select an account by username (case-insensitive lookup)
///
/// **Parameters:**
/// 1. `username: &str` - Username to search for
///
/// **Returns:** `(id, username, password_hash, flags, locked, created_at)`
///
/// **Note:** The `username` column is declared `COLLATE NOCASE`, so the
/// original case is preserved in the returned row.
pub const SQL_SELECT_ACCOUNT_BY_USERNAME: &str = "SELECT id, username, password_hash, flags, locked, created_at FROM accounts WHERE username = ?";

/// Insert a new account
///
/// **Parameters:**
/// 1. `username: &str`
/// 2. `password_hash: &str` - Argon2id PHC string
/// 3. `flags: &str` - Comma separated flag names
/// 4. `created_at: i64` - Unix timestamp
///
/// **Note:** Fails with a unique constraint violation if the username is taken.
pub const SQL_INSERT_ACCOUNT: &str =
    "INSERT INTO accounts (username, password_hash, flags, locked, created_at) VALUES (?, ?, ?, 0, ?)";

/// Replace an account's password hash
///
/// **Parameters:**
/// 1. `password_hash: &str`
/// 2. `username: &str`
pub const SQL_UPDATE_ACCOUNT_PASSWORD: &str =
    "UPDATE accounts SET password_hash = ? WHERE username = ?";

/// Lock or unlock an account
///
/// **Parameters:**
/// 1. `locked: bool`
/// 2. `username: &str`
pub const SQL_UPDATE_ACCOUNT_LOCKED: &str = "UPDATE accounts SET locked = ? WHERE username = ?";

/// Delete an account
///
/// **Parameters:**
/// 1. `username: &str`
pub const SQL_DELETE_ACCOUNT: &str = "DELETE FROM accounts WHERE username = ?";

// ========================================================================
// Server Log Operations
// ========================================================================

/// Append a server log entry
///
/// **Parameters:**
/// 1. `timestamp: &str` - RFC 3339 UTC timestamp
/// 2. `level: &str` - `error`, `warn`, `info` or `debug`
/// 3. `topic: &str` - Event topic such as `join` or `ban`
/// 4. `user: Option<&str>`
/// 5. `session: Option<&str>`
/// 6. `message: &str`
pub const SQL_INSERT_LOG_ENTRY: &str = "INSERT INTO serverlog (timestamp, level, topic, user, session, message) VALUES (?, ?, ?, ?, ?, ?)";

/// Select the newest log entries, newest first
///
/// **Parameters:**
/// 1. `limit: i64`
///
/// **Returns:** `(timestamp, level, topic, user, session, message)`
pub const SQL_SELECT_RECENT_LOG_ENTRIES: &str = "SELECT timestamp, level, topic, user, session, message FROM serverlog ORDER BY id DESC LIMIT ?";

/// Delete log entries older than a timestamp
///
/// **Parameters:**
/// 1. `before: &str` - RFC 3339 UTC timestamp
///
/// **Note:** RFC 3339 strings in UTC sort lexically in time order.
pub const SQL_DELETE_LOG_ENTRIES_BEFORE: &str = "DELETE FROM serverlog WHERE timestamp < ?";
