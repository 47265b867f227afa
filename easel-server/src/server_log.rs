//! Server event log
//!
//! Events that administrators care about (joins, bans, failed logins) are
//! written both to `tracing` and to a [`ServerLog`] sink. The production sink
//! is [`crate::db::DbLog`]; tests use [`MemoryLog`].

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use strum::{AsRefStr, Display, EnumString};

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// What a log entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogTopic {
    /// Session lifecycle and server status
    Status,
    /// Successful and failed identification
    Login,
    Join,
    Leave,
    Kick,
    Ban,
    Unban,
    /// Broken clients and protocol violations
    BadData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub topic: LogTopic,
    pub user: Option<String>,
    pub session: Option<String>,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, topic: LogTopic, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            topic,
            user: None,
            session: None,
            message: message.into(),
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.topic)?;
        if let Some(session) = &self.session {
            write!(f, " {session}")?;
        }
        if let Some(user) = &self.user {
            write!(f, " {user}:")?;
        }
        write!(f, " {}", self.message)
    }
}

/// Destination for server log entries
pub trait ServerLog: Send + Sync {
    fn write(&self, entry: LogEntry);
}

/// Record an entry in `tracing` and in the server log
pub fn emit(log: &dyn ServerLog, entry: LogEntry) {
    match entry.level {
        LogLevel::Error => tracing::error!(topic = entry.topic.as_ref(), "{entry}"),
        LogLevel::Warn => tracing::warn!(topic = entry.topic.as_ref(), "{entry}"),
        LogLevel::Info => tracing::info!(topic = entry.topic.as_ref(), "{entry}"),
        LogLevel::Debug => tracing::debug!(topic = entry.topic.as_ref(), "{entry}"),
    }
    log.write(entry);
}

/// In-memory log sink
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, topic: LogTopic) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.topic == topic)
            .count()
    }
}

impl ServerLog for MemoryLog {
    fn write(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_display() {
        let entry = LogEntry::new(LogLevel::Info, LogTopic::Join, "joined")
            .user("alice")
            .session("abc");
        assert_eq!(entry.to_string(), "[join] abc alice: joined");
    }

    #[test]
    fn test_level_and_topic_names_round_trip() {
        for level in [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug] {
            assert_eq!(level.as_ref().parse::<LogLevel>(), Ok(level));
        }
        assert_eq!(LogTopic::BadData.as_ref(), "baddata");
        assert_eq!(LogTopic::Kick.to_string(), "kick");
        assert_eq!("ban".parse::<LogTopic>(), Ok(LogTopic::Ban));
        assert!("nope".parse::<LogTopic>().is_err());
    }

    #[test]
    fn test_memory_log_records_emitted_entries() {
        let log = MemoryLog::new();
        emit(&log, LogEntry::new(LogLevel::Warn, LogTopic::Ban, "banned"));
        emit(&log, LogEntry::new(LogLevel::Info, LogTopic::Join, "joined"));
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.count(LogTopic::Ban), 1);
    }
}
