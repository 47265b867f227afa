//! Metadata change events
//!
//! Every persistent change to a session's metadata is expressed as a
//! `HistoryEvent`. The journaled backend appends each event as one JSON line
//! and replays them on load; the memory backend ignores them.

use chrono::{DateTime, Utc};
use easel_common::ProtocolVersion;
use serde::{Deserialize, Serialize};

use super::{BanEntry, SessionFlags};

/// Current journal format version
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// First line of every journal
    Format { version: u32 },
    /// Second line of every journal
    Created {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        protocol: ProtocolVersion,
        founder: String,
        started_at: DateTime<Utc>,
    },
    /// The recording file that now holds the message history
    Recording { file: String },
    Founder { name: String },
    Title { title: String },
    Password { hash: Option<String> },
    OpPassword { hash: Option<String> },
    MaxUsers { count: u8 },
    AutoReset { threshold: u64 },
    Flags { flags: SessionFlags },
    Ban { entry: BanEntry },
    Unban { id: u32 },
    Announce { url: String },
    Unannounce { url: String },
    Operator { auth_id: String, on: bool },
    Trusted { auth_id: String, on: bool },
    AuthName { auth_id: String, username: String },
    User { id: u8, name: String },
    Catchup { next: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = HistoryEvent::Title {
            title: "Sketch night".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"title","title":"Sketch night"}"#);
    }

    #[test]
    fn test_created_roundtrip_without_alias() {
        let event = HistoryEvent::Created {
            id: "abc".to_string(),
            alias: None,
            protocol: ProtocolVersion::current(),
            founder: "alice".to_string(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("alias"));
        let back: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
