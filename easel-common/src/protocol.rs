//! Protocol definitions for Easel
//!
//! All messages are newline-delimited JSON objects tagged by `type`.
//!
//! ## Login sequence
//!
//! ```text
//! S: Greeting (server version and feature flags)
//! C: StartTls              (if TLS is offered; mandatory when SECURE)
//! S: StartTls              (TLS handshake follows)
//! C: Lookup                (only when LOOKUP is advertised)
//! S: LookupResult
//! C: Ident
//! S: Identified | NeedPassword | NeedExtAuth | Error
//! S: SessionList           (repeated until the client picks a session)
//! C: Host | Join
//! S: LoginOk | Error
//! ```
//!
//! After `LoginOk` the client uploads canvas messages with `Message` and
//! receives history batches with `Messages`. Canvas messages are opaque
//! byte strings carried hex-encoded. Records starting with
//! [`NOTICE_PREFIX`] are written by the server itself (see
//! [`HistoryNotice`]) and may not be uploaded.
//!
//! ## Stream reset
//!
//! ```text
//! S: AutoresetRequest      (to one operator, when the history grows large)
//! C: ResetStart
//! S: ResetStarted          (carries the catch-up key)
//! C: ResetData             (repeated, tagged with the catch-up key)
//! C: ResetFinish
//! S: ResetDone | Error
//! ```
//!
//! Indices keep counting across a reset; every client then receives the new
//! history starting at the new first index.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolVersion;

/// First byte of history records written by the server
pub const NOTICE_PREFIX: u8 = 0;

/// What kind of identification the client intends to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentIntent {
    /// Log in without an account
    Guest,
    /// Log in with a server account password
    Auth,
    /// Log in with an external authentication token
    ExtAuth,
}

/// Client request messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Request an encryption upgrade
    StartTls,
    /// Look up a session before identifying
    Lookup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    /// Identify the user
    Ident {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// Signed token issued by the external authenticator
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ext_auth: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intent: Option<IdentIntent>,
    },
    /// Create a new session, becoming its founder
    Host {
        /// Vanity session ID (requires permission); generated if absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        protocol: ProtocolVersion,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Join an existing session by ID or alias
    Join {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invite: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Upload a canvas message (hex-encoded bytes)
    Message { data: String },
    /// Begin replacing the session history (operators only)
    ResetStart,
    /// Part of the new history of a reset in progress
    ResetData { catchup_key: i32, data: Vec<String> },
    /// Replace the history with everything sent since `ResetStart`
    ResetFinish { catchup_key: i32 },
    /// Open or close the session to users without an invite (operators only)
    SetClosed { closed: bool },
    /// Create an invite secret, 0 uses meaning unlimited (operators only)
    CreateInvite {
        #[serde(default)]
        max_uses: u32,
    },
    /// Disconnect a user, optionally banning them (operators only)
    Kick {
        user_id: u8,
        #[serde(default)]
        ban: bool,
    },
    /// Lift a ban (operators only)
    Unban { id: u32 },
}

impl ClientMessage {
    /// Short name used in logs and error replies
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartTls => "StartTls",
            Self::Lookup { .. } => "Lookup",
            Self::Ident { .. } => "Ident",
            Self::Host { .. } => "Host",
            Self::Join { .. } => "Join",
            Self::Message { .. } => "Message",
            Self::ResetStart => "ResetStart",
            Self::ResetData { .. } => "ResetData",
            Self::ResetFinish { .. } => "ResetFinish",
            Self::SetClosed { .. } => "SetClosed",
            Self::CreateInvite { .. } => "CreateInvite",
            Self::Kick { .. } => "Kick",
            Self::Unban { .. } => "Unban",
        }
    }
}

/// Public description of a live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub title: String,
    pub founder: String,
    pub protocol: ProtocolVersion,
    pub users: u32,
    pub max_users: u8,
    pub has_password: bool,
    pub closed: bool,
    pub persistent: bool,
    pub nsfm: bool,
    pub auth_only: bool,
    /// Unix timestamp (seconds) when the session started
    pub started_at: i64,
}

/// Server response messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First message on every connection
    Greeting { version: u32, flags: Vec<String> },
    /// Encryption upgrade accepted; the TLS handshake starts right after this line
    StartTls,
    /// Reply to `Lookup`
    LookupResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SessionDescription>,
    },
    /// Identification succeeded
    Identified {
        username: String,
        guest: bool,
        flags: Vec<String>,
    },
    /// The username belongs to an account; resend `Ident` with a password
    NeedPassword,
    /// Authenticate externally, then resend `Ident` with the token
    NeedExtAuth { url: String, nonce: String },
    /// Session list changes (the first update carries the full list)
    SessionList {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        add: Vec<SessionDescription>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        remove: Vec<String>,
    },
    /// Host or join succeeded
    LoginOk {
        id: String,
        user_id: u8,
        founder: bool,
    },
    /// A batch of history messages starting at `first_index`
    Messages { first_index: i64, data: Vec<String> },
    /// The history passed its auto-reset threshold; please reset it
    AutoresetRequest {
        /// Largest acceptable reset image in bytes, 0 for unlimited
        max_size: u64,
    },
    /// Reset accepted; tag the new history with this key
    ResetStarted { catchup_key: i32 },
    /// The history was replaced and now starts at `first_index`
    ResetDone { catchup_key: i32, first_index: i64 },
    /// Current state of the session, after an operator changed it
    SessionInfo { session: SessionDescription },
    InviteCreated { secret: String, max_uses: u32 },
    /// The session ban list after a change
    BanList { bans: Value },
    /// This user was removed from the session
    Kicked { by: String, banned: bool },
    /// Error reply; `code` is machine readable
    Error { code: String, message: String },
}

/// A history record written by the server rather than uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "lowercase")]
pub enum HistoryNotice {
    Join { user_id: u8, name: String },
    Leave { user_id: u8 },
}

impl HistoryNotice {
    /// Encode as a history record: [`NOTICE_PREFIX`] followed by JSON
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut record = vec![NOTICE_PREFIX];
        serde_json::to_writer(&mut record, self)?;
        Ok(record)
    }

    /// Decode a history record, `None` if it is not a server notice
    pub fn decode(record: &[u8]) -> Option<Self> {
        match record.split_first() {
            Some((&NOTICE_PREFIX, json)) => serde_json::from_slice(json).ok(),
            _ => None,
        }
    }

    /// Could `record` be mistaken for a server notice?
    pub fn is_reserved(record: &[u8]) -> bool {
        record.first() == Some(&NOTICE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_ident() {
        let msg = ClientMessage::Ident {
            username: "alice".to_string(),
            password: None,
            ext_auth: None,
            intent: Some(IdentIntent::Guest),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Ident\""));
        assert!(json.contains("\"intent\":\"guest\""));
        assert!(!json.contains("\"password\""));
    }

    #[test]
    fn test_deserialize_join_with_defaults() {
        let json = r#"{"type":"Join","id":"drawing-night"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                id: "drawing-night".to_string(),
                invite: None,
                password: None,
            }
        );
    }

    #[test]
    fn test_deserialize_host_requires_valid_protocol() {
        let ok = r#"{"type":"Host","protocol":"easel:4.24.0"}"#;
        assert!(serde_json::from_str::<ClientMessage>(ok).is_ok());

        let bad = r#"{"type":"Host","protocol":"nonsense"}"#;
        assert!(serde_json::from_str::<ClientMessage>(bad).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type":"Shutdown"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_error_message_shape() {
        let msg = ServerMessage::Error {
            code: "badPassword".to_string(),
            message: "Incorrect password".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"Error","code":"badPassword","message":"Incorrect password"}"#
        );
    }

    #[test]
    fn test_session_list_skips_empty_vectors() {
        let msg = ServerMessage::SessionList {
            add: vec![],
            remove: vec!["abc".to_string()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"add\""));
        assert!(json.contains("\"remove\":[\"abc\"]"));
    }

    #[test]
    fn test_reset_data_shape() {
        let json = r#"{"type":"ResetData","catchup_key":42,"data":["00ff"]}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ResetData {
                catchup_key: 42,
                data: vec!["00ff".to_string()],
            }
        );
    }

    #[test]
    fn test_kick_defaults_to_no_ban() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"Kick","user_id":3}"#).unwrap();
        assert_eq!(msg, ClientMessage::Kick { user_id: 3, ban: false });
    }

    #[test]
    fn test_history_notice_record() {
        let notice = HistoryNotice::Join {
            user_id: 7,
            name: "alice".to_string(),
        };
        let record = notice.encode().unwrap();
        assert_eq!(record[0], NOTICE_PREFIX);
        assert!(HistoryNotice::is_reserved(&record));
        assert_eq!(HistoryNotice::decode(&record), Some(notice));

        assert_eq!(HistoryNotice::decode(b"stroke"), None);
        assert!(!HistoryNotice::is_reserved(b""));
    }
}
