//! Login failures and their wire codes

use easel_common::protocol::ServerMessage;
use thiserror::Error;

/// Why a session could not be created
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateSessionError {
    /// A session with this ID or alias already exists
    #[error("session ID or alias already in use")]
    IdInUse,
    /// This protocol version cannot be hosted here
    #[error("unsupported protocol version")]
    BadProtocol,
    /// The server is full or not accepting new sessions
    #[error("server is not accepting new sessions")]
    Closed,
    #[error("could not create session storage: {0}")]
    Storage(String),
}

impl CreateSessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IdInUse => "idInuse",
            Self::BadProtocol => "badProtocol",
            Self::Closed => "closed",
            Self::Storage(_) => "internalError",
        }
    }
}

/// A failed login step
///
/// Every variant is reported to the client with [`LoginError::to_message`]
/// before the connection is either allowed to retry or dropped, as decided
/// by [`LoginError::is_fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("unexpected {0} message")]
    ProtocolViolation(&'static str),
    #[error("encryption must be enabled first")]
    TlsRequired,
    #[error("invalid username")]
    BadUsername,
    #[error("invalid session ID or alias")]
    BadSessionId,
    #[error("guest logins are not allowed on this server")]
    NoGuest,
    #[error("incorrect password")]
    BadPassword,
    #[error("too many failed attempts")]
    TooManyAttempts,
    #[error("this account is locked")]
    AccountLocked,
    #[error("external authentication is not available")]
    ExtAuthUnavailable,
    #[error("external authentication failed")]
    BadExtAuth,
    #[error("session lookup failed")]
    LookupFailed,
    #[error("session not found")]
    SessionNotFound,
    #[error("this session is closed")]
    SessionClosed,
    #[error("this session is full")]
    SessionFull,
    #[error("you have been banned from this session")]
    Banned,
    #[error("only registered users may join this session")]
    AuthOnly,
    #[error("you are not allowed to host sessions")]
    HostDenied,
    #[error("invite not found")]
    InvalidInvite,
    #[error("invite has been used up")]
    InviteLimitReached,
    #[error("this session needs a password")]
    NeedSessionPassword,
    #[error(transparent)]
    Create(#[from] CreateSessionError),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl LoginError {
    /// Machine-readable error code sent to the client
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "protocolViolation",
            Self::TlsRequired => "tlsRequired",
            Self::BadUsername => "badUsername",
            Self::BadSessionId => "badSessionId",
            Self::NoGuest => "noGuest",
            Self::BadPassword => "badPassword",
            Self::TooManyAttempts => "tooManyAttempts",
            Self::AccountLocked => "accountLocked",
            Self::ExtAuthUnavailable => "extAuthUnavailable",
            Self::BadExtAuth => "badExtAuth",
            Self::LookupFailed => "lookupFailed",
            Self::SessionNotFound => "notFound",
            Self::SessionClosed => "closed",
            Self::SessionFull => "sessionFull",
            Self::Banned => "banned",
            Self::AuthOnly => "authOnly",
            Self::HostDenied => "unauthorizedHost",
            Self::InvalidInvite => "invalidInvite",
            Self::InviteLimitReached => "inviteLimitReached",
            Self::NeedSessionPassword => "needPassword",
            Self::Create(e) => e.code(),
            Self::Internal(_) => "internalError",
        }
    }

    /// Whether the connection must be dropped after reporting this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::TlsRequired
                | Self::TooManyAttempts
                | Self::Banned
                | Self::LookupFailed
                | Self::Internal(_)
        )
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}
