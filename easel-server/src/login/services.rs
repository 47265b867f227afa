//! Collaborators the login state machine talks to
//!
//! Each one is a trait object so the server can plug in sqlite accounts and
//! the live session directory while tests use in-memory fakes.

use std::sync::Arc;

use easel_common::ProtocolVersion;
use easel_common::protocol::SessionDescription;
use futures_util::future::BoxFuture;

use super::error::{CreateSessionError, LoginError};
use crate::session::Session;

/// A registered user account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub password_hash: String,
    pub flags: Vec<String>,
    pub locked: bool,
}

impl Account {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// Account flag allowing the user to host sessions when guests cannot
pub const FLAG_HOST: &str = "HOST";

/// Account flag exempting the user from session bans
pub const FLAG_BAN_EXEMPT: &str = "BANEXEMPT";

/// Account flag granting operator rights in every session
pub const FLAG_MOD: &str = "MOD";

pub trait AccountLookup: Send + Sync {
    fn find_account<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<Account>, LoginError>>;
}

/// Identity confirmed by an external authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtAuthIdentity {
    /// Stable user id at the authenticator
    pub ext_auth_id: String,
    pub username: String,
    pub flags: Vec<String>,
}

pub trait ExtAuthVerifier: Send + Sync {
    /// Where the client should authenticate
    fn url(&self) -> &str;

    /// Check a token the authenticator issued for `nonce`
    ///
    /// Returns `Ok(None)` if the token is invalid, expired or for another nonce.
    fn verify<'a>(
        &'a self,
        token: &'a str,
        nonce: &'a str,
    ) -> BoxFuture<'a, Result<Option<ExtAuthIdentity>, LoginError>>;
}

/// Lookup performed before identification when the server demands it
pub trait LookupService: Send + Sync {
    fn lookup<'a>(
        &'a self,
        session: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<SessionDescription>, LoginError>>;
}

/// Parameters for a new session
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Vanity ID; a UUID is generated if absent
    pub id: Option<String>,
    pub alias: Option<String>,
    pub protocol: ProtocolVersion,
    pub founder: String,
    pub title: String,
    pub password_hash: Option<String>,
}

/// The set of live sessions
pub trait SessionsDirectory: Send + Sync {
    fn find_session(&self, id_or_alias: &str) -> Option<Arc<Session>>;

    fn create_session(
        &self,
        request: NewSession,
    ) -> BoxFuture<'_, Result<Arc<Session>, CreateSessionError>>;

    fn session_list(&self) -> BoxFuture<'_, Vec<SessionDescription>>;
}

/// Resolves lookups against the live session directory
pub struct DirectoryLookup {
    sessions: Arc<dyn SessionsDirectory>,
}

impl DirectoryLookup {
    pub fn new(sessions: Arc<dyn SessionsDirectory>) -> Self {
        Self { sessions }
    }
}

impl LookupService for DirectoryLookup {
    fn lookup<'a>(
        &'a self,
        session: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<SessionDescription>, LoginError>> {
        Box::pin(async move {
            let Some(found) = session.and_then(|id| self.sessions.find_session(id)) else {
                return Ok(None);
            };
            found
                .description()
                .await
                .map(Some)
                .map_err(|e| LoginError::Internal(e.to_string()))
        })
    }
}
