//! Client login handshake
//!
//! One [`LoginSession`] runs per connection until the client has picked a
//! session. The connection feeds it every client message and acts on the
//! returned [`LoginStep`]: keep going, upgrade to TLS, hand over to the
//! session, or hang up.
//!
//! ```text
//! WaitForSecure -> WaitForLookup -> WaitForIdent -> WaitForLogin -> Ignore
//! ```
//!
//! States only move forward. Any message that does not belong to the
//! current state is a protocol violation and ends the login in `Ignore`.

mod error;
mod services;

use std::net::IpAddr;
use std::sync::Arc;

use easel_common::protocol::{ClientMessage, IdentIntent, ServerMessage, SessionDescription};
use easel_common::{ProtocolVersion, validators};

pub use error::{CreateSessionError, LoginError};
pub use services::{
    Account, AccountLookup, DirectoryLookup, ExtAuthIdentity, ExtAuthVerifier, FLAG_BAN_EXEMPT,
    FLAG_HOST, FLAG_MOD, LookupService, NewSession, SessionsDirectory,
};

use crate::db::{PasswordError, hash_password, verify_password};
use crate::history::SessionFlags;
use crate::server_log::{LogEntry, LogLevel, LogTopic, ServerLog, emit};
use crate::session::{InviteCheck, JoiningUser, Session, SessionJoinError};

/// Wrong passwords tolerated per connection; the last one disconnects
pub const MAX_PASSWORD_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    WaitForSecure,
    WaitForLookup,
    WaitForIdent,
    WaitForLogin,
    /// Login finished or failed; further messages are dropped
    Ignore,
}

/// Server-wide login rules
#[derive(Debug, Clone)]
pub struct LoginPolicy {
    pub allow_guests: bool,
    /// Guests may create sessions (registered users need the HOST flag otherwise)
    pub allow_guest_hosts: bool,
    /// Clients must look up a session before identifying
    pub mandatory_lookup: bool,
    pub tls_available: bool,
    pub tls_required: bool,
    pub persistence: bool,
}

impl Default for LoginPolicy {
    fn default() -> Self {
        Self {
            allow_guests: true,
            allow_guest_hosts: true,
            mandatory_lookup: false,
            tls_available: false,
            tls_required: false,
            persistence: false,
        }
    }
}

/// Everything a login needs from the rest of the server
pub struct LoginServices {
    pub policy: LoginPolicy,
    pub sessions: Arc<dyn SessionsDirectory>,
    pub accounts: Option<Arc<dyn AccountLookup>>,
    pub ext_auth: Option<Arc<dyn ExtAuthVerifier>>,
    pub lookup: Arc<dyn LookupService>,
    pub log: Arc<dyn ServerLog>,
}

/// Who the client turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub guest: bool,
    pub ext_auth_id: Option<String>,
    pub flags: Vec<String>,
}

impl Identity {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// A finished login
#[derive(Debug)]
pub struct LoggedIn {
    pub session: Arc<Session>,
    pub user_id: u8,
    pub founder: bool,
    pub identity: Identity,
}

#[derive(Debug)]
pub enum LoginStep {
    Continue,
    /// Send the replies, then perform the TLS handshake
    StartTls,
    Complete(LoggedIn),
    /// Send the replies, then close the connection
    Disconnect,
}

/// Replies to send, then what to do next
#[derive(Debug)]
pub struct LoginResponse {
    pub replies: Vec<ServerMessage>,
    pub step: LoginStep,
}

impl LoginResponse {
    fn reply(messages: Vec<ServerMessage>) -> Self {
        Self {
            replies: messages,
            step: LoginStep::Continue,
        }
    }
}

pub struct LoginSession {
    services: Arc<LoginServices>,
    peer: Option<IpAddr>,
    secure: bool,
    state: LoginState,
    auth_attempts: u32,
    session_password_attempts: u32,
    /// Nonce handed to the external authenticator, until it is used
    ext_auth_nonce: Option<u64>,
    ext_auth_nonce_issued: bool,
    identity: Option<Identity>,
}

impl LoginSession {
    pub fn new(services: Arc<LoginServices>, peer: Option<IpAddr>) -> Self {
        let state = if services.policy.tls_available {
            LoginState::WaitForSecure
        } else {
            Self::state_after_secure(&services.policy)
        };
        let peer_name = peer.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        emit(
            services.log.as_ref(),
            LogEntry::new(
                LogLevel::Debug,
                LogTopic::Status,
                format!("new connection from {peer_name}"),
            ),
        );
        Self {
            services,
            peer,
            secure: false,
            state,
            auth_attempts: 0,
            session_password_attempts: 0,
            ext_auth_nonce: None,
            ext_auth_nonce_issued: false,
            identity: None,
        }
    }

    fn state_after_secure(policy: &LoginPolicy) -> LoginState {
        if policy.mandatory_lookup {
            LoginState::WaitForLookup
        } else {
            LoginState::WaitForIdent
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// First message sent on the connection
    pub fn greeting(&self) -> ServerMessage {
        let policy = &self.services.policy;
        let mut flags = vec![easel_common::FEATURE_MULTI];
        if policy.tls_available {
            flags.push(easel_common::FEATURE_TLS);
        }
        if policy.tls_required {
            flags.push(easel_common::FEATURE_SECURE);
        }
        if policy.persistence {
            flags.push(easel_common::FEATURE_PERSIST);
        }
        if self.services.accounts.is_some() {
            flags.push(easel_common::FEATURE_IDENT);
        }
        if !policy.allow_guests {
            flags.push(easel_common::FEATURE_NOGUEST);
        }
        if self.services.ext_auth.is_some() {
            flags.push(easel_common::FEATURE_EXTAUTH);
        }
        if policy.mandatory_lookup {
            flags.push(easel_common::FEATURE_LOOKUP);
        }
        ServerMessage::Greeting {
            version: easel_common::SERVER_PROTOCOL_VERSION,
            flags: flags.into_iter().map(str::to_string).collect(),
        }
    }

    /// The TLS handshake requested with `StartTls` has completed
    pub fn tls_established(&mut self) {
        self.secure = true;
    }

    /// Session list update for a client that has not picked a session yet
    pub fn announce_session(&self, description: &SessionDescription) -> Option<ServerMessage> {
        (self.state == LoginState::WaitForLogin).then(|| ServerMessage::SessionList {
            add: vec![description.clone()],
            remove: Vec::new(),
        })
    }

    pub fn announce_session_end(&self, id: &str) -> Option<ServerMessage> {
        (self.state == LoginState::WaitForLogin).then(|| ServerMessage::SessionList {
            add: Vec::new(),
            remove: vec![id.to_string()],
        })
    }

    /// A line that could not be parsed as a client message
    pub fn invalid_message(&mut self, reason: &str) -> LoginResponse {
        self.log(LogLevel::Warn, LogTopic::BadData, format!("invalid message: {reason}"));
        self.fail(LoginError::ProtocolViolation("invalid"))
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> LoginResponse {
        if self.state == LoginState::WaitForSecure {
            if let ClientMessage::StartTls = message {
                self.state = Self::state_after_secure(&self.services.policy);
                return LoginResponse {
                    replies: vec![ServerMessage::StartTls],
                    step: LoginStep::StartTls,
                };
            }
            if self.services.policy.tls_required && !self.secure {
                return self.fail(LoginError::TlsRequired);
            }
            self.state = Self::state_after_secure(&self.services.policy);
        }

        match (self.state, message) {
            (LoginState::WaitForLookup, ClientMessage::Lookup { session }) => {
                self.handle_lookup(session).await
            }
            (
                LoginState::WaitForIdent,
                ClientMessage::Ident {
                    username,
                    password,
                    ext_auth,
                    intent,
                },
            ) => self.handle_ident(username, password, ext_auth, intent).await,
            (
                LoginState::WaitForLogin,
                ClientMessage::Host {
                    id,
                    alias,
                    protocol,
                    title,
                    password,
                },
            ) => self.handle_host(id, alias, protocol, title, password).await,
            (LoginState::WaitForLogin, ClientMessage::Join { id, invite, password }) => {
                self.handle_join(id, invite, password).await
            }
            (LoginState::Ignore, _) => LoginResponse {
                replies: Vec::new(),
                step: LoginStep::Disconnect,
            },
            (state, other) => {
                self.log(
                    LogLevel::Warn,
                    LogTopic::BadData,
                    format!("{} message in state {state:?}", other.kind()),
                );
                self.fail(LoginError::ProtocolViolation(other.kind()))
            }
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    async fn handle_lookup(&mut self, session: Option<String>) -> LoginResponse {
        let lookup = Arc::clone(&self.services.lookup);
        match lookup.lookup(session.as_deref()).await {
            Ok(found) => {
                self.state = LoginState::WaitForIdent;
                LoginResponse::reply(vec![ServerMessage::LookupResult { session: found }])
            }
            Err(e) => {
                self.log(LogLevel::Warn, LogTopic::Status, format!("lookup failed: {e}"));
                self.fail(LoginError::LookupFailed)
            }
        }
    }

    // ========================================================================
    // Identification
    // ========================================================================

    async fn handle_ident(
        &mut self,
        username: String,
        password: Option<String>,
        ext_auth: Option<String>,
        intent: Option<IdentIntent>,
    ) -> LoginResponse {
        if validators::validate_username(&username).is_err() {
            return self.fail(LoginError::BadUsername);
        }

        let intent = intent.unwrap_or(if ext_auth.is_some() {
            IdentIntent::ExtAuth
        } else if password.is_some() {
            IdentIntent::Auth
        } else {
            IdentIntent::Guest
        });

        match intent {
            IdentIntent::Guest => self.guest_login(username).await,
            IdentIntent::Auth => self.auth_login(username, password.unwrap_or_default()).await,
            IdentIntent::ExtAuth => self.ext_auth_login(username, ext_auth).await,
        }
    }

    async fn guest_login(&mut self, username: String) -> LoginResponse {
        if !self.services.policy.allow_guests {
            return self.fail(LoginError::NoGuest);
        }
        if let Some(accounts) = self.services.accounts.clone() {
            match accounts.find_account(&username).await {
                Ok(Some(_)) => return LoginResponse::reply(vec![ServerMessage::NeedPassword]),
                Ok(None) => {}
                Err(e) => return self.fail(e),
            }
        }
        self.identified(Identity {
            username,
            guest: true,
            ext_auth_id: None,
            flags: Vec::new(),
        })
        .await
    }

    async fn auth_login(&mut self, username: String, password: String) -> LoginResponse {
        let Some(accounts) = self.services.accounts.clone() else {
            return self.guest_login(username).await;
        };
        let account = match accounts.find_account(&username).await {
            Ok(Some(account)) => account,
            Ok(None) => return self.guest_login(username).await,
            Err(e) => return self.fail(e),
        };
        if account.locked {
            self.log_user(LogLevel::Warn, LogTopic::Login, &username, "locked account");
            return self.fail(LoginError::AccountLocked);
        }

        let hash = account.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await;
        match verified {
            Ok(Ok(true)) => {
                self.identified(Identity {
                    username: account.username,
                    guest: false,
                    ext_auth_id: None,
                    flags: account.flags,
                })
                .await
            }
            Ok(Ok(false)) | Ok(Err(PasswordError::Validation(_))) => {
                self.failed_attempt(&username, LoginError::BadPassword)
            }
            Ok(Err(e)) => self.fail(LoginError::Internal(e.to_string())),
            Err(e) => self.fail(LoginError::Internal(e.to_string())),
        }
    }

    async fn ext_auth_login(&mut self, username: String, token: Option<String>) -> LoginResponse {
        let Some(verifier) = self.services.ext_auth.clone() else {
            return self.fail(LoginError::ExtAuthUnavailable);
        };

        let Some(token) = token else {
            if self.ext_auth_nonce_issued {
                return self.fail(LoginError::BadExtAuth);
            }
            let nonce: u64 = rand::random();
            self.ext_auth_nonce = Some(nonce);
            self.ext_auth_nonce_issued = true;
            return LoginResponse::reply(vec![ServerMessage::NeedExtAuth {
                url: verifier.url().to_string(),
                nonce: format_nonce(nonce),
            }]);
        };

        // The nonce is gone after one verification, good or bad
        let Some(nonce) = self.ext_auth_nonce.take() else {
            return self.fail(LoginError::BadExtAuth);
        };
        match verifier.verify(&token, &format_nonce(nonce)).await {
            Ok(Some(identity)) => {
                self.identified(Identity {
                    username: identity.username,
                    guest: false,
                    ext_auth_id: Some(identity.ext_auth_id),
                    flags: identity.flags,
                })
                .await
            }
            Ok(None) => self.failed_attempt(&username, LoginError::BadExtAuth),
            Err(e) => self.fail(e),
        }
    }

    async fn identified(&mut self, identity: Identity) -> LoginResponse {
        let kind = if identity.guest { "guest" } else { "registered user" };
        self.log_user(
            LogLevel::Info,
            LogTopic::Login,
            &identity.username,
            &format!("identified as {kind}"),
        );

        let sessions = Arc::clone(&self.services.sessions);
        let list = sessions.session_list().await;
        let reply = ServerMessage::Identified {
            username: identity.username.clone(),
            guest: identity.guest,
            flags: identity.flags.clone(),
        };
        self.identity = Some(identity);
        self.state = LoginState::WaitForLogin;
        LoginResponse::reply(vec![
            reply,
            ServerMessage::SessionList {
                add: list,
                remove: Vec::new(),
            },
        ])
    }

    fn failed_attempt(&mut self, username: &str, error: LoginError) -> LoginResponse {
        self.auth_attempts += 1;
        self.log_user(
            LogLevel::Warn,
            LogTopic::Login,
            username,
            &format!("failed login attempt {}", self.auth_attempts),
        );
        if self.auth_attempts >= MAX_PASSWORD_ATTEMPTS {
            self.fail(LoginError::TooManyAttempts)
        } else {
            self.fail(error)
        }
    }

    // ========================================================================
    // Host and join
    // ========================================================================

    async fn handle_host(
        &mut self,
        id: Option<String>,
        alias: Option<String>,
        protocol: ProtocolVersion,
        title: Option<String>,
        password: Option<String>,
    ) -> LoginResponse {
        let Some(identity) = self.identity.clone() else {
            return self.fail(LoginError::Internal("no identity".to_string()));
        };
        if !protocol.is_hostable() {
            return self.fail(CreateSessionError::BadProtocol.into());
        }
        if !self.services.policy.allow_guest_hosts && !identity.has_flag(FLAG_HOST) {
            return self.fail(LoginError::HostDenied);
        }
        if let Some(id) = &id
            && validators::validate_session_id(id).is_err()
        {
            return self.fail(LoginError::BadSessionId);
        }
        if let Some(alias) = &alias
            && validators::validate_session_alias(alias).is_err()
        {
            return self.fail(LoginError::BadSessionId);
        }

        let password_hash = match password.filter(|p| !p.is_empty()) {
            None => None,
            Some(password) => {
                match tokio::task::spawn_blocking(move || hash_password(&password, false)).await {
                    Ok(Ok(hash)) => Some(hash),
                    Ok(Err(PasswordError::Validation(_))) => {
                        return self.fail(LoginError::BadPassword);
                    }
                    Ok(Err(e)) => return self.fail(LoginError::Internal(e.to_string())),
                    Err(e) => return self.fail(LoginError::Internal(e.to_string())),
                }
            }
        };

        let request = NewSession {
            id,
            alias,
            protocol,
            founder: identity.username.clone(),
            title: title.unwrap_or_default(),
            password_hash,
        };
        let sessions = Arc::clone(&self.services.sessions);
        let session = match sessions.create_session(request).await {
            Ok(session) => session,
            Err(e) => return self.fail(e.into()),
        };

        match session.join(self.joining_user(&identity), None).await {
            Ok(user_id) => self.complete(session, user_id, true, identity),
            Err(e) => self.fail(join_error(e)),
        }
    }

    async fn handle_join(
        &mut self,
        id: String,
        invite: Option<String>,
        password: Option<String>,
    ) -> LoginResponse {
        let Some(identity) = self.identity.clone() else {
            return self.fail(LoginError::Internal("no identity".to_string()));
        };
        let Some(session) = self.services.sessions.find_session(&id) else {
            return self.fail(LoginError::SessionNotFound);
        };

        if !identity.has_flag(FLAG_BAN_EXEMPT) {
            let ip = self.peer;
            let ext_auth_id = identity.ext_auth_id.clone();
            let ban = session
                .history()
                .read(move |h| h.is_banned(ip, ext_auth_id.as_deref(), None).map(|b| b.id))
                .await;
            match ban {
                Ok(None) => {}
                Ok(Some(ban_id)) => {
                    emit(
                        self.services.log.as_ref(),
                        LogEntry::new(
                            LogLevel::Warn,
                            LogTopic::Ban,
                            format!("banned user tried to join (ban #{ban_id})"),
                        )
                        .user(identity.username.clone())
                        .session(session.id()),
                    );
                    return self.fail(LoginError::Banned);
                }
                Err(e) => return self.fail(LoginError::Internal(e.to_string())),
            }
        }

        let policy = session
            .history()
            .read(|h| {
                let meta = h.metadata();
                (
                    meta.password_hash.clone(),
                    meta.flags.contains(SessionFlags::AUTH_ONLY),
                )
            })
            .await;
        let (password_hash, auth_only) = match policy {
            Ok(policy) => policy,
            Err(e) => return self.fail(LoginError::Internal(e.to_string())),
        };
        if auth_only && identity.guest {
            return self.fail(LoginError::AuthOnly);
        }

        // A valid invite gets past the closed flag and the session password
        let invited = match invite.as_deref().map(|secret| session.check_invite(secret)) {
            None => false,
            Some(InviteCheck::Ok) => true,
            Some(InviteCheck::NotFound) => return self.fail(LoginError::InvalidInvite),
            Some(InviteCheck::LimitReached) => return self.fail(LoginError::InviteLimitReached),
        };
        if !invited && session.is_closed() {
            return self.fail(LoginError::SessionClosed);
        }
        if !invited && let Some(hash) = password_hash {
            let Some(password) = password.filter(|p| !p.is_empty()) else {
                return self.fail(LoginError::NeedSessionPassword);
            };
            let verified =
                tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await;
            match verified {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) | Ok(Err(PasswordError::Validation(_))) => {
                    self.session_password_attempts += 1;
                    if self.session_password_attempts >= MAX_PASSWORD_ATTEMPTS {
                        return self.fail(LoginError::TooManyAttempts);
                    }
                    return self.fail(LoginError::BadPassword);
                }
                Ok(Err(e)) => return self.fail(LoginError::Internal(e.to_string())),
                Err(e) => return self.fail(LoginError::Internal(e.to_string())),
            }
        }

        let invite = if invited { invite.as_deref() } else { None };
        match session.join(self.joining_user(&identity), invite).await {
            Ok(user_id) => self.complete(session, user_id, false, identity),
            Err(e) => self.fail(join_error(e)),
        }
    }

    fn joining_user(&self, identity: &Identity) -> JoiningUser {
        JoiningUser {
            name: identity.username.clone(),
            auth_id: identity.ext_auth_id.clone(),
            ip: self.peer,
        }
    }

    fn complete(
        &mut self,
        session: Arc<Session>,
        user_id: u8,
        founder: bool,
        identity: Identity,
    ) -> LoginResponse {
        emit(
            self.services.log.as_ref(),
            LogEntry::new(
                LogLevel::Info,
                LogTopic::Join,
                format!("joined as user #{user_id}"),
            )
            .user(identity.username.clone())
            .session(session.id()),
        );
        self.state = LoginState::Ignore;
        LoginResponse {
            replies: vec![ServerMessage::LoginOk {
                id: session.id().to_string(),
                user_id,
                founder,
            }],
            step: LoginStep::Complete(LoggedIn {
                session,
                user_id,
                founder,
                identity,
            }),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Report `error`; fatal errors end the login
    fn fail(&mut self, error: LoginError) -> LoginResponse {
        let step = if error.is_fatal() {
            self.state = LoginState::Ignore;
            LoginStep::Disconnect
        } else {
            LoginStep::Continue
        };
        LoginResponse {
            replies: vec![error.to_message()],
            step,
        }
    }

    fn log(&self, level: LogLevel, topic: LogTopic, message: String) {
        let peer = self.peer.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        emit(
            self.services.log.as_ref(),
            LogEntry::new(level, topic, format!("{peer}: {message}")),
        );
    }

    fn log_user(&self, level: LogLevel, topic: LogTopic, user: &str, message: &str) {
        emit(
            self.services.log.as_ref(),
            LogEntry::new(level, topic, message).user(user),
        );
    }
}

fn format_nonce(nonce: u64) -> String {
    format!("{nonce:016x}")
}

fn join_error(error: SessionJoinError) -> LoginError {
    match error {
        SessionJoinError::Full => LoginError::SessionFull,
        SessionJoinError::InviteNotFound => LoginError::InvalidInvite,
        SessionJoinError::InviteLimitReached => LoginError::InviteLimitReached,
        SessionJoinError::History(e) => LoginError::Internal(e.to_string()),
    }
}
