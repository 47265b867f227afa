//! Client connection handling
//!
//! A connection runs the login handshake first, then becomes a reader and
//! writer of the session it joined: uploaded canvas messages are appended
//! to the session history, and new history is streamed back in batches.
//! Session operators may also reset the history, close the session, create
//! invites and kick or ban other users.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use easel_common::io::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_LINE_TIMEOUT, LineError, read_message, write_message,
};
use easel_common::protocol::{ClientMessage, HistoryNotice, ServerMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::history::{BanTarget, HistoryError, HistoryMessage};
use crate::login::{FLAG_MOD, LoggedIn, LoginServices, LoginSession, LoginStep};
use crate::server_log::{LogEntry, LogLevel, LogTopic, emit};
use crate::session::SessionEvent;
use crate::sessions::{SessionListEvent, SessionServer};

/// Most history messages carried by one `Messages` reply
pub const MESSAGES_PER_BATCH: usize = 256;

/// Byte stream a connection runs over, before or after a TLS upgrade
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

type Stream = BufReader<Box<dyn ClientStream>>;

/// Parameters for handling a connection
pub struct ConnectionParams {
    pub peer_addr: SocketAddr,
    pub login: Arc<LoginServices>,
    pub sessions: Arc<SessionServer>,
    /// Present when the server offers STARTTLS
    pub tls_acceptor: Option<TlsAcceptor>,
    pub debug: bool,
}

/// Handle a client connection from greeting to disconnect
pub async fn handle_connection<S>(socket: S, params: ConnectionParams) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ConnectionParams {
        peer_addr,
        login,
        sessions,
        tls_acceptor,
        debug,
    } = params;

    let boxed: Box<dyn ClientStream> = Box::new(socket);
    let mut stream: Stream = BufReader::new(boxed);
    let mut login_session = LoginSession::new(Arc::clone(&login), Some(peer_addr.ip()));

    write_message(&mut stream, &login_session.greeting()).await?;

    let (mut stream, logged_in) = run_login(
        stream,
        &mut login_session,
        &sessions,
        tls_acceptor.as_ref(),
        peer_addr,
        debug,
    )
    .await?;
    let Some(logged_in) = logged_in else {
        let _ = stream.get_mut().shutdown().await;
        return Ok(());
    };

    let session = Arc::clone(&logged_in.session);
    let user_id = logged_in.user_id;
    info!(
        peer = %peer_addr,
        session = %session.id(),
        user = %logged_in.identity.username,
        user_id,
        "logged in"
    );
    // The user count shown to clients still picking a session changed
    sessions.announce(&session).await;

    let result = run_session(stream, &logged_in, &login, &sessions, peer_addr).await;

    if let Err(e) = sessions.leave(&session, user_id).await {
        warn!(session = %session.id(), user_id, "error while leaving session: {e}");
    }
    if debug {
        debug!(peer = %peer_addr, session = %session.id(), user_id, "disconnected");
    }
    result
}

/// Wait until the client has sent at least one byte, or hung up
///
/// Only waits on the read buffer, so it can be raced against other events
/// without losing a partly read line.
async fn wait_readable<R>(reader: &mut R, deadline: Instant) -> Result<bool, LineError>
where
    R: AsyncBufRead + Unpin,
{
    timeout_at(deadline, reader.fill_buf())
        .await
        .map_err(|_| LineError::IdleTimeout)?
        .map(|buf| !buf.is_empty())
        .map_err(LineError::from)
}

/// Read the message whose first bytes have already arrived
async fn read_ready_message<R>(reader: &mut R) -> Result<Option<ClientMessage>, LineError>
where
    R: AsyncBufRead + Unpin,
{
    timeout(DEFAULT_LINE_TIMEOUT, read_message(reader))
        .await
        .map_err(|_| LineError::LineTimeout)?
}

async fn send_all<W>(writer: &mut W, messages: &[ServerMessage]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for message in messages {
        write_message(writer, message).await?;
    }
    Ok(())
}

/// Drive the login handshake until the client is in a session
///
/// Hands back the stream (upgraded, if STARTTLS was used) and `None` when
/// the connection should be closed.
async fn run_login(
    mut stream: Stream,
    login: &mut LoginSession,
    sessions: &SessionServer,
    tls_acceptor: Option<&TlsAcceptor>,
    peer_addr: SocketAddr,
    debug: bool,
) -> io::Result<(Stream, Option<LoggedIn>)> {
    let mut events = sessions.subscribe();

    loop {
        // The idle timer restarts for every message
        let deadline = Instant::now() + DEFAULT_IDLE_TIMEOUT;
        let readable = loop {
            tokio::select! {
                ready = wait_readable(&mut stream, deadline) => break ready,
                event = events.recv() => {
                    let update = match event {
                        Ok(SessionListEvent::Updated(description)) => {
                            login.announce_session(&description)
                        }
                        Ok(SessionListEvent::Removed(id)) => login.announce_session_end(&id),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(peer = %peer_addr, skipped, "session list updates dropped");
                            None
                        }
                        Err(RecvError::Closed) => return Ok((stream, None)),
                    };
                    if let Some(update) = update {
                        write_message(&mut stream, &update).await?;
                    }
                }
            }
        };

        let response = match readable {
            Ok(false) => return Ok((stream, None)),
            Ok(true) => match read_ready_message(&mut stream).await {
                Ok(Some(message)) => login.handle_message(message).await,
                Ok(None) => return Ok((stream, None)),
                Err(LineError::InvalidJson(reason)) => login.invalid_message(&reason),
                Err(e) => {
                    login_read_failed(e, peer_addr, debug)?;
                    return Ok((stream, None));
                }
            },
            Err(e) => {
                login_read_failed(e, peer_addr, debug)?;
                return Ok((stream, None));
            }
        };

        send_all(&mut stream, &response.replies).await?;

        match response.step {
            LoginStep::Continue => {}
            LoginStep::Disconnect => return Ok((stream, None)),
            LoginStep::Complete(logged_in) => return Ok((stream, Some(logged_in))),
            LoginStep::StartTls => {
                let Some(acceptor) = tls_acceptor else {
                    return Ok((stream, None));
                };
                // Anything buffered now was sent in the clear after STARTTLS
                if !stream.buffer().is_empty() {
                    warn!(peer = %peer_addr, "data received before TLS handshake");
                    return Ok((stream, None));
                }
                let tls = acceptor
                    .accept(stream.into_inner())
                    .await
                    .map_err(|e| io::Error::other(format!("TLS handshake failed: {e}")))?;
                let upgraded: Box<dyn ClientStream> = Box::new(tls);
                stream = BufReader::new(upgraded);
                login.tls_established();
            }
        }
    }
}

/// Log a failed pre-login read; only unexpected I/O errors propagate
fn login_read_failed(error: LineError, peer_addr: SocketAddr, debug: bool) -> io::Result<()> {
    // Idle and truncated connections are common (scanners, dropped links)
    let common = matches!(error, LineError::IdleTimeout | LineError::LineTimeout);
    if !common || debug {
        debug!(peer = %peer_addr, "login read failed: {error}");
    }
    match error {
        LineError::Io(e) if e.kind() != io::ErrorKind::UnexpectedEof => Err(e),
        _ => Ok(()),
    }
}

/// A stream reset this client is uploading
struct PendingReset {
    catchup_key: i32,
    /// Largest acceptable image, 0 for unlimited
    max_size: u64,
    size: u64,
    messages: Vec<HistoryMessage>,
}

/// A logged-in client and how far it has been brought up to date
struct SessionClient<'a, W> {
    writer: W,
    logged_in: &'a LoggedIn,
    services: &'a LoginServices,
    sessions: &'a SessionServer,
    peer_addr: SocketAddr,
    operator: bool,
    /// Highest history index sent, -1 if none yet
    delivered: i64,
    reset: Option<PendingReset>,
}

fn error_reply(code: &str, message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        code: code.to_string(),
        message: message.into(),
    }
}

/// Hex-decode an uploaded record, refusing anything that looks like a server notice
fn decode_record(data: &str) -> Option<HistoryMessage> {
    let bytes = hex::decode(data).ok()?;
    if HistoryNotice::is_reserved(&bytes) {
        return None;
    }
    Some(HistoryMessage::from(bytes))
}

fn operator_only(message: &ClientMessage) -> bool {
    matches!(
        message,
        ClientMessage::ResetStart
            | ClientMessage::ResetData { .. }
            | ClientMessage::ResetFinish { .. }
            | ClientMessage::SetClosed { .. }
            | ClientMessage::CreateInvite { .. }
            | ClientMessage::Kick { .. }
            | ClientMessage::Unban { .. }
    )
}

/// Founders, moderators and authenticated session operators run operator commands
async fn is_operator(logged_in: &LoggedIn) -> bool {
    let identity = &logged_in.identity;
    if logged_in.founder || identity.has_flag(FLAG_MOD) {
        return true;
    }
    let registered = (!identity.guest).then(|| identity.username.clone());
    let auth_id = identity.ext_auth_id.clone();
    logged_in
        .session
        .history()
        .read(move |h| {
            registered.is_some_and(|name| h.metadata().founder == name)
                || auth_id.is_some_and(|id| h.is_authenticated_operator(&id))
        })
        .await
        .unwrap_or(false)
}

/// Serve a logged-in client until it disconnects
async fn run_session(
    stream: Stream,
    logged_in: &LoggedIn,
    services: &LoginServices,
    sessions: &SessionServer,
    peer_addr: SocketAddr,
) -> io::Result<()> {
    let session = &logged_in.session;

    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut updates = session.history().subscribe();
    let mut events = session.subscribe_events();

    let mut client = SessionClient {
        writer,
        logged_in,
        services,
        sessions,
        peer_addr,
        operator: is_operator(logged_in).await,
        delivered: -1,
        reset: None,
    };
    let result = client.serve(&mut reader, &mut updates, &mut events).await;
    client.close().await;
    result
}

impl<W> SessionClient<'_, W>
where
    W: AsyncWrite + Unpin,
{
    async fn serve<R>(
        &mut self,
        reader: &mut R,
        updates: &mut watch::Receiver<i64>,
        events: &mut broadcast::Receiver<SessionEvent>,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        // Catch up on existing history before waiting for anything
        self.history_changed().await?;

        loop {
            tokio::select! {
                ready = async { reader.fill_buf().await.map(|buf| !buf.is_empty()) } => {
                    if !ready? {
                        return Ok(());
                    }
                    let message = match read_ready_message(reader).await {
                        Ok(Some(message)) => message,
                        Ok(None) => return Ok(()),
                        Err(e) => {
                            self.log(LogLevel::Warn, LogTopic::BadData, e.to_string());
                            let _ = self.send(&error_reply("badData", "Invalid message")).await;
                            return Ok(());
                        }
                    };
                    if !self.handle(message).await? {
                        return Ok(());
                    }
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    self.history_changed().await?;
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::Kicked { user_id, by, banned })
                        if user_id == self.logged_in.user_id =>
                    {
                        self.send(&ServerMessage::Kicked { by, banned }).await?;
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(peer = %self.peer_addr, skipped, "session events dropped");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Release what the connection still holds and hang up
    async fn close(mut self) {
        self.abandon_reset().await;
        let _ = self.writer.shutdown().await;
    }

    async fn send(&mut self, message: &ServerMessage) -> io::Result<()> {
        write_message(&mut self.writer, message).await
    }

    fn log(&self, level: LogLevel, topic: LogTopic, message: impl Into<String>) {
        emit(
            self.services.log.as_ref(),
            LogEntry::new(level, topic, message)
                .user(self.logged_in.identity.username.as_str())
                .session(self.logged_in.session.id()),
        );
    }

    /// Report a history failure; the connection closes afterwards
    async fn history_failed(&mut self, what: &str, error: HistoryError) -> io::Result<bool> {
        warn!(session = %self.logged_in.session.id(), "could not {what}: {error}");
        self.send(&error_reply(
            "internalError",
            "Session history could not be written",
        ))
        .await?;
        Ok(false)
    }

    async fn history_changed(&mut self) -> io::Result<()> {
        self.send_new_history().await?;
        if self.operator {
            self.request_autoreset().await?;
        }
        Ok(())
    }

    /// Send everything after the last delivered index
    async fn send_new_history(&mut self) -> io::Result<()> {
        let session = &self.logged_in.session;
        let (batch, last_index) = session
            .history()
            .get_batch(self.delivered)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut first_index = last_index - batch.len() as i64 + 1;
        for chunk in batch.chunks(MESSAGES_PER_BATCH) {
            let reply = ServerMessage::Messages {
                first_index,
                data: chunk.iter().map(|m| hex::encode(m.as_bytes())).collect(),
            };
            write_message(&mut self.writer, &reply).await?;
            first_index += chunk.len() as i64;
        }

        self.delivered = last_index;
        if let Err(e) = session.mark_delivered(self.logged_in.user_id, last_index).await {
            warn!(session = %session.id(), "could not release delivered history: {e}");
        }
        Ok(())
    }

    /// Ask this operator to reset the history once it outgrows the threshold
    async fn request_autoreset(&mut self) -> io::Result<()> {
        let session = &self.logged_in.session;
        if self.reset.is_some() {
            return Ok(());
        }
        let (size, threshold, max_size) = session
            .history()
            .read(|h| {
                (
                    h.size_in_bytes(),
                    h.effective_auto_reset_threshold(),
                    h.size_limit(),
                )
            })
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        if threshold == 0 || size < threshold || !session.claim_autoreset(self.logged_in.user_id) {
            return Ok(());
        }
        self.log(
            LogLevel::Info,
            LogTopic::Status,
            format!("history is {size} bytes, requesting a reset"),
        );
        self.send(&ServerMessage::AutoresetRequest { max_size }).await
    }

    /// Handle one message, returning `false` when the connection should close
    async fn handle(&mut self, message: ClientMessage) -> io::Result<bool> {
        if operator_only(&message) && !self.operator {
            let reply = error_reply(
                "notOperator",
                format!("{} is for session operators only", message.kind()),
            );
            self.send(&reply).await?;
            return Ok(true);
        }

        match message {
            ClientMessage::Message { data } => self.upload(&data).await,
            ClientMessage::ResetStart => self.reset_start().await,
            ClientMessage::ResetData { catchup_key, data } => {
                self.reset_data(catchup_key, &data).await
            }
            ClientMessage::ResetFinish { catchup_key } => self.reset_finish(catchup_key).await,
            ClientMessage::SetClosed { closed } => self.set_closed(closed).await,
            ClientMessage::CreateInvite { max_uses } => self.create_invite(max_uses).await,
            ClientMessage::Kick { user_id, ban } => self.kick(user_id, ban).await,
            ClientMessage::Unban { id } => self.unban(id).await,
            other => {
                warn!(
                    peer = %self.peer_addr,
                    session = %self.logged_in.session.id(),
                    "unexpected {} after login",
                    other.kind()
                );
                let reply = error_reply(
                    "protocolViolation",
                    format!("{} is not allowed here", other.kind()),
                );
                self.send(&reply).await?;
                Ok(false)
            }
        }
    }

    async fn upload(&mut self, data: &str) -> io::Result<bool> {
        let Some(message) = decode_record(data) else {
            self.send(&error_reply("badData", "Message data is not a valid canvas message"))
                .await?;
            return Ok(false);
        };

        match self.logged_in.session.history().add_message(message).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.send(&error_reply("historyFull", "Session history is full"))
                    .await?;
                Ok(true)
            }
            Err(e) => self.history_failed("append message", e).await,
        }
    }

    async fn reset_start(&mut self) -> io::Result<bool> {
        if self.reset.is_some() {
            self.send(&error_reply("resetInProgress", "A reset is already in progress"))
                .await?;
            return Ok(true);
        }

        let allocated = self
            .logged_in
            .session
            .history()
            .write(|h| {
                h.next_catchup_key()
                    .map(|key| key.map(|key| (key, h.size_limit())))
            })
            .await;
        match allocated {
            Ok(Ok(Some((catchup_key, max_size)))) => {
                self.reset = Some(PendingReset {
                    catchup_key,
                    max_size,
                    size: 0,
                    messages: Vec::new(),
                });
                self.send(&ServerMessage::ResetStarted { catchup_key }).await?;
                Ok(true)
            }
            Ok(Ok(None)) => {
                self.send(&error_reply("resetUnavailable", "Too many resets in progress"))
                    .await?;
                Ok(true)
            }
            Ok(Err(e)) | Err(e) => self.history_failed("allocate a catch-up key", e).await,
        }
    }

    async fn reset_data(&mut self, catchup_key: i32, data: &[String]) -> io::Result<bool> {
        if self.reset.as_ref().is_none_or(|r| r.catchup_key != catchup_key) {
            self.send(&error_reply("badCatchupKey", "No reset with this catch-up key"))
                .await?;
            return Ok(true);
        }
        let Some(messages) = data
            .iter()
            .map(String::as_str)
            .map(decode_record)
            .collect::<Option<Vec<_>>>()
        else {
            self.send(&error_reply("badData", "Reset data is not a valid canvas message"))
                .await?;
            return Ok(false);
        };

        let too_large = match &mut self.reset {
            Some(reset) => {
                reset.size += messages.iter().map(|m| m.len() as u64).sum::<u64>();
                reset.messages.extend(messages);
                reset.max_size > 0 && reset.size > reset.max_size
            }
            None => false,
        };
        if too_large {
            self.abandon_reset().await;
            self.send(&error_reply("resetTooLarge", "Reset image exceeds the size limit"))
                .await?;
        }
        Ok(true)
    }

    async fn reset_finish(&mut self, catchup_key: i32) -> io::Result<bool> {
        let Some(reset) = self.reset.take_if(|r| r.catchup_key == catchup_key) else {
            self.send(&error_reply("badCatchupKey", "No reset with this catch-up key"))
                .await?;
            return Ok(true);
        };

        let count = reset.messages.len();
        let session = &self.logged_in.session;
        let replaced = session
            .history()
            .write(move |h| {
                let replaced = h.reset(reset.messages);
                h.release_catchup_key(catchup_key);
                replaced.map(|done| done.then(|| h.first_index()))
            })
            .await;
        match replaced {
            Ok(Ok(Some(first_index))) => {
                session.autoreset_done();
                self.log(
                    LogLevel::Info,
                    LogTopic::Status,
                    format!("history reset to {count} messages"),
                );
                self.send(&ServerMessage::ResetDone {
                    catchup_key,
                    first_index,
                })
                .await?;
                Ok(true)
            }
            Ok(Ok(None)) => {
                self.send(&error_reply("resetTooLarge", "Reset image exceeds the size limit"))
                    .await?;
                Ok(true)
            }
            Ok(Err(e)) | Err(e) => self.history_failed("reset history", e).await,
        }
    }

    /// Drop a reset in progress and give its catch-up key back
    async fn abandon_reset(&mut self) {
        let Some(reset) = self.reset.take() else {
            return;
        };
        let key = reset.catchup_key;
        let history = self.logged_in.session.history();
        if let Err(e) = history.write(move |h| h.release_catchup_key(key)).await {
            warn!(session = %history.id(), "could not release catch-up key {key}: {e}");
        }
    }

    async fn set_closed(&mut self, closed: bool) -> io::Result<bool> {
        let session = &self.logged_in.session;
        session.set_closed(closed);
        self.sessions.announce(session).await;
        self.log(
            LogLevel::Info,
            LogTopic::Status,
            if closed { "session closed" } else { "session opened" },
        );
        match session.description().await {
            Ok(description) => {
                self.send(&ServerMessage::SessionInfo {
                    session: description,
                })
                .await?;
                Ok(true)
            }
            Err(e) => self.history_failed("describe session", e).await,
        }
    }

    async fn create_invite(&mut self, max_uses: u32) -> io::Result<bool> {
        let secret = self
            .logged_in
            .session
            .create_invite(&self.logged_in.identity.username, max_uses);
        self.send(&ServerMessage::InviteCreated { secret, max_uses })
            .await?;
        Ok(true)
    }

    async fn kick(&mut self, user_id: u8, ban: bool) -> io::Result<bool> {
        let session = &self.logged_in.session;
        let by = self.logged_in.identity.username.clone();
        if user_id == self.logged_in.user_id {
            self.send(&error_reply("badTarget", "You cannot kick yourself"))
                .await?;
            return Ok(true);
        }
        let Some(target) = session.participant(user_id) else {
            self.send(&error_reply("noSuchUser", format!("No user #{user_id} in this session")))
                .await?;
            return Ok(true);
        };

        if ban {
            let ban_target = BanTarget {
                username: target.name.clone(),
                ip: target.ip,
                ext_auth_id: target.auth_id.clone(),
                sid: None,
            };
            let banned_by = by.clone();
            let bans = session
                .history()
                .write(move |h| {
                    h.add_ban(ban_target, &banned_by)
                        .map(|_| h.ban_list().export())
                })
                .await;
            match bans {
                Ok(Ok(bans)) => {
                    self.log(
                        LogLevel::Info,
                        LogTopic::Ban,
                        format!("banned {} (#{user_id})", target.name),
                    );
                    self.send(&ServerMessage::BanList { bans }).await?;
                }
                Ok(Err(e)) | Err(e) => return self.history_failed("add ban", e).await,
            }
        }

        if session.kick(user_id, &by, ban) {
            self.log(
                LogLevel::Info,
                LogTopic::Kick,
                format!("kicked {} (#{user_id})", target.name),
            );
        }
        Ok(true)
    }

    async fn unban(&mut self, id: u32) -> io::Result<bool> {
        let removed = self
            .logged_in
            .session
            .history()
            .write(move |h| {
                h.remove_ban(id)
                    .map(|name| name.map(|name| (name, h.ban_list().export())))
            })
            .await;
        match removed {
            Ok(Ok(Some((name, bans)))) => {
                self.log(LogLevel::Info, LogTopic::Unban, format!("unbanned {name}"));
                self.send(&ServerMessage::BanList { bans }).await?;
                Ok(true)
            }
            Ok(Ok(None)) => {
                self.send(&error_reply("noSuchBan", format!("No ban #{id}")))
                    .await?;
                Ok(true)
            }
            Ok(Err(e)) | Err(e) => self.history_failed("remove ban", e).await,
        }
    }
}
