//! The session directory: creates, finds, lists and ends sessions

use std::fs;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use easel_common::protocol::SessionDescription;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::history::{
    HistoryError, HistoryStorage, JOURNAL_EXTENSION, SessionFlags, SessionHistory, SessionMetadata,
};
use crate::login::{CreateSessionError, NewSession, SessionsDirectory};
use crate::server_log::{LogEntry, LogLevel, LogTopic, ServerLog, emit};
use crate::session::Session;

/// Capacity of the session list event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Limits applied to every session
#[derive(Debug, Clone, Default)]
pub struct SessionLimits {
    /// Maximum number of live sessions, 0 for unlimited
    pub max_sessions: usize,
    /// History size limit in bytes, 0 for unlimited
    pub size_limit: u64,
    /// Default auto-reset threshold for new sessions, 0 to disable
    pub auto_reset_threshold: u64,
}

/// A change to the session list
#[derive(Debug, Clone, PartialEq)]
pub enum SessionListEvent {
    /// A session appeared or its description changed
    Updated(SessionDescription),
    Removed(String),
}

pub struct SessionServer {
    storage: HistoryStorage,
    limits: SessionLimits,
    sessions: RwLock<Vec<Arc<Session>>>,
    events: broadcast::Sender<SessionListEvent>,
    log: Arc<dyn ServerLog>,
}

impl SessionServer {
    pub fn new(storage: HistoryStorage, limits: SessionLimits, log: Arc<dyn ServerLog>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            limits,
            sessions: RwLock::new(Vec::new()),
            events,
            log,
        }
    }

    /// Load every persisted session found in the sessions directory
    ///
    /// Sessions that fail to load are logged and skipped. Returns how many
    /// were loaded.
    pub fn load_persisted(&self) -> io::Result<usize> {
        let HistoryStorage::Journaled { dir, archive } = &self.storage else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }
            match SessionHistory::load(&path, *archive) {
                Ok(mut history) => {
                    history.set_size_limit(self.limits.size_limit);
                    let session = Arc::new(Session::new(history));
                    info!(session = %session.id(), "loaded persisted session");
                    self.write_sessions().push(session);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(journal = %path.display(), "could not load session: {e}");
                }
            }
        }
        Ok(loaded)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionListEvent> {
        self.events.subscribe()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.read_sessions().clone()
    }

    pub fn session_count(&self) -> usize {
        self.read_sessions().len()
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_name_taken(sessions: &[Arc<Session>], id: &str, alias: Option<&str>) -> bool {
        sessions
            .iter()
            .any(|s| s.matches(id) || alias.is_some_and(|a| s.matches(a)))
    }

    pub async fn create(&self, request: NewSession) -> Result<Arc<Session>, CreateSessionError> {
        if !request.protocol.is_hostable() {
            return Err(CreateSessionError::BadProtocol);
        }
        let id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        {
            let sessions = self.read_sessions();
            if self.limits.max_sessions > 0 && sessions.len() >= self.limits.max_sessions {
                return Err(CreateSessionError::Closed);
            }
            if Self::is_name_taken(&sessions, &id, request.alias.as_deref()) {
                return Err(CreateSessionError::IdInUse);
            }
        }

        let mut meta = SessionMetadata::new(
            id.clone(),
            request.alias.clone(),
            request.protocol,
            request.founder.clone(),
        );
        meta.title = request.title;
        meta.password_hash = request.password_hash;

        let storage = self.storage.clone();
        let limits = self.limits.clone();
        let history = tokio::task::spawn_blocking(move || {
            let mut history = SessionHistory::create(&storage, meta)?;
            history.set_size_limit(limits.size_limit);
            history.set_auto_reset_threshold(limits.auto_reset_threshold)?;
            Ok::<_, HistoryError>(history)
        })
        .await
        .map_err(|e| CreateSessionError::Storage(e.to_string()))?
        .map_err(|e| match e {
            HistoryError::Io(io) if io.kind() == io::ErrorKind::AlreadyExists => {
                CreateSessionError::IdInUse
            }
            other => CreateSessionError::Storage(other.to_string()),
        })?;

        let session = Arc::new(Session::new(history));
        let inserted = {
            let mut sessions = self.write_sessions();
            // Other hosts may have been created while the history was set up
            if self.limits.max_sessions > 0 && sessions.len() >= self.limits.max_sessions {
                Err(CreateSessionError::Closed)
            } else if Self::is_name_taken(&sessions, &id, request.alias.as_deref()) {
                Err(CreateSessionError::IdInUse)
            } else {
                sessions.push(session.clone());
                Ok(())
            }
        };
        if let Err(e) = inserted {
            if let Err(terminate_err) = session.history().terminate().await {
                warn!(session = %id, "could not discard unused session history: {terminate_err}");
            }
            return Err(e);
        }

        emit(
            self.log.as_ref(),
            LogEntry::new(LogLevel::Info, LogTopic::Status, "session created")
                .user(request.founder)
                .session(id),
        );
        self.announce(&session).await;
        Ok(session)
    }

    /// End a session and delete (or archive) its storage
    pub async fn terminate(&self, id: &str) -> Result<bool, HistoryError> {
        let removed = {
            let mut sessions = self.write_sessions();
            let position = sessions.iter().position(|s| s.id() == id);
            position.map(|i| sessions.remove(i))
        };
        let Some(session) = removed else {
            return Ok(false);
        };

        let _ = self.events.send(SessionListEvent::Removed(id.to_string()));
        emit(
            self.log.as_ref(),
            LogEntry::new(LogLevel::Info, LogTopic::Status, "session terminated").session(id),
        );
        session.history().terminate().await?;
        Ok(true)
    }

    /// A user left; non-persistent sessions end when the last one goes
    pub async fn leave(&self, session: &Arc<Session>, user_id: u8) -> Result<(), HistoryError> {
        let remaining = session.leave(user_id).await;
        emit(
            self.log.as_ref(),
            LogEntry::new(LogLevel::Info, LogTopic::Leave, format!("user #{user_id} left"))
                .session(session.id()),
        );
        if remaining > 0 {
            self.announce(session).await;
            return Ok(());
        }

        let persistent = session
            .history()
            .read(|h| h.metadata().flags.contains(SessionFlags::PERSISTENT))
            .await?;
        if persistent {
            self.announce(session).await;
            Ok(())
        } else {
            self.terminate(session.id()).await.map(|_| ())
        }
    }

    /// Tell pre-login connections about a new or changed session
    pub async fn announce(&self, session: &Session) {
        match session.description().await {
            Ok(description) => {
                let _ = self.events.send(SessionListEvent::Updated(description));
            }
            Err(e) => warn!(session = %session.id(), "could not describe session: {e}"),
        }
    }

    /// Seal the open recording block of every session
    pub async fn close_blocks(&self) {
        for session in self.sessions() {
            if let Err(e) = session.history().close_block().await {
                warn!(session = %session.id(), "could not seal recording block: {e}");
            }
        }
    }

    /// Periodically seal idle recording blocks
    pub fn spawn_block_sealer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                debug!("sealing recording blocks");
                server.close_blocks().await;
            }
        })
    }

    pub async fn descriptions(&self) -> Vec<SessionDescription> {
        let mut list = Vec::new();
        for session in self.sessions() {
            match session.description().await {
                Ok(description) => list.push(description),
                Err(e) => warn!(session = %session.id(), "could not describe session: {e}"),
            }
        }
        list
    }
}

impl SessionsDirectory for SessionServer {
    fn find_session(&self, id_or_alias: &str) -> Option<Arc<Session>> {
        self.read_sessions()
            .iter()
            .find(|s| s.matches(id_or_alias))
            .cloned()
    }

    fn create_session(
        &self,
        request: NewSession,
    ) -> BoxFuture<'_, Result<Arc<Session>, CreateSessionError>> {
        Box::pin(self.create(request))
    }

    fn session_list(&self) -> BoxFuture<'_, Vec<SessionDescription>> {
        Box::pin(self.descriptions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryMessage;
    use crate::server_log::MemoryLog;
    use crate::session::JoiningUser;
    use easel_common::ProtocolVersion;
    use tempfile::TempDir;

    fn request(id: Option<&str>, alias: Option<&str>) -> NewSession {
        NewSession {
            id: id.map(str::to_string),
            alias: alias.map(str::to_string),
            protocol: ProtocolVersion::current(),
            founder: "alice".to_string(),
            title: "Test".to_string(),
            password_hash: None,
        }
    }

    fn memory_server(limits: SessionLimits) -> SessionServer {
        SessionServer::new(HistoryStorage::Memory, limits, Arc::new(MemoryLog::new()))
    }

    fn joining(name: &str) -> JoiningUser {
        JoiningUser {
            name: name.to_string(),
            auth_id: None,
            ip: None,
        }
    }

    #[tokio::test]
    async fn test_create_generates_uuid() {
        let server = memory_server(SessionLimits::default());
        let session = server.create(request(None, None)).await.unwrap();
        assert!(Uuid::parse_str(session.id()).is_ok());
        assert!(server.find_session(session.id()).is_some());
    }

    #[tokio::test]
    async fn test_id_and_alias_in_use() {
        let server = memory_server(SessionLimits::default());
        server
            .create(request(Some("one"), Some("first")))
            .await
            .unwrap();

        let err = server.create(request(Some("one"), None)).await.unwrap_err();
        assert_eq!(err, CreateSessionError::IdInUse);
        let err = server
            .create(request(Some("two"), Some("first")))
            .await
            .unwrap_err();
        assert_eq!(err, CreateSessionError::IdInUse);
        assert!(server.find_session("first").is_some());
    }

    #[tokio::test]
    async fn test_bad_protocol() {
        let server = memory_server(SessionLimits::default());
        let mut req = request(None, None);
        req.protocol = ProtocolVersion::new("other", 1, 1, 0);
        assert_eq!(
            server.create(req).await.unwrap_err(),
            CreateSessionError::BadProtocol
        );
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let server = memory_server(SessionLimits {
            max_sessions: 1,
            ..Default::default()
        });
        server.create(request(None, None)).await.unwrap();
        assert_eq!(
            server.create(request(None, None)).await.unwrap_err(),
            CreateSessionError::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_sessions_holds_under_concurrent_hosts() {
        for _ in 0..20 {
            let server = Arc::new(memory_server(SessionLimits {
                max_sessions: 1,
                ..Default::default()
            }));
            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let server = Arc::clone(&server);
                    tokio::spawn(async move { server.create(request(None, None)).await })
                })
                .collect();

            let mut created = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(_) => created += 1,
                    Err(e) => assert_eq!(e, CreateSessionError::Closed),
                }
            }
            assert_eq!(created, 1);
            assert_eq!(server.session_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_losing_host_discards_its_journal() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(SessionServer::new(
            HistoryStorage::Journaled {
                dir: dir.path().to_path_buf(),
                archive: false,
            },
            SessionLimits {
                max_sessions: 1,
                ..Default::default()
            },
            Arc::new(MemoryLog::new()),
        ));
        let tasks: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|id| {
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.create(request(Some(id), None)).await })
            })
            .collect();
        for task in tasks {
            let _ = task.await.unwrap();
        }

        assert_eq!(server.session_count(), 1);
        let journals = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(JOURNAL_EXTENSION))
            .count();
        assert_eq!(journals, 1);
    }

    #[tokio::test]
    async fn test_create_broadcasts_and_applies_limits() {
        let server = memory_server(SessionLimits {
            size_limit: 1000,
            ..Default::default()
        });
        let mut events = server.subscribe();
        let session = server.create(request(Some("s"), None)).await.unwrap();

        match events.recv().await.unwrap() {
            SessionListEvent::Updated(desc) => assert_eq!(desc.id, "s"),
            other => panic!("unexpected event {other:?}"),
        }
        let limit = session.history().read(|h| h.size_limit()).await.unwrap();
        assert_eq!(limit, 1000);
    }

    #[tokio::test]
    async fn test_last_leave_terminates_non_persistent_session() {
        let server = memory_server(SessionLimits::default());
        let session = server.create(request(Some("s"), None)).await.unwrap();
        let id = session.join(joining("alice"), None).await.unwrap();
        let mut events = server.subscribe();

        server.leave(&session, id).await.unwrap();
        assert!(server.find_session("s").is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionListEvent::Removed("s".to_string())
        );
    }

    #[tokio::test]
    async fn test_persistent_session_survives_last_leave() {
        let server = memory_server(SessionLimits::default());
        let session = server.create(request(Some("s"), None)).await.unwrap();
        session
            .history()
            .write(|h| h.set_flag(SessionFlags::PERSISTENT, true))
            .await
            .unwrap()
            .unwrap();
        let id = session.join(joining("alice"), None).await.unwrap();

        server.leave(&session, id).await.unwrap();
        assert!(server.find_session("s").is_some());
    }

    #[tokio::test]
    async fn test_load_persisted_sessions() {
        let dir = TempDir::new().unwrap();
        let storage = HistoryStorage::Journaled {
            dir: dir.path().to_path_buf(),
            archive: false,
        };

        let server = SessionServer::new(
            storage.clone(),
            SessionLimits::default(),
            Arc::new(MemoryLog::new()),
        );
        let session = server
            .create(request(Some("kept"), Some("alias")))
            .await
            .unwrap();
        session
            .history()
            .add_message(HistoryMessage::from(&b"stroke"[..]))
            .await
            .unwrap();
        drop(session);
        drop(server);

        let server = SessionServer::new(storage, SessionLimits::default(), Arc::new(MemoryLog::new()));
        assert_eq!(server.load_persisted().unwrap(), 1);
        let session = server.find_session("alias").unwrap();
        assert_eq!(session.id(), "kept");
        let (batch, last) = session.history().get_batch(-1).await.unwrap();
        assert_eq!(last, 0);
        assert_eq!(batch[0].as_bytes(), b"stroke");

        let list = server.descriptions().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "Test");
    }

    #[tokio::test]
    async fn test_load_persisted_skips_broken_journal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("junk.session"), b"not json\n").unwrap();
        let server = SessionServer::new(
            HistoryStorage::Journaled {
                dir: dir.path().to_path_buf(),
                archive: false,
            },
            SessionLimits::default(),
            Arc::new(MemoryLog::new()),
        );
        assert_eq!(server.load_persisted().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminate_unknown_session() {
        let server = memory_server(SessionLimits::default());
        assert!(!server.terminate("nope").await.unwrap());
    }
}
