//! Session history engine
//!
//! Every session keeps an ordered, append-only log of canvas messages under
//! a byte budget. `SessionHistory` holds the logic shared by all storage
//! backends (size accounting, indices, metadata, bans, catch-up keys) and
//! delegates storage to a [`Backend`]: either [`MemoryHistory`] for
//! ephemeral sessions or [`JournaledHistory`] for sessions that survive a
//! restart.
//!
//! Indices are monotonic over the whole life of a session. A reset replaces
//! the content but keeps counting, so a client holding an old index can
//! tell that the history it knew is gone.

mod ban_list;
mod catchup;
mod event;
mod flags;
mod handle;
mod id_queue;
mod journaled;
mod memory;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use easel_common::{MAX_SESSION_USERS, ProtocolVersion};
use serde_json::Value;
use thiserror::Error;

pub use ban_list::{BanEntry, BanImport, BanList, BanListError, BanTarget, normalize_ip};
pub use catchup::{CatchupKeyAllocator, INITIAL_CATCHUP_KEY, MAX_CATCHUP_KEY, MIN_CATCHUP_KEY};
pub use event::{HistoryEvent, JOURNAL_FORMAT_VERSION};
pub use flags::SessionFlags;
pub use handle::HistoryHandle;
pub use id_queue::{IdQueue, MAX_USER_ID, MIN_USER_ID};
pub use journaled::{
    ARCHIVED_SUFFIX, BLOCK_MAX_AGE, BLOCK_SIZE_LIMIT, JOURNAL_EXTENSION, JournaledHistory,
    journal_filename,
};
pub use memory::MemoryHistory;

/// Extra space beyond the size limit available to emergency messages
pub const EMERGENCY_SPACE: u64 = 1024 * 1024;

/// One opaque canvas message
///
/// Cloning is cheap; the bytes are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct HistoryMessage(Arc<[u8]>);

impl HistoryMessage {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for HistoryMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for HistoryMessage {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for HistoryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HistoryMessage({} bytes)", self.0.len())
    }
}

/// Errors from the history layer
///
/// Running out of space is not an error; mutations report it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A previous write failed; the session can no longer be persisted
    #[error("session history is broken")]
    Broken,
    #[error("corrupt recording: {0}")]
    Corrupt(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid journal: {0}")]
    InvalidJournal(String),
    #[error(transparent)]
    BanList(#[from] BanListError),
    /// The blocking task running a history operation died
    #[error("history task failed: {0}")]
    Task(String),
}

/// Storage operations every backend provides
///
/// Offsets are positions in the retained history, 0 being the message at
/// the session's first index.
pub trait HistoryBackend {
    fn append(&mut self, message: &HistoryMessage) -> Result<(), HistoryError>;

    /// Replace the whole retained history
    fn replace(&mut self, messages: &[HistoryMessage]) -> Result<(), HistoryError>;

    /// Messages from `offset` to the end
    fn batch(&self, offset: usize) -> Result<Vec<HistoryMessage>, HistoryError>;

    /// Release cached copies of the first `before_offset` messages
    fn cleanup(&mut self, before_offset: usize);

    /// Persist a metadata change
    fn record(&mut self, event: &HistoryEvent) -> Result<(), HistoryError>;

    fn terminate(&mut self) -> Result<(), HistoryError>;
}

/// Storage backend of one session, chosen when the session is created
#[derive(Debug)]
pub enum Backend {
    Memory(MemoryHistory),
    Journaled(JournaledHistory),
}

impl HistoryBackend for Backend {
    fn append(&mut self, message: &HistoryMessage) -> Result<(), HistoryError> {
        match self {
            Self::Memory(b) => b.append(message),
            Self::Journaled(b) => b.append(message),
        }
    }

    fn replace(&mut self, messages: &[HistoryMessage]) -> Result<(), HistoryError> {
        match self {
            Self::Memory(b) => b.replace(messages),
            Self::Journaled(b) => b.replace(messages),
        }
    }

    fn batch(&self, offset: usize) -> Result<Vec<HistoryMessage>, HistoryError> {
        match self {
            Self::Memory(b) => b.batch(offset),
            Self::Journaled(b) => b.batch(offset),
        }
    }

    fn cleanup(&mut self, before_offset: usize) {
        match self {
            Self::Memory(b) => b.cleanup(before_offset),
            Self::Journaled(b) => b.cleanup(before_offset),
        }
    }

    fn record(&mut self, event: &HistoryEvent) -> Result<(), HistoryError> {
        match self {
            Self::Memory(b) => b.record(event),
            Self::Journaled(b) => b.record(event),
        }
    }

    fn terminate(&mut self) -> Result<(), HistoryError> {
        match self {
            Self::Memory(b) => b.terminate(),
            Self::Journaled(b) => b.terminate(),
        }
    }
}

/// Where new session histories are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStorage {
    Memory,
    Journaled { dir: PathBuf, archive: bool },
}

/// Descriptive and policy metadata of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    pub id: String,
    pub alias: Option<String>,
    pub protocol: ProtocolVersion,
    pub founder: String,
    pub title: String,
    pub password_hash: Option<String>,
    pub op_password_hash: Option<String>,
    pub max_users: u8,
    pub auto_reset_threshold: u64,
    pub flags: SessionFlags,
    pub started_at: DateTime<Utc>,
}

impl SessionMetadata {
    pub fn new(
        id: impl Into<String>,
        alias: Option<String>,
        protocol: ProtocolVersion,
        founder: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            alias,
            protocol,
            founder: founder.into(),
            title: String::new(),
            password_hash: None,
            op_password_hash: None,
            max_users: MAX_SESSION_USERS,
            auto_reset_threshold: 0,
            flags: SessionFlags::empty(),
            started_at: Utc::now(),
        }
    }
}

/// Everything about a session that is rebuilt by replaying its events
#[derive(Debug, Clone)]
struct HistoryState {
    meta: SessionMetadata,
    announcements: Vec<String>,
    bans: BanList,
    id_queue: IdQueue,
    catchup: CatchupKeyAllocator,
    operators: HashSet<String>,
    trusted: HashSet<String>,
    auth_names: HashMap<String, String>,
}

impl HistoryState {
    fn new(meta: SessionMetadata) -> Self {
        Self {
            meta,
            announcements: Vec::new(),
            bans: BanList::new(),
            id_queue: IdQueue::new(),
            catchup: CatchupKeyAllocator::new(),
            operators: HashSet::new(),
            trusted: HashSet::new(),
            auth_names: HashMap::new(),
        }
    }

    fn apply(&mut self, event: HistoryEvent) {
        match event {
            HistoryEvent::Format { .. }
            | HistoryEvent::Created { .. }
            | HistoryEvent::Recording { .. } => {}
            HistoryEvent::Founder { name } => self.meta.founder = name,
            HistoryEvent::Title { title } => self.meta.title = title,
            HistoryEvent::Password { hash } => self.meta.password_hash = hash,
            HistoryEvent::OpPassword { hash } => self.meta.op_password_hash = hash,
            HistoryEvent::MaxUsers { count } => self.meta.max_users = count,
            HistoryEvent::AutoReset { threshold } => self.meta.auto_reset_threshold = threshold,
            HistoryEvent::Flags { flags } => self.meta.flags = flags,
            HistoryEvent::Ban { entry } => self.bans.insert(entry),
            HistoryEvent::Unban { id } => {
                self.bans.remove(id);
            }
            HistoryEvent::Announce { url } => {
                if !self.announcements.contains(&url) {
                    self.announcements.push(url);
                }
            }
            HistoryEvent::Unannounce { url } => self.announcements.retain(|u| *u != url),
            HistoryEvent::Operator { auth_id, on } => {
                if on {
                    self.operators.insert(auth_id);
                } else {
                    self.operators.remove(&auth_id);
                }
            }
            HistoryEvent::Trusted { auth_id, on } => {
                if on {
                    self.trusted.insert(auth_id);
                } else {
                    self.trusted.remove(&auth_id);
                }
            }
            HistoryEvent::AuthName { auth_id, username } => {
                self.auth_names.insert(auth_id, username);
            }
            HistoryEvent::User { id, name } => self.id_queue.set_id_for_name(id, &name),
            HistoryEvent::Catchup { next } => {
                self.catchup = CatchupKeyAllocator::starting_at(next);
            }
        }
    }
}

/// The history of one session
#[derive(Debug)]
pub struct SessionHistory {
    state: HistoryState,
    backend: Backend,
    size_in_bytes: u64,
    size_limit: u64,
    auto_reset_base: u64,
    first_index: i64,
    last_index: i64,
}

impl SessionHistory {
    /// Create a history for a new session
    pub fn create(storage: &HistoryStorage, meta: SessionMetadata) -> Result<Self, HistoryError> {
        let backend = match storage {
            HistoryStorage::Memory => Backend::Memory(MemoryHistory::new()),
            HistoryStorage::Journaled { dir, archive } => {
                Backend::Journaled(JournaledHistory::create(dir, &meta, *archive)?)
            }
        };
        Ok(Self::with_state(HistoryState::new(meta), backend, 0, 0))
    }

    /// Load a persisted session from its journal file
    pub fn load(journal_path: &Path, archive: bool) -> Result<Self, HistoryError> {
        let loaded = JournaledHistory::load(journal_path, archive)?;
        Ok(Self::with_state(
            loaded.state,
            Backend::Journaled(loaded.backend),
            loaded.message_count,
            loaded.size_in_bytes,
        ))
    }

    fn with_state(state: HistoryState, backend: Backend, count: usize, size: u64) -> Self {
        Self {
            state,
            backend,
            size_in_bytes: size,
            size_limit: 0,
            auto_reset_base: 0,
            first_index: 0,
            last_index: count as i64 - 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.state.meta.id
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.state.meta
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, Backend::Journaled(_))
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Set the history size limit (0 = unlimited)
    pub fn set_size_limit(&mut self, limit: u64) {
        self.size_limit = limit;
    }

    pub fn first_index(&self) -> i64 {
        self.first_index
    }

    pub fn last_index(&self) -> i64 {
        self.last_index
    }

    /// Size of the history right after the last reset
    pub fn auto_reset_base(&self) -> u64 {
        self.auto_reset_base
    }

    /// History size at which an automatic reset should be requested
    ///
    /// The threshold counts bytes added on top of the last reset image.
    /// Zero means automatic resets are disabled.
    pub fn effective_auto_reset_threshold(&self) -> u64 {
        match self.state.meta.auto_reset_threshold {
            0 => 0,
            t => t.saturating_add(self.auto_reset_base),
        }
    }

    /// Would `bytes` more fit, allowing `extra` bytes over the limit?
    pub fn has_space_for(&self, bytes: u64, extra: u64) -> bool {
        self.size_limit == 0 || self.size_in_bytes + bytes <= self.size_limit + extra
    }

    /// Append a message, returning `Ok(false)` if there is no room
    pub fn add_message(&mut self, message: HistoryMessage) -> Result<bool, HistoryError> {
        self.add_with_extra(message, 0)
    }

    /// Append a critical message that may use the emergency space
    pub fn add_emergency_message(&mut self, message: HistoryMessage) -> Result<bool, HistoryError> {
        self.add_with_extra(message, EMERGENCY_SPACE)
    }

    fn add_with_extra(&mut self, message: HistoryMessage, extra: u64) -> Result<bool, HistoryError> {
        let bytes = message.len() as u64;
        if !self.has_space_for(bytes, extra) {
            return Ok(false);
        }
        self.backend.append(&message)?;
        self.size_in_bytes += bytes;
        self.last_index += 1;
        Ok(true)
    }

    /// Replace the history with a new reset image
    ///
    /// Indices keep counting: the new content starts right after the old
    /// last index. Returns `Ok(false)` if the image exceeds the size limit.
    pub fn reset(&mut self, messages: Vec<HistoryMessage>) -> Result<bool, HistoryError> {
        let size: u64 = messages.iter().map(|m| m.len() as u64).sum();
        if self.size_limit > 0 && size > self.size_limit {
            return Ok(false);
        }
        self.backend.replace(&messages)?;
        self.size_in_bytes = size;
        self.auto_reset_base = size;
        self.first_index = self.last_index + 1;
        self.last_index += messages.len() as i64;
        Ok(true)
    }

    /// Messages after index `after`, with the current last index
    pub fn get_batch(&self, after: i64) -> Result<(Vec<HistoryMessage>, i64), HistoryError> {
        if after >= self.last_index {
            return Ok((Vec::new(), self.last_index));
        }
        let offset = (after - self.first_index + 1).max(0) as usize;
        Ok((self.backend.batch(offset)?, self.last_index))
    }

    /// Every reader has received all messages up to and including `before`
    pub fn cleanup_batches(&mut self, before: i64) {
        let delivered = before - self.first_index + 1;
        if delivered > 0 {
            self.backend.cleanup(delivered as usize);
        }
    }

    /// Seal the open recording block, if this history has one
    pub fn close_block(&mut self) -> Result<(), HistoryError> {
        match &mut self.backend {
            Backend::Journaled(b) => b.close_block(),
            Backend::Memory(_) => Ok(()),
        }
    }

    /// The session is over: delete or archive its storage
    pub fn terminate(&mut self) -> Result<(), HistoryError> {
        self.backend.terminate()
    }

    fn persist(&mut self, event: HistoryEvent) -> Result<(), HistoryError> {
        self.backend.record(&event)?;
        self.state.apply(event);
        Ok(())
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub fn set_founder(&mut self, name: &str) -> Result<(), HistoryError> {
        if self.state.meta.founder == name {
            return Ok(());
        }
        self.persist(HistoryEvent::Founder {
            name: name.to_string(),
        })
    }

    pub fn set_title(&mut self, title: &str) -> Result<(), HistoryError> {
        if self.state.meta.title == title {
            return Ok(());
        }
        self.persist(HistoryEvent::Title {
            title: title.to_string(),
        })
    }

    pub fn set_password_hash(&mut self, hash: Option<String>) -> Result<(), HistoryError> {
        if self.state.meta.password_hash == hash {
            return Ok(());
        }
        self.persist(HistoryEvent::Password { hash })
    }

    pub fn set_op_password_hash(&mut self, hash: Option<String>) -> Result<(), HistoryError> {
        if self.state.meta.op_password_hash == hash {
            return Ok(());
        }
        self.persist(HistoryEvent::OpPassword { hash })
    }

    /// Set the user limit, clamped to 1..=254
    pub fn set_max_users(&mut self, count: u32) -> Result<(), HistoryError> {
        let count = count.clamp(1, u32::from(MAX_SESSION_USERS)) as u8;
        if self.state.meta.max_users == count {
            return Ok(());
        }
        self.persist(HistoryEvent::MaxUsers { count })
    }

    /// Set the auto-reset threshold, at most 90% of the size limit
    pub fn set_auto_reset_threshold(&mut self, threshold: u64) -> Result<(), HistoryError> {
        let threshold = if self.size_limit > 0 {
            threshold.min(self.size_limit / 10 * 9)
        } else {
            threshold
        };
        if self.state.meta.auto_reset_threshold == threshold {
            return Ok(());
        }
        self.persist(HistoryEvent::AutoReset { threshold })
    }

    pub fn set_flags(&mut self, flags: SessionFlags) -> Result<(), HistoryError> {
        if self.state.meta.flags == flags {
            return Ok(());
        }
        self.persist(HistoryEvent::Flags { flags })
    }

    pub fn set_flag(&mut self, flag: SessionFlags, on: bool) -> Result<(), HistoryError> {
        let mut flags = self.state.meta.flags;
        flags.set(flag, on);
        self.set_flags(flags)
    }

    // ========================================================================
    // Bans
    // ========================================================================

    pub fn ban_list(&self) -> &BanList {
        &self.state.bans
    }

    /// Ban a user, returning `Ok(false)` if an identical ban exists
    pub fn add_ban(&mut self, target: BanTarget, banned_by: &str) -> Result<bool, HistoryError> {
        let Some(entry) = self.state.bans.prepare(target, banned_by, Utc::now()) else {
            return Ok(false);
        };
        self.persist(HistoryEvent::Ban { entry })?;
        Ok(true)
    }

    /// Merge externally supplied bans, skipping malformed and duplicate ones
    pub fn import_bans(&mut self, data: &Value) -> Result<BanImport, HistoryError> {
        let (total, targets) = BanList::parse_import(data)?;
        let mut imported = 0;
        for (target, banned_by) in targets {
            if self.add_ban(target, &banned_by)? {
                imported += 1;
            }
        }
        Ok(BanImport { total, imported })
    }

    /// Lift a ban, returning the name of the user who was banned
    pub fn remove_ban(&mut self, id: u32) -> Result<Option<String>, HistoryError> {
        let Some(username) = self
            .state
            .bans
            .entries()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.username.clone())
        else {
            return Ok(None);
        };
        self.persist(HistoryEvent::Unban { id })?;
        Ok(Some(username))
    }

    pub fn is_banned(
        &self,
        ip: Option<IpAddr>,
        ext_auth_id: Option<&str>,
        sid: Option<&str>,
    ) -> Option<&BanEntry> {
        self.state.bans.is_banned(ip, ext_auth_id, sid)
    }

    // ========================================================================
    // Announcements
    // ========================================================================

    pub fn announcements(&self) -> &[String] {
        &self.state.announcements
    }

    pub fn add_announcement(&mut self, url: &str) -> Result<bool, HistoryError> {
        if self.state.announcements.iter().any(|u| u == url) {
            return Ok(false);
        }
        self.persist(HistoryEvent::Announce {
            url: url.to_string(),
        })?;
        Ok(true)
    }

    pub fn remove_announcement(&mut self, url: &str) -> Result<bool, HistoryError> {
        if !self.state.announcements.iter().any(|u| u == url) {
            return Ok(false);
        }
        self.persist(HistoryEvent::Unannounce {
            url: url.to_string(),
        })?;
        Ok(true)
    }

    // ========================================================================
    // Authenticated user status
    // ========================================================================

    pub fn is_authenticated_operator(&self, auth_id: &str) -> bool {
        self.state.operators.contains(auth_id)
    }

    pub fn is_authenticated_trusted(&self, auth_id: &str) -> bool {
        self.state.trusted.contains(auth_id)
    }

    pub fn authenticated_username(&self, auth_id: &str) -> Option<&str> {
        self.state.auth_names.get(auth_id).map(String::as_str)
    }

    pub fn set_authenticated_operator(&mut self, auth_id: &str, on: bool) -> Result<(), HistoryError> {
        if self.state.operators.contains(auth_id) == on {
            return Ok(());
        }
        self.persist(HistoryEvent::Operator {
            auth_id: auth_id.to_string(),
            on,
        })
    }

    pub fn set_authenticated_trust(&mut self, auth_id: &str, on: bool) -> Result<(), HistoryError> {
        if self.state.trusted.contains(auth_id) == on {
            return Ok(());
        }
        self.persist(HistoryEvent::Trusted {
            auth_id: auth_id.to_string(),
            on,
        })
    }

    pub fn set_authenticated_username(
        &mut self,
        auth_id: &str,
        username: &str,
    ) -> Result<(), HistoryError> {
        if self.authenticated_username(auth_id) == Some(username) {
            return Ok(());
        }
        self.persist(HistoryEvent::AuthName {
            auth_id: auth_id.to_string(),
            username: username.to_string(),
        })
    }

    // ========================================================================
    // User ids and catch-up keys
    // ========================================================================

    /// Pick a user id for a joining user
    pub fn next_user_id(&mut self, name: &str, in_use: impl Fn(u8) -> bool) -> Option<u8> {
        self.state.id_queue.next_id(name, in_use)
    }

    /// Remember that `name` joined with `id`, so they get it back next time
    pub fn join_user(&mut self, id: u8, name: &str) -> Result<(), HistoryError> {
        if self.state.id_queue.id_for_name(name) == Some(id) {
            self.state.id_queue.reserve_id(id);
            return Ok(());
        }
        self.persist(HistoryEvent::User {
            id,
            name: name.to_string(),
        })
    }

    pub fn id_for_name(&self, name: &str) -> Option<u8> {
        self.state.id_queue.id_for_name(name)
    }

    /// Allocate a catch-up key for a stream reset
    pub fn next_catchup_key(&mut self) -> Result<Option<i32>, HistoryError> {
        let Some(key) = self.state.catchup.allocate() else {
            return Ok(None);
        };
        let event = HistoryEvent::Catchup {
            next: self.state.catchup.next_key(),
        };
        if let Err(e) = self.backend.record(&event) {
            self.state.catchup.release(key);
            return Err(e);
        }
        Ok(Some(key))
    }

    pub fn release_catchup_key(&mut self, key: i32) -> bool {
        self.state.catchup.release(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_history() -> SessionHistory {
        let meta = SessionMetadata::new("test", None, ProtocolVersion::current(), "alice");
        SessionHistory::create(&HistoryStorage::Memory, meta).unwrap()
    }

    fn msg(len: usize) -> HistoryMessage {
        HistoryMessage::from(vec![7u8; len])
    }

    #[test]
    fn test_new_history_is_empty() {
        let history = memory_history();
        assert_eq!(history.first_index(), 0);
        assert_eq!(history.last_index(), -1);
        assert_eq!(history.size_in_bytes(), 0);
        assert!(!history.is_persistent());
    }

    #[test]
    fn test_add_advances_size_and_index() {
        let mut history = memory_history();
        assert!(history.add_message(msg(10)).unwrap());
        assert!(history.add_message(msg(5)).unwrap());
        assert_eq!(history.size_in_bytes(), 15);
        assert_eq!(history.last_index(), 1);
    }

    #[test]
    fn test_size_limit_never_exceeded() {
        let mut history = memory_history();
        history.set_size_limit(100);
        let mut accepted = 0;
        for len in [30, 30, 30, 30, 9, 1, 1] {
            let before = history.size_in_bytes();
            if history.add_message(msg(len)).unwrap() {
                accepted += 1;
            } else {
                assert_eq!(history.size_in_bytes(), before);
            }
            assert!(history.size_in_bytes() <= 100);
        }
        assert_eq!(history.size_in_bytes(), 100);
        assert_eq!(accepted, 5);
        assert_eq!(history.last_index(), 4);
    }

    #[test]
    fn test_emergency_space() {
        let mut history = memory_history();
        history.set_size_limit(10);
        assert!(history.add_message(msg(10)).unwrap());
        assert!(!history.add_message(msg(1)).unwrap());
        assert!(history.add_emergency_message(msg(1)).unwrap());
        assert!(
            !history
                .add_emergency_message(msg(EMERGENCY_SPACE as usize))
                .unwrap()
        );
        assert_eq!(history.size_in_bytes(), 11);
    }

    #[test]
    fn test_unlimited_size() {
        let mut history = memory_history();
        assert!(history.has_space_for(u64::MAX / 2, 0));
        assert!(history.add_message(msg(1000)).unwrap());
    }

    #[test]
    fn test_reset_keeps_indices_increasing() {
        let mut history = memory_history();
        for _ in 0..5 {
            history.add_message(msg(10)).unwrap();
        }
        assert_eq!(history.last_index(), 4);

        assert!(history.reset(vec![msg(3), msg(4)]).unwrap());
        assert_eq!(history.first_index(), 5);
        assert_eq!(history.last_index(), 6);
        assert_eq!(history.size_in_bytes(), 7);
        assert_eq!(history.auto_reset_base(), 7);
        assert_eq!(history.last_index() - history.first_index() + 1, 2);
    }

    #[test]
    fn test_reset_too_large_rejected() {
        let mut history = memory_history();
        history.set_size_limit(5);
        history.add_message(msg(2)).unwrap();
        assert!(!history.reset(vec![msg(6)]).unwrap());
        assert_eq!(history.size_in_bytes(), 2);
        assert_eq!(history.first_index(), 0);
        assert_eq!(history.last_index(), 0);
    }

    #[test]
    fn test_reset_to_empty() {
        let mut history = memory_history();
        history.add_message(msg(2)).unwrap();
        assert!(history.reset(Vec::new()).unwrap());
        assert_eq!(history.first_index(), 1);
        assert_eq!(history.last_index(), 0);
        assert!(history.get_batch(-1).unwrap().0.is_empty());
    }

    #[test]
    fn test_get_batch() {
        let mut history = memory_history();
        for i in 0..5u8 {
            history.add_message(HistoryMessage::from(vec![i])).unwrap();
        }

        let (all, last) = history.get_batch(-1).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(last, 4);

        let (tail, _) = history.get_batch(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].as_bytes(), &[3]);

        let (none, last) = history.get_batch(4).unwrap();
        assert!(none.is_empty());
        assert_eq!(last, 4);

        let (none, last) = history.get_batch(100).unwrap();
        assert!(none.is_empty());
        assert_eq!(last, 4);
    }

    #[test]
    fn test_get_batch_before_first_index_returns_everything() {
        let mut history = memory_history();
        for _ in 0..3 {
            history.add_message(msg(1)).unwrap();
        }
        history.reset(vec![msg(1), msg(2)]).unwrap();

        let (batch, last) = history.get_batch(0).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(last, 4);
        assert_eq!(batch[1].len(), 2);
    }

    #[test]
    fn test_max_users_clamped() {
        let mut history = memory_history();
        history.set_max_users(0).unwrap();
        assert_eq!(history.metadata().max_users, 1);
        history.set_max_users(1000).unwrap();
        assert_eq!(history.metadata().max_users, 254);
    }

    #[test]
    fn test_auto_reset_threshold() {
        let mut history = memory_history();
        history.set_size_limit(1000);
        history.set_auto_reset_threshold(5000).unwrap();
        assert_eq!(history.metadata().auto_reset_threshold, 900);

        history.reset(vec![msg(100)]).unwrap();
        assert_eq!(history.effective_auto_reset_threshold(), 1000);

        history.set_auto_reset_threshold(0).unwrap();
        assert_eq!(history.effective_auto_reset_threshold(), 0);
    }

    #[test]
    fn test_flags() {
        let mut history = memory_history();
        history.set_flag(SessionFlags::PERSISTENT, true).unwrap();
        history.set_flag(SessionFlags::NSFM, true).unwrap();
        history.set_flag(SessionFlags::PERSISTENT, false).unwrap();
        assert_eq!(history.metadata().flags, SessionFlags::NSFM);
    }

    #[test]
    fn test_bans() {
        let mut history = memory_history();
        let target = BanTarget {
            username: "troll".to_string(),
            ip: Some("10.0.0.1".parse().unwrap()),
            ext_auth_id: None,
            sid: Some("sid".to_string()),
        };
        assert!(history.add_ban(target.clone(), "alice").unwrap());
        assert!(!history.add_ban(target, "alice").unwrap());
        assert_eq!(history.ban_list().len(), 1);

        assert!(history.is_banned(None, None, Some("sid")).is_some());
        assert_eq!(history.remove_ban(1).unwrap(), Some("troll".to_string()));
        assert_eq!(history.remove_ban(1).unwrap(), None);
        assert!(history.ban_list().is_empty());
    }

    #[test]
    fn test_import_bans() {
        let mut history = memory_history();
        let data = json!([
            {"username": "a", "ip": "10.0.0.1"},
            {"username": "b", "ip": "10.0.0.1"},
            {"username": "c", "ip": "bogus"}
        ]);
        let result = history.import_bans(&data).unwrap();
        assert_eq!(result, BanImport { total: 3, imported: 1 });
        assert!(history.import_bans(&json!("nope")).is_err());
    }

    #[test]
    fn test_announcements() {
        let mut history = memory_history();
        assert!(history.add_announcement("https://list.example/").unwrap());
        assert!(!history.add_announcement("https://list.example/").unwrap());
        assert_eq!(history.announcements().len(), 1);
        assert!(history.remove_announcement("https://list.example/").unwrap());
        assert!(!history.remove_announcement("https://list.example/").unwrap());
    }

    #[test]
    fn test_authenticated_status() {
        let mut history = memory_history();
        history.set_authenticated_operator("ext-1", true).unwrap();
        history.set_authenticated_trust("ext-2", true).unwrap();
        history.set_authenticated_username("ext-1", "Alice").unwrap();

        assert!(history.is_authenticated_operator("ext-1"));
        assert!(!history.is_authenticated_operator("ext-2"));
        assert!(history.is_authenticated_trusted("ext-2"));
        assert_eq!(history.authenticated_username("ext-1"), Some("Alice"));

        history.set_authenticated_operator("ext-1", false).unwrap();
        assert!(!history.is_authenticated_operator("ext-1"));
    }

    #[test]
    fn test_user_ids_reused_by_name() {
        let mut history = memory_history();
        let id = history.next_user_id("bob", |_| false).unwrap();
        history.join_user(id, "bob").unwrap();
        history.next_user_id("carol", |_| false).unwrap();
        assert_eq!(history.next_user_id("bob", |_| false), Some(id));
    }

    #[test]
    fn test_catchup_keys() {
        let mut history = memory_history();
        let first = history.next_catchup_key().unwrap().unwrap();
        let second = history.next_catchup_key().unwrap().unwrap();
        assert_eq!(first, INITIAL_CATCHUP_KEY + 1);
        assert_ne!(first, second);
        assert!(history.release_catchup_key(first));
    }
}
