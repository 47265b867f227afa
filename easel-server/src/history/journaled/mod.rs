//! File-backed session history
//!
//! A journaled session lives in two kinds of files inside the sessions
//! directory:
//!
//! - `{id}.session`: the metadata journal, one [`HistoryEvent`] per line
//! - `{id}_r{n}.rec`: the recording, holding the message history in
//!   sealed blocks (see [`recording`])
//!
//! Each reset starts a new recording file and names it in the journal.
//! Blocks are sealed once they grow past [`BLOCK_SIZE_LIMIT`] or get older
//! than [`BLOCK_MAX_AGE`], which bounds how much a crash can damage and lets
//! delivered blocks be dropped from memory and reread on demand.

mod journal;
mod recording;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use self::journal::JournalWriter;
use super::{
    HistoryBackend, HistoryError, HistoryEvent, HistoryMessage, HistoryState, JOURNAL_FORMAT_VERSION,
    SessionFlags, SessionMetadata,
};

/// File extension of metadata journals
pub const JOURNAL_EXTENSION: &str = "session";

/// Appended to a journal's name when an archived session terminates
pub const ARCHIVED_SUFFIX: &str = ".archived";

/// Seal the open block once it holds this many bytes
pub const BLOCK_SIZE_LIMIT: u64 = 1024 * 1024;

/// Seal the open block once it is this old
pub const BLOCK_MAX_AGE: Duration = Duration::from_secs(30);

/// Name of the metadata journal of session `id`
pub fn journal_filename(id: &str) -> String {
    format!("{id}.{JOURNAL_EXTENSION}")
}

fn recording_filename(id: &str, n: u32) -> String {
    format!("{id}_r{n}.rec")
}

fn recording_number(id: &str, name: &str) -> Option<u32> {
    name.strip_prefix(id)?
        .strip_prefix("_r")?
        .strip_suffix(".rec")?
        .parse()
        .ok()
}

#[derive(Debug)]
struct Block {
    start_offset: u64,
    end_offset: u64,
    /// Position of the first message in the retained history
    first: usize,
    count: usize,
    sealed: bool,
    /// `None` once dropped from memory; reread from disk when needed
    messages: Option<Vec<HistoryMessage>>,
}

impl Block {
    fn open(offset: u64, first: usize) -> Self {
        Self {
            start_offset: offset,
            end_offset: offset,
            first,
            count: 0,
            sealed: false,
            messages: Some(Vec::new()),
        }
    }
}

#[derive(Debug)]
struct BlockCache {
    blocks: Vec<Block>,
    /// Read handle for reloading dropped blocks, opened on first use
    reader: Option<File>,
}

/// What [`JournaledHistory::load`] found on disk
pub(in crate::history) struct Loaded {
    pub(in crate::history) backend: JournaledHistory,
    pub(in crate::history) state: HistoryState,
    pub(in crate::history) message_count: usize,
    pub(in crate::history) size_in_bytes: u64,
}

#[derive(Debug)]
pub struct JournaledHistory {
    dir: PathBuf,
    id: String,
    journal: Option<JournalWriter>,
    recording: Option<File>,
    recording_name: String,
    recording_len: u64,
    file_count: u32,
    /// Earlier recordings kept around in archive mode
    old_recordings: Vec<String>,
    cache: Mutex<BlockCache>,
    block_opened_at: Instant,
    archive: bool,
    broken: bool,
}

impl JournaledHistory {
    /// Start a new journaled history in `dir`
    ///
    /// Fails if a journal for this session id already exists.
    pub fn create(dir: &Path, meta: &SessionMetadata, archive: bool) -> Result<Self, HistoryError> {
        fs::create_dir_all(dir)?;
        let mut journal = JournalWriter::create_new(&dir.join(journal_filename(&meta.id)))?;

        journal.append(&HistoryEvent::Format {
            version: JOURNAL_FORMAT_VERSION,
        })?;
        journal.append(&HistoryEvent::Created {
            id: meta.id.clone(),
            alias: meta.alias.clone(),
            protocol: meta.protocol.clone(),
            founder: meta.founder.clone(),
            started_at: meta.started_at,
        })?;
        for event in initial_events(meta) {
            journal.append(&event)?;
        }

        let recording_name = recording_filename(&meta.id, 1);
        let mut recording = new_recording_file(&dir.join(&recording_name))?;
        let recording_len = recording::write_new(&mut recording, &[])?;
        journal.append(&HistoryEvent::Recording {
            file: recording_name.clone(),
        })?;

        info!(session = %meta.id, dir = %dir.display(), "created journaled session history");

        Ok(Self {
            dir: dir.to_path_buf(),
            id: meta.id.clone(),
            journal: Some(journal),
            recording: Some(recording),
            recording_name,
            recording_len,
            file_count: 1,
            old_recordings: Vec::new(),
            cache: Mutex::new(BlockCache {
                blocks: vec![Block::open(recording_len, 0)],
                reader: None,
            }),
            block_opened_at: Instant::now(),
            archive,
            broken: false,
        })
    }

    /// Reopen a session from its journal
    ///
    /// Damage at the end of the journal or the recording (as left by a
    /// crash mid-write) is cut off and logged; the session then starts with
    /// whatever was intact.
    pub(in crate::history) fn load(journal_path: &Path, archive: bool) -> Result<Loaded, HistoryError> {
        let dir = journal_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let contents = journal::read(journal_path)?;
        let mut events = contents.events.into_iter();

        match events.next() {
            Some(HistoryEvent::Format { version }) if version == JOURNAL_FORMAT_VERSION => {}
            Some(HistoryEvent::Format { version }) => {
                return Err(HistoryError::InvalidJournal(format!(
                    "unsupported journal version {version}"
                )));
            }
            _ => return Err(HistoryError::InvalidJournal("missing format header".to_string())),
        }
        let meta = match events.next() {
            Some(HistoryEvent::Created {
                id,
                alias,
                protocol,
                founder,
                started_at,
            }) => SessionMetadata {
                started_at,
                ..SessionMetadata::new(id, alias, protocol, founder)
            },
            _ => return Err(HistoryError::InvalidJournal("missing session header".to_string())),
        };

        let id = meta.id.clone();
        let mut state = HistoryState::new(meta);
        let mut recordings = Vec::new();
        for event in events {
            if let HistoryEvent::Recording { file } = &event {
                if Path::new(file).file_name().and_then(|n| n.to_str()) != Some(file.as_str()) {
                    return Err(HistoryError::InvalidJournal(format!(
                        "bad recording file name {file:?}"
                    )));
                }
                recordings.push(file.clone());
            }
            state.apply(event);
        }

        let Some(recording_name) = recordings.pop() else {
            return Err(HistoryError::InvalidJournal("no recording file".to_string()));
        };
        let file_count = recordings
            .iter()
            .chain(std::iter::once(&recording_name))
            .filter_map(|name| recording_number(&id, name))
            .max()
            .unwrap_or(1);

        let journal = JournalWriter::reopen(journal_path, contents.valid_len)?;

        let recording_path = dir.join(&recording_name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&recording_path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    HistoryError::NotFound(recording_path.display().to_string())
                }
                _ => HistoryError::Io(e),
            })?;

        let scan = recording::scan(&mut file)?;
        let file_len = file.metadata()?.len();
        if let Some(problem) = &scan.problem {
            warn!(
                session = %id,
                file = %recording_name,
                valid = scan.valid_len,
                len = file_len,
                "recording damaged ({problem}), discarding tail"
            );
        }
        if scan.valid_len < file_len {
            file.set_len(scan.valid_len)?;
        }

        let mut recording_len = scan.valid_len;
        file.seek(SeekFrom::Start(recording_len))?;
        if recording_len == 0 {
            recording_len = recording::write_new(&mut file, &[])?;
        }

        let message_count = scan.message_count();
        let size_in_bytes = scan.size_in_bytes();

        let mut blocks = Vec::with_capacity(scan.blocks.len() + 1);
        let mut first = 0;
        for scanned in scan.blocks {
            if !scanned.sealed {
                // Seal the tail so appends start a fresh block
                let count = u32::try_from(scanned.count)
                    .map_err(|_| HistoryError::Corrupt("block too large".to_string()))?;
                file.write_all(&recording::encode_seal(scanned.start_offset, count))?;
                file.sync_data()?;
                recording_len += recording::SEAL_FRAME_LEN;
            }
            blocks.push(Block {
                start_offset: scanned.start_offset,
                end_offset: scanned.end_offset,
                first,
                count: scanned.count,
                sealed: true,
                messages: None,
            });
            first += scanned.count;
        }
        blocks.push(Block::open(recording_len, first));

        info!(
            session = %id,
            messages = message_count,
            bytes = size_in_bytes,
            "loaded journaled session history"
        );

        Ok(Loaded {
            backend: Self {
                dir,
                id,
                journal: Some(journal),
                recording: Some(file),
                recording_name,
                recording_len,
                file_count,
                old_recordings: recordings,
                cache: Mutex::new(BlockCache {
                    blocks,
                    reader: None,
                }),
                block_opened_at: Instant::now(),
                archive,
                broken: false,
            },
            state,
            message_count,
            size_in_bytes,
        })
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(journal_filename(&self.id))
    }

    /// Give up on a writer after a failed write
    ///
    /// Retrying could leave a half-written entry in the middle of the file,
    /// so the session stops persisting anything from here on.
    fn discard_writer_on_error(&mut self, context: &str, file: &str, err: io::Error) -> HistoryError {
        error!(
            session = %self.id,
            file,
            "{context} failed: {err}; session history can no longer be saved"
        );
        if file == self.recording_name {
            self.recording = None;
        } else {
            self.journal = None;
        }
        self.broken = true;
        HistoryError::Io(err)
    }

    fn write_journal(&mut self, event: &HistoryEvent) -> Result<(), HistoryError> {
        if self.broken {
            return Err(HistoryError::Broken);
        }
        let result = match self.journal.as_mut() {
            Some(journal) => journal.append(event),
            None => return Err(HistoryError::Broken),
        };
        result.map_err(|e| {
            let name = journal_filename(&self.id);
            self.discard_writer_on_error("journal write", &name, e)
        })
    }

    fn write_recording(&mut self, bytes: &[u8], sync: bool) -> Result<(), HistoryError> {
        if self.broken {
            return Err(HistoryError::Broken);
        }
        let result = match self.recording.as_mut() {
            Some(file) => file
                .write_all(bytes)
                .and_then(|()| if sync { file.sync_data() } else { Ok(()) }),
            None => return Err(HistoryError::Broken),
        };
        result.map_err(|e| {
            let name = self.recording_name.clone();
            self.discard_writer_on_error("recording write", &name, e)
        })?;
        self.recording_len += bytes.len() as u64;
        Ok(())
    }

    /// Seal the open block and start a new one
    pub fn close_block(&mut self) -> Result<(), HistoryError> {
        let (start_offset, count) = {
            let cache = self.cache.get_mut().unwrap_or_else(PoisonError::into_inner);
            match cache.blocks.last() {
                Some(open) if open.count > 0 => (open.start_offset, open.count),
                _ => {
                    self.block_opened_at = Instant::now();
                    return Ok(());
                }
            }
        };
        let count32 = u32::try_from(count)
            .map_err(|_| HistoryError::Corrupt("block too large".to_string()))?;
        self.write_recording(&recording::encode_seal(start_offset, count32), true)?;

        let offset = self.recording_len;
        let cache = self.cache.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(open) = cache.blocks.last_mut() {
            open.sealed = true;
            let next = open.first + open.count;
            cache.blocks.push(Block::open(offset, next));
        }
        self.block_opened_at = Instant::now();
        debug!(session = %self.id, messages = count, "sealed history block");
        Ok(())
    }

    fn delete_file(&self, name: &str) {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(session = %self.id, file = name, "could not delete: {e}"),
        }
    }
}

impl HistoryBackend for JournaledHistory {
    fn append(&mut self, message: &HistoryMessage) -> Result<(), HistoryError> {
        let frame = recording::encode_message(message.as_bytes())?;
        self.write_recording(&frame, false)?;

        let offset = self.recording_len;
        let cache = self.cache.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(open) = cache.blocks.last_mut() else {
            return Err(HistoryError::Corrupt("no open block".to_string()));
        };
        open.end_offset = offset;
        open.count += 1;
        open.messages.get_or_insert_with(Vec::new).push(message.clone());

        let full = open.end_offset - open.start_offset >= BLOCK_SIZE_LIMIT;
        if (full || self.block_opened_at.elapsed() >= BLOCK_MAX_AGE)
            && let Err(e) = self.close_block()
        {
            // The message itself is stored; the next write will report the failure
            warn!(session = %self.id, "could not seal block after append: {e}");
        }
        Ok(())
    }

    fn replace(&mut self, messages: &[HistoryMessage]) -> Result<(), HistoryError> {
        if self.broken {
            return Err(HistoryError::Broken);
        }
        let number = self.file_count + 1;
        let name = recording_filename(&self.id, number);
        let path = self.dir.join(&name);

        let written = new_recording_file(&path)
            .and_then(|mut file| recording::write_new(&mut file, messages).map(|len| (file, len)));
        let (file, len) = match written {
            Ok(v) => v,
            Err(e) => {
                // The current recording is untouched, so the session carries on
                self.delete_file(&name);
                return Err(e.into());
            }
        };

        if let Err(e) = self.write_journal(&HistoryEvent::Recording { file: name.clone() }) {
            self.delete_file(&name);
            return Err(e);
        }

        let old = std::mem::replace(&mut self.recording_name, name);
        self.recording = Some(file);
        self.recording_len = len;
        self.file_count = number;

        let mut blocks = Vec::with_capacity(2);
        if !messages.is_empty() {
            blocks.push(Block {
                start_offset: recording::HEADER_LEN,
                end_offset: len - recording::SEAL_FRAME_LEN,
                first: 0,
                count: messages.len(),
                sealed: true,
                messages: Some(messages.to_vec()),
            });
        }
        blocks.push(Block::open(len, messages.len()));
        let cache = self.cache.get_mut().unwrap_or_else(PoisonError::into_inner);
        cache.blocks = blocks;
        cache.reader = None;
        self.block_opened_at = Instant::now();

        if self.archive {
            self.old_recordings.push(old);
        } else {
            self.delete_file(&old);
        }
        debug!(session = %self.id, messages = messages.len(), "started new recording after reset");
        Ok(())
    }

    fn batch(&self, offset: usize) -> Result<Vec<HistoryMessage>, HistoryError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let BlockCache { blocks, reader } = &mut *cache;

        let mut batch = Vec::new();
        for block in blocks.iter_mut() {
            if block.count == 0 || block.first + block.count <= offset {
                continue;
            }
            if block.messages.is_none() {
                if reader.is_none() {
                    *reader = Some(File::open(self.dir.join(&self.recording_name))?);
                }
                if let Some(file) = reader.as_mut() {
                    block.messages = Some(recording::read_block(
                        file,
                        block.start_offset,
                        block.end_offset,
                        block.count,
                    )?);
                }
            }
            let skip = offset.saturating_sub(block.first);
            if let Some(messages) = &block.messages {
                batch.extend_from_slice(messages.get(skip..).unwrap_or_default());
            }
        }
        Ok(batch)
    }

    fn cleanup(&mut self, before_offset: usize) {
        let cache = self.cache.get_mut().unwrap_or_else(PoisonError::into_inner);
        for block in cache
            .blocks
            .iter_mut()
            .filter(|b| b.sealed && b.first + b.count <= before_offset)
        {
            block.messages = None;
        }
    }

    fn record(&mut self, event: &HistoryEvent) -> Result<(), HistoryError> {
        self.write_journal(event)
    }

    fn terminate(&mut self) -> Result<(), HistoryError> {
        self.journal = None;
        self.recording = None;
        self.cache
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .reader = None;
        self.broken = true;

        let journal_path = self.journal_path();
        if self.archive {
            let mut archived = journal_path.clone().into_os_string();
            archived.push(ARCHIVED_SUFFIX);
            fs::rename(&journal_path, &archived)?;
            info!(session = %self.id, "archived session history");
        } else {
            for name in std::mem::take(&mut self.old_recordings) {
                self.delete_file(&name);
            }
            self.delete_file(&self.recording_name);
            fs::remove_file(&journal_path)?;
            info!(session = %self.id, "deleted session history");
        }
        Ok(())
    }
}

fn new_recording_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Journal entries for metadata that differs from the defaults
fn initial_events(meta: &SessionMetadata) -> Vec<HistoryEvent> {
    let defaults = SessionMetadata::new(
        meta.id.clone(),
        meta.alias.clone(),
        meta.protocol.clone(),
        meta.founder.clone(),
    );
    let mut events = Vec::new();
    if meta.title != defaults.title {
        events.push(HistoryEvent::Title {
            title: meta.title.clone(),
        });
    }
    if meta.password_hash.is_some() {
        events.push(HistoryEvent::Password {
            hash: meta.password_hash.clone(),
        });
    }
    if meta.op_password_hash.is_some() {
        events.push(HistoryEvent::OpPassword {
            hash: meta.op_password_hash.clone(),
        });
    }
    if meta.max_users != defaults.max_users {
        events.push(HistoryEvent::MaxUsers {
            count: meta.max_users,
        });
    }
    if meta.auto_reset_threshold != 0 {
        events.push(HistoryEvent::AutoReset {
            threshold: meta.auto_reset_threshold,
        });
    }
    if meta.flags != SessionFlags::empty() {
        events.push(HistoryEvent::Flags { flags: meta.flags });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Backend, BanTarget, HistoryStorage, SessionHistory};
    use easel_common::ProtocolVersion;
    use tempfile::TempDir;

    fn meta(id: &str) -> SessionMetadata {
        SessionMetadata::new(
            id,
            Some("sketchbook".to_string()),
            ProtocolVersion::current(),
            "alice",
        )
    }

    fn storage(dir: &TempDir, archive: bool) -> HistoryStorage {
        HistoryStorage::Journaled {
            dir: dir.path().to_path_buf(),
            archive,
        }
    }

    fn msg(i: usize) -> HistoryMessage {
        HistoryMessage::from(format!("stroke {i}").into_bytes())
    }

    fn all(history: &SessionHistory) -> Vec<HistoryMessage> {
        history.get_batch(-1).unwrap().0
    }

    #[test]
    fn test_create_writes_files() {
        let dir = TempDir::new().unwrap();
        let history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        assert!(history.is_persistent());
        assert!(dir.path().join("s1.session").exists());
        assert!(dir.path().join("s1_r1.rec").exists());
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        assert!(SessionHistory::create(&storage(&dir, false), meta("s1")).is_err());
    }

    #[test]
    fn test_reload_reproduces_messages_and_metadata() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        for i in 0..25 {
            assert!(history.add_message(msg(i)).unwrap());
        }
        history.set_title("Evening sketch").unwrap();
        history.set_flag(SessionFlags::PERSISTENT, true).unwrap();
        history.set_flag(SessionFlags::NSFM, true).unwrap();
        history
            .add_ban(
                BanTarget {
                    username: "troll".to_string(),
                    ip: Some("10.1.2.3".parse().unwrap()),
                    ext_auth_id: None,
                    sid: None,
                },
                "alice",
            )
            .unwrap();
        let expected = all(&history);
        let size = history.size_in_bytes();
        drop(history);

        let loaded = SessionHistory::load(&dir.path().join("s1.session"), false).unwrap();
        assert_eq!(all(&loaded), expected);
        assert_eq!(loaded.size_in_bytes(), size);
        assert_eq!(loaded.last_index(), 24);

        let meta = loaded.metadata();
        assert_eq!(meta.id, "s1");
        assert_eq!(meta.alias.as_deref(), Some("sketchbook"));
        assert_eq!(meta.founder, "alice");
        assert_eq!(meta.title, "Evening sketch");
        assert_eq!(meta.flags, SessionFlags::PERSISTENT | SessionFlags::NSFM);
        assert_eq!(loaded.ban_list().len(), 1);
        assert_eq!(loaded.ban_list().entries()[0].username, "troll");
    }

    #[test]
    fn test_sealed_blocks_reload_lazily() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        for i in 0..3 {
            history.add_message(msg(i)).unwrap();
        }
        history.close_block().unwrap();
        for i in 3..5 {
            history.add_message(msg(i)).unwrap();
        }

        // Everything delivered; the sealed block is dropped from memory
        history.cleanup_batches(4);
        let (tail, _) = history.get_batch(1).unwrap();
        assert_eq!(tail, (2..5).map(msg).collect::<Vec<_>>());
        assert_eq!(all(&history).len(), 5);
    }

    #[test]
    fn test_reset_starts_new_recording() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        for i in 0..4 {
            history.add_message(msg(i)).unwrap();
        }
        assert!(history.reset(vec![msg(100)]).unwrap());
        history.add_message(msg(101)).unwrap();

        assert!(!dir.path().join("s1_r1.rec").exists());
        assert!(dir.path().join("s1_r2.rec").exists());
        assert_eq!(all(&history), vec![msg(100), msg(101)]);
        drop(history);

        let loaded = SessionHistory::load(&dir.path().join("s1.session"), false).unwrap();
        assert_eq!(all(&loaded), vec![msg(100), msg(101)]);
        assert_eq!(loaded.first_index(), 0);
        assert_eq!(loaded.last_index(), 1);
    }

    #[test]
    fn test_damaged_tail_discarded_on_load() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        for i in 0..3 {
            history.add_message(msg(i)).unwrap();
        }
        drop(history);

        let path = dir.path().join("s1_r1.rec");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 200, 0, 0, 0, 0xde, 0xad]).unwrap();
        drop(file);

        let mut loaded = SessionHistory::load(&dir.path().join("s1.session"), false).unwrap();
        assert_eq!(all(&loaded), (0..3).map(msg).collect::<Vec<_>>());

        // Still writable after recovery
        loaded.add_message(msg(3)).unwrap();
        drop(loaded);
        let again = SessionHistory::load(&dir.path().join("s1.session"), false).unwrap();
        assert_eq!(all(&again).len(), 4);
    }

    #[test]
    fn test_terminate_deletes_files() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        history.add_message(msg(0)).unwrap();
        history.terminate().unwrap();
        assert!(!dir.path().join("s1.session").exists());
        assert!(!dir.path().join("s1_r1.rec").exists());
        assert!(matches!(
            history.add_message(msg(1)),
            Err(HistoryError::Broken)
        ));
    }

    #[test]
    fn test_terminate_archives() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, true), meta("s1")).unwrap();
        history.add_message(msg(0)).unwrap();
        history.reset(vec![msg(1)]).unwrap();
        history.terminate().unwrap();
        assert!(!dir.path().join("s1.session").exists());
        assert!(dir.path().join("s1.session.archived").exists());
        assert!(dir.path().join("s1_r1.rec").exists());
        assert!(dir.path().join("s1_r2.rec").exists());
    }

    #[test]
    fn test_journal_write_failure_breaks_session() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        if let Backend::Journaled(backend) = &mut history.backend {
            let err = io::Error::other("disk on fire");
            let name = journal_filename("s1");
            backend.discard_writer_on_error("test", &name, err);
            assert!(backend.is_broken());
        }
        assert!(matches!(history.set_title("x"), Err(HistoryError::Broken)));
        assert_eq!(history.metadata().title, "");
        assert!(matches!(
            history.add_message(msg(0)),
            Err(HistoryError::Broken)
        ));
        assert_eq!(history.last_index(), -1);
        assert_eq!(history.size_in_bytes(), 0);
    }

    #[test]
    fn test_catchup_key_persisted() {
        let dir = TempDir::new().unwrap();
        let mut history = SessionHistory::create(&storage(&dir, false), meta("s1")).unwrap();
        let first = history.next_catchup_key().unwrap().unwrap();
        drop(history);

        let mut loaded = SessionHistory::load(&dir.path().join("s1.session"), false).unwrap();
        let second = loaded.next_catchup_key().unwrap().unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_recording_number() {
        assert_eq!(recording_number("abc", "abc_r12.rec"), Some(12));
        assert_eq!(recording_number("abc", "abd_r1.rec"), None);
        assert_eq!(recording_number("abc", "abc_r.rec"), None);
    }
}
