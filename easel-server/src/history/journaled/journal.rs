//! Metadata journal: one JSON-encoded [`HistoryEvent`] per line

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use tracing::warn;

use crate::history::{HistoryError, HistoryEvent};

#[derive(Debug)]
pub(super) struct JournalWriter {
    file: File,
}

impl JournalWriter {
    /// Create a journal, failing if one already exists
    pub fn create_new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).create_new(true).open(path)?;
        Ok(Self { file })
    }

    /// Reopen a journal for appending, dropping anything past `valid_len`
    pub fn reopen(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }
        Ok(Self { file })
    }

    /// Append and flush one event
    pub fn append(&mut self, event: &HistoryEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()
    }
}

/// Events read back from a journal
#[derive(Debug)]
pub(super) struct JournalContents {
    pub events: Vec<HistoryEvent>,
    /// Length of the well-formed prefix
    pub valid_len: u64,
}

/// Read all events, stopping at the first line that does not parse
///
/// A damaged line is usually a write torn by a crash; it and everything
/// after it are ignored.
pub(super) fn read(path: &Path) -> Result<JournalContents, HistoryError> {
    let data = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => HistoryError::NotFound(path.display().to_string()),
        _ => HistoryError::Io(e),
    })?;

    let mut events = Vec::new();
    let mut valid_len = 0usize;
    for line in data.split_inclusive(|&b| b == b'\n') {
        let complete = line.last() == Some(&b'\n');
        let text = line.strip_suffix(b"\n").unwrap_or(line);
        if text.is_empty() && complete {
            valid_len += line.len();
            continue;
        }
        match serde_json::from_slice::<HistoryEvent>(text) {
            Ok(event) if complete => {
                events.push(event);
                valid_len += line.len();
            }
            Ok(_) => {
                warn!(journal = %path.display(), "journal ends without a newline, dropping last entry");
                break;
            }
            Err(e) => {
                warn!(
                    journal = %path.display(),
                    offset = valid_len,
                    "discarding damaged journal tail: {e}"
                );
                break;
            }
        }
    }

    Ok(JournalContents {
        events,
        valid_len: valid_len as u64,
    })
}
