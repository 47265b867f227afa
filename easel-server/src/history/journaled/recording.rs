//! Recording file format
//!
//! ```text
//! header: "EASELREC" version:u32le
//! frame:  kind:u8 len:u32le crc32c:u32le payload[len]
//! ```
//!
//! Message frames carry one canvas message each. A seal frame closes a
//! block of messages; its payload repeats the block's start offset and
//! message count so a scan can check that the block is whole.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

use crc32c::crc32c;

use crate::history::{HistoryError, HistoryMessage};

const MAGIC: &[u8; 8] = b"EASELREC";
const VERSION: u32 = 1;
pub(super) const HEADER_LEN: u64 = 12;

const FRAME_HEADER_LEN: usize = 9;
const KIND_MESSAGE: u8 = 1;
const KIND_SEAL: u8 = 2;
const SEAL_PAYLOAD_LEN: usize = 12;
pub(super) const SEAL_FRAME_LEN: u64 = (FRAME_HEADER_LEN + SEAL_PAYLOAD_LEN) as u64;

/// Larger frames are treated as garbage rather than allocated
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub(super) fn header() -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..8].copy_from_slice(MAGIC);
    buf[8..].copy_from_slice(&VERSION.to_le_bytes());
    buf
}

fn encode_frame(kind: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub(super) fn encode_message(message: &[u8]) -> io::Result<Vec<u8>> {
    encode_frame(KIND_MESSAGE, message)
}

pub(super) fn encode_seal(start_offset: u64, count: u32) -> Vec<u8> {
    let mut payload = [0u8; SEAL_PAYLOAD_LEN];
    payload[..8].copy_from_slice(&start_offset.to_le_bytes());
    payload[8..].copy_from_slice(&count.to_le_bytes());
    let mut buf = Vec::with_capacity(SEAL_FRAME_LEN as usize);
    buf.push(KIND_SEAL);
    buf.extend_from_slice(&(SEAL_PAYLOAD_LEN as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf
}

enum Frame {
    /// Clean end of data between frames
    End,
    /// Data ends inside a frame
    Truncated,
    Invalid(String),
    /// Message payload is left in the caller's buffer
    Message,
    Seal { start_offset: u64, count: u32 },
}

/// Read until `buf` is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

fn read_frame<R: Read>(reader: &mut R, payload: &mut Vec<u8>) -> io::Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(Frame::End),
        n if n < FRAME_HEADER_LEN => return Ok(Frame::Truncated),
        _ => {}
    }

    let kind = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let expected_crc = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Invalid(format!("frame length {len} out of range")));
    }

    payload.resize(len, 0);
    if read_full(reader, payload)? < len {
        return Ok(Frame::Truncated);
    }
    let actual_crc = crc32c(payload);
    if actual_crc != expected_crc {
        return Ok(Frame::Invalid(format!(
            "crc mismatch (expected {expected_crc:#010x}, got {actual_crc:#010x})"
        )));
    }

    match kind {
        KIND_MESSAGE => Ok(Frame::Message),
        KIND_SEAL if len == SEAL_PAYLOAD_LEN => {
            let mut offset = [0u8; 8];
            offset.copy_from_slice(&payload[..8]);
            let mut count = [0u8; 4];
            count.copy_from_slice(&payload[8..]);
            Ok(Frame::Seal {
                start_offset: u64::from_le_bytes(offset),
                count: u32::from_le_bytes(count),
            })
        }
        KIND_SEAL => Ok(Frame::Invalid("malformed block seal".to_string())),
        other => Ok(Frame::Invalid(format!("unknown frame kind {other}"))),
    }
}

/// A run of message frames found by [`scan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ScannedBlock {
    /// Offset of the first message frame
    pub start_offset: u64,
    /// Offset just past the last message frame
    pub end_offset: u64,
    pub count: usize,
    pub size_in_bytes: u64,
    pub sealed: bool,
}

/// Result of walking a recording file
#[derive(Debug)]
pub(super) struct Scan {
    pub blocks: Vec<ScannedBlock>,
    /// Length of the consistent prefix of the file
    pub valid_len: u64,
    /// What was wrong with the rest, if anything
    pub problem: Option<String>,
}

impl Scan {
    pub fn message_count(&self) -> usize {
        self.blocks.iter().map(|b| b.count).sum()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size_in_bytes).sum()
    }
}

/// Walk a recording file and index its blocks
///
/// Everything after the last whole frame is reported as damaged. A block
/// whose seal does not match its content is dropped entirely, together with
/// everything after it. Message payloads are checked but not kept.
pub(super) fn scan(file: &mut File) -> Result<Scan, HistoryError> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&*file);

    let mut head = [0u8; HEADER_LEN as usize];
    let read = read_full(&mut reader, &mut head)?;
    if read < head.len() {
        return Ok(Scan {
            blocks: Vec::new(),
            valid_len: 0,
            problem: (read > 0).then(|| "truncated file header".to_string()),
        });
    }
    if &head[..8] != MAGIC {
        return Err(HistoryError::Corrupt("not a recording file".to_string()));
    }
    let version = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);
    if version != VERSION {
        return Err(HistoryError::Corrupt(format!(
            "unsupported recording version {version}"
        )));
    }

    let mut blocks = Vec::new();
    let mut payload = Vec::new();
    let mut pos = HEADER_LEN;
    let mut open = ScannedBlock {
        start_offset: pos,
        end_offset: pos,
        count: 0,
        size_in_bytes: 0,
        sealed: false,
    };

    let problem = loop {
        match read_frame(&mut reader, &mut payload)? {
            Frame::End => break None,
            Frame::Truncated => break Some("truncated frame".to_string()),
            Frame::Invalid(reason) => break Some(reason),
            Frame::Message => {
                pos += (FRAME_HEADER_LEN + payload.len()) as u64;
                open.end_offset = pos;
                open.count += 1;
                open.size_in_bytes += payload.len() as u64;
            }
            Frame::Seal {
                start_offset,
                count,
            } => {
                if start_offset != open.start_offset || count as usize != open.count {
                    // Nothing in this block can be trusted
                    pos = open.start_offset;
                    open.end_offset = pos;
                    open.count = 0;
                    open.size_in_bytes = 0;
                    break Some(format!(
                        "block seal mismatch at offset {}",
                        open.start_offset
                    ));
                }
                pos += SEAL_FRAME_LEN;
                open.sealed = true;
                let next = ScannedBlock {
                    start_offset: pos,
                    end_offset: pos,
                    count: 0,
                    size_in_bytes: 0,
                    sealed: false,
                };
                blocks.push(std::mem::replace(&mut open, next));
            }
        }
    };

    if open.count > 0 {
        blocks.push(open);
    }

    Ok(Scan {
        blocks,
        valid_len: pos,
        problem,
    })
}

/// Read the messages of one block back from disk
pub(super) fn read_block(
    file: &mut File,
    start_offset: u64,
    end_offset: u64,
    count: usize,
) -> Result<Vec<HistoryMessage>, HistoryError> {
    file.seek(SeekFrom::Start(start_offset))?;
    let mut reader = BufReader::new(Read::take(&*file, end_offset - start_offset));
    let mut payload = Vec::new();
    let mut messages = Vec::with_capacity(count);

    loop {
        match read_frame(&mut reader, &mut payload)? {
            Frame::End => break,
            Frame::Message => messages.push(HistoryMessage::from(payload.as_slice())),
            Frame::Truncated => {
                return Err(HistoryError::Corrupt(format!(
                    "block at offset {start_offset} is truncated"
                )));
            }
            Frame::Invalid(reason) => {
                return Err(HistoryError::Corrupt(format!(
                    "block at offset {start_offset}: {reason}"
                )));
            }
            Frame::Seal { .. } => {
                return Err(HistoryError::Corrupt(format!(
                    "unexpected seal inside block at offset {start_offset}"
                )));
            }
        }
    }

    if messages.len() != count {
        return Err(HistoryError::Corrupt(format!(
            "block at offset {start_offset} holds {} messages, expected {count}",
            messages.len()
        )));
    }
    Ok(messages)
}

/// Write a complete recording file holding `messages` as one sealed block
///
/// Returns the new file length; the file is left positioned at its end.
pub(super) fn write_new(file: &mut File, messages: &[HistoryMessage]) -> io::Result<u64> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&header());
    for message in messages {
        buf.extend_from_slice(&encode_message(message.as_bytes())?);
    }
    if !messages.is_empty() {
        let count = u32::try_from(messages.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many messages"))?;
        buf.extend_from_slice(&encode_seal(HEADER_LEN, count));
    }
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(buf.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join(name))
            .unwrap()
    }

    fn messages(n: usize) -> Vec<HistoryMessage> {
        (0..n)
            .map(|i| HistoryMessage::from(format!("message {i}").into_bytes()))
            .collect()
    }

    #[test]
    fn test_scan_sealed_block() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        let len = write_new(&mut file, &messages(3)).unwrap();

        let scan = scan(&mut file).unwrap();
        assert!(scan.problem.is_none());
        assert_eq!(scan.valid_len, len);
        assert_eq!(scan.blocks.len(), 1);
        assert!(scan.blocks[0].sealed);
        assert_eq!(scan.message_count(), 3);
        assert_eq!(scan.size_in_bytes(), 3 * 9);

        let block = &scan.blocks[0];
        let read = read_block(&mut file, block.start_offset, block.end_offset, 3).unwrap();
        assert_eq!(read, messages(3));
    }

    #[test]
    fn test_scan_unsealed_tail() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        write_new(&mut file, &messages(2)).unwrap();
        file.write_all(&encode_message(b"tail").unwrap()).unwrap();

        let scan = scan(&mut file).unwrap();
        assert!(scan.problem.is_none());
        assert_eq!(scan.blocks.len(), 2);
        assert!(!scan.blocks[1].sealed);
        assert_eq!(scan.blocks[1].count, 1);
        assert_eq!(scan.message_count(), 3);
    }

    #[test]
    fn test_scan_truncated_frame() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        let len = write_new(&mut file, &messages(2)).unwrap();
        let frame = encode_message(b"torn write").unwrap();
        file.write_all(&frame[..frame.len() - 3]).unwrap();

        let scan = scan(&mut file).unwrap();
        assert_eq!(scan.problem.as_deref(), Some("truncated frame"));
        assert_eq!(scan.valid_len, len);
        assert_eq!(scan.message_count(), 2);
    }

    #[test]
    fn test_scan_bad_crc() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        let len = write_new(&mut file, &[]).unwrap();
        let mut frame = encode_message(b"flipped").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        file.write_all(&frame).unwrap();

        let scan = scan(&mut file).unwrap();
        assert!(scan.problem.unwrap().contains("crc mismatch"));
        assert_eq!(scan.valid_len, len);
        assert!(scan.blocks.is_empty());
    }

    #[test]
    fn test_scan_seal_mismatch_drops_block() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        let len = write_new(&mut file, &messages(2)).unwrap();
        file.write_all(&encode_message(b"one").unwrap()).unwrap();
        file.write_all(&encode_message(b"two").unwrap()).unwrap();
        // Claims three messages where there are two
        file.write_all(&encode_seal(len, 3)).unwrap();

        let scan = scan(&mut file).unwrap();
        assert!(scan.problem.as_ref().unwrap().contains("seal mismatch"));
        assert_eq!(scan.valid_len, len);
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(scan.message_count(), 2);
    }

    #[test]
    fn test_scan_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        file.write_all(b"definitely not a recording").unwrap();
        assert!(matches!(scan(&mut file), Err(HistoryError::Corrupt(_))));
    }

    #[test]
    fn test_scan_empty_file() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        let scan = scan(&mut file).unwrap();
        assert_eq!(scan.valid_len, 0);
        assert!(scan.problem.is_none());
    }

    #[test]
    fn test_read_block_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let mut file = open(&dir, "a.rec");
        write_new(&mut file, &messages(1)).unwrap();

        // Flip a payload byte behind the scan's back
        file.seek(SeekFrom::Start(HEADER_LEN + FRAME_HEADER_LEN as u64))
            .unwrap();
        file.write_all(b"X").unwrap();

        let end = HEADER_LEN + FRAME_HEADER_LEN as u64 + 9;
        let result = read_block(&mut file, HEADER_LEN, end, 1);
        assert!(matches!(result, Err(HistoryError::Corrupt(_))));
    }
}
