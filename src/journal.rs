//! Append-only journal
//!
//! Durable backing for the intent queue and the bulk scheduler. Every entry
//! is fsynced before `append` returns.
//!
//! # Frame Layout (17-byte header + payload)
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ seq_id     │ 8 bytes   │ Monotonic sequence within the file │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! │ payload_len│ 4 bytes   │ Payload size                       │
//! │ entry_type │ 1 byte    │ JournalEntryType                   │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```
//!
//! Payloads are JSON. A frame cut short by a crash (torn tail) is dropped
//! on open; a complete frame with a bad checksum is corruption and fails
//! the open.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

pub const JOURNAL_HEADER_SIZE: usize = 17;

/// Upper bound on a single payload; anything larger is a corrupt length
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub seq_id: u64,
    pub checksum: u32,
    pub payload_len: u32,
    pub entry_type: u8,
}

impl JournalHeader {
    pub fn new(entry_type: JournalEntryType, seq_id: u64, payload: &[u8]) -> Self {
        Self {
            seq_id,
            checksum: crc32_checksum(payload),
            payload_len: payload.len() as u32,
            entry_type: entry_type as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.seq_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16] = self.entry_type;
        buf
    }

    pub fn from_bytes(buf: &[u8; JOURNAL_HEADER_SIZE]) -> Self {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[0..8]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&buf[8..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[12..16]);
        Self {
            seq_id: u64::from_le_bytes(seq),
            checksum: u32::from_le_bytes(checksum),
            payload_len: u32::from_le_bytes(len),
            entry_type: buf[16],
        }
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

/// Journal entry types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntryType {
    IntentPublished = 1,
    IntentAcked = 2,
    ItemScheduled = 3,
    ItemFired = 4,
    ItemCancelled = 5,
    IntentRetried = 6,
}

impl TryFrom<u8> for JournalEntryType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::IntentPublished),
            2 => Ok(Self::IntentAcked),
            3 => Ok(Self::ItemScheduled),
            4 => Ok(Self::ItemFired),
            5 => Ok(Self::ItemCancelled),
            6 => Ok(Self::IntentRetried),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown JournalEntryType: {}", value),
            )),
        }
    }
}

#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A single journal entry (header + payload)
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub header: JournalHeader,
    pub payload: Vec<u8>,
}

impl JournalEntry {
    pub fn entry_type(&self) -> io::Result<JournalEntryType> {
        JournalEntryType::try_from(self.header.entry_type)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> io::Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Sequential frame reader
pub struct JournalReader<R: Read> {
    reader: R,
    /// Bytes consumed by complete, verified frames
    valid_len: u64,
}

impl<R: Read> JournalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            valid_len: 0,
        }
    }

    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Next entry; `None` at EOF or at a torn tail
    pub fn read_entry(&mut self) -> io::Result<Option<JournalEntry>> {
        let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
        match self.reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let header = JournalHeader::from_bytes(&header_buf);
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "payload_len {} exceeds limit at seq_id={}",
                    header.payload_len, header.seq_id
                ),
            ));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        match self.reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        if !header.verify_checksum(&payload) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "CRC32 checksum mismatch at seq_id={}, expected={}, got={}",
                    header.seq_id,
                    header.checksum,
                    crc32_checksum(&payload)
                ),
            ));
        }

        self.valid_len += (JOURNAL_HEADER_SIZE + payload.len()) as u64;
        Ok(Some(JournalEntry { header, payload }))
    }

    pub fn read_all(&mut self) -> io::Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.read_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

struct JournalWriter {
    file: File,
    next_seq: u64,
}

/// File-backed journal, safe to share across tasks
pub struct Journal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
}

impl Journal {
    /// Open (or create) a journal, returning the entries already on disk
    pub fn open(path: impl AsRef<Path>) -> io::Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut reader = JournalReader::new(&file);
        let entries = reader.read_all()?;
        let valid_len = reader.valid_len();

        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                path = %path.display(),
                dropped_bytes = on_disk - valid_len,
                "Journal torn tail truncated"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }

        let next_seq = entries.last().map(|e| e.header.seq_id + 1).unwrap_or(1);
        debug!(path = %path.display(), entries = entries.len(), next_seq, "Journal opened");

        Ok((
            Self {
                path,
                writer: Mutex::new(JournalWriter { file, next_seq }),
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame and fsync it. Returns the assigned sequence id.
    ///
    /// Payloads over `MAX_PAYLOAD_LEN` are refused; the reader would reject
    /// the frame and every later open would fail.
    pub fn append(&self, entry_type: JournalEntryType, payload: &[u8]) -> io::Result<u64> {
        if payload.len() > MAX_PAYLOAD_LEN as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "journal payload of {} bytes exceeds {}",
                    payload.len(),
                    MAX_PAYLOAD_LEN
                ),
            ));
        }

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("journal writer poisoned"))?;

        let seq_id = writer.next_seq;
        let header = JournalHeader::new(entry_type, seq_id, payload);
        let mut frame = Vec::with_capacity(JOURNAL_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);

        writer.file.write_all(&frame)?;
        writer.file.flush()?;
        writer.file.sync_data()?;
        writer.next_seq += 1;
        Ok(seq_id)
    }

    pub fn append_json<T: Serialize>(
        &self,
        entry_type: JournalEntryType,
        value: &T,
    ) -> io::Result<u64> {
        let payload =
            serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.append(entry_type, &payload)
    }
}
