//! The write-ahead journal: every commit is appended here and fsynced
//! before any page in the cache is touched, so a crash between "journal
//! write" and "apply to cache" is always recoverable by replaying from the
//! last watermark.
//!
//! Wire format. A watermark record lives at journal offset 0:
//!
//! ```text
//! applied_tid: u64 LE | crc32: u32 LE
//! ```
//!
//! followed by zero or more commit records, each:
//!
//! ```text
//! tid: u64 LE | n_writes: u32 LE | payload_len: u32 LE
//! payload: n_writes * { addr: u64 LE | len: u32 LE | bytes: [u8; len] }
//! crc32: u32 LE   (over everything from `tid` through the payload)
//! ```
//!
//! A commit applies its record to the cache, advances the watermark past
//! it, and truncates the journal back to just the watermark, so the
//! journal is normally empty except for the commit currently in flight.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crc32fast::Hasher;

use crate::addr::{page_nr, page_offset, Addr, PAGE_SIZE};
use crate::cache::PageCache;
use crate::error::{Result, StorageError};

const WATERMARK_LEN: u64 = 8 + 4;

fn consistency(msg: impl Into<String>) -> StorageError {
    StorageError::ConsistencyError(msg.into())
}

/// One page-range write staged as part of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalWrite {
    pub addr: Addr,
    pub bytes: Vec<u8>,
}

/// Everything a single commit needs to replay: its transaction id and the
/// byte ranges it wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub tid: u64,
    pub writes: Vec<JournalWrite>,
}

impl JournalRecord {
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for w in &self.writes {
            payload.extend_from_slice(&w.addr.to_le_bytes());
            payload.extend_from_slice(&(w.bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(&w.bytes);
        }
        let mut out = Vec::with_capacity(16 + payload.len() + 4);
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&(self.writes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        let mut hasher = Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    /// Decode one record from the front of `buf`. Returns the record and
    /// how many bytes it consumed. A truncated or corrupt tail (the kind a
    /// crash mid-append leaves behind) is reported as an error so the
    /// caller can treat it as "end of journal" rather than propagating it.
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 16 {
            return Err(consistency("journal record shorter than its fixed header"));
        }
        let tid = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let n_writes = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let payload_len = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        let body_len = 16 + payload_len;
        if buf.len() < body_len + 4 {
            return Err(consistency("journal record truncated"));
        }
        let recorded_crc = u32::from_le_bytes(buf[body_len..body_len + 4].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&buf[..body_len]);
        if hasher.finalize() != recorded_crc {
            return Err(consistency("journal record checksum mismatch"));
        }

        let mut writes = Vec::with_capacity(n_writes);
        let mut pos = 16;
        for _ in 0..n_writes {
            if pos + 12 > body_len {
                return Err(consistency("journal record write entry truncated"));
            }
            let addr = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            let len = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
            pos += 12;
            if pos + len > body_len {
                return Err(consistency("journal record write payload truncated"));
            }
            writes.push(JournalWrite {
                addr,
                bytes: buf[pos..pos + len].to_vec(),
            });
            pos += len;
        }
        Ok((Self { tid, writes }, body_len + 4))
    }
}

/// The journal file, positioned to append the next commit record.
pub struct Journal {
    file: File,
    write_offset: u64,
}

impl Journal {
    /// Initialize a brand-new journal file: watermark at tid 0, nothing
    /// pending.
    pub fn create(mut file: File) -> Result<Self> {
        file.set_len(WATERMARK_LEN).map_err(StorageError::FileError)?;
        let mut journal = Self {
            file,
            write_offset: WATERMARK_LEN,
        };
        journal.write_watermark(0)?;
        Ok(journal)
    }

    /// Open a journal file that may hold unapplied records from a crash.
    /// Does not replay; call [`Journal::replay`] once the cache is ready.
    pub fn open_existing(file: File) -> Result<Self> {
        let len = file.metadata().map_err(StorageError::FileError)?.len();
        Ok(Self {
            file,
            write_offset: len.max(WATERMARK_LEN),
        })
    }

    fn write_watermark(&mut self, applied_tid: u64) -> Result<()> {
        let mut buf = [0u8; WATERMARK_LEN as usize];
        buf[0..8].copy_from_slice(&applied_tid.to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&buf[0..8]);
        buf[8..12].copy_from_slice(&hasher.finalize().to_le_bytes());
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(StorageError::FileError)?;
        self.file.write_all(&buf).map_err(StorageError::FileError)?;
        self.file.sync_all().map_err(StorageError::FileError)?;
        Ok(())
    }

    fn read_watermark(&mut self) -> Result<u64> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(StorageError::FileError)?;
        let mut buf = [0u8; WATERMARK_LEN as usize];
        self.file.read_exact(&mut buf).map_err(StorageError::FileError)?;
        let applied_tid = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let recorded = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&buf[0..8]);
        if hasher.finalize() != recorded {
            return Err(consistency("journal watermark checksum mismatch"));
        }
        Ok(applied_tid)
    }

    /// Append one commit record. Fsyncs the journal (data only, not
    /// metadata) when `sync` is set, matching [`crate::config::Config::sync_journal`].
    pub fn append(&mut self, record: &JournalRecord, sync: bool) -> Result<()> {
        let bytes = record.encode();
        self.file
            .seek(SeekFrom::Start(self.write_offset))
            .map_err(StorageError::FileError)?;
        self.file.write_all(&bytes).map_err(StorageError::FileError)?;
        if sync {
            self.file.sync_data().map_err(StorageError::FileError)?;
        }
        self.write_offset += bytes.len() as u64;
        Ok(())
    }

    /// After a commit has applied its own record directly (the common,
    /// non-crash path): advance the watermark past `tid` and truncate.
    pub fn checkpoint(&mut self, tid: u64) -> Result<()> {
        self.write_watermark(tid)?;
        self.file.set_len(WATERMARK_LEN).map_err(StorageError::FileError)?;
        self.write_offset = WATERMARK_LEN;
        Ok(())
    }

    fn pending_records(&mut self) -> Result<(u64, Vec<JournalRecord>)> {
        let applied = self.read_watermark()?;
        self.file
            .seek(SeekFrom::Start(WATERMARK_LEN))
            .map_err(StorageError::FileError)?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf).map_err(StorageError::FileError)?;

        let mut records = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            match JournalRecord::decode(&buf[pos..]) {
                Ok((record, consumed)) => {
                    pos += consumed;
                    if record.tid > applied {
                        records.push(record);
                    }
                }
                Err(_) => break,
            }
        }
        Ok((applied, records))
    }

    /// Replay every record left unapplied by a crash into `cache`, then
    /// advance the watermark and truncate. Returns the highest tid now
    /// applied (0 if the journal held nothing to replay).
    pub fn replay(&mut self, cache: &PageCache) -> Result<u64> {
        let (mut last_tid, records) = self.pending_records()?;
        for record in &records {
            apply_record(cache, record)?;
            last_tid = last_tid.max(record.tid);
        }
        if !records.is_empty() {
            cache.flush()?;
        }
        self.checkpoint(last_tid)?;
        Ok(last_tid)
    }
}

fn apply_record(cache: &PageCache, record: &JournalRecord) -> Result<()> {
    for w in &record.writes {
        apply_write(cache, w.addr, &w.bytes)?;
    }
    Ok(())
}

/// Copy `bytes` into the cache starting at `addr`, splitting at page
/// boundaries as needed.
pub(crate) fn apply_write(cache: &PageCache, addr: Addr, bytes: &[u8]) -> Result<()> {
    let mut remaining = bytes;
    let mut addr = addr;
    while !remaining.is_empty() {
        let page = page_nr(addr);
        let offset = page_offset(addr) as usize;
        let n = remaining.len().min(PAGE_SIZE - offset);
        let mut page_ref = cache.write(page)?;
        page_ref.as_mut_slice()[offset..offset + n].copy_from_slice(&remaining[..n]);
        remaining = &remaining[n..];
        addr += n as u64;
    }
    Ok(())
}
