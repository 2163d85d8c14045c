//! The database facade: open or create a file, replay its journal, and
//! hand out the single writer transaction and any number of concurrent
//! reads.

use std::fs::{File, OpenOptions as StdOpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;

use crate::addr::{Addr, PAGE_SIZE};
use crate::cache::{MappedStorage, PageCache};
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::header::DbHeader;
use crate::journal::Journal;
use crate::txn::Transaction;

/// How [`Database::open`] should treat an existing or missing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if the file already exists.
    CreateNew,
    /// Create a fresh, empty database, overwriting any existing file.
    CreateAlways,
    /// Fail if the file does not already exist.
    OpenExisting,
    /// Open the file if present, otherwise create a fresh database.
    OpenAlways,
}

const HEADER_RESERVED_PAGES: u64 = 1;

/// An open database: one mapped, cached file, one journal, one writer at a
/// time, any number of concurrent readers.
pub struct Database {
    pub(crate) cache: PageCache,
    pub(crate) journal: Mutex<Journal>,
    pub(crate) header: Mutex<DbHeader>,
    pub(crate) writer_lock: Mutex<()>,
    next_tid: AtomicU64,
    pub(crate) config: Config,
    // Dropping this releases the advisory exclusive lock taken in `open`.
    _file_lock: Option<File>,
}

impl Database {
    /// Open, or create, a file-backed database at `path`. A sibling file
    /// named `<path>.journal` holds the write-ahead log.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        match mode {
            OpenMode::CreateNew if existed => {
                return Err(StorageError::BadArgument(format!(
                    "{} already exists",
                    path.display()
                )))
            }
            OpenMode::OpenExisting if !existed => {
                return Err(StorageError::BadArgument(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
            _ => {}
        }
        let create_fresh = matches!(mode, OpenMode::CreateNew | OpenMode::CreateAlways)
            || (mode == OpenMode::OpenAlways && !existed);

        let file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(matches!(mode, OpenMode::CreateAlways))
            .open(path)
            .map_err(StorageError::FileError)?;
        file.try_lock_exclusive().map_err(StorageError::Lock)?;

        let journal_file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(journal_path_for(path))
            .map_err(StorageError::FileError)?;

        if create_fresh {
            tracing::info!(path = %path.display(), "creating fresh database");
            Self::init_fresh(file, journal_file, config)
        } else {
            tracing::info!(path = %path.display(), "opening existing database");
            Self::init_existing(file, journal_file, config)
        }
    }

    /// Open an anonymous, memory-only database: nothing survives the
    /// process, including the journal.
    pub fn open_anon(config: Config) -> Result<Self> {
        let journal_file = tempfile::tempfile().map_err(StorageError::FileError)?;
        let initial_len = PAGE_SIZE as u64 * HEADER_RESERVED_PAGES;
        let storage = MappedStorage::open_anon(initial_len)?;
        let cache = PageCache::new(storage, config.cache_capacity);
        let header = DbHeader::new(initial_len);
        write_header(&cache, &header)?;
        let journal = Journal::create(journal_file)?;
        Ok(Self {
            cache,
            journal: Mutex::new(journal),
            header: Mutex::new(header),
            writer_lock: Mutex::new(()),
            next_tid: AtomicU64::new(1),
            config,
            _file_lock: None,
        })
    }

    fn init_fresh(file: File, journal_file: File, config: Config) -> Result<Self> {
        let initial_len = PAGE_SIZE as u64 * HEADER_RESERVED_PAGES;
        file.set_len(initial_len).map_err(StorageError::FileError)?;
        let storage = MappedStorage::open_file(
            file.try_clone().map_err(StorageError::FileError)?,
            initial_len,
        )?;
        let cache = PageCache::new(storage, config.cache_capacity);
        let header = DbHeader::new(initial_len);
        write_header(&cache, &header)?;
        cache.flush()?;
        let journal = Journal::create(journal_file)?;
        Ok(Self {
            cache,
            journal: Mutex::new(journal),
            header: Mutex::new(header),
            writer_lock: Mutex::new(()),
            next_tid: AtomicU64::new(1),
            config,
            _file_lock: Some(file),
        })
    }

    fn init_existing(file: File, journal_file: File, config: Config) -> Result<Self> {
        let len = file.metadata().map_err(StorageError::FileError)?.len();
        let storage = MappedStorage::open_file(
            file.try_clone().map_err(StorageError::FileError)?,
            len,
        )?;
        let cache = PageCache::new(storage, config.cache_capacity);

        // The on-disk header page may be torn here (a crash mid-apply can
        // leave it partially written); don't validate until after replay
        // has had a chance to repair it.
        let mut journal = Journal::open_existing(journal_file)?;
        let applied_tid = journal.replay(&cache)?;
        tracing::debug!(applied_tid, "replayed journal on open");

        let header = read_header(&cache)?.validate()?;

        Ok(Self {
            cache,
            journal: Mutex::new(journal),
            header: Mutex::new(header),
            writer_lock: Mutex::new(()),
            next_tid: AtomicU64::new(applied_tid + 1),
            config,
            _file_lock: Some(file),
        })
    }

    /// Start the single write transaction. Blocks until any other writer in
    /// this process releases it; a second process is excluded entirely by
    /// the advisory file lock taken in `open`.
    pub fn begin_write(&self) -> Transaction<'_> {
        let guard = self.writer_lock.lock();
        let header = *self.header.lock();
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        Transaction::new(self, guard, header, tid)
    }

    /// Read `len` bytes starting at `addr` from the last committed state.
    /// Never blocks on the writer.
    pub fn load(&self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        let mut addr = addr;
        while remaining > 0 {
            let page = crate::addr::page_nr(addr);
            let offset = crate::addr::page_offset(addr) as usize;
            let n = remaining.min(PAGE_SIZE - offset);
            let page_ref = self.cache.read(page)?;
            out.extend_from_slice(&page_ref.as_slice()[offset..offset + n]);
            remaining -= n;
            addr += n as u64;
        }
        Ok(out)
    }

    /// Bytes currently allocated to the file, including the reserved
    /// header page.
    pub fn end_of_file(&self) -> Addr {
        self.header.lock().end_of_file()
    }
}

fn journal_path_for(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".journal");
    PathBuf::from(os)
}

pub(crate) fn write_header(cache: &PageCache, header: &DbHeader) -> Result<()> {
    let mut page_ref = cache.write(0)?;
    let bytes = bytemuck::bytes_of(header);
    page_ref.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

pub(crate) fn read_header(cache: &PageCache) -> Result<DbHeader> {
    let page_ref = cache.read(0)?;
    Ok(bytemuck::pod_read_unaligned(
        &page_ref.as_slice()[..std::mem::size_of::<DbHeader>()],
    ))
}
