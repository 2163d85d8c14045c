//! The page cache: a bounded set of resident, memory-mapped pages, evicted
//! least-recently-used, shared between one writer and many readers.
//!
//! Three lock tiers guard the cache, always taken in this order to avoid
//! deadlock:
//!
//! 1. `storage` (`RwLock<MappedStorage>`) — held briefly, write side only
//!    while the backing file/maps are growing.
//! 2. `lru` (`Mutex<Lru>`) — held briefly to reorder the recency list.
//! 3. a page's own `RwLock<Slot>` — held for the duration of a read or
//!    write of that page's bytes.
//!
//! Eviction only ever uses non-blocking acquire on a page's lock: a page
//! somebody is currently reading or writing is simply skipped rather than
//! waited for, so a slow reader can never stall the thread trying to bring
//! in a new page. A dirty evicted page is written through to the file
//! before its slot is reused.

use std::collections::HashMap;
use std::fs::File;

use memmap2::{MmapMut, MmapOptions, MmapRaw, RemapOptions};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::addr::{PageNr, PAGE_SIZE};
use crate::error::{Result, StorageError};

/// Owns the growable set of memory maps backing the database file (or, for
/// an anonymous in-memory database, backing nothing but RAM).
///
/// Maps are only ever appended to, never replaced or dropped while the
/// cache is live: a [`Slot`]'s cached pointer into an earlier map would
/// otherwise dangle the moment that map's `Vec` entry moved or vanished.
pub(crate) struct MappedStorage {
    maps: Vec<MmapRaw>,
    file: Option<File>,
}

/// Confirm the engine's fixed page size is a multiple of the host's actual
/// mmap granularity. A host with a larger native page size than ours would
/// silently round every mapping offset, desynchronizing page addresses
/// from what actually got mapped.
fn check_host_page_size() -> Result<()> {
    let host = page_size::get();
    if host == 0 || PAGE_SIZE % host != 0 {
        return Err(StorageError::ConsistencyError(format!(
            "engine page size {PAGE_SIZE} is not a multiple of the host mmap granularity {host}"
        )));
    }
    Ok(())
}

impl MappedStorage {
    pub fn open_file(file: File, initial_len: u64) -> Result<Self> {
        check_host_page_size()?;
        let map = MmapOptions::new()
            .len(initial_len as usize)
            .map_raw(&file)
            .map_err(StorageError::FileError)?;
        Ok(Self {
            maps: vec![map],
            file: Some(file),
        })
    }

    pub fn open_anon(initial_len: u64) -> Result<Self> {
        check_host_page_size()?;
        let map = MmapRaw::from(
            MmapMut::map_anon(initial_len as usize).map_err(StorageError::FileError)?,
        );
        Ok(Self {
            maps: vec![map],
            file: None,
        })
    }

    fn total_len(&self) -> u64 {
        self.maps.iter().map(|m| m.len() as u64).sum()
    }

    /// Grow the mapped region by `additional` bytes, resizing the backing
    /// file first if there is one. On Linux this tries to extend the last
    /// map in place (`mremap`); otherwise a new map is appended.
    pub fn grow(&mut self, additional: u64) -> Result<()> {
        if additional == 0 {
            return Ok(());
        }
        if let Some(file) = &self.file {
            let current = file.metadata().map_err(StorageError::FileError)?.len();
            file.set_len(current + additional)
                .map_err(StorageError::FileError)?;
            file.sync_all().map_err(StorageError::FileError)?;

            #[cfg(target_os = "linux")]
            {
                let last = self.maps.last_mut().expect("storage always has one map");
                let new_size = last.len() + additional as usize;
                if last
                    .remap(new_size, RemapOptions::new().may_move(false))
                    .is_ok()
                {
                    return Ok(());
                }
            }

            let map = MmapOptions::new()
                .offset(current)
                .len(additional as usize)
                .map_raw(file)
                .map_err(StorageError::FileError)?;
            self.maps.push(map);
            Ok(())
        } else {
            #[cfg(target_os = "linux")]
            {
                let last = self.maps.last_mut().expect("storage always has one map");
                let new_size = last.len() + additional as usize;
                if last
                    .remap(new_size, RemapOptions::new().may_move(false))
                    .is_ok()
                {
                    return Ok(());
                }
            }
            let map = MmapRaw::from(
                MmapMut::map_anon(additional as usize).map_err(StorageError::FileError)?,
            );
            self.maps.push(map);
            Ok(())
        }
    }

    /// Locate the raw pointer to the start of `page_nr`'s bytes.
    ///
    /// # Safety
    /// The caller must not hold this pointer past the point where `grow` is
    /// next called against an anonymous-map database (a remap can move an
    /// anonymous map's storage even though it never moves a file-backed
    /// one). A cached [`Slot`] pointer is only ever read under that page's
    /// own lock, so this is upheld by always re-deriving the pointer inside
    /// `PageCache::ensure_resident` rather than caching it across a grow.
    unsafe fn page_ptr(&self, page_nr: PageNr) -> Result<*mut u8> {
        let mut want = page_nr as usize * PAGE_SIZE;
        for map in &self.maps {
            if want < map.len() {
                return Ok(map.as_mut_ptr().add(want));
            }
            want -= map.len();
        }
        Err(StorageError::ConsistencyError(format!(
            "page {page_nr} is not within the mapped region"
        )))
    }

    pub fn flush_all(&self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        for map in &self.maps {
            map.flush().map_err(StorageError::FileError)?;
        }
        Ok(())
    }

    /// Msync just the one page's range, so evicting a dirty slot doesn't
    /// have to flush the whole mapped region to write it through.
    fn flush_page(&self, page_nr: PageNr) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let mut want = page_nr as usize * PAGE_SIZE;
        for map in &self.maps {
            if want < map.len() {
                return map.flush_range(want, PAGE_SIZE).map_err(StorageError::FileError);
            }
            want -= map.len();
        }
        Err(StorageError::ConsistencyError(format!(
            "page {page_nr} is not within the mapped region"
        )))
    }
}

/// A resident page's bytes plus bookkeeping. The pointer is recomputed
/// under the storage lock every time the page is (re)bound to a slot, so it
/// never survives a map growth unobserved.
///
/// `dirty` tracks whether this tenancy has been written since it was bound:
/// the bytes already live in the shared mmap either way (eviction never
/// loses data), but a dirty page's on-disk bytes may still lag the mapped
/// ones until a msync, so eviction writes it through first.
struct Slot {
    page_nr: Option<PageNr>,
    ptr: *mut u8,
    dirty: bool,
}

// `ptr` aliases mmap'd memory, never thread-local memory; access is
// mediated by this slot's own RwLock, so sharing the raw pointer across
// threads is sound.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    fn empty() -> Self {
        Self {
            page_nr: None,
            ptr: std::ptr::null_mut(),
            dirty: false,
        }
    }

    /// # Safety
    /// `ptr` must point to at least `PAGE_SIZE` valid, mapped bytes that
    /// outlive every read of this slice.
    unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, PAGE_SIZE)
    }

    /// # Safety
    /// See [`Slot::bytes`].
    unsafe fn bytes_mut(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, PAGE_SIZE)
    }
}

/// Arena-and-index doubly linked recency list over cache slot indices.
/// `head` is most-recently-used, `tail` is least-recently-used; `next`
/// points from `tail` toward `head`.
struct Lru {
    next: Vec<Option<usize>>,
    prev: Vec<Option<usize>>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            next: vec![None; capacity],
            prev: vec![None; capacity],
            head: None,
            tail: None,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (p, n) = (self.prev[slot], self.next[slot]);
        match p {
            Some(p) => self.next[p] = n,
            None => self.head = n,
        }
        match n {
            Some(n) => self.prev[n] = p,
            None => self.tail = p,
        }
        self.prev[slot] = None;
        self.next[slot] = None;
    }

    /// Move (or insert) `slot` to the most-recently-used position.
    fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        if self.prev[slot].is_some() || self.next[slot].is_some() || self.tail == Some(slot) {
            self.unlink(slot);
        }
        self.next[slot] = self.head;
        if let Some(h) = self.head {
            self.prev[h] = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Iterate slot indices from least- to most-recently-used.
    fn least_recent_order(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.tail;
        while let Some(s) = cur {
            out.push(s);
            cur = self.prev[s];
        }
        out
    }
}

/// A shared read handle on one resident page's bytes.
pub struct ReadRef<'a> {
    guard: RwLockReadGuard<'a, Slot>,
}

impl<'a> ReadRef<'a> {
    pub fn page_nr(&self) -> PageNr {
        self.guard.page_nr.expect("bound slot")
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safe: the slot is bound (page_nr.is_some()) and holds a read lock
        // for the lifetime of `self`, so nothing can rebind or move it.
        unsafe { self.guard.bytes() }
    }
}

/// An exclusive write handle on one resident page's bytes.
pub struct WriteRef<'a> {
    guard: RwLockWriteGuard<'a, Slot>,
}

impl<'a> WriteRef<'a> {
    pub fn page_nr(&self) -> PageNr {
        self.guard.page_nr.expect("bound slot")
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { self.guard.bytes() }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.guard.dirty = true;
        unsafe { self.guard.bytes_mut() }
    }
}

/// The bounded LRU page cache.
pub struct PageCache {
    storage: RwLock<MappedStorage>,
    slots: Vec<RwLock<Slot>>,
    lru: Mutex<Lru>,
    index: Mutex<HashMap<PageNr, usize>>,
}

impl PageCache {
    pub fn new(storage: MappedStorage, capacity: usize) -> Self {
        assert!(capacity >= 2, "cache must hold at least 2 pages");
        Self {
            storage: RwLock::new(storage),
            slots: (0..capacity).map(|_| RwLock::new(Slot::empty())).collect(),
            lru: Mutex::new(Lru::new(capacity)),
            index: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Ensure the mapped region covers at least `end_of_file` bytes,
    /// growing by whole `quantum` multiples.
    pub fn ensure_mapped(&self, end_of_file: u64, quantum_bytes: u64) -> Result<()> {
        let mut storage = self.storage.write();
        let current = storage.total_len();
        if current >= end_of_file {
            return Ok(());
        }
        let deficit = end_of_file - current;
        let quanta = deficit.div_ceil(quantum_bytes);
        storage.grow(quanta * quantum_bytes)
    }

    /// Borrow a resident page for reading, bringing it in (possibly
    /// evicting another page) if it isn't resident yet.
    pub fn read(&self, page_nr: PageNr) -> Result<ReadRef<'_>> {
        let slot_idx = self.resident_slot(page_nr)?;
        let guard = self.slots[slot_idx].read();
        Ok(ReadRef { guard })
    }

    /// Borrow a resident page for writing. Only the single writer
    /// transaction ever calls this, so it never competes with itself.
    pub fn write(&self, page_nr: PageNr) -> Result<WriteRef<'_>> {
        let slot_idx = self.resident_slot(page_nr)?;
        let guard = self.slots[slot_idx].write();
        Ok(WriteRef { guard })
    }

    fn resident_slot(&self, page_nr: PageNr) -> Result<usize> {
        {
            let index = self.index.lock();
            if let Some(&slot_idx) = index.get(&page_nr) {
                self.lru.lock().touch(slot_idx);
                return Ok(slot_idx);
            }
        }
        self.bind_slot(page_nr)
    }

    /// Bind `page_nr` to some slot, evicting a clean unlocked page if the
    /// cache is full, and point that slot at the page's bytes.
    fn bind_slot(&self, page_nr: PageNr) -> Result<usize> {
        let mut index = self.index.lock();
        // Another thread may have bound it while we waited for the lock.
        if let Some(&slot_idx) = index.get(&page_nr) {
            self.lru.lock().touch(slot_idx);
            return Ok(slot_idx);
        }

        let storage = self.storage.read();
        let ptr = unsafe { storage.page_ptr(page_nr)? };

        let slot_idx = self.evict_or_find_free(&index, &storage)?;
        {
            let mut slot = self.slots[slot_idx].write();
            if let Some(old_page) = slot.page_nr {
                index.remove(&old_page);
            }
            slot.page_nr = Some(page_nr);
            slot.ptr = ptr;
            slot.dirty = false;
        }
        index.insert(page_nr, slot_idx);
        self.lru.lock().touch(slot_idx);
        Ok(slot_idx)
    }

    /// Find a never-used slot, or evict the least-recently-used slot that
    /// isn't currently locked by a reader/writer. A dirty evicted slot is
    /// written through before its bookkeeping is freed for reuse; its bytes
    /// are never at risk either way, since they live in the shared mmap
    /// itself rather than a separate cache buffer.
    fn evict_or_find_free(
        &self,
        index: &HashMap<PageNr, usize>,
        storage: &MappedStorage,
    ) -> Result<usize> {
        if index.len() < self.slots.len() {
            for (i, slot) in self.slots.iter().enumerate() {
                // Non-blocking: this scan runs with the map lock held, and
                // only a non-blocking acquire is allowed in that position.
                if let Some(guard) = slot.try_read() {
                    if guard.page_nr.is_none() {
                        return Ok(i);
                    }
                }
            }
        }
        let order = self.lru.lock().least_recent_order();
        for slot_idx in order {
            if let Some(mut guard) = self.slots[slot_idx].try_write() {
                if guard.dirty {
                    storage.flush_page(guard.page_nr.expect("bound slot"))?;
                    guard.dirty = false;
                }
                drop(guard);
                return Ok(slot_idx);
            }
        }
        Err(StorageError::ConsistencyError(
            "page cache exhausted: every resident page is pinned".into(),
        ))
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.read().flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(pages: u64, capacity: usize) -> PageCache {
        let storage = MappedStorage::open_anon(pages * PAGE_SIZE as u64).unwrap();
        PageCache::new(storage, capacity)
    }

    #[test]
    fn write_then_read_same_page() {
        let c = cache(4, 2);
        {
            let mut w = c.write(1).unwrap();
            w.as_mut_slice()[0..5].copy_from_slice(b"hello");
        }
        let r = c.read(1).unwrap();
        assert_eq!(&r.as_slice()[0..5], b"hello");
    }

    #[test]
    fn eviction_keeps_other_pages_data() {
        let c = cache(8, 2);
        {
            let mut w = c.write(0).unwrap();
            w.as_mut_slice()[0] = 1;
        }
        {
            let mut w = c.write(1).unwrap();
            w.as_mut_slice()[0] = 2;
        }
        // Bringing in a third page with capacity 2 must evict one of the
        // first two, but must not corrupt the mapped bytes of either.
        {
            let mut w = c.write(2).unwrap();
            w.as_mut_slice()[0] = 3;
        }
        assert_eq!(c.read(0).unwrap().as_slice()[0], 1);
        assert_eq!(c.read(2).unwrap().as_slice()[0], 3);
    }

    #[test]
    fn dirty_page_is_written_through_on_eviction() {
        use std::io::{Read, Seek, SeekFrom};

        let mut f = tempfile::tempfile().unwrap();
        f.set_len(4 * PAGE_SIZE as u64).unwrap();
        let storage =
            MappedStorage::open_file(f.try_clone().unwrap(), 4 * PAGE_SIZE as u64).unwrap();
        let c = PageCache::new(storage, 2);
        {
            let mut w = c.write(0).unwrap();
            w.as_mut_slice()[0] = 0xAB;
        }
        // Capacity 2: bringing in two more pages evicts page 0's slot, and
        // since it was dirty that must write it through without a caller
        // ever calling `flush()`.
        c.write(1).unwrap();
        c.write(2).unwrap();

        let mut byte = [0u8; 1];
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 0xAB);
    }

    #[test]
    fn ensure_mapped_grows_in_quantum_multiples() {
        let storage = MappedStorage::open_anon(PAGE_SIZE as u64).unwrap();
        let c = PageCache::new(storage, 4);
        c.ensure_mapped(10 * PAGE_SIZE as u64, 4 * PAGE_SIZE as u64)
            .unwrap();
        // Page 9 must now be addressable without error.
        assert!(c.read(9).is_ok());
    }
}
