//! The single write transaction: stages allocator changes and byte writes
//! against a private shadow of the database header, then commits them all
//! atomically through the journal.

use parking_lot::MutexGuard;

use crate::addr::{Addr, SizeClass};
use crate::alloc;
use crate::db::Database;
use crate::error::Result;
use crate::header::DbHeader;
use crate::journal::{self, JournalRecord, JournalWrite};

/// A staged set of writes and allocator changes, owning the only writer
/// slot for as long as it's alive. Dropping it without calling
/// [`Transaction::commit`] discards everything staged, same as
/// [`Transaction::abort`].
pub struct Transaction<'a> {
    db: &'a Database,
    // Held for the transaction's whole lifetime: this is what makes the
    // engine single-writer. Never read, only kept alive.
    _writer: MutexGuard<'a, ()>,
    header: DbHeader,
    tid: u64,
    writes: Vec<JournalWrite>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        db: &'a Database,
        writer: MutexGuard<'a, ()>,
        header: DbHeader,
        tid: u64,
    ) -> Self {
        Self {
            db,
            _writer: writer,
            header,
            tid,
            writes: Vec::new(),
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Allocate one block of `class`.
    pub fn alloc(&mut self, class: SizeClass) -> Result<Addr> {
        alloc::allocate(
            &mut self.header,
            &self.db.cache,
            class,
            (self.db.config.extension_quantum_pages * crate::addr::PAGE_SIZE) as u64,
        )
    }

    /// Return the block at `addr` to its free list. Its size class is read
    /// back from its own block header, not supplied by the caller.
    pub fn free(&mut self, addr: Addr) -> Result<()> {
        alloc::free(&mut self.header, &self.db.cache, addr)
    }

    /// Stage raw bytes to be written at `addr` on commit. Overlapping or
    /// adjacent pending writes are coalesced into one, with these bytes
    /// taking precedence over anything already staged in that range.
    pub fn stage_write(&mut self, addr: Addr, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut start = addr;
        let mut end = addr + bytes.len() as u64;
        let mut absorbed = Vec::new();

        loop {
            let mut changed = false;
            let mut i = 0;
            while i < self.writes.len() {
                let w_start = self.writes[i].addr;
                let w_end = w_start + self.writes[i].bytes.len() as u64;
                if w_end >= start && w_start <= end {
                    start = start.min(w_start);
                    end = end.max(w_end);
                    absorbed.push(self.writes.remove(i));
                    changed = true;
                } else {
                    i += 1;
                }
            }
            if !changed {
                break;
            }
        }

        let mut merged = vec![0u8; (end - start) as usize];
        for w in &absorbed {
            let offset = (w.addr - start) as usize;
            merged[offset..offset + w.bytes.len()].copy_from_slice(&w.bytes);
        }
        let offset = (addr - start) as usize;
        merged[offset..offset + bytes.len()].copy_from_slice(bytes);

        self.writes.push(JournalWrite {
            addr: start,
            bytes: merged,
        });
    }

    /// Commit every staged write and allocator change atomically: merge in
    /// `writes` (byte ranges handed over by the serializer, not staged via
    /// [`Transaction::stage_write`] beforehand) exactly as `stage_write`
    /// would, append the journal record (fsyncing per
    /// [`crate::config::Config::sync_journal`]), apply it to the cache, then
    /// advance the journal's watermark.
    ///
    /// If the process dies after the journal append but before this
    /// returns, [`crate::db::Database::open`]'s replay reapplies the same
    /// record on next open, so a caller that never saw `commit` return
    /// cannot tell the difference from a commit that never started.
    pub fn commit(mut self, writes: &[(Addr, Vec<u8>)]) -> Result<()> {
        for (addr, bytes) in writes {
            self.stage_write(*addr, bytes);
        }
        let header_bytes = bytemuck::bytes_of(&self.header).to_vec();
        self.stage_write(0, &header_bytes);

        let record = JournalRecord {
            tid: self.tid,
            writes: self.writes,
        };

        {
            let mut journal = self.db.journal.lock();
            journal.append(&record, self.db.config.sync_journal)?;
            for w in &record.writes {
                journal::apply_write(&self.db.cache, w.addr, &w.bytes)?;
            }
            if self.db.config.sync_journal {
                self.db.cache.flush()?;
            }
            journal.checkpoint(self.tid)?;
        }

        *self.db.header.lock() = self.header;
        Ok(())
    }

    /// Discard everything staged. Equivalent to dropping the transaction.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;

    #[test]
    fn stage_write_coalesces_overlapping_ranges() {
        let db = Database::open_anon(Config::default()).unwrap();
        let mut txn = db.begin_write();
        txn.stage_write(100, b"aaaaa");
        txn.stage_write(102, b"bbbbb");
        assert_eq!(txn.writes.len(), 1);
        assert_eq!(txn.writes[0].addr, 100);
        assert_eq!(&txn.writes[0].bytes, b"aabbbbb");
    }

    #[test]
    fn stage_write_merges_adjacent_ranges() {
        let db = Database::open_anon(Config::default()).unwrap();
        let mut txn = db.begin_write();
        txn.stage_write(0, b"abc");
        txn.stage_write(3, b"def");
        assert_eq!(txn.writes.len(), 1);
        assert_eq!(&txn.writes[0].bytes, b"abcdef");
    }

    #[test]
    fn commit_persists_writes_across_transactions() {
        let db = Database::open_anon(Config::default()).unwrap();
        let mut txn = db.begin_write();
        let addr = txn.alloc(SizeClass::T4).unwrap();
        txn.stage_write(addr, b"payload!");
        txn.commit(&[]).unwrap();

        let bytes = db.load(addr, 8).unwrap();
        assert_eq!(&bytes, b"payload!");
    }

    #[test]
    fn abort_discards_staged_writes() {
        let db = Database::open_anon(Config::default()).unwrap();
        let eof_before = db.end_of_file();
        let mut txn = db.begin_write();
        let _ = txn.alloc(SizeClass::Pg).unwrap();
        txn.abort();
        assert_eq!(db.end_of_file(), eof_before);
    }
}
