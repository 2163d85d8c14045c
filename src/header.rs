//! On-disk header layouts: the database header at offset 0, and the 8-byte
//! header every allocated block carries.
//!
//! Both are read and written through explicit little-endian accessors, never
//! by touching the raw `#[repr(C)]` fields directly, so the in-memory layout
//! chosen by the compiler never leaks into the on-disk format.

use bytemuck::{Pod, Zeroable};

use crate::addr::{Addr, SizeClass};
use crate::error::{Result, StorageError};

/// Magic bytes identifying a database file.
pub const MAGIC: [u8; 8] = *b"CHSBSE01";

/// The database header: lives at byte 0 of page 0 and occupies half a page
/// at most. It is staged and journaled like any other write, so a crash
/// mid-commit is recovered the same way as any other torn page: by
/// replaying the journal.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DbHeader {
    magic: [u8; 8],
    end_of_file: [u8; 8],
    free_pg: [u8; 8],
    free_t1: [u8; 8],
    free_t2: [u8; 8],
    free_t3: [u8; 8],
    free_t4: [u8; 8],
}

const _: () = assert!(
    std::mem::size_of::<DbHeader>() <= crate::addr::PAGE_SIZE / 2,
    "database header must fit in half a page"
);

impl DbHeader {
    /// A freshly initialized header for an empty database of `end_of_file`
    /// bytes and no free blocks of any class.
    pub fn new(end_of_file: u64) -> Self {
        Self {
            magic: MAGIC,
            end_of_file: end_of_file.to_le_bytes(),
            free_pg: 0u64.to_le_bytes(),
            free_t1: 0u64.to_le_bytes(),
            free_t2: 0u64.to_le_bytes(),
            free_t3: 0u64.to_le_bytes(),
            free_t4: 0u64.to_le_bytes(),
        }
    }

    /// Validate the magic and return the header, or an error naming what's
    /// wrong.
    pub fn validate(self) -> Result<Self> {
        if self.magic != MAGIC {
            return Err(StorageError::ConsistencyError(format!(
                "bad database magic: {:?}",
                self.magic
            )));
        }
        Ok(self)
    }

    pub fn end_of_file(&self) -> u64 {
        u64::from_le_bytes(self.end_of_file)
    }

    pub fn set_end_of_file(&mut self, v: u64) {
        self.end_of_file = v.to_le_bytes();
    }

    /// The free-list head address for a given size class (0 means empty).
    pub fn free_head(&self, class: SizeClass) -> Addr {
        let bytes = match class {
            SizeClass::Pg => &self.free_pg,
            SizeClass::T1 => &self.free_t1,
            SizeClass::T2 => &self.free_t2,
            SizeClass::T3 => &self.free_t3,
            SizeClass::T4 => &self.free_t4,
        };
        u64::from_le_bytes(*bytes)
    }

    pub fn set_free_head(&mut self, class: SizeClass, addr: Addr) {
        let bytes = addr.to_le_bytes();
        match class {
            SizeClass::Pg => self.free_pg = bytes,
            SizeClass::T1 => self.free_t1 = bytes,
            SizeClass::T2 => self.free_t2 = bytes,
            SizeClass::T3 => self.free_t3 = bytes,
            SizeClass::T4 => self.free_t4 = bytes,
        }
    }
}

/// The 8-byte header stored at the front of every allocated or free block:
/// high byte is the size class's type tag, low 7 bytes hold the packed
/// `next` pointer (page number in bits 0..52, in-page slot in bits 52..56)
/// used while the block sits on a free list.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockHeader {
    data: [u8; 8],
}

const PAGE_MASK: u64 = (1 << 52) - 1;

impl BlockHeader {
    /// Build a header tagging a block of `class` whose free-list `next` is
    /// `next`, encoding `next`'s page number and in-page slot.
    pub fn new(class: SizeClass, next: Option<Addr>) -> Self {
        let encoded = match next {
            None => 0u64,
            Some(addr) => {
                let page = crate::addr::page_nr(addr);
                let slot = class.slot_of(addr);
                (page & PAGE_MASK) | (slot << 52)
            }
        };
        let mut data = encoded.to_le_bytes();
        data[7] = class.type_byte();
        Self { data }
    }

    pub fn class(&self) -> Result<SizeClass> {
        SizeClass::from_type_byte(self.data[7])
    }

    /// Decode the free-list `next` pointer, `None` if this is the list's
    /// tail.
    pub fn next(&self) -> Result<Option<Addr>> {
        let class = self.class()?;
        let mut raw = self.data;
        raw[7] = 0;
        let encoded = u64::from_le_bytes(raw);
        if encoded == 0 {
            return Ok(None);
        }
        let page = encoded & PAGE_MASK;
        let slot = encoded >> 52;
        Ok(Some(class.addr(page, slot)))
    }

    pub fn set_next(&mut self, class: SizeClass, next: Option<Addr>) {
        *self = Self::new(class, next);
    }
}
