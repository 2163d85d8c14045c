//! The block allocator: binary-buddy-style splitting across the five size
//! classes, backed by the five free lists kept in the database header.
//!
//! Allocating a class whose free list is empty recursively allocates one
//! block of the next larger class, splits it in two, returns one half and
//! pushes the other onto the smaller class's free list. The recursion
//! bottoms out at `Pg`, where an empty free list means extending the file
//! by a fresh page. A single page extension can satisfy an unbounded
//! number of smaller allocations afterward, since every split but the last
//! leaves a spare half behind for next time.
//!
//! Freeing never coalesces buddies back together; it just prepends the
//! freed block to its class's free list. Fragmentation this causes is
//! bounded by the five-class granularity and is the tradeoff the format
//! makes for O(1), lock-held-briefly allocation and free.

use bytemuck::{bytes_of, pod_read_unaligned};

use crate::addr::{page_nr, page_offset, Addr, SizeClass};
use crate::cache::PageCache;
use crate::error::Result;
use crate::header::{BlockHeader, DbHeader};

/// Allocate one block of `class`, splitting or extending the file as
/// needed. `quantum_bytes` is how much to grow the mapped region by when a
/// new page must be mapped (see [`crate::config::Config::extension_quantum_pages`]).
pub fn allocate(
    header: &mut DbHeader,
    cache: &PageCache,
    class: SizeClass,
    quantum_bytes: u64,
) -> Result<Addr> {
    if let Some(addr) = pop_free(header, cache, class)? {
        return Ok(addr);
    }
    match class.parent() {
        None => extend_new_page(header, cache, quantum_bytes),
        Some(parent) => {
            let parent_addr = allocate(header, cache, parent, quantum_bytes)?;
            let page = page_nr(parent_addr);
            let parent_slot = parent.slot_of(parent_addr);
            let addr_a = class.addr(page, parent_slot * 2);
            let addr_b = class.addr(page, parent_slot * 2 + 1);
            write_block_header(cache, addr_a, BlockHeader::new(class, None))?;
            push_free(header, cache, class, addr_b)?;
            Ok(addr_a)
        }
    }
}

/// Return a previously allocated block to its free list, reading its size
/// class from its own block header's type byte rather than trusting the
/// caller to know it.
///
/// Still can't detect a double-free or a free of an address that was never
/// allocated at all (its header byte, whatever it happens to be, is taken at
/// face value); it can only reject a header whose type byte doesn't decode
/// to any class.
pub fn free(header: &mut DbHeader, cache: &PageCache, addr: Addr) -> Result<()> {
    let class = read_block_header(cache, addr)?.class()?;
    push_free(header, cache, class, addr)
}

fn pop_free(header: &mut DbHeader, cache: &PageCache, class: SizeClass) -> Result<Option<Addr>> {
    let head = header.free_head(class);
    if head == 0 {
        return Ok(None);
    }
    let next = read_block_header(cache, head)?.next()?;
    header.set_free_head(class, next.unwrap_or(0));
    Ok(Some(head))
}

fn push_free(header: &mut DbHeader, cache: &PageCache, class: SizeClass, addr: Addr) -> Result<()> {
    let current_head = header.free_head(class);
    let next = if current_head == 0 {
        None
    } else {
        Some(current_head)
    };
    write_block_header(cache, addr, BlockHeader::new(class, next))?;
    header.set_free_head(class, addr);
    Ok(())
}

fn extend_new_page(header: &mut DbHeader, cache: &PageCache, quantum_bytes: u64) -> Result<Addr> {
    let addr = header.end_of_file();
    let new_eof = addr + crate::addr::PAGE_SIZE as u64;
    cache.ensure_mapped(new_eof, quantum_bytes)?;
    header.set_end_of_file(new_eof);
    write_block_header(cache, addr, BlockHeader::new(SizeClass::Pg, None))?;
    Ok(addr)
}

fn read_block_header(cache: &PageCache, addr: Addr) -> Result<BlockHeader> {
    let page = page_nr(addr);
    let offset = page_offset(addr) as usize;
    let page_ref = cache.read(page)?;
    Ok(pod_read_unaligned(&page_ref.as_slice()[offset..offset + 8]))
}

fn write_block_header(cache: &PageCache, addr: Addr, header: BlockHeader) -> Result<()> {
    let page = page_nr(addr);
    let offset = page_offset(addr) as usize;
    let mut page_ref = cache.write(page)?;
    page_ref.as_mut_slice()[offset..offset + 8].copy_from_slice(bytes_of(&header));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PAGE_SIZE;
    use crate::cache::MappedStorage;
    use std::collections::HashSet;

    fn new_cache(pages: u64) -> PageCache {
        let storage = MappedStorage::open_anon(pages * PAGE_SIZE as u64).unwrap();
        PageCache::new(storage, 64)
    }

    #[test]
    fn allocating_one_full_page_extends_the_file_once() {
        let cache = new_cache(1);
        let mut header = DbHeader::new(PAGE_SIZE as u64);
        let addr = allocate(&mut header, &cache, SizeClass::Pg, PAGE_SIZE as u64).unwrap();
        assert_eq!(addr, PAGE_SIZE as u64);
        assert_eq!(header.end_of_file(), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn sixteen_t4_allocations_consume_exactly_one_page() {
        let cache = new_cache(1);
        let mut header = DbHeader::new(PAGE_SIZE as u64);
        let mut seen = HashSet::new();
        for _ in 0..16 {
            let addr =
                allocate(&mut header, &cache, SizeClass::T4, PAGE_SIZE as u64).unwrap();
            assert!(seen.insert(addr), "each allocation must be distinct");
        }
        // Exactly one page was ever mapped in: all T4 free lists should now
        // be empty again and no page beyond the first was touched.
        assert_eq!(header.end_of_file(), 2 * PAGE_SIZE as u64);
        assert_eq!(header.free_head(SizeClass::T4), 0);
        assert_eq!(header.free_head(SizeClass::T3), 0);
        assert_eq!(header.free_head(SizeClass::T2), 0);
        assert_eq!(header.free_head(SizeClass::T1), 0);
    }

    #[test]
    fn freed_block_is_reused_before_extending_again() {
        let cache = new_cache(1);
        let mut header = DbHeader::new(PAGE_SIZE as u64);
        let a = allocate(&mut header, &cache, SizeClass::T4, PAGE_SIZE as u64).unwrap();
        free(&mut header, &cache, a).unwrap();
        let eof_before = header.end_of_file();
        let b = allocate(&mut header, &cache, SizeClass::T4, PAGE_SIZE as u64).unwrap();
        assert_eq!(a, b);
        assert_eq!(header.end_of_file(), eof_before);
    }

    #[test]
    fn a_freed_page_class_block_is_not_split() {
        let cache = new_cache(2);
        let mut header = DbHeader::new(PAGE_SIZE as u64);
        let p1 = allocate(&mut header, &cache, SizeClass::Pg, PAGE_SIZE as u64).unwrap();
        free(&mut header, &cache, p1).unwrap();
        let p2 = allocate(&mut header, &cache, SizeClass::Pg, PAGE_SIZE as u64).unwrap();
        assert_eq!(p1, p2);
    }

    /// A block handed out by a split, never freed before, must already carry
    /// its own class's type byte: `free` has nothing but that byte to go on.
    #[test]
    fn split_allocated_block_is_self_describing_before_any_free() {
        let cache = new_cache(1);
        let mut header = DbHeader::new(PAGE_SIZE as u64);
        let addr = allocate(&mut header, &cache, SizeClass::T3, PAGE_SIZE as u64).unwrap();
        assert_eq!(read_block_header(&cache, addr).unwrap().class().unwrap(), SizeClass::T3);
        free(&mut header, &cache, addr).unwrap();
        let addr2 = allocate(&mut header, &cache, SizeClass::T3, PAGE_SIZE as u64).unwrap();
        assert_eq!(addr, addr2);
    }

    #[test]
    fn free_rejects_an_address_with_no_recognizable_block_header() {
        let cache = new_cache(1);
        let mut header = DbHeader::new(PAGE_SIZE as u64);
        // Untouched region of the header page: all zero bytes, not a valid
        // type tag for any size class.
        let addr = SizeClass::T4.addr(0, 15);
        assert!(free(&mut header, &cache, addr).is_err());
    }
}
