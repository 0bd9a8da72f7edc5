//! Page-level record allocator
//!
//! A block doubles as a self-describing page: a fixed header, an entry
//! table growing downward from it, and payloads carved upward from the end
//! of the block. Entries are addressed by `(page, index)` keys; freeing
//! zeroes an entry's offset and shrinks the table only from its tail, so
//! keys held elsewhere stay valid for the lifetime of the page.
//!
//! On-disk layout: header `version(2)|flags(2)|entry_count(2)|
//! free_space(2)|data_off(2)`, entry descriptor `offset(2)|length(2)`.
//! Invariant at all times:
//! `entry_table_end <= free_space <= data_off <= BLOCK_SIZE`.

use crate::arbiter::{AccessArbiter, Lease};
use crate::block::{Key, BLOCK_SIZE};
use crate::cache::{BlockCache, CacheStats};
use crate::error::{Result, StoreError};
use crate::files::FileSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// On-disk page format version
const PAGE_VERSION: u16 = 1;

/// Reuse freed entry-table slots on allocation
const FLAG_REUSE: u16 = 0x0001;

/// Header bytes: version, flags, entry_count, free_space, data_off
pub(crate) const HEADER_SIZE: usize = 10;

/// Entry descriptor bytes: offset, length
const ENTRY_SIZE: usize = 4;

/// Largest payload a single entry can hold
pub(crate) const MAX_ENTRY_SIZE: usize = BLOCK_SIZE - HEADER_SIZE - ENTRY_SIZE;

#[derive(Debug, Clone, Copy)]
struct PageHeader {
    version: u16,
    flags: u16,
    entry_count: u16,
    free_space: u16,
    data_off: u16,
}

impl PageHeader {
    fn read(lease: &mut Lease<'_>) -> Result<Self> {
        lease.seek(0)?;
        Ok(PageHeader {
            version: lease.read_u16()?,
            flags: lease.read_u16()?,
            entry_count: lease.read_u16()?,
            free_space: lease.read_u16()?,
            data_off: lease.read_u16()?,
        })
    }

    fn write(&self, lease: &mut Lease<'_>) -> Result<()> {
        lease.seek(0)?;
        lease.write_u16(self.version)?;
        lease.write_u16(self.flags)?;
        lease.write_u16(self.entry_count)?;
        lease.write_u16(self.free_space)?;
        lease.write_u16(self.data_off)
    }

    fn gap(&self) -> usize {
        self.data_off as usize - self.free_space as usize
    }
}

/// Variable-length record allocator over one file set
pub(crate) struct PageAllocator {
    cache: BlockCache,
    arbiter: AccessArbiter,
    /// Page current allocations target
    active: AtomicU32,
    /// Next never-used page number
    next_radical: AtomicU32,
    reuse: bool,
    fresh: bool,
}

impl PageAllocator {
    /// Open the allocator over `<dir>/<base>.NNN`, restoring the page count
    /// a previous run left behind.
    pub(crate) fn open(
        dir: &Path,
        base: &str,
        cache_capacity: usize,
        reuse: bool,
    ) -> Result<Self> {
        let files = Arc::new(FileSet::open(dir, base)?);
        let highest = files.highest_radical()?;
        let fresh = highest == 0;
        let active = highest.saturating_sub(1);
        debug!(base, pages = highest, "opened page allocator");
        Ok(PageAllocator {
            cache: BlockCache::new(files, cache_capacity),
            arbiter: AccessArbiter::new(),
            active: AtomicU32::new(active),
            next_radical: AtomicU32::new(highest.max(1)),
            reuse,
            fresh,
        })
    }

    /// True when open found no prior data (fixed low keys must be seeded)
    pub(crate) fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Lease an arbitrary span of a block
    fn lease(&self, radical: u32, offset: usize, length: usize, writable: bool) -> Result<Lease<'_>> {
        let guard = self.cache.acquire(radical)?;
        self.arbiter.begin(guard, offset, length, writable)
    }

    /// Allocate a `size`-byte record, returning its key. The payload is
    /// written afterwards through `access`.
    pub(crate) fn allocate(&self, size: usize) -> Result<Key> {
        if size == 0 || size > MAX_ENTRY_SIZE {
            return Err(StoreError::capacity(format!(
                "entry of {size} bytes exceeds maximum {MAX_ENTRY_SIZE}"
            )));
        }
        loop {
            let radical = self.active.load(Ordering::Acquire);
            if let Some(key) = self.try_allocate_in(radical, size)? {
                return Ok(key);
            }
            self.advance_active(radical)?;
        }
    }

    /// Attempt allocation in one page; `None` means the page cannot satisfy
    /// the request and the caller should move to a new page.
    fn try_allocate_in(&self, radical: u32, size: usize) -> Result<Option<Key>> {
        // The header lease serializes allocation on this page; descriptor
        // and payload spans are disjoint from it, so concurrent readers of
        // other entries are unaffected.
        let mut hdr_lease = self.lease(radical, 0, HEADER_SIZE, true)?;
        let mut header = PageHeader::read(&mut hdr_lease)?;
        if header.version == 0 {
            // Untouched page: self-describe it.
            header = PageHeader {
                version: PAGE_VERSION,
                flags: if self.reuse { FLAG_REUSE } else { 0 },
                entry_count: 0,
                free_space: HEADER_SIZE as u16,
                data_off: BLOCK_SIZE as u16,
            };
        } else if header.version != PAGE_VERSION {
            return Err(StoreError::bad_state(format!(
                "page {radical} version {} (expected {PAGE_VERSION})",
                header.version
            )));
        }

        let table_len = header.free_space as usize - HEADER_SIZE;

        // First fit over freed slots: the hole's index is reused, payload
        // is carved fresh from the gap.
        if header.flags & FLAG_REUSE != 0 && table_len > 0 && header.gap() >= size {
            let mut table = self.lease(radical, HEADER_SIZE, table_len, true)?;
            for index in 0..header.entry_count {
                table.seek(index as usize * ENTRY_SIZE)?;
                let offset = table.read_u16()?;
                if offset != 0 {
                    continue;
                }
                let payload = header.data_off as usize - size;
                table.seek(index as usize * ENTRY_SIZE)?;
                table.write_u16(payload as u16)?;
                table.write_u16(size as u16)?;
                header.data_off = payload as u16;
                header.write(&mut hdr_lease)?;
                return Ok(Some(Key::new(radical, index as u32)));
            }
        }

        // Append: one more descriptor below, payload carved above.
        if header.gap() < size + ENTRY_SIZE {
            return Ok(None);
        }
        let index = header.entry_count;
        let payload = header.data_off as usize - size;
        let slot = HEADER_SIZE + index as usize * ENTRY_SIZE;
        let mut desc = self.lease(radical, slot, ENTRY_SIZE, true)?;
        desc.write_u16(payload as u16)?;
        desc.write_u16(size as u16)?;
        header.entry_count += 1;
        header.free_space += ENTRY_SIZE as u16;
        header.data_off = payload as u16;
        header.write(&mut hdr_lease)?;
        Ok(Some(Key::new(radical, index as u32)))
    }

    /// Move allocation to a brand-new page, tolerating a concurrent winner.
    fn advance_active(&self, from: u32) -> Result<()> {
        if self.active.load(Ordering::Acquire) != from {
            return Ok(());
        }
        let next = self.next_radical.fetch_add(1, Ordering::AcqRel);
        if next == u32::MAX {
            return Err(StoreError::capacity("page key space exhausted"));
        }
        // A lost race leaves an unused page number behind; gaps are benign.
        let _ = self
            .active
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire);
        Ok(())
    }

    /// Free the entry named by `key`. Only trailing empty entries shrink
    /// the table, cascading through a run of them; interior holes persist
    /// until reused so `(page, index)` addresses held elsewhere stay valid.
    pub(crate) fn free(&self, key: Key) -> Result<()> {
        let radical = key.radical();
        let index = key.local() as usize;
        let mut hdr_lease = self.lease(radical, 0, HEADER_SIZE, true)?;
        let mut header = PageHeader::read(&mut hdr_lease)?;
        if header.version != PAGE_VERSION {
            return Err(StoreError::bad_state(format!("free of {key}: uninitialized page")));
        }
        if index >= header.entry_count as usize {
            return Err(StoreError::bad_state(format!("free of {key}: no such entry")));
        }
        let table_len = header.free_space as usize - HEADER_SIZE;
        let mut table = self.lease(radical, HEADER_SIZE, table_len, true)?;
        table.seek(index * ENTRY_SIZE)?;
        let offset = table.read_u16()?;
        if offset == 0 {
            return Err(StoreError::bad_state(format!("double free of {key}")));
        }
        table.seek(index * ENTRY_SIZE)?;
        table.write_u16(0)?;

        while header.entry_count > 0 {
            let last = header.entry_count as usize - 1;
            table.seek(last * ENTRY_SIZE)?;
            if table.read_u16()? != 0 {
                break;
            }
            header.entry_count -= 1;
            header.free_space -= ENTRY_SIZE as u16;
        }
        if header.entry_count == 0 {
            // Page emptied out entirely; its payload space comes back.
            header.data_off = BLOCK_SIZE as u16;
        }
        header.write(&mut hdr_lease)
    }

    /// Lease the payload of an entry, cursor at its first byte.
    pub(crate) fn access(&self, key: Key, writable: bool) -> Result<Lease<'_>> {
        if key.is_null() {
            return Err(StoreError::bad_state("access through null key"));
        }
        let radical = key.radical();
        let index = key.local() as usize;
        let (offset, length) = {
            let mut hdr_lease = self.lease(radical, 0, HEADER_SIZE, false)?;
            let header = PageHeader::read(&mut hdr_lease)?;
            if header.version != PAGE_VERSION {
                return Err(StoreError::bad_state(format!("access of {key}: uninitialized page")));
            }
            if index >= header.entry_count as usize {
                return Err(StoreError::bad_state(format!("access of {key}: no such entry")));
            }
            let slot = HEADER_SIZE + index * ENTRY_SIZE;
            let mut desc = self.lease(radical, slot, ENTRY_SIZE, false)?;
            (desc.read_u16()? as usize, desc.read_u16()? as usize)
        };
        if offset == 0 {
            return Err(StoreError::bad_state(format!("access of freed entry {key}")));
        }
        self.lease(radical, offset, length, writable)
    }

    /// Write back all dirty blocks and sync the backing files.
    pub(crate) fn flush(&self) -> Result<()> {
        self.cache.flush_all()
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[cfg(test)]
    fn check_invariants(&self, radical: u32) -> Result<()> {
        let mut hdr_lease = self.lease(radical, 0, HEADER_SIZE, false)?;
        let header = PageHeader::read(&mut hdr_lease)?;
        drop(hdr_lease);
        let table_end = HEADER_SIZE + header.entry_count as usize * ENTRY_SIZE;
        assert!(table_end <= header.free_space as usize);
        assert!(header.free_space <= header.data_off);
        assert!(header.data_off as usize <= BLOCK_SIZE);
        if header.entry_count > 0 {
            let table_len = header.free_space as usize - HEADER_SIZE;
            let mut table = self.lease(radical, HEADER_SIZE, table_len, false)?;
            for index in 0..header.entry_count as usize {
                table.seek(index * ENTRY_SIZE)?;
                let offset = table.read_u16()? as usize;
                let length = table.read_u16()? as usize;
                if offset != 0 {
                    assert!(offset >= header.data_off as usize);
                    assert!(offset + length <= BLOCK_SIZE);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_allocator(reuse: bool) -> (TempDir, PageAllocator) {
        let dir = TempDir::new().unwrap();
        let alloc = PageAllocator::open(dir.path(), "data", 16, reuse).unwrap();
        (dir, alloc)
    }

    #[test]
    fn test_allocate_write_read() {
        let (_dir, alloc) = test_allocator(true);
        let key = alloc.allocate(16).unwrap();
        {
            let mut lease = alloc.access(key, true).unwrap();
            lease.write_u64(0xDEAD_BEEF).unwrap();
        }
        let mut lease = alloc.access(key, false).unwrap();
        assert_eq!(lease.read_u64().unwrap(), 0xDEAD_BEEF);
        assert_eq!(lease.len(), 16);
    }

    #[test]
    fn test_keys_are_page_and_index() {
        let (_dir, alloc) = test_allocator(true);
        let a = alloc.allocate(8).unwrap();
        let b = alloc.allocate(8).unwrap();
        assert_eq!(a, Key::new(0, 0));
        assert_eq!(b, Key::new(0, 1));
    }

    #[test]
    fn test_free_then_reuse_same_index() {
        let (_dir, alloc) = test_allocator(true);
        let _keep = alloc.allocate(8).unwrap();
        let hole = alloc.allocate(8).unwrap();
        let _tail = alloc.allocate(8).unwrap();
        alloc.free(hole).unwrap();
        let reused = alloc.allocate(12).unwrap();
        assert_eq!(reused.local(), hole.local());
        alloc.check_invariants(0).unwrap();
    }

    #[test]
    fn test_no_reuse_without_flag() {
        let (_dir, alloc) = test_allocator(false);
        let _keep = alloc.allocate(8).unwrap();
        let hole = alloc.allocate(8).unwrap();
        let _tail = alloc.allocate(8).unwrap();
        alloc.free(hole).unwrap();
        let next = alloc.allocate(8).unwrap();
        assert_eq!(next.local(), 3);
    }

    #[test]
    fn test_trailing_free_shrinks_table() {
        let (_dir, alloc) = test_allocator(true);
        let a = alloc.allocate(8).unwrap();
        let b = alloc.allocate(8).unwrap();
        let c = alloc.allocate(8).unwrap();
        // Freeing b leaves an interior hole; freeing c cascades over it.
        alloc.free(b).unwrap();
        alloc.free(c).unwrap();
        alloc.check_invariants(0).unwrap();
        let next = alloc.allocate(8).unwrap();
        assert_eq!(next.local(), 1);
        alloc.free(a).unwrap();
        alloc.check_invariants(0).unwrap();
    }

    #[test]
    fn test_double_free_is_bad_state() {
        let (_dir, alloc) = test_allocator(true);
        let _keep = alloc.allocate(8).unwrap();
        let key = alloc.allocate(8).unwrap();
        alloc.free(key).unwrap();
        assert!(matches!(alloc.free(key), Err(StoreError::BadState(_))));
        assert!(matches!(
            alloc.access(key, false),
            Err(StoreError::BadState(_))
        ));
    }

    #[test]
    fn test_oversized_entry_refused() {
        let (_dir, alloc) = test_allocator(true);
        assert!(matches!(
            alloc.allocate(MAX_ENTRY_SIZE + 1),
            Err(StoreError::CapacityExceeded(_))
        ));
        assert!(alloc.allocate(MAX_ENTRY_SIZE).is_ok());
    }

    #[test]
    fn test_spills_to_new_page() {
        let (_dir, alloc) = test_allocator(true);
        let a = alloc.allocate(5000).unwrap();
        let b = alloc.allocate(5000).unwrap();
        assert_eq!(a.radical(), 0);
        assert_ne!(b.radical(), 0);
        alloc.check_invariants(a.radical()).unwrap();
        alloc.check_invariants(b.radical()).unwrap();
    }

    #[test]
    fn test_invariants_after_mixed_sequence() {
        let (_dir, alloc) = test_allocator(true);
        let mut live = Vec::new();
        for round in 0..200usize {
            let size = 8 + (round * 7) % 120;
            live.push(alloc.allocate(size).unwrap());
            if round % 3 == 0 {
                let victim = live.remove(round % live.len());
                alloc.free(victim).unwrap();
            }
        }
        let mut pages: Vec<u32> = live.iter().map(|k| k.radical()).collect();
        pages.sort_unstable();
        pages.dedup();
        for radical in pages {
            alloc.check_invariants(radical).unwrap();
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let key;
        {
            let alloc = PageAllocator::open(dir.path(), "data", 16, true).unwrap();
            assert!(alloc.is_fresh());
            key = alloc.allocate(8).unwrap();
            let mut lease = alloc.access(key, true).unwrap();
            lease.write_u64(99).unwrap();
            drop(lease);
            alloc.flush().unwrap();
        }
        let alloc = PageAllocator::open(dir.path(), "data", 16, true).unwrap();
        assert!(!alloc.is_fresh());
        let mut lease = alloc.access(key, false).unwrap();
        assert_eq!(lease.read_u64().unwrap(), 99);
        drop(lease);
        // New allocations continue past the restored state.
        let next = alloc.allocate(8).unwrap();
        assert_ne!(next, key);
    }
}
