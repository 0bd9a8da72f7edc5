//! Access arbiter: shared/exclusive byte-range leases
//!
//! Transactions never touch block bytes directly; they hold a [`Lease`]
//! over a `[offset, offset+length)` span first. Any number of shared
//! leases may overlap; a writable lease admits no overlapping lease of
//! either kind, so no reader can observe a partial write within a span.
//! Conflicts refuse rather than block; critical sections are short, so
//! the blocking variant simply retries.
//!
//! The lease carries a cursor relative to its own zero point and typed
//! little-endian accessors. Reads and writes past the boundary fail with
//! `OutOfBounds`; writes through a read-only lease fail with
//! `NotWritable`. The span and the underlying block pin are released on
//! every exit path via `Drop`.

use crate::block::{Key, BLOCK_SIZE};
use crate::cache::BlockGuard;
use crate::error::{Result, StoreError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: u32,
    length: u32,
    writable: bool,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.offset < other.offset + other.length && other.offset < self.offset + self.length
    }
}

#[derive(Default)]
struct TableState {
    spans: Vec<Span>,
    /// Set under this mutex when the table is unmapped; a late inserter
    /// holding a stale `Arc` must refetch instead of landing a span no
    /// future overlap scan would see.
    retired: bool,
}

#[derive(Default)]
struct LeaseTable {
    state: Mutex<TableState>,
}

enum Insert {
    Granted,
    Conflict,
    Retired,
}

impl LeaseTable {
    fn try_insert(&self, span: Span) -> Insert {
        let mut state = self.state.lock();
        if state.retired {
            return Insert::Retired;
        }
        let conflict = state
            .spans
            .iter()
            .any(|held| held.overlaps(&span) && (held.writable || span.writable));
        if conflict {
            return Insert::Conflict;
        }
        let at = state.spans.partition_point(|held| held.offset <= span.offset);
        state.spans.insert(at, span);
        Insert::Granted
    }

    /// Removes the span; returns the number of spans left.
    fn remove(&self, span: Span) -> usize {
        let mut state = self.state.lock();
        let at = state.spans.iter().position(|held| *held == span);
        debug_assert!(at.is_some(), "released a never-acquired lease");
        if let Some(at) = at {
            state.spans.remove(at);
        }
        state.spans.len()
    }
}

/// Grants byte-range leases per block
pub(crate) struct AccessArbiter {
    tables: RwLock<HashMap<u32, Arc<LeaseTable>>>,
}

impl AccessArbiter {
    pub(crate) fn new() -> Self {
        AccessArbiter {
            tables: RwLock::new(HashMap::new()),
        }
    }

    fn table_for(&self, radical: u32) -> Arc<LeaseTable> {
        if let Some(table) = self.tables.read().get(&radical) {
            return table.clone();
        }
        self.tables
            .write()
            .entry(radical)
            .or_insert_with(|| Arc::new(LeaseTable::default()))
            .clone()
    }

    fn release(&self, radical: u32, table: &Arc<LeaseTable>, span: Span) {
        if table.remove(span) != 0 {
            return;
        }
        // Drop empty tables so the map tracks only blocks under lease. The
        // table is retired under its own mutex while the map write lock is
        // held, so an in-flight inserter either lands its span first (and
        // the table stays mapped) or sees `retired` and refetches.
        let mut tables = self.tables.write();
        if let Some(current) = tables.get(&radical) {
            if Arc::ptr_eq(current, table) {
                let mut state = table.state.lock();
                if state.spans.is_empty() {
                    state.retired = true;
                    drop(state);
                    tables.remove(&radical);
                }
            }
        }
    }

    /// Attempt a lease; refuses with `LeaseConflict` when the writer
    /// exclusivity rule would be violated.
    pub(crate) fn try_begin<'a>(
        &'a self,
        guard: BlockGuard<'a>,
        offset: usize,
        length: usize,
        writable: bool,
    ) -> std::result::Result<Lease<'a>, (BlockGuard<'a>, StoreError)> {
        if offset + length > BLOCK_SIZE {
            return Err((
                guard,
                StoreError::bad_state(format!(
                    "lease span [{offset}, +{length}) exceeds block size"
                )),
            ));
        }
        let span = Span {
            offset: offset as u32,
            length: length as u32,
            writable,
        };
        let table = loop {
            let table = self.table_for(guard.radical());
            match table.try_insert(span) {
                Insert::Granted => break table,
                Insert::Conflict => {
                    return Err((guard, StoreError::LeaseConflict { offset, length }));
                }
                // Raced with the unmapping of an emptied table; fetch the
                // live one.
                Insert::Retired => continue,
            }
        };
        Ok(Lease {
            arbiter: self,
            table,
            guard,
            span,
            pos: 0,
            wrote: false,
        })
    }

    /// Lease a span, retrying past conflicts (short critical sections make
    /// retries cheap; nothing suspends on a condition variable).
    pub(crate) fn begin<'a>(
        &'a self,
        mut guard: BlockGuard<'a>,
        offset: usize,
        length: usize,
        writable: bool,
    ) -> Result<Lease<'a>> {
        let mut spins = 0u32;
        loop {
            match self.try_begin(guard, offset, length, writable) {
                Ok(lease) => return Ok(lease),
                Err((returned, StoreError::LeaseConflict { .. })) => {
                    guard = returned;
                    spins += 1;
                    if spins % 64 == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                Err((_, e)) => return Err(e),
            }
        }
    }

    /// Number of blocks with at least one active lease (test visibility)
    #[cfg(test)]
    pub(crate) fn blocks_under_lease(&self) -> usize {
        self.tables.read().len()
    }
}

/// A granted read or read-write window over a byte span of one block
pub(crate) struct Lease<'a> {
    arbiter: &'a AccessArbiter,
    table: Arc<LeaseTable>,
    guard: BlockGuard<'a>,
    span: Span,
    pos: u32,
    wrote: bool,
}

macro_rules! lease_rw {
    ($read:ident, $write:ident, $ty:ty) => {
        pub(crate) fn $read(&mut self) -> Result<$ty> {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            self.read_exact(&mut raw)?;
            Ok(<$ty>::from_le_bytes(raw))
        }

        pub(crate) fn $write(&mut self, value: $ty) -> Result<()> {
            self.write_all(&value.to_le_bytes())
        }
    };
}

impl<'a> Lease<'a> {
    /// Length of the leased span
    pub(crate) fn len(&self) -> usize {
        self.span.length as usize
    }

    pub(crate) fn position(&self) -> usize {
        self.pos as usize
    }

    pub(crate) fn remaining(&self) -> usize {
        (self.span.length - self.pos) as usize
    }

    pub(crate) fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.span.length as usize {
            return Err(StoreError::OutOfBounds {
                position: pos,
                len: 0,
                limit: self.span.length as usize,
            });
        }
        self.pos = pos as u32;
        Ok(())
    }

    fn check(&self, len: usize) -> Result<*mut u8> {
        if self.pos as usize + len > self.span.length as usize {
            return Err(StoreError::OutOfBounds {
                position: self.pos as usize,
                len,
                limit: self.span.length as usize,
            });
        }
        let at = self.span.offset as usize + self.pos as usize;
        Ok(unsafe { self.guard.as_ptr().add(at) })
    }

    pub(crate) fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let src = self.check(out.len())?;
        // Safety: span bounds checked above; the arbiter guarantees no
        // writable lease overlaps this span while we hold it.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        self.pos += out.len() as u32;
        Ok(())
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        let mut out = vec![0u8; len];
        self.read_exact(&mut out)?;
        Ok(Bytes::from(out))
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if !self.span.writable {
            return Err(StoreError::NotWritable);
        }
        let dst = self.check(data.len())?;
        // Safety: bounds checked; writable leases are exclusive over their
        // span, so no concurrent access observes a partial write.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        self.pos += data.len() as u32;
        self.wrote = true;
        Ok(())
    }

    lease_rw!(read_u8, write_u8, u8);
    lease_rw!(read_u16, write_u16, u16);
    lease_rw!(read_u32, write_u32, u32);
    lease_rw!(read_u64, write_u64, u64);
    lease_rw!(read_i64, write_i64, i64);
    lease_rw!(read_f32, write_f32, f32);
    lease_rw!(read_f64, write_f64, f64);

    pub(crate) fn read_key(&mut self) -> Result<Key> {
        Ok(Key::from_raw(self.read_u64()?))
    }

    pub(crate) fn write_key(&mut self, key: Key) -> Result<()> {
        self.write_u64(key.raw())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.wrote {
            self.guard.mark_dirty();
        }
        self.arbiter
            .release(self.guard.radical(), &self.table, self.span);
    }
}
