//! Bounded block cache
//!
//! Multiplexes block I/O for one file set through a fixed pool of slots.
//! Each slot runs a lock-free state machine in a single atomic word:
//!
//! ```text
//! FREE -> RESERVED -> READY -> { SHARED(n) | EXCLUSIVE }
//! ```
//!
//! `FREE -> RESERVED` is won by exactly one caller via compare-exchange;
//! the winner loads bytes (zero-filling past EOF) and publishes `READY`.
//! Misses for the same block serialize on a lock striped by radical, so a
//! block is never resident in two slots at once. Shared use counts pinners
//! in the low half of the state word; exclusive use requires an idle
//! `READY` slot and is taken only for write-back. When the pool is full
//! the oldest idle slot is flushed and unassigned, and the caller retries
//! reservation.

use crate::block::{RawBlock, BLOCK_SIZE, NO_RADICAL};
use crate::error::Result;
use crate::files::FileSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

const TAG_FREE: u64 = 0;
const TAG_RESERVED: u64 = 1;
const TAG_READY: u64 = 2;
const TAG_EXCLUSIVE: u64 = 3;

const TAG_SHIFT: u32 = 32;
const COUNT_MASK: u64 = 0xFFFF_FFFF;

fn pack(tag: u64, count: u64) -> u64 {
    (tag << TAG_SHIFT) | count
}

fn tag_of(state: u64) -> u64 {
    state >> TAG_SHIFT
}

fn count_of(state: u64) -> u64 {
    state & COUNT_MASK
}

struct Slot {
    state: AtomicU64,
    radical: AtomicU32,
    last_hit: AtomicU64,
    dirty: AtomicBool,
    block: RawBlock,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: AtomicU64::new(pack(TAG_FREE, 0)),
            radical: AtomicU32::new(NO_RADICAL),
            last_hit: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            block: RawBlock::new(),
        }
    }
}

/// Cache counters, sampled without locking
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Block acquisitions served from a resident slot
    pub hits: u64,
    /// Block acquisitions that had to load from disk
    pub misses: u64,
    /// Slots reclaimed under pool pressure
    pub reclaims: u64,
    /// Dirty blocks written back
    pub write_backs: u64,
}

#[derive(Default)]
struct StatCells {
    hits: AtomicU64,
    misses: AtomicU64,
    reclaims: AtomicU64,
    write_backs: AtomicU64,
}

const MISS_STRIPES: usize = 16;

/// Bounded pool of block slots over one file set
pub(crate) struct BlockCache {
    files: Arc<FileSet>,
    slots: Box<[Slot]>,
    miss_locks: Box<[Mutex<()>]>,
    clock: AtomicU64,
    stats: StatCells,
}

impl BlockCache {
    pub(crate) fn new(files: Arc<FileSet>, capacity: usize) -> Self {
        let slots = (0..capacity.max(2)).map(|_| Slot::new()).collect();
        let miss_locks = (0..MISS_STRIPES).map(|_| Mutex::new(())).collect();
        BlockCache {
            files,
            slots,
            miss_locks,
            clock: AtomicU64::new(1),
            stats: StatCells::default(),
        }
    }

    /// Pin the block covering `radical` shared, loading it if absent.
    pub(crate) fn acquire(&self, radical: u32) -> Result<BlockGuard<'_>> {
        debug_assert_ne!(radical, NO_RADICAL);
        let mut spins = 0u32;
        loop {
            // Resident fast path.
            if let Some(index) = self.find_resident(radical) {
                match self.try_pin(index, radical) {
                    PinOutcome::Pinned => {
                        self.touch(index);
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(BlockGuard {
                            cache: self,
                            index,
                            radical,
                        });
                    }
                    PinOutcome::Busy => {
                        backoff(&mut spins);
                        continue;
                    }
                    PinOutcome::Gone => continue,
                }
            }

            // Miss: reserve a free slot, or make one by reclaiming. Loads
            // serialize on a lock striped by radical, so a block is only
            // ever resident in a single slot at a time.
            {
                let stripe = radical as usize % self.miss_locks.len();
                let _loading = self.miss_locks[stripe].lock();
                if self.find_resident(radical).is_some() {
                    // Lost the load race; pin via the resident path.
                    continue;
                }
                if let Some(index) = self.reserve_free(radical) {
                    self.load(index, radical)?;
                    self.touch(index);
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(BlockGuard {
                        cache: self,
                        index,
                        radical,
                    });
                }
            }

            self.reclaim_one()?;
            backoff(&mut spins);
        }
    }

    fn find_resident(&self, radical: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.radical.load(Ordering::Acquire) == radical)
    }

    fn try_pin(&self, index: usize, radical: u32) -> PinOutcome {
        let slot = &self.slots[index];
        loop {
            let state = slot.state.load(Ordering::Acquire);
            match tag_of(state) {
                TAG_READY => {
                    let next = pack(TAG_READY, count_of(state) + 1);
                    if slot
                        .state
                        .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // The slot may have been reassigned between the scan
                        // and the pin; verify and back out if so.
                        if slot.radical.load(Ordering::Acquire) == radical {
                            return PinOutcome::Pinned;
                        }
                        self.release_shared(index);
                        return PinOutcome::Gone;
                    }
                }
                TAG_RESERVED | TAG_EXCLUSIVE => return PinOutcome::Busy,
                _ => return PinOutcome::Gone,
            }
        }
    }

    fn reserve_free(&self, radical: u32) -> Option<usize> {
        for (index, slot) in self.slots.iter().enumerate() {
            let free = pack(TAG_FREE, 0);
            if slot
                .state
                .compare_exchange(free, pack(TAG_RESERVED, 0), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.radical.store(radical, Ordering::Release);
                return Some(index);
            }
        }
        None
    }

    fn abandon(&self, index: usize) {
        let slot = &self.slots[index];
        slot.radical.store(NO_RADICAL, Ordering::Release);
        slot.state.store(pack(TAG_FREE, 0), Ordering::Release);
    }

    /// Load bytes into a slot we hold in RESERVED, publishing READY pinned
    /// once by the caller. On I/O failure the slot returns to FREE so the
    /// state machine never sticks mid-transition.
    fn load(&self, index: usize, radical: u32) -> Result<()> {
        let slot = &self.slots[index];
        // Safety: RESERVED grants this thread sole ownership of the buffer.
        let buf = unsafe { slot.block.buf_mut() };
        if let Err(e) = self.files.read_block(radical, buf) {
            self.abandon(index);
            return Err(e);
        }
        slot.dirty.store(false, Ordering::Release);
        slot.state.store(pack(TAG_READY, 1), Ordering::Release);
        Ok(())
    }

    /// Flush and unassign the oldest idle slot, making room for a retry.
    /// Losing every race this round is fine; the acquire loop retries.
    fn reclaim_one(&self) -> Result<()> {
        let mut victim: Option<(usize, u64)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.state.load(Ordering::Acquire) != pack(TAG_READY, 0) {
                continue;
            }
            let hit = slot.last_hit.load(Ordering::Acquire);
            if victim.map_or(true, |(_, best)| hit < best) {
                victim = Some((index, hit));
            }
        }
        let Some((index, _)) = victim else {
            return Ok(());
        };
        let slot = &self.slots[index];
        if slot
            .state
            .compare_exchange(
                pack(TAG_READY, 0),
                pack(TAG_EXCLUSIVE, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }
        let radical = slot.radical.load(Ordering::Acquire);
        if slot.dirty.load(Ordering::Acquire) {
            // Safety: EXCLUSIVE grants sole ownership for write-back.
            let buf = unsafe { slot.block.buf() };
            if let Err(e) = self.files.write_block(radical, buf) {
                // Leave the slot resident and READY; the data is intact.
                slot.state.store(pack(TAG_READY, 0), Ordering::Release);
                return Err(e);
            }
            slot.dirty.store(false, Ordering::Release);
            self.stats.write_backs.fetch_add(1, Ordering::Relaxed);
        }
        trace!(radical, "reclaimed cache slot");
        self.stats.reclaims.fetch_add(1, Ordering::Relaxed);
        self.abandon(index);
        Ok(())
    }

    fn touch(&self, index: usize) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        self.slots[index].last_hit.store(stamp, Ordering::Release);
    }

    fn release_shared(&self, index: usize) {
        let prev = self.slots[index].state.fetch_sub(1, Ordering::AcqRel);
        debug_assert_eq!(tag_of(prev), TAG_READY);
        debug_assert!(count_of(prev) > 0, "release of a never-acquired block");
    }

    pub(crate) fn mark_dirty(&self, index: usize) {
        self.slots[index].dirty.store(true, Ordering::Release);
    }

    /// Write back every dirty block. Spins past transient pins; callers
    /// invoke this at quiescent points (flush, close).
    pub(crate) fn flush_all(&self) -> Result<()> {
        for slot in self.slots.iter() {
            let mut spins = 0u32;
            loop {
                if !slot.dirty.load(Ordering::Acquire) {
                    break;
                }
                if slot
                    .state
                    .compare_exchange(
                        pack(TAG_READY, 0),
                        pack(TAG_EXCLUSIVE, 0),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let radical = slot.radical.load(Ordering::Acquire);
                    // Safety: EXCLUSIVE grants sole ownership for write-back.
                    let buf = unsafe { slot.block.buf() };
                    let written = self.files.write_block(radical, buf);
                    if written.is_ok() {
                        slot.dirty.store(false, Ordering::Release);
                        self.stats.write_backs.fetch_add(1, Ordering::Relaxed);
                    }
                    slot.state.store(pack(TAG_READY, 0), Ordering::Release);
                    written?;
                    break;
                }
                backoff(&mut spins);
            }
        }
        self.files.sync()
    }

    /// Number of slots currently mapped to a block
    pub(crate) fn resident(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.radical.load(Ordering::Acquire) != NO_RADICAL)
            .count()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            reclaims: self.stats.reclaims.load(Ordering::Relaxed),
            write_backs: self.stats.write_backs.load(Ordering::Relaxed),
        }
    }
}

enum PinOutcome {
    Pinned,
    Busy,
    Gone,
}

fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins % 64 == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// Shared pin on a resident block; drop releases.
pub(crate) struct BlockGuard<'a> {
    cache: &'a BlockCache,
    index: usize,
    radical: u32,
}

impl BlockGuard<'_> {
    pub(crate) fn radical(&self) -> u32 {
        self.radical
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.cache.slots[self.index].block.as_ptr()
    }

    pub(crate) fn mark_dirty(&self) {
        self.cache.mark_dirty(self.index);
    }

    pub(crate) fn len(&self) -> usize {
        BLOCK_SIZE
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.cache.release_shared(self.index);
    }
}
