//! Reverse graph index: graph -> subjects summary
//!
//! Each graph maps to a chain of fixed-capacity records grouping its
//! subjects by key radical:
//! `next(8) | radical(4) | used(4) | [subject_local(4) | multiplicity(4)] x 128`.
//! A slot with multiplicity 0 is vacant. Every primary-trie mutation
//! adjusts exactly one slot; a record unlinks when its last slot empties
//! and the graph leaves the root map when its chain empties, which is how
//! a graph is detected as drained.

use crate::block::Key;
use crate::error::{Result, StoreError};
use crate::page::PageAllocator;
use crate::pmap::PMap;
use std::sync::Arc;

const GRAPH_SLOTS: usize = 128;
const SLOTS_OFF: usize = 16;
const RECORD_BYTES: usize = SLOTS_OFF + GRAPH_SLOTS * 8;

enum Hit {
    /// Subject not in this record
    Miss,
    /// Slot adjusted, record still populated
    Done,
    /// Slot adjusted and the record emptied out
    RecordEmpty,
}

pub(crate) struct GraphIndex {
    alloc: Arc<PageAllocator>,
    map: PMap,
}

impl GraphIndex {
    pub(crate) fn new(alloc: Arc<PageAllocator>, root: Key) -> Self {
        GraphIndex {
            map: PMap::new(alloc.clone(), root),
            alloc,
        }
    }

    fn head(&self, graph: Key) -> Result<Key> {
        Ok(self.map.get(graph.raw())?.map_or(Key::NULL, Key::from_raw))
    }

    /// Record one more quad for `subject` in `graph`.
    pub(crate) fn bump(&self, graph: Key, subject: Key) -> Result<()> {
        let head = self.head(graph)?;

        // An occupied slot for this subject, anywhere in the chain.
        let mut at = head;
        while !at.is_null() {
            let next = {
                let mut lease = self.alloc.access(at, true)?;
                let next = lease.read_key()?;
                let radical = lease.read_u32()?;
                if radical == subject.radical() {
                    for slot in 0..GRAPH_SLOTS {
                        lease.seek(SLOTS_OFF + slot * 8)?;
                        let local = lease.read_u32()?;
                        let mult = lease.read_u32()?;
                        if mult > 0 && local == subject.local() {
                            lease.seek(SLOTS_OFF + slot * 8 + 4)?;
                            return lease.write_u32(mult + 1);
                        }
                    }
                }
                next
            };
            at = next;
        }

        // A vacant slot in a record already covering this radical.
        let mut at = head;
        while !at.is_null() {
            let next = {
                let mut lease = self.alloc.access(at, true)?;
                let next = lease.read_key()?;
                let radical = lease.read_u32()?;
                let used = lease.read_u32()?;
                if radical == subject.radical() && (used as usize) < GRAPH_SLOTS {
                    for slot in 0..GRAPH_SLOTS {
                        lease.seek(SLOTS_OFF + slot * 8 + 4)?;
                        if lease.read_u32()? == 0 {
                            lease.seek(SLOTS_OFF + slot * 8)?;
                            lease.write_u32(subject.local())?;
                            lease.write_u32(1)?;
                            lease.seek(12)?;
                            return lease.write_u32(used + 1);
                        }
                    }
                }
                next
            };
            at = next;
        }

        // Overflow: a fresh record becomes the chain head.
        let fresh = self.alloc.allocate(RECORD_BYTES)?;
        let mut buf = vec![0u8; RECORD_BYTES];
        buf[0..8].copy_from_slice(&head.raw().to_le_bytes());
        buf[8..12].copy_from_slice(&subject.radical().to_le_bytes());
        buf[12..16].copy_from_slice(&1u32.to_le_bytes());
        buf[SLOTS_OFF..SLOTS_OFF + 4].copy_from_slice(&subject.local().to_le_bytes());
        buf[SLOTS_OFF + 4..SLOTS_OFF + 8].copy_from_slice(&1u32.to_le_bytes());
        self.alloc.access(fresh, true)?.write_all(&buf)?;
        self.map.put(graph.raw(), fresh.raw())?;
        Ok(())
    }

    /// Drop one quad of `subject` from `graph`. True when the graph has no
    /// quads left at all.
    pub(crate) fn drop_one(&self, graph: Key, subject: Key) -> Result<bool> {
        let mut prev = Key::NULL;
        let mut at = self.head(graph)?;
        while !at.is_null() {
            let (next, hit) = self.drop_in_record(at, subject)?;
            match hit {
                Hit::Done => return Ok(false),
                Hit::RecordEmpty => {
                    if prev.is_null() {
                        if next.is_null() {
                            self.map.remove(graph.raw())?;
                            self.alloc.free(at)?;
                            return Ok(true);
                        }
                        self.map.put(graph.raw(), next.raw())?;
                    } else {
                        self.alloc.access(prev, true)?.write_key(next)?;
                    }
                    self.alloc.free(at)?;
                    return Ok(false);
                }
                Hit::Miss => {
                    prev = at;
                    at = next;
                }
            }
        }
        Err(StoreError::bad_state(format!(
            "subject {subject} not registered for graph {graph}"
        )))
    }

    fn drop_in_record(&self, at: Key, subject: Key) -> Result<(Key, Hit)> {
        let mut lease = self.alloc.access(at, true)?;
        let next = lease.read_key()?;
        let radical = lease.read_u32()?;
        let used = lease.read_u32()?;
        if radical != subject.radical() {
            return Ok((next, Hit::Miss));
        }
        for slot in 0..GRAPH_SLOTS {
            lease.seek(SLOTS_OFF + slot * 8)?;
            let local = lease.read_u32()?;
            let mult = lease.read_u32()?;
            if mult == 0 || local != subject.local() {
                continue;
            }
            if mult > 1 {
                lease.seek(SLOTS_OFF + slot * 8 + 4)?;
                lease.write_u32(mult - 1)?;
                return Ok((next, Hit::Done));
            }
            lease.seek(SLOTS_OFF + slot * 8)?;
            lease.write_u32(0)?;
            lease.write_u32(0)?;
            lease.seek(12)?;
            lease.write_u32(used - 1)?;
            let hit = if used == 1 { Hit::RecordEmpty } else { Hit::Done };
            return Ok((next, hit));
        }
        Ok((next, Hit::Miss))
    }

    /// Total quads in `graph`, counted with multiplicity.
    pub(crate) fn count(&self, graph: Key) -> Result<u64> {
        let mut total = 0u64;
        let mut at = self.head(graph)?;
        while !at.is_null() {
            let mut lease = self.alloc.access(at, false)?;
            let next = lease.read_key()?;
            for slot in 0..GRAPH_SLOTS {
                lease.seek(SLOTS_OFF + slot * 8 + 4)?;
                total += lease.read_u32()? as u64;
            }
            drop(lease);
            at = next;
        }
        Ok(total)
    }

    /// Keys of every subject with at least one quad in `graph`.
    pub(crate) fn subjects(&self, graph: Key) -> Result<Vec<Key>> {
        let mut out = Vec::new();
        let mut at = self.head(graph)?;
        while !at.is_null() {
            let mut lease = self.alloc.access(at, false)?;
            let next = lease.read_key()?;
            lease.seek(8)?;
            let radical = lease.read_u32()?;
            for slot in 0..GRAPH_SLOTS {
                lease.seek(SLOTS_OFF + slot * 8)?;
                let local = lease.read_u32()?;
                let mult = lease.read_u32()?;
                if mult > 0 {
                    out.push(Key::new(radical, local));
                }
            }
            drop(lease);
            at = next;
        }
        Ok(out)
    }
}
