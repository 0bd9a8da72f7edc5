//! Interned term storage: strings, literals, blank-node ids
//!
//! Strings bucket by a stable 32-bit content hash through a persisted map;
//! hash collisions chain through the entries' next pointers, newest first.
//! Literals compose three string keys (lexical, datatype, language) and
//! deduplicate on the triple through a second map keyed by the lexical
//! string's key. Both entry layouts put the reference count at byte 8, so
//! one pair of ref-count operations covers them.
//!
//! Entry layouts:
//!   string  `next(8) | refcount(8) | len(4) | bytes`
//!   literal `next(8) | refcount(8) | lexical(8) | datatype(8) | lang(8)`

use crate::block::Key;
use crate::cache::CacheStats;
use crate::error::{Result, StoreError};
use crate::page::PageAllocator;
use crate::pmap::{PMap, DIR_BYTES};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::debug;

/// String/literal header bytes ahead of the payload
const STRING_HEADER: usize = 8 + 8 + 4;
const LITERAL_BYTES: usize = 8 + 8 + 8 + 8 + 8;

/// Fixed low keys on a fresh node file 0, in allocation order after the
/// reserved dummy at (0,0).
const BLANK_COUNTER_INDEX: u32 = 1;
const STRING_ROOT_INDEX: u32 = 2;
const LITERAL_ROOT_INDEX: u32 = 3;

const WEAK_CACHE_SLOTS: usize = 1024;
const WEAK_CACHE_PROBE: usize = 8;

/// Bounded weak-reference cache of materialized strings. A fixed ring with
/// a short linear probe window; an overwrite on a full window is fine,
/// correctness never depends on a hit.
struct WeakCache {
    slots: Mutex<Vec<Option<(Key, Weak<str>)>>>,
}

impl WeakCache {
    fn new() -> Self {
        WeakCache {
            slots: Mutex::new(vec![None; WEAK_CACHE_SLOTS]),
        }
    }

    fn home(key: Key) -> usize {
        (key.raw() as usize).wrapping_mul(0x9E37_79B9) % WEAK_CACHE_SLOTS
    }

    fn get(&self, key: Key) -> Option<Arc<str>> {
        let slots = self.slots.lock();
        let home = Self::home(key);
        for step in 0..WEAK_CACHE_PROBE {
            let slot = &slots[(home + step) % WEAK_CACHE_SLOTS];
            if let Some((k, weak)) = slot {
                if *k == key {
                    return weak.upgrade();
                }
            }
        }
        None
    }

    fn put(&self, key: Key, value: &Arc<str>) {
        let mut slots = self.slots.lock();
        let home = Self::home(key);
        let mut victim = home;
        for step in 0..WEAK_CACHE_PROBE {
            let at = (home + step) % WEAK_CACHE_SLOTS;
            match &slots[at] {
                None => {
                    victim = at;
                    break;
                }
                Some((k, weak)) => {
                    if *k == key || weak.strong_count() == 0 {
                        victim = at;
                        break;
                    }
                }
            }
        }
        slots[victim] = Some((key, Arc::downgrade(value)));
    }
}

/// Interned node storage over its own file set
pub(crate) struct NodeStore {
    alloc: Arc<PageAllocator>,
    strings: PMap,
    literals: PMap,
    blank_counter: Key,
    cache: WeakCache,
}

impl NodeStore {
    pub(crate) fn open(
        dir: &Path,
        base: &str,
        cache_capacity: usize,
        reuse: bool,
    ) -> Result<Self> {
        let alloc = Arc::new(PageAllocator::open(dir, base, cache_capacity, reuse)?);
        if alloc.is_fresh() {
            // Deterministic low keys: dummy, blank counter, two map roots.
            let dummy = alloc.allocate(1)?;
            let counter = alloc.allocate(8)?;
            let string_root = alloc.allocate(DIR_BYTES)?;
            let literal_root = alloc.allocate(DIR_BYTES)?;
            if dummy != Key::new(0, 0)
                || counter != Key::new(0, BLANK_COUNTER_INDEX)
                || string_root != Key::new(0, STRING_ROOT_INDEX)
                || literal_root != Key::new(0, LITERAL_ROOT_INDEX)
            {
                return Err(StoreError::bad_state("node store seeded out of order"));
            }
            alloc.access(counter, true)?.write_u64(1)?;
            debug!(base, "seeded fresh node store");
        }
        Ok(NodeStore {
            strings: PMap::new(alloc.clone(), Key::new(0, STRING_ROOT_INDEX)),
            literals: PMap::new(alloc.clone(), Key::new(0, LITERAL_ROOT_INDEX)),
            blank_counter: Key::new(0, BLANK_COUNTER_INDEX),
            cache: WeakCache::new(),
            alloc,
        })
    }

    /// Walk a bucket chain for `value`, without creating it.
    pub(crate) fn find_string(&self, value: &str) -> Result<Option<Key>> {
        let hash = crc32fast::hash(value.as_bytes()) as u64;
        let head = self.strings.get(hash)?.map_or(Key::NULL, Key::from_raw);
        self.find_in_chain(head, value)
    }

    fn find_in_chain(&self, head: Key, value: &str) -> Result<Option<Key>> {
        let mut at = head;
        while !at.is_null() {
            let (next, bytes) = {
                let mut lease = self.alloc.access(at, false)?;
                let next = lease.read_key()?;
                lease.seek(16)?;
                let len = lease.read_u32()? as usize;
                (next, lease.read_bytes(len)?)
            };
            if bytes.as_ref() == value.as_bytes() {
                return Ok(Some(at));
            }
            at = next;
        }
        Ok(None)
    }

    /// Find or create the entry for `value`, returning its key. A new
    /// entry starts with reference count 0.
    pub(crate) fn intern_string(&self, value: &str) -> Result<Key> {
        let hash = crc32fast::hash(value.as_bytes()) as u64;
        let head = self.strings.get(hash)?.map_or(Key::NULL, Key::from_raw);
        if let Some(at) = self.find_in_chain(head, value)? {
            return Ok(at);
        }
        let key = self.alloc.allocate(STRING_HEADER + value.len())?;
        {
            let mut lease = self.alloc.access(key, true)?;
            lease.write_key(head)?;
            lease.write_u64(0)?;
            lease.write_u32(value.len() as u32)?;
            lease.write_all(value.as_bytes())?;
        }
        self.strings.put(hash, key.raw())?;
        Ok(key)
    }

    /// Materialize the string behind `key`, serving repeats from the weak
    /// cache.
    pub(crate) fn lookup_string(&self, key: Key) -> Result<Arc<str>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }
        let bytes = {
            let mut lease = self.alloc.access(key, false)?;
            lease.seek(16)?;
            let len = lease.read_u32()? as usize;
            lease.read_bytes(len)?
        };
        let text = std::str::from_utf8(bytes.as_ref())
            .map_err(|_| StoreError::bad_state(format!("entry {key} is not utf-8")))?;
        let value: Arc<str> = Arc::from(text);
        self.cache.put(key, &value);
        Ok(value)
    }

    /// Walk a lexical bucket for the exact (lexical, datatype, lang)
    /// triple, without creating it.
    pub(crate) fn find_literal(&self, lexical: Key, datatype: Key, lang: Key) -> Result<Option<Key>> {
        let head = self
            .literals
            .get(lexical.raw())?
            .map_or(Key::NULL, Key::from_raw);
        let mut at = head;
        while !at.is_null() {
            let mut lease = self.alloc.access(at, false)?;
            let next = lease.read_key()?;
            lease.seek(16)?;
            let (l, d, g) = (lease.read_key()?, lease.read_key()?, lease.read_key()?);
            drop(lease);
            if (l, d, g) == (lexical, datatype, lang) {
                return Ok(Some(at));
            }
            at = next;
        }
        Ok(None)
    }

    /// Find or create the literal composed of three string keys. Absent
    /// parts (no datatype, no language tag) are null keys.
    pub(crate) fn intern_literal(&self, lexical: Key, datatype: Key, lang: Key) -> Result<Key> {
        if let Some(at) = self.find_literal(lexical, datatype, lang)? {
            return Ok(at);
        }
        let head = self
            .literals
            .get(lexical.raw())?
            .map_or(Key::NULL, Key::from_raw);
        let key = self.alloc.allocate(LITERAL_BYTES)?;
        {
            let mut lease = self.alloc.access(key, true)?;
            lease.write_key(head)?;
            lease.write_u64(0)?;
            lease.write_key(lexical)?;
            lease.write_key(datatype)?;
            lease.write_key(lang)?;
        }
        self.literals.put(lexical.raw(), key.raw())?;
        Ok(key)
    }

    /// The (lexical, datatype, lang) keys of a literal entry
    pub(crate) fn lookup_literal(&self, key: Key) -> Result<(Key, Key, Key)> {
        let mut lease = self.alloc.access(key, false)?;
        lease.seek(16)?;
        Ok((lease.read_key()?, lease.read_key()?, lease.read_key()?))
    }

    /// Bump the reference count of a string or literal entry.
    pub(crate) fn inc_ref(&self, key: Key) -> Result<u64> {
        let mut lease = self.alloc.access(key, true)?;
        lease.seek(8)?;
        let count = lease.read_u64()? + 1;
        lease.seek(8)?;
        lease.write_u64(count)?;
        Ok(count)
    }

    /// Drop one reference. A count of zero leaves the entry logically dead
    /// but physically retained; dropping below zero is corruption.
    pub(crate) fn dec_ref(&self, key: Key) -> Result<u64> {
        let mut lease = self.alloc.access(key, true)?;
        lease.seek(8)?;
        let count = lease.read_u64()?;
        if count == 0 {
            return Err(StoreError::bad_state(format!(
                "ref count of {key} already zero"
            )));
        }
        lease.seek(8)?;
        lease.write_u64(count - 1)?;
        Ok(count - 1)
    }

    pub(crate) fn ref_count(&self, key: Key) -> Result<u64> {
        let mut lease = self.alloc.access(key, false)?;
        lease.seek(8)?;
        lease.read_u64()
    }

    /// Get-and-increment on the persisted blank-node counter. The writable
    /// page access is the one intentional serialization point here.
    pub(crate) fn mint_blank(&self) -> Result<u64> {
        let mut lease = self.alloc.access(self.blank_counter, true)?;
        let id = lease.read_u64()?;
        lease.seek(0)?;
        lease.write_u64(id + 1)?;
        Ok(id)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.alloc.flush()
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        self.alloc.cache_stats()
    }
}
