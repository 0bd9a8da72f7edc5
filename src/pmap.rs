//! Persisted two-stage map from 64-bit keys to 64-bit values
//!
//! Stage 1 fans the key's high byte out across a linked chain of fixed-size
//! directory records, each carrying 64 slots. A slot points at the root of
//! a stage-2 B+-tree over the remaining bits, created lazily on first
//! insert into its bucket. Tree nodes are fixed-size allocator records;
//! splits propagate up to a new root, underflow borrows from a sibling
//! before merging, and a shrinking root collapses back into its only
//! child. Iteration is lazy and yields pairs in ascending key order.

use crate::block::Key;
use crate::error::{Result, StoreError};
use crate::page::PageAllocator;
use std::sync::Arc;

/// Slots per directory record; four chained records cover all 256 buckets
const DIR_SLOTS: usize = 64;

/// Directory record: next(8) + 64 slot keys
pub(crate) const DIR_BYTES: usize = 8 + DIR_SLOTS * 8;

/// Max keys per tree node
const ORDER: usize = 63;

/// Underflow threshold for non-root nodes
const MIN_KEYS: usize = ORDER / 2;

const TAG_LEAF: u16 = 1;
const TAG_INTERNAL: u16 = 2;

/// Leaf record: tag(2) | count(2) | (key 8, value 8) x ORDER
const LEAF_BYTES: usize = 4 + ORDER * 16;

/// Internal record: tag(2) | count(2) | child0(8) | (key 8, child 8) x ORDER
const INTERNAL_BYTES: usize = 4 + 8 + ORDER * 16;

enum BNode {
    Leaf { keys: Vec<u64>, vals: Vec<u64> },
    Internal { keys: Vec<u64>, children: Vec<Key> },
}

impl BNode {
    fn key_count(&self) -> usize {
        match self {
            BNode::Leaf { keys, .. } => keys.len(),
            BNode::Internal { keys, .. } => keys.len(),
        }
    }
}

/// One persisted map rooted at a pre-allocated directory record
pub(crate) struct PMap {
    alloc: Arc<PageAllocator>,
    root: Key,
}

impl PMap {
    /// Attach to the directory record at `root`. A fresh record must be
    /// zero-filled (all slots null, no next record).
    pub(crate) fn new(alloc: Arc<PageAllocator>, root: Key) -> Self {
        PMap { alloc, root }
    }

    /// Allocate a record and zero its payload, which may sit on recycled
    /// page space.
    fn alloc_zeroed(&self, size: usize) -> Result<Key> {
        let key = self.alloc.allocate(size)?;
        let mut lease = self.alloc.access(key, true)?;
        lease.write_all(&vec![0u8; size])?;
        Ok(key)
    }

    /// Walk stage 1 to the directory record and slot covering `key`,
    /// extending the chain when `create` is set.
    fn slot_location(&self, key: u64, create: bool) -> Result<Option<(Key, usize)>> {
        let bucket = (key >> 56) as usize;
        let mut record = self.root;
        for _ in 0..bucket / DIR_SLOTS {
            let next = self.alloc.access(record, false)?.read_key()?;
            if next.is_null() {
                if !create {
                    return Ok(None);
                }
                let fresh = self.alloc_zeroed(DIR_BYTES)?;
                self.alloc.access(record, true)?.write_key(fresh)?;
                record = fresh;
            } else {
                record = next;
            }
        }
        Ok(Some((record, bucket % DIR_SLOTS)))
    }

    fn read_slot(&self, record: Key, slot: usize) -> Result<Key> {
        let mut lease = self.alloc.access(record, false)?;
        lease.seek(8 + slot * 8)?;
        lease.read_key()
    }

    fn write_slot(&self, record: Key, slot: usize, value: Key) -> Result<()> {
        let mut lease = self.alloc.access(record, true)?;
        lease.seek(8 + slot * 8)?;
        lease.write_key(value)
    }

    fn load_node(&self, key: Key) -> Result<BNode> {
        let mut lease = self.alloc.access(key, false)?;
        let tag = lease.read_u16()?;
        let count = lease.read_u16()? as usize;
        match tag {
            TAG_LEAF => {
                let mut keys = Vec::with_capacity(count);
                let mut vals = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(lease.read_u64()?);
                    vals.push(lease.read_u64()?);
                }
                Ok(BNode::Leaf { keys, vals })
            }
            TAG_INTERNAL => {
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(lease.read_key()?);
                for _ in 0..count {
                    keys.push(lease.read_u64()?);
                    children.push(lease.read_key()?);
                }
                Ok(BNode::Internal { keys, children })
            }
            other => Err(StoreError::bad_state(format!(
                "map node {key} has tag {other}"
            ))),
        }
    }

    fn store_node(&self, key: Key, node: &BNode) -> Result<()> {
        let mut lease = self.alloc.access(key, true)?;
        match node {
            BNode::Leaf { keys, vals } => {
                lease.write_u16(TAG_LEAF)?;
                lease.write_u16(keys.len() as u16)?;
                for (k, v) in keys.iter().zip(vals) {
                    lease.write_u64(*k)?;
                    lease.write_u64(*v)?;
                }
            }
            BNode::Internal { keys, children } => {
                lease.write_u16(TAG_INTERNAL)?;
                lease.write_u16(keys.len() as u16)?;
                lease.write_key(children[0])?;
                for (k, c) in keys.iter().zip(&children[1..]) {
                    lease.write_u64(*k)?;
                    lease.write_key(*c)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, key: u64) -> Result<Option<u64>> {
        let Some((record, slot)) = self.slot_location(key, false)? else {
            return Ok(None);
        };
        let mut node_key = self.read_slot(record, slot)?;
        if node_key.is_null() {
            return Ok(None);
        }
        loop {
            match self.load_node(node_key)? {
                BNode::Internal { keys, children } => {
                    let idx = keys.partition_point(|&k| k <= key);
                    node_key = children[idx];
                }
                BNode::Leaf { keys, vals } => {
                    return Ok(match keys.binary_search(&key) {
                        Ok(i) => Some(vals[i]),
                        Err(_) => None,
                    });
                }
            }
        }
    }

    /// Insert or replace, returning the previous value if any.
    pub(crate) fn put(&self, key: u64, value: u64) -> Result<Option<u64>> {
        let Some((record, slot)) = self.slot_location(key, true)? else {
            return Err(StoreError::bad_state("directory chain vanished"));
        };
        let root = self.read_slot(record, slot)?;
        if root.is_null() {
            let leaf = self.alloc.allocate(LEAF_BYTES)?;
            self.store_node(
                leaf,
                &BNode::Leaf {
                    keys: vec![key],
                    vals: vec![value],
                },
            )?;
            self.write_slot(record, slot, leaf)?;
            return Ok(None);
        }
        let (old, split) = self.insert_rec(root, key, value)?;
        if let Some((sep, right)) = split {
            let new_root = self.alloc.allocate(INTERNAL_BYTES)?;
            self.store_node(
                new_root,
                &BNode::Internal {
                    keys: vec![sep],
                    children: vec![root, right],
                },
            )?;
            self.write_slot(record, slot, new_root)?;
        }
        Ok(old)
    }

    /// Returns the previous value and, on overflow, the separator plus the
    /// freshly allocated right sibling for the parent to absorb.
    fn insert_rec(
        &self,
        node_key: Key,
        key: u64,
        value: u64,
    ) -> Result<(Option<u64>, Option<(u64, Key)>)> {
        match self.load_node(node_key)? {
            BNode::Leaf {
                mut keys,
                mut vals,
            } => {
                match keys.binary_search(&key) {
                    Ok(i) => {
                        let old = vals[i];
                        vals[i] = value;
                        self.store_node(node_key, &BNode::Leaf { keys, vals })?;
                        return Ok((Some(old), None));
                    }
                    Err(i) => {
                        keys.insert(i, key);
                        vals.insert(i, value);
                    }
                }
                if keys.len() <= ORDER {
                    self.store_node(node_key, &BNode::Leaf { keys, vals })?;
                    return Ok((None, None));
                }
                // Leaf split: the separator is the right half's first key
                // and stays in the right leaf.
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_vals = vals.split_off(mid);
                let sep = right_keys[0];
                let right = self.alloc.allocate(LEAF_BYTES)?;
                self.store_node(
                    right,
                    &BNode::Leaf {
                        keys: right_keys,
                        vals: right_vals,
                    },
                )?;
                self.store_node(node_key, &BNode::Leaf { keys, vals })?;
                Ok((None, Some((sep, right))))
            }
            BNode::Internal {
                mut keys,
                mut children,
            } => {
                let idx = keys.partition_point(|&k| k <= key);
                let (old, split) = self.insert_rec(children[idx], key, value)?;
                let Some((sep, right_child)) = split else {
                    return Ok((old, None));
                };
                keys.insert(idx, sep);
                children.insert(idx + 1, right_child);
                if keys.len() <= ORDER {
                    self.store_node(node_key, &BNode::Internal { keys, children })?;
                    return Ok((old, None));
                }
                // Internal split: the middle key moves up.
                let mid = keys.len() / 2;
                let sep_up = keys[mid];
                let right_keys = keys.split_off(mid + 1);
                keys.truncate(mid);
                let right_children = children.split_off(mid + 1);
                let right = self.alloc.allocate(INTERNAL_BYTES)?;
                self.store_node(
                    right,
                    &BNode::Internal {
                        keys: right_keys,
                        children: right_children,
                    },
                )?;
                self.store_node(node_key, &BNode::Internal { keys, children })?;
                Ok((old, Some((sep_up, right))))
            }
        }
    }

    /// Remove `key`, returning its value if present. Frees the stage-2
    /// tree entirely when its last pair goes.
    pub(crate) fn remove(&self, key: u64) -> Result<Option<u64>> {
        let Some((record, slot)) = self.slot_location(key, false)? else {
            return Ok(None);
        };
        let root = self.read_slot(record, slot)?;
        if root.is_null() {
            return Ok(None);
        }
        let (old, _) = self.remove_rec(root, key)?;
        if old.is_none() {
            return Ok(None);
        }
        match self.load_node(root)? {
            BNode::Leaf { keys, .. } if keys.is_empty() => {
                self.alloc.free(root)?;
                self.write_slot(record, slot, Key::NULL)?;
            }
            BNode::Internal { keys, children } if keys.is_empty() => {
                // Root collapse after a merge consumed its last separator.
                self.alloc.free(root)?;
                self.write_slot(record, slot, children[0])?;
            }
            _ => {}
        }
        Ok(old)
    }

    /// Returns the removed value and whether the node is now under the
    /// minimum fill (the caller rebalances).
    fn remove_rec(&self, node_key: Key, key: u64) -> Result<(Option<u64>, bool)> {
        match self.load_node(node_key)? {
            BNode::Leaf {
                mut keys,
                mut vals,
            } => match keys.binary_search(&key) {
                Ok(i) => {
                    keys.remove(i);
                    let old = vals.remove(i);
                    let under = keys.len() < MIN_KEYS;
                    self.store_node(node_key, &BNode::Leaf { keys, vals })?;
                    Ok((Some(old), under))
                }
                Err(_) => Ok((None, false)),
            },
            BNode::Internal {
                mut keys,
                mut children,
            } => {
                let idx = keys.partition_point(|&k| k <= key);
                let (old, under) = self.remove_rec(children[idx], key)?;
                if old.is_none() || !under {
                    return Ok((old, false));
                }
                self.rebalance(node_key, &mut keys, &mut children, idx)?;
                let under = keys.len() < MIN_KEYS;
                Ok((old, under))
            }
        }
    }

    /// Restore the fill of `children[idx]`: borrow from a sibling with
    /// spare keys, otherwise merge into the left (or right) neighbor.
    /// Stores every record it touches, including the parent.
    fn rebalance(
        &self,
        parent_key: Key,
        keys: &mut Vec<u64>,
        children: &mut Vec<Key>,
        idx: usize,
    ) -> Result<()> {
        let child_key = children[idx];
        let mut child = self.load_node(child_key)?;

        if idx > 0 {
            let left_key = children[idx - 1];
            let mut left = self.load_node(left_key)?;
            if left.key_count() > MIN_KEYS {
                self.borrow_from_left(&mut left, &mut child, &mut keys[idx - 1]);
                self.store_node(left_key, &left)?;
                self.store_node(child_key, &child)?;
                return self.store_node(parent_key, &BNode::Internal {
                    keys: keys.clone(),
                    children: children.clone(),
                });
            }
        }
        if idx + 1 < children.len() {
            let right_key = children[idx + 1];
            let mut right = self.load_node(right_key)?;
            if right.key_count() > MIN_KEYS {
                self.borrow_from_right(&mut child, &mut right, &mut keys[idx]);
                self.store_node(right_key, &right)?;
                self.store_node(child_key, &child)?;
                return self.store_node(parent_key, &BNode::Internal {
                    keys: keys.clone(),
                    children: children.clone(),
                });
            }
        }

        // Merge. Absorb the child into its left neighbor, or the right
        // neighbor into the child when none exists.
        if idx > 0 {
            let left_key = children[idx - 1];
            let mut left = self.load_node(left_key)?;
            let sep = keys.remove(idx - 1);
            children.remove(idx);
            Self::merge_into(&mut left, child, sep);
            self.store_node(left_key, &left)?;
            self.alloc.free(child_key)?;
        } else {
            let right_key = children[idx + 1];
            let right = self.load_node(right_key)?;
            let sep = keys.remove(idx);
            children.remove(idx + 1);
            Self::merge_into(&mut child, right, sep);
            self.store_node(child_key, &child)?;
            self.alloc.free(right_key)?;
        }
        self.store_node(parent_key, &BNode::Internal {
            keys: keys.clone(),
            children: children.clone(),
        })
    }

    fn borrow_from_left(&self, left: &mut BNode, child: &mut BNode, sep: &mut u64) {
        match (left, child) {
            (
                BNode::Leaf { keys: lk, vals: lv },
                BNode::Leaf { keys: ck, vals: cv },
            ) => {
                let k = lk.remove(lk.len() - 1);
                let v = lv.remove(lv.len() - 1);
                ck.insert(0, k);
                cv.insert(0, v);
                *sep = ck[0];
            }
            (
                BNode::Internal { keys: lk, children: lc },
                BNode::Internal { keys: ck, children: cc },
            ) => {
                ck.insert(0, *sep);
                *sep = lk.remove(lk.len() - 1);
                cc.insert(0, lc.remove(lc.len() - 1));
            }
            _ => unreachable!("siblings share a level"),
        }
    }

    fn borrow_from_right(&self, child: &mut BNode, right: &mut BNode, sep: &mut u64) {
        match (child, right) {
            (
                BNode::Leaf { keys: ck, vals: cv },
                BNode::Leaf { keys: rk, vals: rv },
            ) => {
                ck.push(rk.remove(0));
                cv.push(rv.remove(0));
                *sep = rk[0];
            }
            (
                BNode::Internal { keys: ck, children: cc },
                BNode::Internal { keys: rk, children: rc },
            ) => {
                ck.push(*sep);
                *sep = rk.remove(0);
                cc.push(rc.remove(0));
            }
            _ => unreachable!("siblings share a level"),
        }
    }

    fn merge_into(dst: &mut BNode, src: BNode, sep: u64) {
        match (dst, src) {
            (
                BNode::Leaf { keys: dk, vals: dv },
                BNode::Leaf { keys: sk, vals: sv },
            ) => {
                dk.extend(sk);
                dv.extend(sv);
            }
            (
                BNode::Internal { keys: dk, children: dc },
                BNode::Internal { keys: sk, children: sc },
            ) => {
                dk.push(sep);
                dk.extend(sk);
                dc.extend(sc);
            }
            _ => unreachable!("siblings share a level"),
        }
    }

    /// Lazy in-order iteration. Whole leaves buffer at a time so no lease
    /// is held between yields.
    pub(crate) fn iter(&self) -> PMapIter<'_> {
        PMapIter {
            map: self,
            dir: Some((self.root, 0)),
            stack: Vec::new(),
            leaf: Vec::new().into_iter(),
            failed: false,
        }
    }
}

pub(crate) struct PMapIter<'a> {
    map: &'a PMap,
    /// Current directory record and next slot within it
    dir: Option<(Key, usize)>,
    /// Internal nodes on the path and the next child to visit in each
    stack: Vec<(Key, usize)>,
    leaf: std::vec::IntoIter<(u64, u64)>,
    failed: bool,
}

impl PMapIter<'_> {
    /// Walk to the leftmost leaf under `node_key`, buffering its pairs.
    fn descend(&mut self, mut node_key: Key) -> Result<()> {
        loop {
            match self.map.load_node(node_key)? {
                BNode::Internal { children, .. } => {
                    self.stack.push((node_key, 1));
                    node_key = children[0];
                }
                BNode::Leaf { keys, vals } => {
                    self.leaf = keys.into_iter().zip(vals).collect::<Vec<_>>().into_iter();
                    return Ok(());
                }
            }
        }
    }

    /// Move on to the next leaf, via the stack or the next populated
    /// directory slot. False when the map is exhausted.
    fn advance(&mut self) -> Result<bool> {
        while let Some((node_key, next_child)) = self.stack.pop() {
            let BNode::Internal { children, .. } = self.map.load_node(node_key)? else {
                return Err(StoreError::bad_state("leaf on iterator stack"));
            };
            if next_child < children.len() {
                self.stack.push((node_key, next_child + 1));
                self.descend(children[next_child])?;
                return Ok(true);
            }
        }
        while let Some((record, slot)) = self.dir {
            if slot == DIR_SLOTS {
                let next = self.map.alloc.access(record, false)?.read_key()?;
                self.dir = if next.is_null() { None } else { Some((next, 0)) };
                continue;
            }
            self.dir = Some((record, slot + 1));
            let root = self.map.read_slot(record, slot)?;
            if !root.is_null() {
                self.descend(root)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Iterator for PMapIter<'_> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(pair) = self.leaf.next() {
                return Some(Ok(pair));
            }
            match self.advance() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn test_map() -> (TempDir, PMap) {
        let dir = TempDir::new().unwrap();
        let alloc = Arc::new(PageAllocator::open(dir.path(), "map", 32, true).unwrap());
        let _dummy = alloc.allocate(1).unwrap();
        let root = alloc.allocate(DIR_BYTES).unwrap();
        (dir, PMap::new(alloc, root))
    }

    #[test]
    fn test_put_get_remove() {
        let (_dir, map) = test_map();
        assert_eq!(map.get(42).unwrap(), None);
        assert_eq!(map.put(42, 7).unwrap(), None);
        assert_eq!(map.get(42).unwrap(), Some(7));
        assert_eq!(map.put(42, 8).unwrap(), Some(7));
        assert_eq!(map.get(42).unwrap(), Some(8));
        assert_eq!(map.remove(42).unwrap(), Some(8));
        assert_eq!(map.get(42).unwrap(), None);
        assert_eq!(map.remove(42).unwrap(), None);
    }

    #[test]
    fn test_buckets_spread_over_directory_chain() {
        let (_dir, map) = test_map();
        // One key per bucket touches all four directory records.
        for high in 0..=255u64 {
            let key = high << 56 | 1;
            assert_eq!(map.put(key, high).unwrap(), None);
        }
        for high in 0..=255u64 {
            let key = high << 56 | 1;
            assert_eq!(map.get(key).unwrap(), Some(high));
        }
    }

    #[test]
    fn test_growth_through_splits() {
        let (_dir, map) = test_map();
        // All in one bucket to force a multi-level tree.
        let n = 5000u64;
        for i in 0..n {
            assert_eq!(map.put((7 << 56) | i, i * 2).unwrap(), None);
        }
        for i in 0..n {
            assert_eq!(map.get((7 << 56) | i).unwrap(), Some(i * 2));
        }
        assert_eq!(map.get((7 << 56) | n).unwrap(), None);
    }

    #[test]
    fn test_shrink_through_merges() {
        let (_dir, map) = test_map();
        let n = 3000u64;
        for i in 0..n {
            map.put((3 << 56) | i, i).unwrap();
        }
        let mut order: Vec<u64> = (0..n).collect();
        order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(11));
        for (removed, i) in order.iter().enumerate() {
            assert_eq!(map.remove((3 << 56) | i).unwrap(), Some(*i));
            // Spot-check survivors while the tree collapses.
            if removed % 500 == 0 {
                for j in &order[removed + 1..] {
                    if map.get((3 << 56) | j).unwrap() != Some(*j) {
                        panic!("lost key {j} after {removed} removals");
                    }
                    break;
                }
            }
        }
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn test_iteration_in_key_order() {
        let (_dir, map) = test_map();
        let mut expected = Vec::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let mut keys: Vec<u64> = (0..2000u64).map(|i| i * 31 + ((i % 5) << 50)).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.shuffle(&mut rng);
        for k in &keys {
            map.put(*k, !*k).unwrap();
            expected.push((*k, !*k));
        }
        expected.sort_unstable();
        let got: Vec<(u64, u64)> = map.iter().collect::<Result<_>>().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_random_churn() {
        let (_dir, map) = test_map();
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let mut model = std::collections::BTreeMap::new();
        for round in 0..4000u64 {
            let key = (round * 2654435761) % 600;
            if round % 3 == 2 {
                assert_eq!(map.remove(key).unwrap(), model.remove(&key));
            } else {
                let val = rng.random::<u64>();
                assert_eq!(map.put(key, val).unwrap(), model.insert(key, val));
            }
        }
        let got: Vec<(u64, u64)> = map.iter().collect::<Result<_>>().unwrap();
        let expected: Vec<(u64, u64)> = model.into_iter().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let root;
        {
            let alloc =
                Arc::new(PageAllocator::open(dir.path(), "map", 32, true).unwrap());
            let _dummy = alloc.allocate(1).unwrap();
            root = alloc.allocate(DIR_BYTES).unwrap();
            let map = PMap::new(alloc.clone(), root);
            for i in 0..500u64 {
                map.put(i, i + 1).unwrap();
            }
            alloc.flush().unwrap();
        }
        let alloc = Arc::new(PageAllocator::open(dir.path(), "map", 32, true).unwrap());
        let map = PMap::new(alloc, root);
        for i in 0..500u64 {
            assert_eq!(map.get(i).unwrap(), Some(i + 1));
        }
    }
}
