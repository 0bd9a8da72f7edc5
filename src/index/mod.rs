//! Four-level quad trie plus the reverse graph summary
//!
//! Quads index subject -> property -> object -> graph; each level is a
//! chain of QNode records and the graph level's child is an 8-byte
//! multiplicity counter. Subjects partition into three root maps by term
//! kind so IRI keys, blank ids and anonymous ids never collide. Every
//! mutation also adjusts one slot of the reverse graph index, which
//! answers graph-bound queries and counts without scanning subjects.
//!
//! Mutations across the trie levels and the reverse index go through
//! separate leases and are not atomic; callers keep to one writer at a
//! time with any number of readers. Term reference counts live with the
//! node store and are adjusted by the layer that owns both stores.

mod graphs;
mod qnode;

pub use qnode::{Quad, TermId, TermKind};

use crate::block::Key;
use crate::cache::CacheStats;
use crate::error::{Result, StoreError};
use crate::page::PageAllocator;
use crate::pmap::{PMap, PMapIter, DIR_BYTES};
use graphs::GraphIndex;
use qnode::QNode;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Result of one insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First occurrence of the quad
    New,
    /// Multiplicity went up on an existing quad
    Incremented,
}

/// Result of one removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotFound,
    /// Multiplicity went down, quad still present
    Decremented,
    /// Last occurrence gone
    Removed,
    /// Last occurrence gone and its graph is now empty
    Emptied,
}

/// A quad pattern; `None` fields are wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pattern {
    pub graph: Option<TermId>,
    pub subject: Option<TermId>,
    pub property: Option<TermId>,
    pub object: Option<TermId>,
}

impl Pattern {
    pub fn everything() -> Self {
        Pattern::default()
    }

    pub fn graph(graph: TermId) -> Self {
        Pattern {
            graph: Some(graph),
            ..Pattern::default()
        }
    }
}

impl From<&Quad> for Pattern {
    fn from(quad: &Quad) -> Self {
        Pattern {
            graph: Some(quad.graph),
            subject: Some(quad.subject),
            property: Some(quad.property),
            object: Some(quad.object),
        }
    }
}

const SUBJECT_KINDS: [TermKind; 3] = [TermKind::Iri, TermKind::Blank, TermKind::Anonymous];

/// The quad index over its own file set
pub(crate) struct QuadIndex {
    alloc: Arc<PageAllocator>,
    subj_iri: PMap,
    subj_blank: PMap,
    subj_anon: PMap,
    graphs: GraphIndex,
}

impl QuadIndex {
    pub(crate) fn open(
        dir: &Path,
        base: &str,
        cache_capacity: usize,
        reuse: bool,
    ) -> Result<Self> {
        let alloc = Arc::new(PageAllocator::open(dir, base, cache_capacity, reuse)?);
        if alloc.is_fresh() {
            // Dummy, three subject roots by kind, graph root.
            let dummy = alloc.allocate(1)?;
            let mut roots = [Key::NULL; 4];
            for root in roots.iter_mut() {
                *root = alloc.allocate(DIR_BYTES)?;
            }
            if dummy != Key::new(0, 0) || roots[3] != Key::new(0, 4) {
                return Err(StoreError::bad_state("quad index seeded out of order"));
            }
            debug!(base, "seeded fresh quad index");
        }
        Ok(QuadIndex {
            subj_iri: PMap::new(alloc.clone(), Key::new(0, 1)),
            subj_blank: PMap::new(alloc.clone(), Key::new(0, 2)),
            subj_anon: PMap::new(alloc.clone(), Key::new(0, 3)),
            graphs: GraphIndex::new(alloc.clone(), Key::new(0, 4)),
            alloc,
        })
    }

    fn subject_map(&self, kind: TermKind) -> Result<&PMap> {
        match kind {
            TermKind::Iri => Ok(&self.subj_iri),
            TermKind::Blank => Ok(&self.subj_blank),
            TermKind::Anonymous => Ok(&self.subj_anon),
            TermKind::Literal => Err(StoreError::bad_state("literal as subject")),
        }
    }

    /// Find a term in a chain or prepend a fresh childless node, returning
    /// the node plus the possibly-changed chain head.
    fn find_or_prepend(&self, head: Key, term: TermId) -> Result<(Key, Key)> {
        if let Some((_, at, _)) = qnode::find(&self.alloc, head, term)? {
            return Ok((at, head));
        }
        let fresh = qnode::create(
            &self.alloc,
            &QNode {
                next: head,
                term,
                child: Key::NULL,
            },
        )?;
        Ok((fresh, fresh))
    }

    /// Insert one occurrence of the quad, creating its path lazily.
    pub(crate) fn add(&self, quad: &Quad) -> Result<AddOutcome> {
        let smap = self.subject_map(quad.subject.kind)?;
        let s_raw = quad.subject.key.raw();
        let phead = smap.get(s_raw)?.map_or(Key::NULL, Key::from_raw);

        let (pnode, new_phead) = self.find_or_prepend(phead, quad.property)?;
        if new_phead != phead {
            smap.put(s_raw, new_phead.raw())?;
        }
        let pn = qnode::load(&self.alloc, pnode)?;
        let (onode, new_ohead) = self.find_or_prepend(pn.child, quad.object)?;
        if new_ohead != pn.child {
            qnode::set_child(&self.alloc, pnode, new_ohead)?;
        }
        let on = qnode::load(&self.alloc, onode)?;
        let (gnode, new_ghead) = self.find_or_prepend(on.child, quad.graph)?;
        if new_ghead != on.child {
            qnode::set_child(&self.alloc, onode, new_ghead)?;
        }

        let gn = qnode::load(&self.alloc, gnode)?;
        let outcome = if gn.child.is_null() {
            let counter = self.alloc.allocate(8)?;
            self.alloc.access(counter, true)?.write_u64(1)?;
            qnode::set_child(&self.alloc, gnode, counter)?;
            AddOutcome::New
        } else {
            let mut lease = self.alloc.access(gn.child, true)?;
            let multiplicity = lease.read_u64()?;
            lease.seek(0)?;
            lease.write_u64(multiplicity + 1)?;
            AddOutcome::Incremented
        };
        self.graphs.bump(quad.graph.key, quad.subject.key)?;
        Ok(outcome)
    }

    /// Remove one occurrence. At multiplicity 0 the terminal counter and
    /// every newly childless ancestor unlink and free, stopping at the
    /// first level that still has other children.
    pub(crate) fn remove(&self, quad: &Quad) -> Result<RemoveOutcome> {
        let smap = self.subject_map(quad.subject.kind)?;
        let s_raw = quad.subject.key.raw();
        let Some(phead_raw) = smap.get(s_raw)? else {
            return Ok(RemoveOutcome::NotFound);
        };
        let phead = Key::from_raw(phead_raw);
        let Some((pprev, pnode, pn)) = qnode::find(&self.alloc, phead, quad.property)? else {
            return Ok(RemoveOutcome::NotFound);
        };
        let Some((oprev, onode, on)) = qnode::find(&self.alloc, pn.child, quad.object)? else {
            return Ok(RemoveOutcome::NotFound);
        };
        let Some((gprev, gnode, gn)) = qnode::find(&self.alloc, on.child, quad.graph)? else {
            return Ok(RemoveOutcome::NotFound);
        };
        if gn.child.is_null() {
            return Err(StoreError::bad_state("graph node without counter"));
        }

        let multiplicity = self.alloc.access(gn.child, false)?.read_u64()?;
        let emptied = self.graphs.drop_one(quad.graph.key, quad.subject.key)?;
        if multiplicity > 1 {
            let mut lease = self.alloc.access(gn.child, true)?;
            lease.write_u64(multiplicity - 1)?;
            return Ok(RemoveOutcome::Decremented);
        }

        // Unlink cascade, bottom up.
        self.alloc.free(gn.child)?;
        if !gprev.is_null() {
            qnode::set_next(&self.alloc, gprev, gn.next)?;
        } else {
            qnode::set_child(&self.alloc, onode, gn.next)?;
        }
        self.alloc.free(gnode)?;

        if gprev.is_null() && gn.next.is_null() {
            if !oprev.is_null() {
                qnode::set_next(&self.alloc, oprev, on.next)?;
            } else {
                qnode::set_child(&self.alloc, pnode, on.next)?;
            }
            self.alloc.free(onode)?;

            if oprev.is_null() && on.next.is_null() {
                if !pprev.is_null() {
                    qnode::set_next(&self.alloc, pprev, pn.next)?;
                    self.alloc.free(pnode)?;
                } else if pn.next.is_null() {
                    smap.remove(s_raw)?;
                    self.alloc.free(pnode)?;
                } else {
                    smap.put(s_raw, pn.next.raw())?;
                    self.alloc.free(pnode)?;
                }
            }
        }
        Ok(if emptied {
            RemoveOutcome::Emptied
        } else {
            RemoveOutcome::Removed
        })
    }

    /// Lazy matches for a pattern, one `(quad, multiplicity)` per stored
    /// quad. A bound graph with an unbound subject drives off the reverse
    /// index instead of scanning every subject.
    pub(crate) fn get_all(&self, pattern: Pattern) -> Result<QuadIter<'_>> {
        let source = if let Some(subject) = pattern.subject {
            SubjectSource::One(Some(subject))
        } else if let Some(graph) = pattern.graph {
            SubjectSource::FromGraph {
                subjects: self.graphs.subjects(graph.key)?.into_iter(),
                candidates: Vec::new(),
            }
        } else {
            SubjectSource::Scan {
                stage: 0,
                iter: None,
            }
        };
        Ok(QuadIter {
            index: self,
            pattern,
            source,
            buffered: VecDeque::new(),
            failed: false,
        })
    }

    /// All matches under one subject, buffered. Bound levels stop at their
    /// first (unique) match; unbound levels walk the whole chain.
    fn collect_for_subject(
        &self,
        subject: TermId,
        pattern: &Pattern,
    ) -> Result<VecDeque<(Quad, u64)>> {
        let mut out = VecDeque::new();
        // A literal can never be a subject; such a bound pattern matches
        // nothing rather than failing.
        let Ok(map) = self.subject_map(subject.kind) else {
            return Ok(out);
        };
        let Some(phead) = map.get(subject.key.raw())? else {
            return Ok(out);
        };

        let mut p_at = Key::from_raw(phead);
        while !p_at.is_null() {
            let pn = qnode::load(&self.alloc, p_at)?;
            p_at = pn.next;
            if pattern.property.is_some_and(|p| p != pn.term) {
                continue;
            }
            let mut o_at = pn.child;
            while !o_at.is_null() {
                let on = qnode::load(&self.alloc, o_at)?;
                o_at = on.next;
                if pattern.object.is_some_and(|o| o != on.term) {
                    continue;
                }
                let mut g_at = on.child;
                while !g_at.is_null() {
                    let gn = qnode::load(&self.alloc, g_at)?;
                    g_at = gn.next;
                    if pattern.graph.is_some_and(|g| g != gn.term) {
                        continue;
                    }
                    if gn.child.is_null() {
                        return Err(StoreError::bad_state("graph node without counter"));
                    }
                    let multiplicity = self.alloc.access(gn.child, false)?.read_u64()?;
                    out.push_back((
                        Quad {
                            graph: gn.term,
                            subject,
                            property: pn.term,
                            object: on.term,
                        },
                        multiplicity,
                    ));
                    if pattern.graph.is_some() {
                        break;
                    }
                }
                if pattern.object.is_some() {
                    break;
                }
            }
            if pattern.property.is_some() {
                break;
            }
        }
        Ok(out)
    }

    /// Matches counted with multiplicity. A graph-only pattern sums the
    /// reverse index slots without touching the trie.
    pub(crate) fn count(&self, pattern: Pattern) -> Result<u64> {
        if pattern.subject.is_none() && pattern.property.is_none() && pattern.object.is_none() {
            if let Some(graph) = pattern.graph {
                return self.graphs.count(graph.key);
            }
        }
        let mut total = 0u64;
        for item in self.get_all(pattern)? {
            total += item?.1;
        }
        Ok(total)
    }

    pub(crate) fn contains(&self, pattern: Pattern) -> Result<bool> {
        Ok(self.get_all(pattern)?.next().transpose()?.is_some())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.alloc.flush()
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        self.alloc.cache_stats()
    }
}

enum SubjectSource<'a> {
    /// Bound subject, visited once
    One(Option<TermId>),
    /// Subjects of a bound graph; each key is tried under every subject
    /// kind because the reverse index stores keys without kinds
    FromGraph {
        subjects: std::vec::IntoIter<Key>,
        candidates: Vec<TermId>,
    },
    /// Full scan across the three subject maps
    Scan {
        stage: usize,
        iter: Option<PMapIter<'a>>,
    },
}

/// Lazy pattern matches, buffering one subject's subtree at a time so no
/// lease is held between yields.
pub struct QuadIter<'a> {
    index: &'a QuadIndex,
    pattern: Pattern,
    source: SubjectSource<'a>,
    buffered: VecDeque<(Quad, u64)>,
    failed: bool,
}

impl QuadIter<'_> {
    fn next_subject(&mut self) -> Result<Option<TermId>> {
        match &mut self.source {
            SubjectSource::One(slot) => Ok(slot.take()),
            SubjectSource::FromGraph {
                subjects,
                candidates,
            } => {
                loop {
                    if let Some(candidate) = candidates.pop() {
                        return Ok(Some(candidate));
                    }
                    let Some(key) = subjects.next() else {
                        return Ok(None);
                    };
                    *candidates = SUBJECT_KINDS
                        .iter()
                        .map(|kind| TermId::new(*kind, key))
                        .collect();
                }
            }
            SubjectSource::Scan { stage, iter } => loop {
                if let Some(current) = iter {
                    match current.next() {
                        Some(Ok((raw, _))) => {
                            let kind = SUBJECT_KINDS[*stage];
                            return Ok(Some(TermId::new(kind, Key::from_raw(raw))));
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            *iter = None;
                            *stage += 1;
                        }
                    }
                } else if *stage < SUBJECT_KINDS.len() {
                    let map = self.index.subject_map(SUBJECT_KINDS[*stage])?;
                    *iter = Some(map.iter());
                } else {
                    return Ok(None);
                }
            },
        }
    }

    fn step(&mut self) -> Result<Option<(Quad, u64)>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some(item));
            }
            let Some(subject) = self.next_subject()? else {
                return Ok(None);
            };
            self.buffered = self.index.collect_for_subject(subject, &self.pattern)?;
        }
    }
}

impl Iterator for QuadIter<'_> {
    type Item = Result<(Quad, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_index() -> (TempDir, QuadIndex) {
        let dir = TempDir::new().unwrap();
        let index = QuadIndex::open(dir.path(), "quads", 64, true).unwrap();
        (dir, index)
    }

    fn iri(n: u32) -> TermId {
        TermId::iri(Key::new(0, 100 + n))
    }

    fn quad(g: u32, s: u32, p: u32, o: u32) -> Quad {
        Quad {
            graph: iri(g),
            subject: iri(s),
            property: iri(p),
            object: iri(o),
        }
    }

    fn all(index: &QuadIndex, pattern: Pattern) -> Vec<(Quad, u64)> {
        let mut got: Vec<(Quad, u64)> =
            index.get_all(pattern).unwrap().collect::<Result<_>>().unwrap();
        got.sort_by_key(|(q, _)| (q.subject, q.property, q.object, q.graph));
        got
    }

    #[test]
    fn test_add_remove_outcomes() {
        let (_dir, index) = test_index();
        let q = quad(1, 2, 3, 4);
        assert_eq!(index.add(&q).unwrap(), AddOutcome::New);
        assert_eq!(index.add(&q).unwrap(), AddOutcome::Incremented);
        assert_eq!(index.remove(&q).unwrap(), RemoveOutcome::Decremented);
        assert_eq!(index.remove(&q).unwrap(), RemoveOutcome::Emptied);
        assert_eq!(index.remove(&q).unwrap(), RemoveOutcome::NotFound);
    }

    #[test]
    fn test_removed_vs_emptied() {
        let (_dir, index) = test_index();
        index.add(&quad(1, 2, 3, 4)).unwrap();
        index.add(&quad(1, 2, 3, 5)).unwrap();
        // The graph keeps another quad, so this is Removed.
        assert_eq!(index.remove(&quad(1, 2, 3, 4)).unwrap(), RemoveOutcome::Removed);
        assert_eq!(index.remove(&quad(1, 2, 3, 5)).unwrap(), RemoveOutcome::Emptied);
    }

    #[test]
    fn test_duplicate_is_one_record_with_multiplicity() {
        let (_dir, index) = test_index();
        let q = quad(1, 2, 3, 4);
        index.add(&q).unwrap();
        index.add(&q).unwrap();
        let got = all(&index, Pattern::everything());
        assert_eq!(got, vec![(q, 2)]);
        assert_eq!(index.count(Pattern::everything()).unwrap(), 2);
    }

    #[test]
    fn test_getall_returns_exact_multiset() {
        let (_dir, index) = test_index();
        let quads = [
            quad(1, 2, 3, 4),
            quad(1, 2, 3, 5),
            quad(1, 6, 3, 4),
            quad(7, 2, 3, 4),
            quad(7, 8, 9, 10),
        ];
        for q in &quads {
            assert_eq!(index.add(q).unwrap(), AddOutcome::New);
        }
        let got = all(&index, Pattern::everything());
        let mut expected: Vec<(Quad, u64)> = quads.iter().map(|q| (*q, 1)).collect();
        expected.sort_by_key(|(q, _)| (q.subject, q.property, q.object, q.graph));
        assert_eq!(got, expected);
        assert_eq!(index.count(Pattern::everything()).unwrap(), 5);
    }

    #[test]
    fn test_bound_patterns() {
        let (_dir, index) = test_index();
        index.add(&quad(1, 2, 3, 4)).unwrap();
        index.add(&quad(1, 2, 3, 5)).unwrap();
        index.add(&quad(1, 2, 6, 4)).unwrap();
        index.add(&quad(7, 2, 3, 4)).unwrap();

        let p = Pattern {
            graph: Some(iri(1)),
            subject: Some(iri(2)),
            property: Some(iri(3)),
            object: None,
        };
        let got = all(&index, p);
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|(q, _)| q.graph == iri(1) && q.property == iri(3)));

        assert!(index.contains(Pattern::from(&quad(7, 2, 3, 4))).unwrap());
        assert!(!index.contains(Pattern::from(&quad(7, 2, 3, 5))).unwrap());

        let by_object = Pattern {
            object: Some(iri(4)),
            ..Pattern::default()
        };
        assert_eq!(index.count(by_object).unwrap(), 3);
    }

    #[test]
    fn test_graph_bound_query_uses_reverse_index() {
        let (_dir, index) = test_index();
        for s in 0..40 {
            index.add(&quad(1, s, 3, 4)).unwrap();
        }
        index.add(&quad(2, 50, 3, 4)).unwrap();
        let got = all(&index, Pattern::graph(iri(1)));
        assert_eq!(got.len(), 40);
        assert!(got.iter().all(|(q, _)| q.graph == iri(1)));
        // Graph-only count comes straight from the reverse index.
        assert_eq!(index.count(Pattern::graph(iri(1))).unwrap(), 40);
        assert_eq!(index.count(Pattern::graph(iri(2))).unwrap(), 1);
        assert_eq!(index.count(Pattern::graph(iri(3))).unwrap(), 0);
    }

    #[test]
    fn test_subject_kinds_do_not_collide() {
        let (_dir, index) = test_index();
        let key = Key::new(0, 200);
        let as_iri = Quad {
            subject: TermId::iri(key),
            ..quad(1, 0, 3, 4)
        };
        let as_blank = Quad {
            subject: TermId::new(TermKind::Blank, key),
            ..quad(1, 0, 3, 5)
        };
        index.add(&as_iri).unwrap();
        index.add(&as_blank).unwrap();
        assert_eq!(index.count(Pattern::everything()).unwrap(), 2);
        assert_eq!(
            all(&index, Pattern {
                subject: Some(as_iri.subject),
                ..Pattern::default()
            }),
            vec![(as_iri, 1)]
        );
        assert_eq!(index.remove(&as_iri).unwrap(), RemoveOutcome::Removed);
        assert!(index.contains(Pattern::from(&as_blank)).unwrap());
    }

    #[test]
    fn test_literal_objects_allowed_literal_subjects_refused() {
        let (_dir, index) = test_index();
        let q = Quad {
            object: TermId::literal(Key::new(0, 300)),
            ..quad(1, 2, 3, 0)
        };
        index.add(&q).unwrap();
        assert!(index.contains(Pattern::from(&q)).unwrap());

        let bad = Quad {
            subject: TermId::literal(Key::new(0, 300)),
            ..quad(1, 0, 3, 4)
        };
        assert!(matches!(index.add(&bad), Err(StoreError::BadState(_))));
        // Queries with a literal bound as subject match nothing.
        assert!(!index.contains(Pattern::from(&bad)).unwrap());
    }

    #[test]
    fn test_example_sequence() {
        let (_dir, index) = test_index();
        index.add(&quad(1, 2, 3, 4)).unwrap();
        index.add(&quad(1, 2, 3, 5)).unwrap();
        index.remove(&quad(1, 2, 3, 4)).unwrap();
        let got = all(
            &index,
            Pattern {
                graph: Some(iri(1)),
                subject: Some(iri(2)),
                property: Some(iri(3)),
                object: None,
            },
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.object, iri(5));
        assert_eq!(index.count(Pattern::graph(iri(1))).unwrap(), 1);
    }

    #[test]
    fn test_everything_removed_leaves_empty_index() {
        let (_dir, index) = test_index();
        let quads: Vec<Quad> = (0..30).map(|i| quad(i % 3, i % 5, i % 7, i)).collect();
        for q in &quads {
            index.add(q).unwrap();
        }
        for q in &quads {
            assert_ne!(index.remove(q).unwrap(), RemoveOutcome::NotFound);
        }
        assert_eq!(index.count(Pattern::everything()).unwrap(), 0);
        assert!(all(&index, Pattern::everything()).is_empty());
        for g in 0..3 {
            assert_eq!(index.count(Pattern::graph(iri(g))).unwrap(), 0);
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let index = QuadIndex::open(dir.path(), "quads", 64, true).unwrap();
            index.add(&quad(1, 2, 3, 4)).unwrap();
            index.add(&quad(1, 2, 3, 4)).unwrap();
            index.add(&quad(5, 6, 7, 8)).unwrap();
            index.flush().unwrap();
        }
        let index = QuadIndex::open(dir.path(), "quads", 64, true).unwrap();
        assert_eq!(index.count(Pattern::everything()).unwrap(), 3);
        let got = all(&index, Pattern::from(&quad(1, 2, 3, 4)));
        assert_eq!(got, vec![(quad(1, 2, 3, 4), 2)]);
        assert_eq!(index.remove(&quad(5, 6, 7, 8)).unwrap(), RemoveOutcome::Emptied);
    }
}
