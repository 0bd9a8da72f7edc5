//! Trie node records and term identities
//!
//! A QNode is one link in a level chain of the quad trie:
//! `next(8) | type(4) | key(8) | child(8)`. `child` points at the chain
//! head of the next level, or at the 8-byte multiplicity counter on the
//! graph level.

use crate::block::Key;
use crate::error::{Result, StoreError};
use crate::page::PageAllocator;

/// Kind tag distinguishing term key spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum TermKind {
    Iri = 1,
    Blank = 2,
    Anonymous = 3,
    Literal = 4,
}

impl TermKind {
    pub(crate) fn from_u32(raw: u32) -> Result<TermKind> {
        match raw {
            1 => Ok(TermKind::Iri),
            2 => Ok(TermKind::Blank),
            3 => Ok(TermKind::Anonymous),
            4 => Ok(TermKind::Literal),
            other => Err(StoreError::bad_state(format!("term kind tag {other}"))),
        }
    }
}

/// A resolved term: its kind plus the interned key (node-store entry for
/// IRIs and literals, minted id for blank and anonymous nodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId {
    pub kind: TermKind,
    pub key: Key,
}

impl TermId {
    pub fn new(kind: TermKind, key: Key) -> Self {
        TermId { kind, key }
    }

    pub fn iri(key: Key) -> Self {
        TermId::new(TermKind::Iri, key)
    }

    pub fn blank(id: u64) -> Self {
        TermId::new(TermKind::Blank, Key::from_raw(id))
    }

    pub fn anonymous(id: u64) -> Self {
        TermId::new(TermKind::Anonymous, Key::from_raw(id))
    }

    pub fn literal(key: Key) -> Self {
        TermId::new(TermKind::Literal, key)
    }
}

/// One stored quad at the key level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub graph: TermId,
    pub subject: TermId,
    pub property: TermId,
    pub object: TermId,
}

pub(crate) const QNODE_BYTES: usize = 8 + 4 + 8 + 8;

#[derive(Debug, Clone, Copy)]
pub(crate) struct QNode {
    pub(crate) next: Key,
    pub(crate) term: TermId,
    pub(crate) child: Key,
}

pub(crate) fn load(alloc: &PageAllocator, at: Key) -> Result<QNode> {
    let mut lease = alloc.access(at, false)?;
    let next = lease.read_key()?;
    let kind = TermKind::from_u32(lease.read_u32()?)?;
    let key = lease.read_key()?;
    let child = lease.read_key()?;
    Ok(QNode {
        next,
        term: TermId { kind, key },
        child,
    })
}

pub(crate) fn create(alloc: &PageAllocator, node: &QNode) -> Result<Key> {
    let at = alloc.allocate(QNODE_BYTES)?;
    let mut lease = alloc.access(at, true)?;
    lease.write_key(node.next)?;
    lease.write_u32(node.term.kind as u32)?;
    lease.write_key(node.term.key)?;
    lease.write_key(node.child)?;
    Ok(at)
}

pub(crate) fn set_next(alloc: &PageAllocator, at: Key, next: Key) -> Result<()> {
    alloc.access(at, true)?.write_key(next)
}

pub(crate) fn set_child(alloc: &PageAllocator, at: Key, child: Key) -> Result<()> {
    let mut lease = alloc.access(at, true)?;
    lease.seek(20)?;
    lease.write_key(child)
}

/// Walk a sibling chain for a term, returning the preceding node and the
/// match. A null `prev` means the match is the chain head.
pub(crate) fn find(
    alloc: &PageAllocator,
    head: Key,
    term: TermId,
) -> Result<Option<(Key, Key, QNode)>> {
    let mut prev = Key::NULL;
    let mut at = head;
    while !at.is_null() {
        let node = load(alloc, at)?;
        if node.term == term {
            return Ok(Some((prev, at, node)));
        }
        prev = at;
        at = node.next;
    }
    Ok(None)
}
