//! Persistent quad storage for RDF datasets
//!
//! A binary, concurrently readable file format holding interned terms and
//! quads. The layers, bottom up: fixed 8 KiB blocks multiplexed through a
//! bounded lock-free cache, shared/exclusive byte-range leases, a
//! page-level record allocator, an interned node store and a four-level
//! quad trie with a reverse per-graph summary. Contention resolves by
//! busy-retry throughout; nothing waits on a condition variable.
//!
//! [`QuadStore`] is the value-level entry point; [`Dataset`] exposes the
//! same operations over pre-resolved term keys for callers that manage
//! interning themselves, such as incremental pattern matchers.
//!
//! ```no_run
//! use quadstore::{QuadStore, StoreConfig, Term};
//!
//! # fn main() -> quadstore::Result<()> {
//! let store = QuadStore::open(StoreConfig::new("./data"))?;
//! let g = Term::iri("http://example.org/graph");
//! let s = Term::iri("http://example.org/alice");
//! let p = Term::iri("http://example.org/knows");
//! let o = Term::iri("http://example.org/bob");
//! store.insert(&g, &s, &p, &o)?;
//! assert_eq!(store.count(Some(&g), None, None, None)?, 1);
//! store.flush()?;
//! # Ok(())
//! # }
//! ```

mod arbiter;
mod block;
mod cache;
mod dataset;
mod error;
mod files;
mod index;
mod nodes;
mod page;
mod pmap;

pub use block::{Key, BLOCK_SIZE};
pub use cache::CacheStats;
pub use dataset::{Dataset, StoreStats};
pub use error::{Result, StoreError};
pub use index::{AddOutcome, Pattern, Quad, QuadIter, RemoveOutcome, TermId, TermKind};

use serde::Serialize;
use std::path::PathBuf;

/// Store location and tuning knobs
#[derive(Debug, Clone, Serialize)]
pub struct StoreConfig {
    /// Directory holding the backing files, created on open
    pub dir: PathBuf,
    /// Block cache capacity per file set
    pub cache_blocks: usize,
    /// Reuse freed page entries on allocation
    pub reuse_entries: bool,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StoreConfig {
            dir: dir.into(),
            cache_blocks: 256,
            reuse_entries: true,
        }
    }
}

/// An RDF term at the value level
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Iri(String),
    Literal {
        lexical: String,
        datatype: Option<String>,
        lang: Option<String>,
    },
    Blank(u64),
    /// Internal node minted by upstream matchers; never produced by
    /// parsing
    Anonymous(u64),
}

impl Term {
    pub fn iri(value: impl Into<String>) -> Self {
        Term::Iri(value.into())
    }

    pub fn literal(lexical: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            datatype: None,
            lang: None,
        }
    }

    pub fn typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            datatype: Some(datatype.into()),
            lang: None,
        }
    }

    pub fn tagged(lexical: impl Into<String>, lang: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            datatype: None,
            lang: Some(lang.into()),
        }
    }
}

/// Value-level store: terms in, terms out, interning and reference
/// counting handled internally.
pub struct QuadStore {
    dataset: Dataset,
}

impl QuadStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        Ok(QuadStore {
            dataset: Dataset::open(&config)?,
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Mint a fresh blank node, unique for the lifetime of the store
    /// directory.
    pub fn new_blank(&self) -> Result<Term> {
        Ok(Term::Blank(self.dataset.mint_blank()?))
    }

    /// Resolve a term to its identity, interning it when `create` is set.
    /// Without `create`, an unknown term resolves to `None`.
    fn resolve(&self, term: &Term, create: bool) -> Result<Option<TermId>> {
        let key_of = |value: &str| -> Result<Option<Key>> {
            if create {
                self.dataset.intern_string(value).map(Some)
            } else {
                self.dataset.find_string(value)
            }
        };
        match term {
            Term::Iri(value) => Ok(key_of(value)?.map(TermId::iri)),
            Term::Blank(id) => Ok(Some(TermId::blank(*id))),
            Term::Anonymous(id) => Ok(Some(TermId::anonymous(*id))),
            Term::Literal {
                lexical,
                datatype,
                lang,
            } => {
                let Some(lex) = key_of(lexical)? else {
                    return Ok(None);
                };
                let dt = match datatype {
                    Some(value) => match key_of(value)? {
                        Some(key) => key,
                        None => return Ok(None),
                    },
                    None => Key::NULL,
                };
                let lg = match lang {
                    Some(value) => match key_of(value)? {
                        Some(key) => key,
                        None => return Ok(None),
                    },
                    None => Key::NULL,
                };
                if create {
                    Ok(Some(TermId::literal(
                        self.dataset.intern_literal(lex, dt, lg)?,
                    )))
                } else {
                    Ok(self.dataset.find_literal(lex, dt, lg)?.map(TermId::literal))
                }
            }
        }
    }

    /// Materialize the term behind an identity from a query result.
    pub fn term(&self, id: TermId) -> Result<Term> {
        match id.kind {
            TermKind::Iri => Ok(Term::Iri(self.dataset.lookup_string(id.key)?.to_string())),
            TermKind::Blank => Ok(Term::Blank(id.key.raw())),
            TermKind::Anonymous => Ok(Term::Anonymous(id.key.raw())),
            TermKind::Literal => {
                let (lex, dt, lg) = self.dataset.lookup_literal(id.key)?;
                let fetch = |key: Key| -> Result<Option<String>> {
                    if key.is_null() {
                        Ok(None)
                    } else {
                        Ok(Some(self.dataset.lookup_string(key)?.to_string()))
                    }
                };
                Ok(Term::Literal {
                    lexical: self.dataset.lookup_string(lex)?.to_string(),
                    datatype: fetch(dt)?,
                    lang: fetch(lg)?,
                })
            }
        }
    }

    pub fn insert(&self, graph: &Term, subject: &Term, property: &Term, object: &Term) -> Result<AddOutcome> {
        let quad = Quad {
            graph: self.require(graph)?,
            subject: self.require(subject)?,
            property: self.require(property)?,
            object: self.require(object)?,
        };
        self.dataset.add(&quad)
    }

    pub fn delete(&self, graph: &Term, subject: &Term, property: &Term, object: &Term) -> Result<RemoveOutcome> {
        let resolved = (
            self.resolve(graph, false)?,
            self.resolve(subject, false)?,
            self.resolve(property, false)?,
            self.resolve(object, false)?,
        );
        let (Some(g), Some(s), Some(p), Some(o)) = resolved else {
            return Ok(RemoveOutcome::NotFound);
        };
        self.dataset.remove(&Quad {
            graph: g,
            subject: s,
            property: p,
            object: o,
        })
    }

    fn require(&self, term: &Term) -> Result<TermId> {
        match self.resolve(term, true)? {
            Some(id) => Ok(id),
            None => Err(StoreError::bad_state("interning produced no key")),
        }
    }

    /// Build a pattern from optional bound terms. `None` when a bound
    /// term is not in the store at all, so no quad can match.
    fn pattern(
        &self,
        graph: Option<&Term>,
        subject: Option<&Term>,
        property: Option<&Term>,
        object: Option<&Term>,
    ) -> Result<Option<Pattern>> {
        let mut pattern = Pattern::default();
        for (slot, term) in [
            (&mut pattern.graph, graph),
            (&mut pattern.subject, subject),
            (&mut pattern.property, property),
            (&mut pattern.object, object),
        ] {
            if let Some(term) = term {
                match self.resolve(term, false)? {
                    Some(id) => *slot = Some(id),
                    None => return Ok(None),
                }
            }
        }
        Ok(Some(pattern))
    }

    /// Matching quads with their multiplicities, at the key level; use
    /// [`QuadStore::term`] to materialize the identities.
    pub fn query(
        &self,
        graph: Option<&Term>,
        subject: Option<&Term>,
        property: Option<&Term>,
        object: Option<&Term>,
    ) -> Result<Vec<(Quad, u64)>> {
        let Some(pattern) = self.pattern(graph, subject, property, object)? else {
            return Ok(Vec::new());
        };
        self.dataset.get_all(pattern)?.collect()
    }

    pub fn count(
        &self,
        graph: Option<&Term>,
        subject: Option<&Term>,
        property: Option<&Term>,
        object: Option<&Term>,
    ) -> Result<u64> {
        match self.pattern(graph, subject, property, object)? {
            Some(pattern) => self.dataset.count(pattern),
            None => Ok(0),
        }
    }

    pub fn contains(
        &self,
        graph: Option<&Term>,
        subject: Option<&Term>,
        property: Option<&Term>,
        object: Option<&Term>,
    ) -> Result<bool> {
        match self.pattern(graph, subject, property, object)? {
            Some(pattern) => self.dataset.contains(pattern),
            None => Ok(false),
        }
    }

    pub fn clear(&self, graph: Option<&Term>) -> Result<u64> {
        match graph {
            Some(term) => match self.resolve(term, false)? {
                Some(id) => self.dataset.clear(Some(id)),
                None => Ok(0),
            },
            None => self.dataset.clear(None),
        }
    }

    pub fn copy(&self, from: &Term, to: &Term, overwrite: bool) -> Result<()> {
        let Some(from) = self.resolve(from, false)? else {
            return Ok(());
        };
        let to = self.require(to)?;
        self.dataset.copy(from, to, overwrite)
    }

    pub fn move_graph(&self, from: &Term, to: &Term, overwrite: bool) -> Result<()> {
        let Some(from) = self.resolve(from, false)? else {
            return Ok(());
        };
        let to = self.require(to)?;
        self.dataset.move_graph(from, to, overwrite)
    }

    pub fn flush(&self) -> Result<()> {
        self.dataset.flush()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.dataset.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, QuadStore) {
        let dir = TempDir::new().unwrap();
        let store = QuadStore::open(StoreConfig::new(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_query_roundtrip() {
        let (_dir, store) = test_store();
        let g = Term::iri("http://example.org/g");
        let s = Term::iri("http://example.org/alice");
        let p = Term::iri("http://example.org/name");
        let o = Term::tagged("Alice", "en");
        assert_eq!(store.insert(&g, &s, &p, &o).unwrap(), AddOutcome::New);

        let found = store.query(Some(&g), Some(&s), None, None).unwrap();
        assert_eq!(found.len(), 1);
        let (quad, multiplicity) = &found[0];
        assert_eq!(*multiplicity, 1);
        assert_eq!(store.term(quad.object).unwrap(), o);
        assert_eq!(store.term(quad.property).unwrap(), p);
    }

    #[test]
    fn test_unknown_bound_terms_match_nothing() {
        let (_dir, store) = test_store();
        let g = Term::iri("http://example.org/g");
        store
            .insert(&g, &Term::iri("s"), &Term::iri("p"), &Term::iri("o"))
            .unwrap();
        let ghost = Term::iri("http://example.org/ghost");
        assert_eq!(store.count(None, Some(&ghost), None, None).unwrap(), 0);
        assert!(!store.contains(Some(&ghost), None, None, None).unwrap());
        assert!(store.query(None, None, None, Some(&ghost)).unwrap().is_empty());
        assert_eq!(
            store.delete(&g, &ghost, &Term::iri("p"), &Term::iri("o")).unwrap(),
            RemoveOutcome::NotFound
        );
    }

    #[test]
    fn test_blank_nodes_are_distinct() {
        let (_dir, store) = test_store();
        let b1 = store.new_blank().unwrap();
        let b2 = store.new_blank().unwrap();
        assert_ne!(b1, b2);
        let g = Term::iri("g");
        let p = Term::iri("p");
        store.insert(&g, &b1, &p, &Term::literal("x")).unwrap();
        store.insert(&g, &b2, &p, &Term::literal("x")).unwrap();
        assert_eq!(store.count(Some(&g), None, None, None).unwrap(), 2);
        assert_eq!(store.count(Some(&g), Some(&b1), None, None).unwrap(), 1);
    }

    #[test]
    fn test_literal_forms_are_distinct() {
        let (_dir, store) = test_store();
        let g = Term::iri("g");
        let s = Term::iri("s");
        let p = Term::iri("p");
        let plain = Term::literal("42");
        let typed = Term::typed("42", "http://www.w3.org/2001/XMLSchema#integer");
        store.insert(&g, &s, &p, &plain).unwrap();
        store.insert(&g, &s, &p, &typed).unwrap();
        assert_eq!(store.count(Some(&g), Some(&s), Some(&p), None).unwrap(), 2);
        assert!(store.contains(None, None, None, Some(&typed)).unwrap());
        store.delete(&g, &s, &p, &plain).unwrap();
        assert!(!store.contains(None, None, None, Some(&plain)).unwrap());
        assert!(store.contains(None, None, None, Some(&typed)).unwrap());
    }

    #[test]
    fn test_reopen_restores_everything() {
        let dir = TempDir::new().unwrap();
        let g = Term::iri("g");
        let s = Term::iri("s");
        let p = Term::iri("p");
        let o = Term::literal("persisted");
        {
            let store = QuadStore::open(StoreConfig::new(dir.path())).unwrap();
            store.insert(&g, &s, &p, &o).unwrap();
            store.insert(&g, &s, &p, &o).unwrap();
            store.flush().unwrap();
        }
        let store = QuadStore::open(StoreConfig::new(dir.path())).unwrap();
        let found = store.query(Some(&g), Some(&s), Some(&p), Some(&o)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, 2);
        assert_eq!(store.stats().unwrap().quads, 2);
    }
}
