//! Key-level dataset: node store plus quad index
//!
//! The two stores sit on independent file sets and never share a block.
//! This layer pairs every quad multiplicity change 1:1 with reference
//! count changes on the quad's interned terms (IRIs and literals; blank
//! and anonymous ids have no stored entry to count).

use crate::block::Key;
use crate::cache::CacheStats;
use crate::error::Result;
use crate::index::{AddOutcome, Pattern, Quad, QuadIndex, QuadIter, RemoveOutcome, TermId, TermKind};
use crate::nodes::NodeStore;
use crate::StoreConfig;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Point-in-time store counters
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Quads counted with multiplicity
    pub quads: u64,
    pub node_cache: CacheStats,
    pub index_cache: CacheStats,
}

pub struct Dataset {
    nodes: NodeStore,
    index: QuadIndex,
}

impl Dataset {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let nodes = NodeStore::open(
            &config.dir,
            "nodes",
            config.cache_blocks,
            config.reuse_entries,
        )?;
        let index = QuadIndex::open(
            &config.dir,
            "quads",
            config.cache_blocks,
            config.reuse_entries,
        )?;
        info!(dir = %config.dir.display(), "opened dataset");
        Ok(Dataset { nodes, index })
    }

    pub(crate) fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    fn adjust_refs(&self, quad: &Quad, up: bool) -> Result<()> {
        for term in [quad.graph, quad.subject, quad.property, quad.object] {
            match term.kind {
                TermKind::Iri | TermKind::Literal => {
                    if up {
                        self.nodes.inc_ref(term.key)?;
                    } else {
                        self.nodes.dec_ref(term.key)?;
                    }
                }
                TermKind::Blank | TermKind::Anonymous => {}
            }
        }
        Ok(())
    }

    pub fn add(&self, quad: &Quad) -> Result<AddOutcome> {
        let outcome = self.index.add(quad)?;
        self.adjust_refs(quad, true)?;
        Ok(outcome)
    }

    pub fn add_all<'a, I: IntoIterator<Item = &'a Quad>>(&self, quads: I) -> Result<u64> {
        let mut added = 0;
        for quad in quads {
            self.add(quad)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn remove(&self, quad: &Quad) -> Result<RemoveOutcome> {
        let outcome = self.index.remove(quad)?;
        if outcome != RemoveOutcome::NotFound {
            self.adjust_refs(quad, false)?;
        }
        Ok(outcome)
    }

    pub fn remove_all<'a, I: IntoIterator<Item = &'a Quad>>(&self, quads: I) -> Result<u64> {
        let mut removed = 0;
        for quad in quads {
            if self.remove(quad)? != RemoveOutcome::NotFound {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn get_all(&self, pattern: Pattern) -> Result<QuadIter<'_>> {
        self.index.get_all(pattern)
    }

    pub fn count(&self, pattern: Pattern) -> Result<u64> {
        self.index.count(pattern)
    }

    pub fn contains(&self, pattern: Pattern) -> Result<bool> {
        self.index.contains(pattern)
    }

    /// Drop every quad matching the graph, or the whole store on `None`.
    pub fn clear(&self, graph: Option<TermId>) -> Result<u64> {
        let pattern = Pattern {
            graph,
            ..Pattern::default()
        };
        let victims: Vec<(Quad, u64)> = self.get_all(pattern)?.collect::<Result<_>>()?;
        let mut dropped = 0;
        for (quad, multiplicity) in victims {
            for _ in 0..multiplicity {
                self.remove(&quad)?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Copy every quad of `from` into `to`, multiplicities included.
    /// `overwrite` clears the destination first; otherwise the graphs
    /// merge.
    pub fn copy(&self, from: TermId, to: TermId, overwrite: bool) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if overwrite {
            self.clear(Some(to))?;
        }
        let quads: Vec<(Quad, u64)> =
            self.get_all(Pattern::graph(from))?.collect::<Result<_>>()?;
        for (quad, multiplicity) in quads {
            let moved = Quad {
                graph: to,
                ..quad
            };
            for _ in 0..multiplicity {
                self.add(&moved)?;
            }
        }
        Ok(())
    }

    /// Copy then drain the source graph.
    pub fn move_graph(&self, from: TermId, to: TermId, overwrite: bool) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.copy(from, to, overwrite)?;
        self.clear(Some(from))?;
        Ok(())
    }

    pub fn mint_blank(&self) -> Result<u64> {
        self.nodes.mint_blank()
    }

    pub fn intern_string(&self, value: &str) -> Result<Key> {
        self.nodes.intern_string(value)
    }

    pub fn find_string(&self, value: &str) -> Result<Option<Key>> {
        self.nodes.find_string(value)
    }

    pub fn lookup_string(&self, key: Key) -> Result<Arc<str>> {
        self.nodes.lookup_string(key)
    }

    pub fn intern_literal(&self, lexical: Key, datatype: Key, lang: Key) -> Result<Key> {
        self.nodes.intern_literal(lexical, datatype, lang)
    }

    pub fn find_literal(&self, lexical: Key, datatype: Key, lang: Key) -> Result<Option<Key>> {
        self.nodes.find_literal(lexical, datatype, lang)
    }

    pub fn lookup_literal(&self, key: Key) -> Result<(Key, Key, Key)> {
        self.nodes.lookup_literal(key)
    }

    /// Live references to an interned term, one per quad occurrence
    pub fn term_ref_count(&self, key: Key) -> Result<u64> {
        self.nodes.ref_count(key)
    }

    pub fn flush(&self) -> Result<()> {
        self.nodes.flush()?;
        self.index.flush()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            quads: self.count(Pattern::everything())?,
            node_cache: self.nodes.cache_stats(),
            index_cache: self.index.cache_stats(),
        })
    }
}
