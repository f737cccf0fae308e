//! iSAX tree
//!
//! An n-ary tree over SAX words supporting insert, lazy removal and
//! approximate nearest-neighbor descent. Terminal nodes hold up to
//! `threshold` (pk, word) entries; internal nodes split on one word
//! position and key up to `cardinality` children by the symbol there.
//!
//! A terminal that overflows is converted into an internal node keyed at
//! the position where its words are most diverse (maximum symbol entropy,
//! ties to the smallest position). When no position discriminates — all
//! stored words are identical — the terminal is allowed to exceed the
//! threshold. Ownership is strictly parent → child; removal leaves empty
//! terminals in place.

use crate::sax::{SaxEncoder, SaxWord};
use crate::storage::error::DbResult;
use crate::storage::snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Terminal {
        entries: Vec<(String, SaxWord)>,
    },
    Internal {
        position: usize,
        children: BTreeMap<u8, Node>,
    },
}

impl Node {
    fn empty_terminal() -> Self {
        Node::Terminal {
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IsaxSnapshot {
    lsn: u64,
    word_length: usize,
    cardinality: usize,
    threshold: usize,
    root: Node,
}

/// The tree, parameterized by the SAX word shape and the terminal bound.
#[derive(Debug)]
pub struct IsaxTree {
    root: Node,
    word_length: usize,
    cardinality: usize,
    threshold: usize,
}

impl IsaxTree {
    pub fn new(word_length: usize, cardinality: usize, threshold: usize) -> Self {
        Self {
            root: Node::empty_terminal(),
            word_length,
            cardinality,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Total number of stored entries.
    pub fn len(&self) -> usize {
        fn count(node: &Node) -> usize {
            match node {
                Node::Terminal { entries } => entries.len(),
                Node::Internal { children, .. } => children.values().map(count).sum(),
            }
        }
        count(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an entry. The word must have the tree's word length.
    pub fn insert(&mut self, pk: &str, word: SaxWord) {
        debug_assert_eq!(word.len(), self.word_length);
        let threshold = self.threshold;
        Self::insert_into(&mut self.root, pk.to_string(), word, threshold);
    }

    fn insert_into(node: &mut Node, pk: String, word: SaxWord, threshold: usize) {
        match node {
            Node::Internal { position, children } => {
                let sym = word.symbols()[*position];
                let child = children.entry(sym).or_insert_with(Node::empty_terminal);
                Self::insert_into(child, pk, word, threshold);
            }
            Node::Terminal { entries } => {
                entries.push((pk, word));
                if entries.len() > threshold {
                    Self::try_split(node, threshold);
                }
            }
        }
    }

    /// Convert an overflowing terminal into an internal node, splitting
    /// children recursively while any position still discriminates.
    fn try_split(node: &mut Node, threshold: usize) {
        let Node::Terminal { entries } = node else {
            return;
        };
        let Some(position) = Self::best_split_position(entries) else {
            // every stored word is identical; overflow is allowed
            return;
        };

        let moved = std::mem::take(entries);
        let mut children: BTreeMap<u8, Node> = BTreeMap::new();
        for (pk, word) in moved {
            let sym = word.symbols()[position];
            match children.entry(sym).or_insert_with(Node::empty_terminal) {
                Node::Terminal { entries } => entries.push((pk, word)),
                Node::Internal { .. } => unreachable!("fresh children are terminals"),
            }
        }
        *node = Node::Internal { position, children };

        if let Node::Internal { children, .. } = node {
            for child in children.values_mut() {
                let oversized = matches!(
                    child,
                    Node::Terminal { entries } if entries.len() > threshold
                );
                if oversized {
                    Self::try_split(child, threshold);
                }
            }
        }
    }

    /// Position with maximum symbol entropy, smallest index on ties.
    /// `None` when no position discriminates.
    fn best_split_position(entries: &[(String, SaxWord)]) -> Option<usize> {
        let word_length = entries.first()?.1.len();
        let total = entries.len() as f64;

        let mut best: Option<(usize, f64)> = None;
        for p in 0..word_length {
            let mut counts: BTreeMap<u8, usize> = BTreeMap::new();
            for (_, word) in entries {
                *counts.entry(word.symbols()[p]).or_default() += 1;
            }
            let entropy: f64 = counts
                .values()
                .map(|&c| {
                    let q = c as f64 / total;
                    -q * q.log2()
                })
                .sum();
            if entropy > 0.0 && best.map_or(true, |(_, e)| entropy > e) {
                best = Some((p, entropy));
            }
        }
        best.map(|(p, _)| p)
    }

    /// Remove the entry for `pk`, located by descending with its stored
    /// word. Empty terminals are retained. Returns whether an entry was
    /// removed.
    pub fn remove(&mut self, pk: &str, word: &SaxWord) -> bool {
        let mut node = &mut self.root;
        loop {
            match node {
                Node::Terminal { entries } => {
                    let before = entries.len();
                    entries.retain(|(p, _)| p != pk);
                    return entries.len() < before;
                }
                Node::Internal { position, children } => {
                    let sym = word.symbols()[*position];
                    match children.get_mut(&sym) {
                        Some(child) => node = child,
                        None => return false,
                    }
                }
            }
        }
    }

    /// Whether `pk` is stored, descending with its word.
    pub fn contains(&self, pk: &str, word: &SaxWord) -> bool {
        let mut node = &self.root;
        loop {
            match node {
                Node::Terminal { entries } => {
                    return entries.iter().any(|(p, _)| p == pk);
                }
                Node::Internal { position, children } => {
                    let sym = word.symbols()[*position];
                    match children.get(&sym) {
                        Some(child) => node = child,
                        None => return false,
                    }
                }
            }
        }
    }

    /// Approximate-NN descent: follow the matching child at each internal
    /// node, falling back to the child with the nearest symbol in
    /// breakpoint space (smaller symbol on ties). Returns the reached
    /// terminal's entries; the caller refines with exact distances.
    pub fn candidates<'a>(
        &'a self,
        word: &SaxWord,
        encoder: &SaxEncoder,
    ) -> &'a [(String, SaxWord)] {
        let mut node = &self.root;
        loop {
            match node {
                Node::Terminal { entries } => return entries,
                Node::Internal { position, children } => {
                    let sym = word.symbols()[*position];
                    node = match children.get(&sym) {
                        Some(child) => child,
                        None => {
                            let (_, nearest) = children
                                .iter()
                                .min_by(|(a, _), (b, _)| {
                                    encoder
                                        .symbol_distance(sym, **a)
                                        .total_cmp(&encoder.symbol_distance(sym, **b))
                                        .then(a.cmp(b))
                                })
                                .expect("internal nodes have at least one child");
                            nearest
                        }
                    };
                }
            }
        }
    }

    /// Entry lists of every terminal, for structural checks.
    pub fn terminals(&self) -> Vec<&[(String, SaxWord)]> {
        fn collect<'a>(node: &'a Node, out: &mut Vec<&'a [(String, SaxWord)]>) {
            match node {
                Node::Terminal { entries } => out.push(entries),
                Node::Internal { children, .. } => {
                    for child in children.values() {
                        collect(child, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }

    /// Persist the tree tagged with the primary-index lsn.
    pub fn save(&self, path: &Path, lsn: u64) -> DbResult<()> {
        snapshot::write_snapshot(
            path,
            &IsaxSnapshot {
                lsn,
                word_length: self.word_length,
                cardinality: self.cardinality,
                threshold: self.threshold,
                root: self.root.clone(),
            },
        )
    }

    /// Load a snapshot if it exists, is intact, was taken at exactly
    /// `expected_lsn` and matches the configured parameters; otherwise
    /// `None` and the caller rebuilds from the series heap.
    pub fn load(
        path: &Path,
        word_length: usize,
        cardinality: usize,
        threshold: usize,
        expected_lsn: u64,
    ) -> Option<Self> {
        let snap: Option<IsaxSnapshot> = match snapshot::read_snapshot(path) {
            Ok(snap) => snap,
            Err(e) => {
                tracing::warn!("iSAX snapshot unreadable ({}); will rebuild", e);
                None
            }
        };
        snap.and_then(|s| {
            if s.lsn != expected_lsn
                || s.word_length != word_length
                || s.cardinality != cardinality
                || s.threshold != threshold
            {
                tracing::warn!("iSAX snapshot stale or mismatched; will rebuild");
                return None;
            }
            Some(Self {
                root: s.root,
                word_length: s.word_length,
                cardinality: s.cardinality,
                threshold: s.threshold,
            })
        })
    }
}
