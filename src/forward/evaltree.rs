// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Evaluation tree: an arena of partial products shared across circuits.
//!
//! Node `i` is either the identity, a single operation, or the product of
//! two earlier nodes (a prefix followed by a suffix). Nodes only reference
//! lower indices, so evaluating them in order is always valid. Intermediate
//! results are released after their last use; only the requested finals
//! are retained.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use crate::error::{Error, Result};

/// One node of the evaluation arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalNode {
    /// Empty product.
    Identity,
    /// A single operation, by operation key.
    Leaf(String),
    /// Product of `prefix` followed by `suffix` (matrix `M(suffix)·M(prefix)`).
    Product { prefix: usize, suffix: usize },
}

/// Evaluation plan for a list of operation sequences.
#[derive(Debug, Clone)]
pub struct EvalTree {
    nodes: Vec<EvalNode>,
    finals: Vec<usize>,
    last_use: Vec<usize>,
    retained: Vec<bool>,
    peak_cache_size: usize,
    shared: bool,
}

impl EvalTree {
    /// Build a tree sharing common prefixes and repeated sub-sequences.
    ///
    /// If the shared plan needs more than `max_cache_size` simultaneously
    /// cached products, falls back to evaluating each sequence as an
    /// independent chain; fails with `UnsupportedLength` only if even that
    /// does not fit.
    pub fn build(sequences: &[Vec<String>], max_cache_size: Option<usize>) -> Result<Self> {
        let shared = Self::build_shared(sequences);
        let limit = match max_cache_size {
            None => return Ok(shared),
            Some(limit) => limit,
        };
        if shared.peak_cache_size <= limit {
            return Ok(shared);
        }

        let trivial = Self::build_trivial(sequences);
        if trivial.peak_cache_size <= limit {
            return Ok(trivial);
        }
        Err(Error::UnsupportedLength {
            requested: trivial.peak_cache_size,
            limit,
        })
    }

    /// Shortest-first construction: each sequence extends its longest
    /// already-evaluated prefix by the longest earlier sequences it
    /// contains, falling back to single-operation leaves.
    fn build_shared(sequences: &[Vec<String>]) -> Self {
        let mut nodes = vec![EvalNode::Identity];
        let mut leaves: HashMap<&str, usize> = HashMap::new();
        // prefix trie over labels; trie node -> evaluated product, if any
        let mut trie: HashMap<(usize, &str), usize> = HashMap::new();
        let mut trie_value: Vec<Option<usize>> = vec![Some(0)];
        // complete earlier sequences by length, reusable as chunks
        let mut chunks: BTreeMap<usize, HashMap<&[String], usize>> = BTreeMap::new();

        let mut order: Vec<usize> = (0..sequences.len()).collect();
        order.sort_by_key(|&i| sequences[i].len());

        let mut finals = vec![0; sequences.len()];
        for idx in order {
            let seq = &sequences[idx];

            let (mut start, mut current, mut anchor) = (0, 0, 0);
            let mut t = 0;
            for (k, label) in seq.iter().enumerate() {
                let Some(&child) = trie.get(&(t, label.as_str())) else {
                    break;
                };
                t = child;
                if let Some(node) = trie_value[child] {
                    start = k + 1;
                    current = node;
                    anchor = child;
                }
            }

            while start < seq.len() {
                let remaining = seq.len() - start;
                let found = if remaining >= 2 {
                    chunks.range(2..=remaining).rev().find_map(|(&len, table)| {
                        table.get(&seq[start..start + len]).map(|&node| (len, node))
                    })
                } else {
                    None
                };
                let (len, chunk_node) = match found {
                    Some(hit) => hit,
                    None => {
                        let label = seq[start].as_str();
                        let leaf = *leaves.entry(label).or_insert_with(|| {
                            nodes.push(EvalNode::Leaf(label.to_string()));
                            nodes.len() - 1
                        });
                        (1, leaf)
                    }
                };

                current = if current == 0 {
                    chunk_node
                } else {
                    nodes.push(EvalNode::Product {
                        prefix: current,
                        suffix: chunk_node,
                    });
                    nodes.len() - 1
                };

                for label in &seq[start..start + len] {
                    anchor = *trie.entry((anchor, label.as_str())).or_insert_with(|| {
                        trie_value.push(None);
                        trie_value.len() - 1
                    });
                }
                trie_value[anchor].get_or_insert(current);
                start += len;
            }

            finals[idx] = current;
            if seq.len() >= 2 {
                chunks
                    .entry(seq.len())
                    .or_default()
                    .entry(seq.as_slice())
                    .or_insert(current);
            }
        }

        Self::finish(nodes, finals, true)
    }

    /// No sharing beyond single-operation leaves.
    fn build_trivial(sequences: &[Vec<String>]) -> Self {
        let mut nodes = vec![EvalNode::Identity];
        let mut leaves: HashMap<&str, usize> = HashMap::new();
        let mut finals = Vec::with_capacity(sequences.len());

        for seq in sequences {
            let mut current = 0;
            for label in seq {
                let leaf = *leaves.entry(label.as_str()).or_insert_with(|| {
                    nodes.push(EvalNode::Leaf(label.clone()));
                    nodes.len() - 1
                });
                current = if current == 0 {
                    leaf
                } else {
                    nodes.push(EvalNode::Product {
                        prefix: current,
                        suffix: leaf,
                    });
                    nodes.len() - 1
                };
            }
            finals.push(current);
        }

        Self::finish(nodes, finals, false)
    }

    fn finish(nodes: Vec<EvalNode>, finals: Vec<usize>, shared: bool) -> Self {
        let n = nodes.len();
        let mut last_use: Vec<usize> = (0..n).collect();
        for (i, node) in nodes.iter().enumerate() {
            if let EvalNode::Product { prefix, suffix } = node {
                last_use[*prefix] = last_use[*prefix].max(i);
                last_use[*suffix] = last_use[*suffix].max(i);
            }
        }
        let mut retained = vec![false; n];
        for &f in &finals {
            retained[f] = true;
        }
        // leaves stay cached for the whole evaluation
        for (i, node) in nodes.iter().enumerate() {
            if matches!(node, EvalNode::Leaf(_) | EvalNode::Identity) {
                retained[i] = true;
            }
        }

        let mut alive = 0usize;
        let mut peak = 0usize;
        let mut releases: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            if !retained[i] {
                releases[last_use[i]].push(i);
            }
        }
        for release in &releases {
            alive += 1;
            peak = peak.max(alive);
            alive -= release.len();
        }

        Self {
            nodes,
            finals,
            last_use,
            retained,
            peak_cache_size: peak,
            shared,
        }
    }

    pub fn nodes(&self) -> &[EvalNode] {
        &self.nodes
    }

    /// Node index holding the product of each input sequence.
    pub fn finals(&self) -> &[usize] {
        &self.finals
    }

    /// Whether node `i` can be released once node `at` has been computed.
    pub fn releasable(&self, i: usize, at: usize) -> bool {
        !self.retained[i] && self.last_use[i] == at
    }

    /// Most products held in memory at once during evaluation.
    pub fn peak_cache_size(&self) -> usize {
        self.peak_cache_size
    }

    /// Whether the tree shares structure beyond leaves.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Split `count` items into at most `num_chunks` contiguous ranges of
/// near-equal size.
pub fn split_ranges(count: usize, num_chunks: usize) -> Vec<Range<usize>> {
    let chunks = num_chunks.clamp(1, count.max(1));
    let base = count / chunks;
    let extra = count % chunks;
    let mut out = Vec::with_capacity(chunks);
    let mut start = 0;
    for k in 0..chunks {
        let len = base + usize::from(k < extra);
        out.push(start..start + len);
        start += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(items: &[&[&str]]) -> Vec<Vec<String>> {
        items
            .iter()
            .map(|s| s.iter().map(|l| l.to_string()).collect())
            .collect()
    }

    /// Expand node `i` back into its operation sequence.
    fn expand(tree: &EvalTree, i: usize) -> Vec<String> {
        match &tree.nodes()[i] {
            EvalNode::Identity => Vec::new(),
            EvalNode::Leaf(l) => vec![l.clone()],
            EvalNode::Product { prefix, suffix } => {
                assert!(*prefix < i && *suffix < i);
                let mut out = expand(tree, *prefix);
                out.extend(expand(tree, *suffix));
                out
            }
        }
    }

    #[test]
    fn test_finals_reproduce_sequences() {
        let input = seqs(&[
            &["Gx", "Gy", "Gx", "Gy"],
            &[],
            &["Gx"],
            &["Gx", "Gy"],
            &["Gy", "Gx", "Gy", "Gx", "Gy"],
            &["Gx", "Gy"],
        ]);
        for tree in [
            EvalTree::build_shared(&input),
            EvalTree::build_trivial(&input),
        ] {
            for (k, seq) in input.iter().enumerate() {
                assert_eq!(&expand(&tree, tree.finals()[k]), seq);
            }
        }
    }

    #[test]
    fn test_shared_tree_reuses_repeated_germs() {
        let germ = ["Gx", "Gy"];
        let input: Vec<Vec<String>> = (1..=8)
            .map(|p| germ.repeat(p).iter().map(|s| s.to_string()).collect())
            .collect();
        let shared = EvalTree::build_shared(&input);
        let trivial = EvalTree::build_trivial(&input);
        assert!(shared.is_shared());
        assert!(shared.len() < trivial.len());
    }

    #[test]
    fn test_cache_limit_falls_back_to_trivial() {
        let input = seqs(&[&["Gx", "Gx", "Gx"], &["Gx", "Gx", "Gy"], &["Gy", "Gx"]]);
        let shared = EvalTree::build(&input, None).unwrap();
        let trivial = EvalTree::build_trivial(&input);
        if trivial.peak_cache_size() < shared.peak_cache_size() {
            let tree = EvalTree::build(&input, Some(trivial.peak_cache_size())).unwrap();
            assert!(!tree.is_shared());
        }
    }

    #[test]
    fn test_cache_limit_too_small() {
        let input = seqs(&[&["Gx", "Gy", "Gx"], &["Gy", "Gy"]]);
        let err = EvalTree::build(&input, Some(1)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLength { limit: 1, .. }));
    }

    #[test]
    fn test_intermediates_are_released() {
        let input = seqs(&[&["Gx", "Gy", "Gx", "Gy", "Gx", "Gy"]]);
        let tree = EvalTree::build_trivial(&input);
        // chain: products 3..=7, only the last is a final
        assert!(tree.peak_cache_size() < tree.len());
    }

    #[test]
    fn test_split_ranges() {
        assert_eq!(split_ranges(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(split_ranges(2, 8), vec![0..1, 1..2]);
        assert_eq!(split_ranges(0, 4), vec![0..0]);
    }
}
