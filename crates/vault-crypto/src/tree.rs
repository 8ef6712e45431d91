//! Flat-tree Merkle scheme over a feed's blocks.
//!
//! Nodes are addressed by their *flat index*: leaf `i` is `2i`, and a node
//! at depth `d` and offset `o` is `(o << (d + 1)) | (2^d - 1)`. Only complete
//! subtrees are ever materialized, so a stored node never changes as the feed
//! grows. The root over `[0, length)` is the balanced binary reduction in
//! which an odd trailing node is promoted unchanged; that reduction equals the
//! right fold of the *peaks* (maximal complete subtrees), which is how it is
//! computed here.

use serde::{Deserialize, Serialize};
use vault_types::Hash;

use crate::hasher::DomainHasher;

/// A tree node: hash plus the number of block bytes it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hash: Hash,
    pub size: u64,
}

/// Encoded width of a [`Node`].
pub const NODE_BYTES: usize = 40;

impl Node {
    pub fn to_bytes(&self) -> [u8; NODE_BYTES] {
        let mut out = [0u8; NODE_BYTES];
        out[..32].copy_from_slice(self.hash.as_bytes());
        out[32..].copy_from_slice(&self.size.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != NODE_BYTES {
            return None;
        }
        let hash: [u8; 32] = bytes[..32].try_into().ok()?;
        let size = u64::from_be_bytes(bytes[32..].try_into().ok()?);
        Some(Self {
            hash: Hash::from_bytes(hash),
            size,
        })
    }
}

/// Leaf node for a block.
pub fn leaf(data: &[u8]) -> Node {
    let size = data.len() as u64;
    Node {
        hash: DomainHasher::LEAF.hash_parts(&[&size.to_be_bytes(), data]),
        size,
    }
}

/// Parent of two adjacent nodes.
pub fn parent(left: &Node, right: &Node) -> Node {
    let size = left.size + right.size;
    Node {
        hash: DomainHasher::PARENT.hash_parts(&[
            &size.to_be_bytes(),
            left.hash.as_bytes(),
            right.hash.as_bytes(),
        ]),
        size,
    }
}

/// Right fold of `nodes`: `parent(n0, parent(n1, ... n_last))`.
pub fn fold(nodes: &[Node]) -> Option<Node> {
    let (last, rest) = nodes.split_last()?;
    Some(rest.iter().rev().fold(*last, |acc, n| parent(n, &acc)))
}

/// Root hash over the given peaks; the empty root when there are none.
pub fn root_hash(peaks: &[Node]) -> Hash {
    match fold(peaks) {
        Some(node) => node.hash,
        None => DomainHasher::EMPTY.hash(&[]),
    }
}

/// Flat-tree index arithmetic.
pub mod flat {
    pub fn index(depth: u32, offset: u64) -> u64 {
        (offset << (depth + 1)) | ((1u64 << depth) - 1)
    }

    pub fn depth(index: u64) -> u32 {
        index.trailing_ones()
    }

    pub fn offset(index: u64) -> u64 {
        index >> (depth(index) + 1)
    }

    pub fn parent(index: u64) -> u64 {
        let d = depth(index);
        self::index(d + 1, offset(index) >> 1)
    }

    pub fn sibling(index: u64) -> u64 {
        let d = depth(index);
        self::index(d, offset(index) ^ 1)
    }

    pub fn is_left(index: u64) -> bool {
        offset(index) & 1 == 0
    }

    /// Children of a non-leaf node.
    pub fn children(index: u64) -> Option<(u64, u64)> {
        let d = depth(index);
        if d == 0 {
            return None;
        }
        let o = offset(index) << 1;
        Some((self::index(d - 1, o), self::index(d - 1, o + 1)))
    }

    /// Flat indices of the peaks covering leaves `[0, length)`, left to right.
    pub fn full_roots(length: u64) -> Vec<u64> {
        let mut roots = Vec::new();
        let mut remaining = length;
        let mut offset = 0u64;
        while remaining > 0 {
            let mut factor = 1u64;
            while factor * 2 <= remaining {
                factor *= 2;
            }
            roots.push(offset + factor - 1);
            offset += 2 * factor;
            remaining -= factor;
        }
        roots
    }
}

/// Inclusion proof for one block against the root of a given length.
///
/// Holds sibling values only: in-peak siblings bottom-up, then the fold of
/// the peaks to the right (if any), then the peaks to the left, nearest
/// first. The shape is implied by `(index, length)` and is never taken from
/// the proof itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub nodes: Vec<Node>,
}

/// Build a proof for leaf `index` at `length` using stored complete nodes.
///
/// Returns `None` when `index` is out of range or a needed node is unknown.
pub fn build_proof(
    index: u64,
    length: u64,
    lookup: impl Fn(u64) -> Option<Node>,
) -> Option<Proof> {
    if index >= length {
        return None;
    }
    let peaks = flat::full_roots(length);
    let mut node = 2 * index;
    let mut nodes = Vec::new();
    while !peaks.contains(&node) {
        nodes.push(lookup(flat::sibling(node))?);
        node = flat::parent(node);
    }
    let j = peaks.iter().position(|p| *p == node)?;
    if j + 1 < peaks.len() {
        let right = peaks[j + 1..]
            .iter()
            .map(|p| lookup(*p))
            .collect::<Option<Vec<_>>>()?;
        nodes.push(fold(&right)?);
    }
    for peak in peaks[..j].iter().rev() {
        nodes.push(lookup(*peak)?);
    }
    Some(Proof { nodes })
}

/// Verify `data` as block `index` of a feed whose root at `length` is `root`.
///
/// On success returns every complete node the proof established, keyed by
/// flat index, so the caller can store them. Any mismatch rejects.
pub fn verify_proof(
    index: u64,
    data: &[u8],
    proof: &Proof,
    length: u64,
    root: &Hash,
) -> Option<Vec<(u64, Node)>> {
    if index >= length {
        return None;
    }
    let peaks = flat::full_roots(length);
    let mut flat_index = 2 * index;
    let mut current = leaf(data);
    let mut learned = vec![(flat_index, current)];
    let mut siblings = proof.nodes.iter();

    while !peaks.contains(&flat_index) {
        let sibling = *siblings.next()?;
        let sibling_index = flat::sibling(flat_index);
        current = if flat::is_left(flat_index) {
            parent(&current, &sibling)
        } else {
            parent(&sibling, &current)
        };
        learned.push((sibling_index, sibling));
        flat_index = flat::parent(flat_index);
        learned.push((flat_index, current));
    }

    let j = peaks.iter().position(|p| *p == flat_index)?;
    if j + 1 < peaks.len() {
        let right = *siblings.next()?;
        current = parent(&current, &right);
    }
    for peak in peaks[..j].iter().rev() {
        let left = *siblings.next()?;
        learned.push((*peak, left));
        current = parent(&left, &current);
    }
    if siblings.next().is_some() || current.hash != *root {
        return None;
    }
    Some(learned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn block(i: u64) -> Vec<u8> {
        format!("block number {i}").into_bytes()
    }

    /// Every complete node for the first `length` blocks.
    fn build(length: u64) -> HashMap<u64, Node> {
        let mut nodes = HashMap::new();
        for i in 0..length {
            let mut idx = 2 * i;
            nodes.insert(idx, leaf(&block(i)));
            while !flat::is_left(idx) {
                let sib = flat::sibling(idx);
                let up = parent(&nodes[&sib], &nodes[&idx]);
                idx = flat::parent(idx);
                nodes.insert(idx, up);
            }
        }
        nodes
    }

    fn peaks(nodes: &HashMap<u64, Node>, length: u64) -> Vec<Node> {
        flat::full_roots(length).iter().map(|p| nodes[p]).collect()
    }

    /// Level-by-level reduction with odd nodes promoted.
    fn balanced_root(length: u64) -> Hash {
        let mut level: Vec<Node> = (0..length).map(|i| leaf(&block(i))).collect();
        if level.is_empty() {
            return DomainHasher::EMPTY.hash(&[]);
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [l, r] => parent(l, r),
                    [single] => *single,
                    _ => unreachable!(),
                })
                .collect();
        }
        level[0].hash
    }

    #[test]
    fn flat_index_arithmetic() {
        assert_eq!(flat::index(0, 3), 6);
        assert_eq!(flat::index(1, 0), 1);
        assert_eq!(flat::index(2, 0), 3);
        assert_eq!(flat::depth(3), 2);
        assert_eq!(flat::parent(0), 1);
        assert_eq!(flat::parent(2), 1);
        assert_eq!(flat::parent(1), 3);
        assert_eq!(flat::sibling(0), 2);
        assert_eq!(flat::sibling(5), 1);
        assert_eq!(flat::children(3), Some((1, 5)));
        assert_eq!(flat::children(4), None);
    }

    #[test]
    fn full_roots_cover_length() {
        assert!(flat::full_roots(0).is_empty());
        assert_eq!(flat::full_roots(1), vec![0]);
        assert_eq!(flat::full_roots(5), vec![3, 8]);
        assert_eq!(flat::full_roots(7), vec![3, 9, 12]);
        assert_eq!(flat::full_roots(8), vec![7]);
    }

    #[test]
    fn peak_fold_matches_balanced_reduction() {
        for length in 0..40 {
            let nodes = build(length);
            assert_eq!(
                root_hash(&peaks(&nodes, length)),
                balanced_root(length),
                "length {length}"
            );
        }
    }

    #[test]
    fn leaf_hash_depends_on_length_prefix() {
        assert_ne!(leaf(b"ab").hash, leaf(b"a").hash);
        assert_eq!(leaf(b"abc").size, 3);
    }

    #[test]
    fn parent_sums_sizes() {
        let p = parent(&leaf(b"aa"), &leaf(b"bbb"));
        assert_eq!(p.size, 5);
    }

    #[test]
    fn node_bytes_roundtrip() {
        let n = leaf(b"node");
        assert_eq!(Node::from_bytes(&n.to_bytes()), Some(n));
        assert_eq!(Node::from_bytes(&[0u8; 12]), None);
    }

    #[test]
    fn proof_for_every_leaf_verifies() {
        let length = 11;
        let nodes = build(length);
        let root = root_hash(&peaks(&nodes, length));
        for i in 0..length {
            let proof = build_proof(i, length, |idx| nodes.get(&idx).copied()).unwrap();
            let learned = verify_proof(i, &block(i), &proof, length, &root)
                .unwrap_or_else(|| panic!("leaf {i} should verify"));
            for (idx, node) in learned {
                assert_eq!(nodes[&idx], node, "learned node {idx} for leaf {i}");
            }
        }
    }

    #[test]
    fn proof_against_older_length() {
        let nodes = build(20);
        let root_at_13 = root_hash(&peaks(&nodes, 13));
        let proof = build_proof(4, 13, |idx| nodes.get(&idx).copied()).unwrap();
        assert!(verify_proof(4, &block(4), &proof, 13, &root_at_13).is_some());
    }

    #[test]
    fn tampered_block_rejected() {
        let nodes = build(6);
        let root = root_hash(&peaks(&nodes, 6));
        let proof = build_proof(2, 6, |idx| nodes.get(&idx).copied()).unwrap();
        assert!(verify_proof(2, b"forged", &proof, 6, &root).is_none());
    }

    #[test]
    fn proof_for_wrong_index_rejected() {
        let nodes = build(8);
        let root = root_hash(&peaks(&nodes, 8));
        let proof = build_proof(2, 8, |idx| nodes.get(&idx).copied()).unwrap();
        assert!(verify_proof(3, &block(2), &proof, 8, &root).is_none());
    }

    #[test]
    fn padded_or_truncated_proof_rejected() {
        let nodes = build(9);
        let root = root_hash(&peaks(&nodes, 9));
        let mut proof = build_proof(1, 9, |idx| nodes.get(&idx).copied()).unwrap();
        let mut padded = proof.clone();
        padded.nodes.push(leaf(b"extra"));
        assert!(verify_proof(1, &block(1), &padded, 9, &root).is_none());
        proof.nodes.pop();
        assert!(verify_proof(1, &block(1), &proof, 9, &root).is_none());
    }

    #[test]
    fn missing_node_yields_no_proof() {
        let mut nodes = build(4);
        nodes.remove(&5);
        assert!(build_proof(0, 4, |idx| nodes.get(&idx).copied()).is_none());
        assert!(build_proof(9, 4, |idx| nodes.get(&idx).copied()).is_none());
    }

    proptest! {
        #[test]
        fn any_leaf_proves_at_any_length(length in 1u64..64, pick in 0u64..64) {
            let index = pick % length;
            let nodes = build(length);
            let root = root_hash(&peaks(&nodes, length));
            let proof = build_proof(index, length, |idx| nodes.get(&idx).copied()).unwrap();
            prop_assert!(verify_proof(index, &block(index), &proof, length, &root).is_some());
        }
    }
}
