//! Fixed-depth binary trie with cached subtree digests.
//!
//! Keys are walked most-significant bit first; leaves sit at depth 256 and
//! hold the digest of an encoded announcement. Every internal node caches
//! `Sha256(left_digest || right_digest)`, with the all-zero digest standing
//! in for an empty child. Two trees holding the same (key, digest) pairs
//! therefore produce byte-identical root digests, which is the only
//! property the peer sync protocol relies on.

use sha2::{Digest as _, Sha256};

use crate::identity::{NodeKey, KEY_LEN};

pub(crate) const DIGEST_LEN: usize = 32;
pub(crate) const KEY_BITS: usize = 8 * KEY_LEN;

pub(crate) type Digest = [u8; DIGEST_LEN];

/// Digest of an empty subtree.
pub(crate) const EMPTY_DIGEST: Digest = [0u8; DIGEST_LEN];

/// Digest of a leaf value (an encoded announcement).
pub(crate) fn leaf_digest(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn combine(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// One trie node. A node with neither child is either the root of an empty
/// tree or a leaf at depth `KEY_BITS`.
#[derive(Clone, Debug, Default)]
pub(crate) struct Node {
    pub digest: Digest,
    pub left: Option<Box<Node>>,
    pub right: Option<Box<Node>>,
}

impl Node {
    fn recompute(&mut self) {
        let left = self.left.as_ref().map_or(EMPTY_DIGEST, |n| n.digest);
        let right = self.right.as_ref().map_or(EMPTY_DIGEST, |n| n.digest);
        self.digest = combine(&left, &right);
    }
}

/// The Merkle index: a trie over full keys with digests cached per node.
#[derive(Clone, Debug, Default)]
pub(crate) struct Tree {
    pub root: Node,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_digest(&self) -> Digest {
        self.root.digest
    }

    pub fn is_empty(&self) -> bool {
        self.root.left.is_none() && self.root.right.is_none()
    }

    /// Insert or replace the leaf for `key`, recomputing digests on the
    /// path back to the root.
    pub fn add(&mut self, key: &NodeKey, digest: Digest) {
        Self::add_at(&mut self.root, key, digest, 0);
    }

    fn add_at(node: &mut Node, key: &NodeKey, digest: Digest, depth: usize) {
        if depth == KEY_BITS {
            node.digest = digest;
            return;
        }
        let child = if key.bit(depth) {
            &mut node.right
        } else {
            &mut node.left
        };
        let child = child.get_or_insert_with(Default::default);
        Self::add_at(child, key, digest, depth + 1);
        node.recompute();
    }

    /// Delete the leaf for `key`, pruning internal nodes left with no
    /// children. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &NodeKey) {
        Self::remove_at(&mut self.root, key, 0);
        if self.is_empty() {
            self.root.digest = EMPTY_DIGEST;
        }
    }

    // Returns true when the subtree under `node` is now empty.
    fn remove_at(node: &mut Node, key: &NodeKey, depth: usize) -> bool {
        if depth == KEY_BITS {
            return true;
        }
        let slot = if key.bit(depth) {
            &mut node.right
        } else {
            &mut node.left
        };
        match slot {
            Some(child) => {
                if Self::remove_at(child, key, depth + 1) {
                    *slot = None;
                }
            }
            None => return false, // key was never present
        }
        if node.left.is_none() && node.right.is_none() {
            true
        } else {
            node.recompute();
            false
        }
    }

    /// Descend as far as `prefix` matches, up to `prefix_len` bits.
    /// Returns the deepest node reached and how many bits matched.
    pub fn node_for(&self, prefix: &NodeKey, prefix_len: usize) -> (&Node, usize) {
        let mut node = &self.root;
        let mut matched = 0;
        while matched < prefix_len {
            let child = if prefix.bit(matched) {
                node.right.as_deref()
            } else {
                node.left.as_deref()
            };
            match child {
                Some(next) => {
                    node = next;
                    matched += 1;
                }
                None => break,
            }
        }
        (node, matched)
    }

    /// Subtree digest at `(prefix, prefix_len)`, if that node exists.
    pub fn lookup(&self, prefix: &NodeKey, prefix_len: usize) -> Option<Digest> {
        let (node, matched) = self.node_for(prefix, prefix_len);
        if matched == prefix_len {
            Some(node.digest)
        } else {
            None
        }
    }
}
