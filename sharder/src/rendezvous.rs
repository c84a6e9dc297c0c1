use crate::hash_key;

/// The stable hash of a storage node address, computed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashedNode(u64);

impl HashedNode {
    /// Hash the node address `addr`.
    pub fn new(addr: &str) -> Self {
        Self(hash_key(addr.as_bytes()))
    }

    /// The raw node hash.
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// A [`RendezvousHash`] maps a `u64` key hash to the index of the highest
/// scoring node out of a fixed node set.
///
/// Every (node, key) pair is scored independently, so removing a node from
/// the candidate set only remaps the keys that node owned: their next best
/// node takes over, and every other key keeps its owner. This is what lets a
/// broken node be skipped without reshuffling the rest of the cluster.
///
/// Instances built from the same addresses (in the same order) and the same
/// seed produce the same mapping. The structure is immutable once built.
#[derive(Debug, Clone)]
pub struct RendezvousHash {
    seed: u64,
    nodes: Vec<HashedNode>,
}

impl RendezvousHash {
    /// Build a [`RendezvousHash`] over `addrs`.
    ///
    /// The index returned by [`Self::select_node`] is the position of the
    /// chosen node in `addrs`.
    ///
    /// # Panics
    ///
    /// Panics if `addrs` is empty.
    pub fn new<'a>(addrs: impl IntoIterator<Item = &'a str>, seed: u64) -> Self {
        let nodes = addrs.into_iter().map(HashedNode::new).collect::<Vec<_>>();
        assert!(!nodes.is_empty(), "empty node set given to rendezvous hash");
        Self { seed, nodes }
    }

    /// The number of nodes this instance selects between.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; construction rejects an empty node set.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Return the index of the node owning `key_hash`, skipping every index
    /// listed in `excluded`.
    ///
    /// If `excluded` covers every node the exclusion is ignored, so a key
    /// always maps to some node. Out of range indexes in `excluded` are
    /// ignored.
    pub fn select_node(&self, key_hash: u64, excluded: &[usize]) -> usize {
        let all_excluded = (0..self.nodes.len()).all(|i| excluded.contains(&i));
        let excluded = if all_excluded { &[][..] } else { excluded };

        let h = key_hash ^ self.seed;
        let mut best = 0;
        let mut best_score = 0;
        for (idx, node) in self.nodes.iter().enumerate() {
            if excluded.contains(&idx) {
                continue;
            }
            let score = scramble(node.get() ^ h);
            if score > best_score {
                best_score = score;
                best = idx;
            }
        }
        best
    }
}

/// A cheap xorshift-multiply avalanche step.
///
/// Not cryptographic; it only has to spread well-mixed input across the full
/// `u64` range so that argmax over nodes is uniform.
#[inline]
fn scramble(mut x: u64) -> u64 {
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(2685821657736338717)
}
