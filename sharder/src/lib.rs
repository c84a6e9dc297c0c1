//! Key hashing and node selection for the write path.
//!
//! Two strategies live here:
//!
//! * [`RendezvousHash`] picks the best storage node for a row inside a
//!   replication group, tolerating an arbitrary subset of excluded (broken)
//!   nodes with minimal remapping.
//! * [`partition_for`] maps a row to one of a fixed number of replication
//!   groups. Groups never fail as a unit, so a plain uniform partition is used
//!   instead of a failure-tolerant pick.

mod rendezvous;
pub use rendezvous::*;

use twox_hash::XxHash64;

/// Hash the raw identity bytes of a row into the `u64` sharding key consumed
/// by [`RendezvousHash::select_node`] and [`partition_for`].
///
/// The same bytes always produce the same key across processes and restarts.
pub fn hash_key(key: &[u8]) -> u64 {
    XxHash64::oneshot(0, key)
}

/// Map `key_hash` uniformly to one of `n` partitions.
///
/// # Panics
///
/// Panics if `n` is 0.
pub fn partition_for(key_hash: u64, n: usize) -> usize {
    assert!(n > 0, "cannot partition into zero groups");
    (key_hash % n as u64) as usize
}
