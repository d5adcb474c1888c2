//! The hexary Merkle-Patricia trie: node model, codecs, hashing, the
//! continuation-returning operations and the backing-store resolver.
pub mod encoding;
pub mod hasher;
pub mod node;
pub mod resolver;
#[allow(clippy::module_inception)]
pub mod trie;

pub use hasher::{acquire_hasher, release_hasher, Hasher, NodeRef};
pub use node::{DuoNode, FullNode, Node, NodeFlags, ShortNode};
pub use resolver::rebuild_from_hashes;
pub use trie::{Trie, TrieAction, TrieContinuation};

use alloy_primitives::B256;

/// Callbacks from trie operations into the owning state: generation
/// accounting for the pruner and structural records for the witness
/// builder. Record callbacks only fire while the trie has read-resolution
/// enabled.
pub trait TrieObserver {
    /// A node joined the given generation.
    fn join_generation(&mut self, _gen: u64) {}
    /// A node left the given generation.
    fn left_generation(&mut self, _gen: u64) {}
    /// A read traversed a branch at `key[:pos]`; `mask`/`hashes` describe
    /// the siblings not on the traversed path.
    fn record_read_branch(&mut self, _prefix: &[u8], _key: &[u8], _pos: usize, _mask: u16, _hashes: &[B256]) {
    }
    /// Same as [`record_read_branch`](TrieObserver::record_read_branch)
    /// but emitted on mutation paths.
    fn record_write_branch(&mut self, _prefix: &[u8], _key: &[u8], _pos: usize, _mask: u16, _hashes: &[B256]) {
    }
    /// A traversal crossed a short node at `key[:pos]` carrying `short_key`.
    fn record_short(&mut self, _prefix: &[u8], _key: &[u8], _pos: usize, _short_key: &[u8]) {}
    /// A traversal reached a value at `key[:pos]`.
    fn record_value(&mut self, _prefix: &[u8], _key: &[u8], _pos: usize, _value: &[u8]) {}
}

/// Observer for standalone tries: no generation accounting, no witness.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl TrieObserver for NullObserver {}
