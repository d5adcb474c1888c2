//! The state views over the trie and the backing store: the full-node
//! [`TrieDbState`], the buffering and persisting writers, the witness
//! builder and the stateless verifier.
pub mod stateless;
pub mod triedb;
pub mod witness;
pub mod writers;

pub use stateless::Stateless;
pub use triedb::TrieDbState;
pub use witness::BlockProof;
pub use writers::{DbStateWriter, NoopWriter, StateReader, StateWriter, TrieStateWriter};
