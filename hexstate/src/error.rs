//! Error type shared by the trie, the resolver and the state layers.
use alloy_primitives::B256;
use thiserror::Error;

/// Errors surfaced by state-engine operations.
///
/// The commit path is all-or-nothing: when any of these is returned from
/// [`TrieDbState::trie_root`](crate::state::TrieDbState::trie_root) the
/// pending buffers are left in place and no hash side-table entries have
/// been written.
#[derive(Debug, Error)]
pub enum StateError {
    /// The resolver could not reconstruct a node matching the hash its
    /// parent recorded for it.
    #[error("missing node {expected_hash} at path {path_hex}", path_hex = hex::encode(.path))]
    MissingNode {
        /// Hash the parent expected at this position.
        expected_hash: B256,
        /// Nibble path from the trie root to the unresolved node.
        path: Vec<u8>,
    },

    /// Malformed RLP or a malformed block proof.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// A reconstructed or recomputed root does not match the claimed root.
    #[error("root mismatch: expected {expected}, got {got}")]
    RootMismatch {
        /// Root claimed by the caller.
        expected: B256,
        /// Root actually computed.
        got: B256,
    },

    /// Backing store I/O failure.
    #[error("backing store: {0}")]
    Database(String),

    /// A structural invariant of the trie was broken; treated as a bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
}

impl From<alloy_rlp::Error> for StateError {
    fn from(err: alloy_rlp::Error) -> Self {
        StateError::InvalidEncoding(err.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = StateError> = std::result::Result<T, E>;

// Minimal hex helper for the MissingNode display; nibble paths are not
// byte-aligned so alloy's hex formatting does not apply.
mod hex {
    pub(super) fn encode(nibbles: &[u8]) -> String {
        nibbles
            .iter()
            .map(|n| match n {
                0..=9 => (b'0' + n) as char,
                10..=15 => (b'a' + n - 10) as char,
                // terminator nibble of a value-carrying key
                _ => 't',
            })
            .collect()
    }
}
