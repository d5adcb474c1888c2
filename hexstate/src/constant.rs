//! This module defines constants that determine the shape of the state trie
//! and the memory budget of the engine.
use alloy_primitives::{b256, B256};

/// Root hash of an empty trie: `keccak256(rlp(""))`.
pub const EMPTY_ROOT: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Hash of empty contract code: `keccak256([])`.
pub const EMPTY_CODE_HASH: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// Number of nibbles in a hashed key (32 bytes, two nibbles per byte).
pub const KEY_NIBBLES: usize = 64;

/// Terminator nibble marking a value-carrying key.
pub const TERMINATOR: u8 = 16;

/// Length of a hex key including the terminator nibble.
pub const HEX_KEY_LEN: usize = KEY_NIBBLES + 1;

/// Nibble depth of the flat hash side-table kept for the account trie.
/// Every node sitting at this depth has its hash exported after a commit.
pub const HASH_TABLE_LEVEL: usize = 5;

/// Number of slots in the hash side-table: one per packed 5-nibble prefix.
pub const HASH_TABLE_SIZE: usize = 1 << (4 * HASH_TABLE_LEVEL);

/// Default trie cache generation limit after which nodes are unloaded from
/// memory. This is the engine's single tunable; see
/// [`TrieDbState::set_max_trie_cache_gen`](crate::state::TrieDbState::set_max_trie_cache_gen).
pub const MAX_TRIE_CACHE_GEN: usize = 4 * 1024 * 1024;

/// Number of codehash -> code associations to keep.
pub const CODE_CACHE_SIZE: usize = 10_000;

/// Number of codehash -> size associations to keep.
pub const CODE_SIZE_CACHE_SIZE: usize = 100_000;

/// Capacity of the shared hasher pool. Returning a hasher to a full pool
/// drops it instead of blocking.
pub const HASHER_POOL_SIZE: usize = 128;

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn empty_sentinels_match_keccak() {
        // rlp("") is the single byte 0x80
        assert_eq!(EMPTY_ROOT, keccak256([0x80u8]));
        assert_eq!(EMPTY_CODE_HASH, keccak256([]));
    }

    #[test]
    fn hash_table_covers_five_nibbles() {
        assert_eq!(HASH_TABLE_SIZE, 1 << 20);
    }
}
