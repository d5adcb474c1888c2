//! Account records and their encodings.
//!
//! Two encodings exist: the storage form written to the accounts bucket,
//! which picks the smallest of three shapes, and the full four-field RLP
//! list carried inside trie leaves (the stateless verifier reads storage
//! roots back out of reconstructed leaves, so leaves always carry all four
//! fields).
use crate::{
    constant::{EMPTY_CODE_HASH, EMPTY_ROOT},
    error::{Result, StateError},
};
use alloy_primitives::{B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};

/// The storage-shape boundary: a two-field encoding is always shorter than
/// this, a four-field one never is.
const EXT_ACCOUNT_MAX_LEN: usize = 60;

/// An account record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    /// Transaction count.
    pub nonce: u64,
    /// Balance in the smallest denomination.
    pub balance: U256,
    /// Root hash of the account's storage trie; [`EMPTY_ROOT`] when the
    /// account has no storage.
    pub storage_root: B256,
    /// keccak256 of the account's code; [`EMPTY_CODE_HASH`] for accounts
    /// without code.
    pub code_hash: B256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            storage_root: EMPTY_ROOT,
            code_hash: EMPTY_CODE_HASH,
        }
    }
}

impl Account {
    /// True when every field sits at its empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balance.is_zero()
            && self.storage_root == EMPTY_ROOT
            && self.code_hash == EMPTY_CODE_HASH
    }

    /// Encode for the accounts bucket, choosing the smallest shape:
    /// a single `0xC0` byte for the fully empty account, a two-field
    /// (nonce, balance) list while storage root and code hash are at their
    /// sentinels, the full four-field list otherwise.
    pub fn encode_for_storage(&self) -> Vec<u8> {
        if self.storage_root == EMPTY_ROOT && self.code_hash == EMPTY_CODE_HASH {
            if self.is_empty() {
                return vec![alloy_rlp::EMPTY_LIST_CODE];
            }
            let mut payload = Vec::with_capacity(42);
            self.nonce.encode(&mut payload);
            self.balance.encode(&mut payload);
            return wrap_list(payload);
        }
        self.encode_for_trie()
    }

    /// Encode the full four-field list used as trie leaf payload.
    pub fn encode_for_trie(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(110);
        self.nonce.encode(&mut payload);
        self.balance.encode(&mut payload);
        self.storage_root.encode(&mut payload);
        self.code_hash.encode(&mut payload);
        wrap_list(payload)
    }

    /// Decode any of the shapes produced by [`encode_for_storage`] or
    /// [`encode_for_trie`].
    ///
    /// [`encode_for_storage`]: Account::encode_for_storage
    /// [`encode_for_trie`]: Account::encode_for_trie
    pub fn decode(enc: &[u8]) -> Result<Self> {
        if enc.is_empty() {
            return Err(StateError::InvalidEncoding(
                "empty account encoding".to_string(),
            ));
        }
        if enc.len() == 1 {
            if enc[0] == alloy_rlp::EMPTY_LIST_CODE {
                return Ok(Account::default());
            }
            return Err(StateError::InvalidEncoding(format!(
                "single-byte account encoding 0x{:02x}",
                enc[0]
            )));
        }

        let mut buf = enc;
        let header = Header::decode(&mut buf)?;
        if !header.list || header.payload_length != buf.len() {
            return Err(StateError::InvalidEncoding(
                "account encoding is not a well-formed list".to_string(),
            ));
        }
        let nonce = u64::decode(&mut buf)?;
        let balance = U256::decode(&mut buf)?;
        if enc.len() < EXT_ACCOUNT_MAX_LEN {
            if !buf.is_empty() {
                return Err(StateError::InvalidEncoding(
                    "trailing bytes after two-field account".to_string(),
                ));
            }
            return Ok(Account {
                nonce,
                balance,
                ..Default::default()
            });
        }
        let storage_root = B256::decode(&mut buf)?;
        let code_hash = B256::decode(&mut buf)?;
        if !buf.is_empty() {
            return Err(StateError::InvalidEncoding(
                "trailing bytes after four-field account".to_string(),
            ));
        }
        Ok(Account {
            nonce,
            balance,
            storage_root,
            code_hash,
        })
    }
}

fn wrap_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}
