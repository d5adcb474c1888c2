//! The reader and writer seams between block execution and the state.
//!
//! Two writer implementations exist: [`TrieStateWriter`] only buffers
//! updates into the owning [`TrieDbState`](crate::state::TrieDbState) for
//! the commit to fold in, while [`DbStateWriter`] persists current-state
//! rows and appends pre-update values to the block-stamped history log.
//! [`NoopWriter`] discards everything; replay paths that only need reads
//! use it.
use crate::{
    account::Account,
    error::Result,
    state::triedb::TrieDbState,
    traits::{Bucket, Database},
};
use alloy_primitives::{Address, B256};

/// Read access to accounts, storage and code.
pub trait StateReader {
    /// The account stored under an address, if any.
    fn read_account_data(&mut self, address: Address) -> Result<Option<Account>>;
    /// A storage slot of an account; the value is the minimal big-endian
    /// encoding with leading zeros stripped.
    fn read_account_storage(&mut self, address: Address, key: B256) -> Result<Option<Vec<u8>>>;
    /// Contract code by its hash.
    fn read_account_code(&mut self, code_hash: B256) -> Result<Vec<u8>>;
    /// Size of contract code by its hash.
    fn read_account_code_size(&mut self, code_hash: B256) -> Result<usize>;
}

/// Write access used by block execution. `original` carries the pre-block
/// value so implementations can skip no-change writes and feed the history
/// log; `None` means the entry did not exist.
pub trait StateWriter {
    /// Store a new account record.
    fn update_account_data(
        &mut self,
        address: Address,
        original: Option<&Account>,
        account: &Account,
    ) -> Result<()>;
    /// Store contract code.
    fn update_account_code(&mut self, code_hash: B256, code: &[u8]) -> Result<()>;
    /// Remove an account and its storage.
    fn delete_account(&mut self, address: Address, original: Option<&Account>) -> Result<()>;
    /// Store a storage slot value; a zero value deletes the slot.
    fn write_account_storage(
        &mut self,
        address: Address,
        key: B256,
        original: B256,
        value: B256,
    ) -> Result<()>;
}

/// Discards all writes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopWriter;

impl StateWriter for NoopWriter {
    fn update_account_data(
        &mut self,
        _address: Address,
        _original: Option<&Account>,
        _account: &Account,
    ) -> Result<()> {
        Ok(())
    }

    fn update_account_code(&mut self, _code_hash: B256, _code: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete_account(&mut self, _address: Address, _original: Option<&Account>) -> Result<()> {
        Ok(())
    }

    fn write_account_storage(
        &mut self,
        _address: Address,
        _key: B256,
        _original: B256,
        _value: B256,
    ) -> Result<()> {
        Ok(())
    }
}

/// Buffers updates into the owning state; nothing reaches the backing
/// store until [`TrieDbState::trie_root`] folds the buffers in.
///
/// [`TrieDbState::trie_root`]: crate::state::TrieDbState::trie_root
pub struct TrieStateWriter<'a, DB> {
    pub(crate) tds: &'a mut TrieDbState<DB>,
}

impl<DB: Database> StateWriter for TrieStateWriter<'_, DB> {
    fn update_account_data(
        &mut self,
        address: Address,
        _original: Option<&Account>,
        account: &Account,
    ) -> Result<()> {
        let addr_hash = self.tds.hash_address(address, false)?;
        self.tds.buffer_account_update(addr_hash, Some(account.clone()));
        Ok(())
    }

    fn update_account_code(&mut self, _code_hash: B256, _code: &[u8]) -> Result<()> {
        // code lives only in the code bucket; the db writer path covers it
        Ok(())
    }

    fn delete_account(&mut self, address: Address, _original: Option<&Account>) -> Result<()> {
        let addr_hash = self.tds.hash_address(address, false)?;
        self.tds.buffer_account_delete(addr_hash);
        Ok(())
    }

    fn write_account_storage(
        &mut self,
        address: Address,
        key: B256,
        _original: B256,
        value: B256,
    ) -> Result<()> {
        let seckey = self.tds.hash_key(key, false)?;
        self.tds
            .buffer_storage_update(address, seckey, strip_leading_zeros(&value));
        Ok(())
    }
}

/// Persists current-state rows and, unless no-history mode is on, appends
/// the pre-update value to the history log keyed by the block number.
/// Writes that change nothing skip the log; deletes record an empty-bytes
/// marker.
///
/// For contracts the block driver runs this pass after
/// [`TrieDbState::trie_root`] so the persisted account records carry their
/// post-commit storage roots; the resolver reconstructs trie leaves from
/// these rows and relies on that.
///
/// [`TrieDbState::trie_root`]: crate::state::TrieDbState::trie_root
pub struct DbStateWriter<'a, DB> {
    pub(crate) tds: &'a mut TrieDbState<DB>,
}

impl<DB: Database> StateWriter for DbStateWriter<'_, DB> {
    fn update_account_data(
        &mut self,
        address: Address,
        original: Option<&Account>,
        account: &Account,
    ) -> Result<()> {
        let addr_hash = self.tds.hash_address(address, true)?;
        let data = account.encode_for_storage();
        self.tds
            .database()
            .put(Bucket::Accounts, addr_hash.as_slice(), &data)?;
        if self.tds.no_history() {
            return Ok(());
        }
        // unchanged accounts leave no historical record
        if original == Some(account) {
            return Ok(());
        }
        let original_data = original.map(Account::encode_for_storage).unwrap_or_default();
        self.tds.database().put_timestamped(
            Bucket::AccountsHistory,
            addr_hash.as_slice(),
            &original_data,
            self.tds.block_nr(),
        )
    }

    fn update_account_code(&mut self, code_hash: B256, code: &[u8]) -> Result<()> {
        self.tds
            .database()
            .put(Bucket::Code, code_hash.as_slice(), code)
    }

    fn delete_account(&mut self, address: Address, original: Option<&Account>) -> Result<()> {
        let addr_hash = self.tds.hash_address(address, true)?;
        self.tds
            .database()
            .delete(Bucket::Accounts, addr_hash.as_slice())?;
        if self.tds.no_history() {
            return Ok(());
        }
        // an account created and deleted within the block leaves an empty
        // marker
        let original_data = original.map(Account::encode_for_storage).unwrap_or_default();
        self.tds.database().put_timestamped(
            Bucket::AccountsHistory,
            addr_hash.as_slice(),
            &original_data,
            self.tds.block_nr(),
        )
    }

    fn write_account_storage(
        &mut self,
        address: Address,
        key: B256,
        original: B256,
        value: B256,
    ) -> Result<()> {
        if original == value {
            return Ok(());
        }
        let seckey = self.tds.hash_key(key, true)?;
        let mut composite = Vec::with_capacity(Address::len_bytes() + B256::len_bytes());
        composite.extend_from_slice(address.as_slice());
        composite.extend_from_slice(seckey.as_slice());

        let stripped = strip_leading_zeros(&value);
        if stripped.is_empty() {
            self.tds.database().delete(Bucket::Storage, &composite)?;
        } else {
            self.tds.database().put(Bucket::Storage, &composite, &stripped)?;
        }
        if self.tds.no_history() {
            return Ok(());
        }
        self.tds.database().put_timestamped(
            Bucket::StorageHistory,
            &composite,
            &strip_leading_zeros(&original),
            self.tds.block_nr(),
        )
    }
}

/// Minimal big-endian encoding of a storage word.
pub(crate) fn strip_leading_zeros(word: &B256) -> Vec<u8> {
    let bytes = word.as_slice();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}
