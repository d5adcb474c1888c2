//! Stateless block verification.
//!
//! A [`Stateless`] instance holds no backing store: it reconstructs the
//! account trie and the touched storage tries from a [`BlockProof`],
//! verifies them against the claimed pre-state roots, then serves as the
//! reader/writer pair for re-executing the block. [`check_root`] applies
//! the buffered updates in deterministic order and compares the recomputed
//! root with the claimed post-state root.
//!
//! [`check_root`]: Stateless::check_root
use crate::{
    account::Account,
    constant::{EMPTY_CODE_HASH, EMPTY_ROOT},
    error::{Result, StateError},
    state::{
        witness::{BlockProof, ProofCursor},
        writers::{strip_leading_zeros, StateReader, StateWriter},
    },
    traits::Bucket,
    trie::{NullObserver, Trie},
};
use alloy_primitives::{keccak256, Address, B256};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Verifier state reconstructed from a block proof.
pub struct Stateless {
    block_nr: u64,
    t: Trie,
    storage_tries: FxHashMap<B256, Trie>,
    code_map: FxHashMap<B256, Vec<u8>>,
    /// Pending storage writes: address -> key hash -> stripped value.
    storage_updates: BTreeMap<Address, BTreeMap<B256, Vec<u8>>>,
    /// Pending account writes: address hash -> record (`None` = delete).
    account_updates: BTreeMap<B256, Option<Account>>,
    deleted: BTreeSet<B256>,
}

impl Stateless {
    /// Reconstruct the tries from a proof and verify them: the account
    /// trie must hash to `state_root`, and each contract's storage trie
    /// must hash to the storage root inside that contract's reconstructed
    /// account leaf. Codes are indexed by their keccak256.
    pub fn new(state_root: B256, proof: &BlockProof, block_nr: u64) -> Result<Self> {
        let mut cursor = ProofCursor::account_side(proof);
        let mut t = Trie::from_block_proof(Bucket::Accounts, Vec::new(), &mut cursor)?;
        let got = t.hash();
        if got != state_root {
            return Err(StateError::RootMismatch {
                expected: state_root,
                got,
            });
        }

        let mut storage_tries = FxHashMap::default();
        let mut contract_cursor = ProofCursor::contract_side(proof);
        for contract in &proof.contracts {
            let mut storage_trie = Trie::from_block_proof(
                Bucket::Storage,
                contract.to_vec(),
                &mut contract_cursor,
            )?;
            let addr_hash = keccak256(contract);
            let enc = t
                .get(None, addr_hash.as_slice(), block_nr, &mut NullObserver)?
                .ok_or_else(|| {
                    StateError::InvalidEncoding(format!(
                        "proof lists contract {contract} without an account leaf"
                    ))
                })?;
            let account = Account::decode(&enc)?;
            let storage_root = storage_trie.hash();
            if account.storage_root != storage_root {
                return Err(StateError::RootMismatch {
                    expected: account.storage_root,
                    got: storage_root,
                });
            }
            storage_tries.insert(addr_hash, storage_trie);
        }

        let mut code_map = FxHashMap::default();
        code_map.insert(EMPTY_CODE_HASH, Vec::new());
        for code in &proof.codes {
            code_map.insert(keccak256(code), code.clone());
        }

        Ok(Stateless {
            block_nr,
            t,
            storage_tries,
            code_map,
            storage_updates: BTreeMap::new(),
            account_updates: BTreeMap::new(),
            deleted: BTreeSet::new(),
        })
    }

    /// Advance to the next block between replays.
    pub fn set_block_nr(&mut self, block_nr: u64) {
        self.block_nr = block_nr;
    }

    /// Apply the buffered updates in deterministic order (storage before
    /// accounts, both sorted by hash), recompute the root and compare it
    /// with the claimed post-state root.
    pub fn check_root(&mut self, expected: B256) -> Result<()> {
        let generation = self.block_nr.saturating_sub(1);
        let storage_updates = std::mem::take(&mut self.storage_updates);
        for (address, slots) in &storage_updates {
            let addr_hash = keccak256(address);
            if self.deleted.contains(&addr_hash) {
                continue;
            }
            let trie = self
                .storage_tries
                .entry(addr_hash)
                .or_insert_with(|| Trie::new(B256::ZERO, Bucket::Storage, address.to_vec()));
            for (key_hash, value) in slots {
                let mut c = trie.update_action(key_hash.as_slice(), value);
                trie.apply_in_memory(&mut c, generation, &mut NullObserver)?;
            }
        }

        let account_updates = std::mem::take(&mut self.account_updates);
        for (addr_hash, account) in &account_updates {
            let mut c = match account {
                Some(account) => {
                    let mut account = account.clone();
                    if self.deleted.contains(addr_hash) {
                        account.storage_root = EMPTY_ROOT;
                        self.storage_tries.remove(addr_hash);
                    } else if let Some(storage_trie) = self.storage_tries.get_mut(addr_hash) {
                        account.storage_root = storage_trie.hash();
                    }
                    self.t
                        .update_action(addr_hash.as_slice(), &account.encode_for_trie())
                }
                None => {
                    self.storage_tries.remove(addr_hash);
                    self.t.delete_action(addr_hash.as_slice())
                }
            };
            self.t.apply_in_memory(&mut c, generation, &mut NullObserver)?;
        }
        self.deleted.clear();

        let got = self.t.hash();
        if got != expected {
            return Err(StateError::RootMismatch { expected, got });
        }
        Ok(())
    }
}

impl StateReader for Stateless {
    fn read_account_data(&mut self, address: Address) -> Result<Option<Account>> {
        let addr_hash = keccak256(address);
        let enc = self
            .t
            .get(None, addr_hash.as_slice(), self.block_nr, &mut NullObserver)?;
        enc.map(|bytes| Account::decode(&bytes)).transpose()
    }

    fn read_account_storage(&mut self, address: Address, key: B256) -> Result<Option<Vec<u8>>> {
        let addr_hash = keccak256(address);
        let Some(trie) = self.storage_tries.get_mut(&addr_hash) else {
            return Ok(None);
        };
        let seckey = keccak256(key);
        trie.get(None, seckey.as_slice(), self.block_nr, &mut NullObserver)
    }

    fn read_account_code(&mut self, code_hash: B256) -> Result<Vec<u8>> {
        self.code_map
            .get(&code_hash)
            .cloned()
            .ok_or_else(|| StateError::Database(format!("code {code_hash} not in the witness")))
    }

    fn read_account_code_size(&mut self, code_hash: B256) -> Result<usize> {
        self.read_account_code(code_hash).map(|code| code.len())
    }
}

impl StateWriter for Stateless {
    fn update_account_data(
        &mut self,
        address: Address,
        _original: Option<&Account>,
        account: &Account,
    ) -> Result<()> {
        let addr_hash = keccak256(address);
        self.account_updates.insert(addr_hash, Some(account.clone()));
        Ok(())
    }

    fn update_account_code(&mut self, code_hash: B256, code: &[u8]) -> Result<()> {
        self.code_map.insert(code_hash, code.to_vec());
        Ok(())
    }

    fn delete_account(&mut self, address: Address, _original: Option<&Account>) -> Result<()> {
        let addr_hash = keccak256(address);
        self.account_updates.insert(addr_hash, None);
        self.deleted.insert(addr_hash);
        Ok(())
    }

    fn write_account_storage(
        &mut self,
        address: Address,
        key: B256,
        _original: B256,
        value: B256,
    ) -> Result<()> {
        let seckey = keccak256(key);
        self.storage_updates
            .entry(address)
            .or_default()
            .insert(seckey, strip_leading_zeros(&value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mem_db::MemDb,
        state::triedb::TrieDbState,
    };
    use alloy_primitives::U256;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn balance_account(balance: u64) -> Account {
        Account {
            nonce: 1,
            balance: U256::from(balance),
            ..Default::default()
        }
    }

    /// One block of account writes applied identically to the full node
    /// and to a writer under replay.
    fn account_writes(block: u64) -> Vec<(Address, Account)> {
        (0..6u8)
            .map(|i| (addr(0x10 + i), balance_account(block * 1000 + u64::from(i))))
            .collect()
    }

    /// Read the original of every written account, the way the block
    /// driver stages writer calls.
    fn stage_block<R: StateReader>(
        reader: &mut R,
        writes: &[(Address, Account)],
    ) -> Vec<(Address, Option<Account>, Account)> {
        writes
            .iter()
            .map(|(address, account)| {
                let original = reader.read_account_data(*address).unwrap();
                (*address, original, account.clone())
            })
            .collect()
    }

    /// Full node executes block 1 (setup) and block 2 (witnessed), then a
    /// verifier with no state replays block 2 from the proof.
    #[test]
    fn stateless_replay_agrees_with_the_full_node() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);

        // block 1: pre-state
        tds.set_block_nr(1);
        for (address, account) in account_writes(1) {
            let original = tds.read_account_data(address).unwrap();
            tds.trie_state_writer()
                .update_account_data(address, original.as_ref(), &account)
                .unwrap();
            tds.db_state_writer()
                .update_account_data(address, original.as_ref(), &account)
                .unwrap();
        }
        let pre_root = tds.trie_root().unwrap();

        // block 2, witnessed: touch a subset and add a fresh account
        tds.set_resolve_reads(true);
        tds.set_block_nr(2);
        let mut writes = account_writes(2);
        writes.truncate(3);
        writes.push((addr(0x77), balance_account(42)));
        let staged = stage_block(&mut tds, &writes);
        for (address, original, account) in &staged {
            tds.trie_state_writer()
                .update_account_data(*address, original.as_ref(), account)
                .unwrap();
            tds.db_state_writer()
                .update_account_data(*address, original.as_ref(), account)
                .unwrap();
        }
        let post_root = tds.trie_root().unwrap();
        let proof = tds.extract_proofs().unwrap();

        // the verifier reconstructs the pre-state and replays the block
        let mut verifier = Stateless::new(pre_root, &proof, 2).unwrap();
        for (address, original, account) in &staged {
            verifier
                .update_account_data(*address, original.as_ref(), account)
                .unwrap();
        }
        verifier.check_root(post_root).unwrap();
    }

    #[test]
    fn corrupted_proofs_are_rejected() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        tds.set_block_nr(1);
        for (address, account) in account_writes(1) {
            let original = tds.read_account_data(address).unwrap();
            tds.trie_state_writer()
                .update_account_data(address, original.as_ref(), &account)
                .unwrap();
        }
        let pre_root = tds.trie_root().unwrap();

        tds.set_resolve_reads(true);
        tds.set_block_nr(2);
        let target = addr(0x12);
        let original = tds.read_account_data(target).unwrap();
        let update = balance_account(9999);
        tds.trie_state_writer()
            .update_account_data(target, original.as_ref(), &update)
            .unwrap();
        tds.trie_root().unwrap();
        let proof = tds.extract_proofs().unwrap();

        // the pristine proof verifies
        assert!(Stateless::new(pre_root, &proof, 2).is_ok());

        // flipping a byte in any array must be rejected
        if !proof.values.is_empty() {
            let mut corrupt = proof.clone();
            corrupt.values[0][0] ^= 1;
            assert!(Stateless::new(pre_root, &corrupt, 2).is_err());
        }
        if !proof.hashes.is_empty() {
            let mut corrupt = proof.clone();
            corrupt.hashes[0].0[0] ^= 1;
            assert!(Stateless::new(pre_root, &corrupt, 2).is_err());
        }
        if !proof.short_keys.is_empty() {
            let mut corrupt = proof.clone();
            corrupt.short_keys[0][0] ^= 1;
            assert!(Stateless::new(pre_root, &corrupt, 2).is_err());
        }
        let mut corrupt = proof.clone();
        corrupt.masks.pop();
        assert!(Stateless::new(pre_root, &corrupt, 2).is_err());
    }

    #[test]
    fn replay_with_storage_and_code() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        let contract = addr(0xc0);
        let code = b"\x60\x01\x60\x02\x01".to_vec();
        let code_hash = keccak256(&code);

        // block 1: a contract with code and one storage slot
        tds.set_block_nr(1);
        let account = Account {
            nonce: 1,
            balance: U256::from(10u64),
            code_hash,
            ..Default::default()
        };
        tds.trie_state_writer()
            .update_account_data(contract, None, &account)
            .unwrap();
        tds.db_state_writer()
            .update_account_data(contract, None, &account)
            .unwrap();
        tds.db_state_writer()
            .update_account_code(code_hash, &code)
            .unwrap();
        let slot = B256::with_last_byte(1);
        tds.trie_state_writer()
            .write_account_storage(contract, slot, B256::ZERO, B256::with_last_byte(7))
            .unwrap();
        tds.db_state_writer()
            .write_account_storage(contract, slot, B256::ZERO, B256::with_last_byte(7))
            .unwrap();
        let pre_root = tds.trie_root().unwrap();

        // block 2, witnessed: read code and slot, overwrite the slot
        tds.set_resolve_reads(true);
        tds.set_block_nr(2);
        assert_eq!(tds.read_account_code(code_hash).unwrap(), code);
        let original_slot = tds.read_account_storage(contract, slot).unwrap();
        assert_eq!(original_slot, Some(vec![7]));
        let original_account = tds.read_account_data(contract).unwrap();
        tds.trie_state_writer()
            .write_account_storage(
                contract,
                slot,
                B256::with_last_byte(7),
                B256::with_last_byte(9),
            )
            .unwrap();
        tds.trie_state_writer()
            .update_account_data(
                contract,
                original_account.as_ref(),
                original_account.as_ref().unwrap(),
            )
            .unwrap();
        let post_root = tds.trie_root().unwrap();
        let proof = tds.extract_proofs().unwrap();
        assert_eq!(proof.contracts, vec![contract]);
        assert_eq!(proof.codes, vec![code.clone()]);

        let mut verifier = Stateless::new(pre_root, &proof, 2).unwrap();
        assert_eq!(verifier.read_account_code(code_hash).unwrap(), code);
        assert_eq!(
            verifier.read_account_storage(contract, slot).unwrap(),
            Some(vec![7])
        );
        let replay_account = verifier.read_account_data(contract).unwrap();
        verifier
            .write_account_storage(
                contract,
                slot,
                B256::with_last_byte(7),
                B256::with_last_byte(9),
            )
            .unwrap();
        verifier
            .update_account_data(
                contract,
                replay_account.as_ref(),
                replay_account.as_ref().unwrap(),
            )
            .unwrap();
        verifier.check_root(post_root).unwrap();
    }
}
