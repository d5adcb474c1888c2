//! The full-node state view: an account trie, lazily opened storage
//! tries, buffered per-block updates, generational pruning of the node
//! graph and the code caches.
//!
//! Control flow per block: the writers buffer updates, [`trie_root`] folds
//! them into the tries through a resolve-then-retry loop and exports the
//! hash side-table, [`prune_tries`] enforces the memory budget.
//! [`unwind_to`] replays the history log backwards. [`extract_proofs`]
//! drains the block witness.
//!
//! [`trie_root`]: TrieDbState::trie_root
//! [`prune_tries`]: TrieDbState::prune_tries
//! [`unwind_to`]: TrieDbState::unwind_to
//! [`extract_proofs`]: TrieDbState::extract_proofs
use crate::{
    account::Account,
    constant::{CODE_CACHE_SIZE, CODE_SIZE_CACHE_SIZE, EMPTY_CODE_HASH, EMPTY_ROOT, MAX_TRIE_CACHE_GEN},
    error::{Result, StateError},
    state::{
        witness::{BlockProof, WitnessState},
        writers::{DbStateWriter, StateReader, TrieStateWriter},
    },
    traits::{Bucket, Database},
    trie::{resolver::resolve_batch, Trie, TrieContinuation, TrieObserver},
};
use alloy_primitives::{keccak256, Address, B256};
use lru::LruCache;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use tracing::{debug, info};

/// Generation accounting and witness records; handed to every trie
/// operation as the observer.
#[derive(Debug, Default)]
pub(crate) struct StateObserver {
    generation_counts: BTreeMap<u64, isize>,
    node_count: isize,
    oldest_generation: u64,
    pub(crate) witness: WitnessState,
}

impl TrieObserver for StateObserver {
    fn join_generation(&mut self, gen: u64) {
        self.node_count += 1;
        *self.generation_counts.entry(gen).or_default() += 1;
    }

    fn left_generation(&mut self, gen: u64) {
        self.node_count -= 1;
        *self.generation_counts.entry(gen).or_default() -= 1;
    }

    fn record_read_branch(&mut self, prefix: &[u8], key: &[u8], pos: usize, mask: u16, hashes: &[B256]) {
        self.witness.record_branch(prefix, key, pos, mask, hashes);
    }

    fn record_write_branch(&mut self, prefix: &[u8], key: &[u8], pos: usize, mask: u16, hashes: &[B256]) {
        self.witness.record_branch(prefix, key, pos, mask, hashes);
    }

    fn record_short(&mut self, prefix: &[u8], key: &[u8], pos: usize, short_key: &[u8]) {
        self.witness.record_short(prefix, key, pos, short_key);
    }

    fn record_value(&mut self, prefix: &[u8], key: &[u8], pos: usize, value: &[u8]) {
        self.witness.record_value(prefix, key, pos, value);
    }
}

/// State view backed by the account trie, per-account storage tries and
/// the flat backing store.
pub struct TrieDbState<DB> {
    t: Trie,
    db: DB,
    block_nr: u64,
    storage_tries: FxHashMap<B256, Trie>,
    /// Pending storage writes: address -> key hash -> stripped value
    /// (empty = delete).
    storage_updates: BTreeMap<Address, BTreeMap<B256, Vec<u8>>>,
    /// Pending account writes: address hash -> record (`None` = delete).
    account_updates: BTreeMap<B256, Option<Account>>,
    /// Accounts whose storage tries go away with them.
    deleted: BTreeSet<B256>,
    code_cache: LruCache<B256, Vec<u8>>,
    code_size_cache: LruCache<B256, usize>,
    historical: bool,
    no_history: bool,
    resolve_reads: bool,
    max_trie_cache_gen: usize,
    observer: StateObserver,
}

impl<DB: Database> TrieDbState<DB> {
    /// Open a state view at `root` as of `block_nr`.
    pub fn new(root: B256, db: DB, block_nr: u64) -> Self {
        let observer = StateObserver {
            oldest_generation: block_nr,
            ..Default::default()
        };
        TrieDbState {
            t: Trie::new(root, Bucket::Accounts, Vec::new()),
            db,
            block_nr,
            storage_tries: FxHashMap::default(),
            storage_updates: BTreeMap::new(),
            account_updates: BTreeMap::new(),
            deleted: BTreeSet::new(),
            code_cache: LruCache::new(NonZeroUsize::new(CODE_CACHE_SIZE).expect("nonzero")),
            code_size_cache: LruCache::new(
                NonZeroUsize::new(CODE_SIZE_CACHE_SIZE).expect("nonzero"),
            ),
            historical: false,
            no_history: false,
            resolve_reads: false,
            max_trie_cache_gen: MAX_TRIE_CACHE_GEN,
            observer,
        }
    }

    /// The backing store.
    pub fn database(&self) -> &DB {
        &self.db
    }

    /// Current block number.
    pub fn block_nr(&self) -> u64 {
        self.block_nr
    }

    /// Advance to the next block.
    pub fn set_block_nr(&mut self, block_nr: u64) {
        self.block_nr = block_nr;
    }

    /// Switch as-of-block reads on for every trie.
    pub fn set_historical(&mut self, historical: bool) {
        self.historical = historical;
        self.t.set_historical(historical);
        for trie in self.storage_tries.values_mut() {
            trie.set_historical(historical);
        }
    }

    /// Enable witness recording on every trie.
    pub fn set_resolve_reads(&mut self, resolve_reads: bool) {
        self.resolve_reads = resolve_reads;
        self.t.set_resolve_reads(resolve_reads);
        for trie in self.storage_tries.values_mut() {
            trie.set_resolve_reads(resolve_reads);
        }
    }

    /// Skip the history log (initial sync).
    pub fn set_no_history(&mut self, no_history: bool) {
        self.no_history = no_history;
    }

    pub(crate) fn no_history(&self) -> bool {
        self.no_history
    }

    /// Override the in-memory node budget.
    pub fn set_max_trie_cache_gen(&mut self, max: usize) {
        self.max_trie_cache_gen = max;
    }

    /// Live structural nodes across all tries.
    pub fn node_count(&self) -> isize {
        self.observer.node_count
    }

    /// Oldest generation still held in memory.
    pub fn oldest_generation(&self) -> u64 {
        self.observer.oldest_generation
    }

    /// Writer that only buffers into this state.
    pub fn trie_state_writer(&mut self) -> TrieStateWriter<'_, DB> {
        TrieStateWriter { tds: self }
    }

    /// Writer that persists rows and the history log.
    pub fn db_state_writer(&mut self) -> DbStateWriter<'_, DB> {
        DbStateWriter { tds: self }
    }

    /// keccak256 of an address, optionally saving the preimage.
    pub fn hash_address(&mut self, address: Address, save: bool) -> Result<B256> {
        let hash = keccak256(address);
        if save {
            self.db
                .put(Bucket::Preimage, hash.as_slice(), address.as_slice())?;
        }
        Ok(hash)
    }

    /// keccak256 of a storage key, optionally saving the preimage.
    pub fn hash_key(&mut self, key: B256, save: bool) -> Result<B256> {
        let hash = keccak256(key);
        if save {
            self.db
                .put(Bucket::Preimage, hash.as_slice(), key.as_slice())?;
        }
        Ok(hash)
    }

    /// Recover the preimage of a hashed key.
    pub fn get_key(&self, hashed: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(Bucket::Preimage, hashed)
    }

    pub(crate) fn buffer_account_update(&mut self, addr_hash: B256, account: Option<Account>) {
        self.account_updates.insert(addr_hash, account);
    }

    pub(crate) fn buffer_account_delete(&mut self, addr_hash: B256) {
        self.account_updates.insert(addr_hash, None);
        self.deleted.insert(addr_hash);
    }

    pub(crate) fn buffer_storage_update(&mut self, address: Address, seckey: B256, value: Vec<u8>) {
        self.storage_updates
            .entry(address)
            .or_default()
            .insert(seckey, value);
    }

    /// Open (or create) the storage trie of an account, rooted at the
    /// account's current storage root.
    fn ensure_storage_trie(&mut self, address: Address, addr_hash: B256) -> Result<()> {
        if self.storage_tries.contains_key(&addr_hash) {
            return Ok(());
        }
        let root = self
            .read_account_data_inner(address)?
            .map(|account| account.storage_root)
            .unwrap_or(EMPTY_ROOT);
        let mut trie = Trie::new(root, Bucket::Storage, address.to_vec());
        trie.set_historical(self.historical);
        trie.set_resolve_reads(self.resolve_reads);
        self.storage_tries.insert(addr_hash, trie);
        Ok(())
    }

    fn read_account_data_inner(&mut self, address: Address) -> Result<Option<Account>> {
        let addr_hash = keccak256(address);
        let enc = self.t.get(
            Some(&self.db as &dyn Database),
            addr_hash.as_slice(),
            self.block_nr,
            &mut self.observer,
        )?;
        enc.map(|bytes| Account::decode(&bytes)).transpose()
    }

    /// Commit the pending buffers: fold storage updates into their tries,
    /// refresh account storage roots, fold account updates into the
    /// account trie, hash the root and export the hash side-table. The
    /// buffers are cleared only on success.
    pub fn trie_root(&mut self) -> Result<B256> {
        let root = self.trie_root_impl(true)?;
        self.clear_updates();
        Ok(root)
    }

    fn trie_root_impl(&mut self, forward: bool) -> Result<B256> {
        if self.storage_updates.is_empty() && self.account_updates.is_empty() {
            return Ok(self.t.hash());
        }

        // storage updates land first so the account records committed
        // below see up-to-date storage roots
        let addresses: Vec<Address> = self.storage_updates.keys().copied().collect();
        for address in addresses {
            let addr_hash = keccak256(address);
            if self.deleted.contains(&addr_hash) {
                continue;
            }
            self.ensure_storage_trie(address, addr_hash)?;
            let mut continuations: Vec<TrieContinuation> = {
                let trie = &self.storage_tries[&addr_hash];
                self.storage_updates[&address]
                    .iter()
                    .map(|(key_hash, value)| trie.update_action(key_hash.as_slice(), value))
                    .collect()
            };
            let trie = self
                .storage_tries
                .get_mut(&addr_hash)
                .expect("storage trie just ensured");
            run_resolve_loop(trie, &self.db, &mut continuations, self.block_nr, &mut self.observer)?;
        }

        let pending_accounts: Vec<(B256, Option<Account>)> = self
            .account_updates
            .iter()
            .map(|(addr_hash, account)| (*addr_hash, account.clone()))
            .collect();
        let mut continuations = Vec::with_capacity(pending_accounts.len());
        for (addr_hash, account) in pending_accounts {
            match account {
                Some(mut account) => {
                    if self.deleted.contains(&addr_hash) {
                        account.storage_root = EMPTY_ROOT;
                        self.drop_storage_trie(addr_hash);
                    } else if forward {
                        if let Some(storage_trie) = self.storage_tries.get_mut(&addr_hash) {
                            account.storage_root = storage_trie.hash();
                        }
                    }
                    continuations
                        .push(self.t.update_action(addr_hash.as_slice(), &account.encode_for_trie()));
                }
                None => {
                    self.drop_storage_trie(addr_hash);
                    continuations.push(self.t.delete_action(addr_hash.as_slice()));
                }
            }
        }
        run_resolve_loop(&mut self.t, &self.db, &mut continuations, self.block_nr, &mut self.observer)?;

        let root = self.t.hash();
        self.t.save_hashes(&self.db, self.block_nr)?;
        Ok(root)
    }

    fn drop_storage_trie(&mut self, addr_hash: B256) {
        if let Some(trie) = self.storage_tries.remove(&addr_hash) {
            trie.prepare_to_remove(&mut self.observer);
        }
    }

    fn clear_updates(&mut self) {
        self.storage_updates.clear();
        self.account_updates.clear();
        self.deleted.clear();
    }

    /// Rewind the state to `target` using the history log: set every
    /// touched key back to its historical value, run a reverse commit that
    /// does not advance storage roots, restore the current-state rows and
    /// truncate the log.
    pub fn unwind_to(&mut self, target: u64) -> Result<()> {
        info!(from = self.block_nr, to = target, "unwinding state");
        let mut delta: Vec<(Bucket, Vec<u8>, Vec<u8>)> = Vec::new();
        self.db
            .rewind_data(self.block_nr, target, &mut |bucket, key, value| {
                delta.push((bucket, key.to_vec(), value.to_vec()));
                Ok(())
            })?;
        for (bucket, key, value) in delta {
            match bucket {
                Bucket::AccountsHistory => {
                    let addr_hash = B256::from_slice(&key);
                    if value.is_empty() {
                        self.account_updates.insert(addr_hash, None);
                        self.deleted.insert(addr_hash);
                    } else {
                        self.account_updates
                            .insert(addr_hash, Some(Account::decode(&value)?));
                    }
                }
                Bucket::StorageHistory => {
                    let address = Address::from_slice(&key[..20]);
                    let key_hash = B256::from_slice(&key[20..52]);
                    self.storage_updates
                        .entry(address)
                        .or_default()
                        .insert(key_hash, value);
                }
                _ => {
                    return Err(StateError::Database(format!(
                        "unexpected rewind bucket {}",
                        bucket.as_str()
                    )))
                }
            }
        }

        self.trie_root_impl(false)?;

        for (addr_hash, account) in &self.account_updates {
            match account {
                None => self.db.delete(Bucket::Accounts, addr_hash.as_slice())?,
                Some(account) => self.db.put(
                    Bucket::Accounts,
                    addr_hash.as_slice(),
                    &account.encode_for_storage(),
                )?,
            }
        }
        for (address, slots) in &self.storage_updates {
            for (key_hash, value) in slots {
                let mut composite = Vec::with_capacity(52);
                composite.extend_from_slice(address.as_slice());
                composite.extend_from_slice(key_hash.as_slice());
                if value.is_empty() {
                    self.db.delete(Bucket::Storage, &composite)?;
                } else {
                    self.db.put(Bucket::Storage, &composite, value)?;
                }
            }
        }
        for block in ((target + 1)..=self.block_nr).rev() {
            self.db.delete_timestamp(block)?;
        }
        self.clear_updates();
        self.block_nr = target;
        Ok(())
    }

    /// Enforce the in-memory node budget: find the smallest generation
    /// cutoff that brings the node count under the cap and unload every
    /// subtree older than it.
    pub fn prune_tries(&mut self) {
        if self.observer.node_count <= self.max_trie_cache_gen as isize {
            return;
        }
        let mut excess = self.observer.node_count - self.max_trie_cache_gen as isize;
        let mut removed = 0isize;
        let mut cutoff = self.observer.oldest_generation;
        while excess > 0 && cutoff <= self.block_nr {
            let count = self
                .observer
                .generation_counts
                .remove(&cutoff)
                .unwrap_or(0);
            excess -= count;
            removed += count;
            cutoff += 1;
        }
        let mut emptied = Vec::new();
        for (addr_hash, trie) in self.storage_tries.iter_mut() {
            if trie.unload_older_than(cutoff) {
                emptied.push(*addr_hash);
            }
        }
        for addr_hash in emptied {
            self.storage_tries.remove(&addr_hash);
        }
        self.t.unload_older_than(cutoff);
        self.observer.oldest_generation = cutoff;
        self.observer.node_count -= removed;
        info!(
            nodes = self.observer.node_count,
            oldest_generation = cutoff,
            "pruned tries"
        );
    }

    /// Drain the accumulated witness into a [`BlockProof`], resolving the
    /// recorded code hashes to code blobs.
    pub fn extract_proofs(&mut self) -> Result<BlockProof> {
        let witness = std::mem::take(&mut self.observer.witness);
        let mut codes = Vec::new();
        for code_hash in witness.code_hashes() {
            if *code_hash == EMPTY_CODE_HASH {
                continue;
            }
            let code = match self.code_cache.get(code_hash) {
                Some(code) => code.clone(),
                None => self
                    .db
                    .get(Bucket::Code, code_hash.as_slice())?
                    .ok_or_else(|| {
                        StateError::Database(format!("missing code for hash {code_hash}"))
                    })?,
            };
            codes.push(code);
        }
        Ok(witness.into_block_proof(codes))
    }

    /// Addresses whose accounts changed in blocks `start..=end`, recovered
    /// through the preimage bucket.
    pub fn get_modified_accounts(&self, start: u64, end: u64) -> Result<Vec<Address>> {
        let mut hashes: Vec<Vec<u8>> = Vec::new();
        self.db
            .rewind_data(end, start.saturating_sub(1), &mut |bucket, key, _| {
                if bucket == Bucket::AccountsHistory {
                    hashes.push(key.to_vec());
                }
                Ok(())
            })?;
        let mut addresses = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let preimage = self.db.get(Bucket::Preimage, &hash)?.ok_or_else(|| {
                StateError::Database(format!(
                    "no preimage for account hash {}",
                    B256::from_slice(&hash)
                ))
            })?;
            addresses.push(Address::from_slice(&preimage));
        }
        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }
}

impl<DB: Database> StateReader for TrieDbState<DB> {
    fn read_account_data(&mut self, address: Address) -> Result<Option<Account>> {
        self.read_account_data_inner(address)
    }

    fn read_account_storage(&mut self, address: Address, key: B256) -> Result<Option<Vec<u8>>> {
        let addr_hash = keccak256(address);
        self.ensure_storage_trie(address, addr_hash)?;
        let seckey = keccak256(key);
        let trie = self
            .storage_tries
            .get_mut(&addr_hash)
            .expect("storage trie just ensured");
        trie.get(
            Some(&self.db as &dyn Database),
            seckey.as_slice(),
            self.block_nr,
            &mut self.observer,
        )
    }

    fn read_account_code(&mut self, code_hash: B256) -> Result<Vec<u8>> {
        if self.resolve_reads {
            self.observer.witness.record_code(code_hash);
        }
        if code_hash == EMPTY_CODE_HASH {
            return Ok(Vec::new());
        }
        if let Some(code) = self.code_cache.get(&code_hash) {
            return Ok(code.clone());
        }
        let code = self
            .db
            .get(Bucket::Code, code_hash.as_slice())?
            .ok_or_else(|| StateError::Database(format!("missing code for hash {code_hash}")))?;
        self.code_size_cache.put(code_hash, code.len());
        self.code_cache.put(code_hash, code.clone());
        Ok(code)
    }

    fn read_account_code_size(&mut self, code_hash: B256) -> Result<usize> {
        if self.resolve_reads {
            self.observer.witness.record_code(code_hash);
        }
        if let Some(size) = self.code_size_cache.get(&code_hash) {
            return Ok(*size);
        }
        let code = self.read_account_code(code_hash)?;
        Ok(code.len())
    }
}

/// Run every continuation against the trie, resolving parked ones through
/// the backing store until the whole batch lands.
fn run_resolve_loop<DB: Database>(
    trie: &mut Trie,
    db: &DB,
    continuations: &mut [TrieContinuation],
    block: u64,
    obs: &mut StateObserver,
) -> Result<()> {
    let mut completed = vec![false; continuations.len()];
    let mut iterations = 0usize;
    loop {
        let mut unresolved = false;
        for (i, c) in continuations.iter_mut().enumerate() {
            if completed[i] {
                continue;
            }
            if trie.run_continuation(c, Some(db as &dyn Database), block, obs)? {
                completed[i] = true;
            } else {
                unresolved = true;
            }
        }
        if !unresolved {
            break;
        }
        resolve_batch(trie, db, continuations, block, false)?;
        iterations += 1;
    }
    if iterations > 3 {
        debug!(iterations, "slow resolution while committing");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem_db::MemDb, state::writers::StateWriter};
    use alloy_primitives::U256;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn balance_account(balance: u64) -> Account {
        Account {
            nonce: 0,
            balance: U256::from(balance),
            ..Default::default()
        }
    }

    /// Apply one account update through both writers, the way the block
    /// driver does.
    fn apply_account(
        tds: &mut TrieDbState<MemDb>,
        address: Address,
        account: &Account,
    ) -> Result<()> {
        let original = tds.read_account_data(address)?;
        tds.trie_state_writer()
            .update_account_data(address, original.as_ref(), account)?;
        tds.db_state_writer()
            .update_account_data(address, original.as_ref(), account)?;
        Ok(())
    }

    fn apply_storage(
        tds: &mut TrieDbState<MemDb>,
        address: Address,
        key: B256,
        value: B256,
    ) -> Result<()> {
        let original = tds
            .read_account_storage(address, key)?
            .map(|bytes| {
                let mut word = [0u8; 32];
                word[32 - bytes.len()..].copy_from_slice(&bytes);
                B256::from(word)
            })
            .unwrap_or_default();
        tds.trie_state_writer()
            .write_account_storage(address, key, original, value)?;
        tds.db_state_writer()
            .write_account_storage(address, key, original, value)?;
        Ok(())
    }

    #[test]
    fn empty_commit_is_empty_root() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        assert_eq!(tds.trie_root().unwrap(), EMPTY_ROOT);
    }

    #[test]
    fn commit_clears_pending_buffers() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 1);
        apply_account(&mut tds, addr(0x11), &balance_account(100)).unwrap();
        assert!(!tds.account_updates.is_empty());
        tds.trie_root().unwrap();
        assert!(tds.account_updates.is_empty());
        assert!(tds.storage_updates.is_empty());
        assert!(tds.deleted.is_empty());
    }

    #[test]
    fn committed_account_reads_back() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 1);
        let account = Account {
            nonce: 3,
            balance: U256::from(500u64),
            ..Default::default()
        };
        apply_account(&mut tds, addr(0x22), &account).unwrap();
        let root = tds.trie_root().unwrap();
        assert_ne!(root, EMPTY_ROOT);
        assert_eq!(tds.read_account_data(addr(0x22)).unwrap(), Some(account));
    }

    #[test]
    fn storage_updates_advance_the_account_root() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 1);
        let contract = addr(0x33);
        apply_account(&mut tds, contract, &balance_account(1)).unwrap();
        let root_without_storage = tds.trie_root().unwrap();

        tds.set_block_nr(2);
        apply_storage(&mut tds, contract, B256::with_last_byte(1), B256::with_last_byte(42)).unwrap();
        apply_account(&mut tds, contract, &balance_account(1)).unwrap();
        let root_with_storage = tds.trie_root().unwrap();
        assert_ne!(root_without_storage, root_with_storage);

        let account = tds.read_account_data(contract).unwrap().unwrap();
        assert_ne!(account.storage_root, EMPTY_ROOT);
        assert_eq!(
            tds.read_account_storage(contract, B256::with_last_byte(1)).unwrap(),
            Some(vec![42])
        );
    }

    #[test]
    fn account_commit_order_does_not_change_the_root() {
        let accounts: Vec<(Address, Account)> = (1..=8u8)
            .map(|i| (addr(i), balance_account(u64::from(i) * 10)))
            .collect();

        let mut forward = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 1);
        for (address, account) in &accounts {
            apply_account(&mut forward, *address, account).unwrap();
        }
        let root_forward = forward.trie_root().unwrap();

        let mut backward = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 1);
        for (address, account) in accounts.iter().rev() {
            apply_account(&mut backward, *address, account).unwrap();
        }
        assert_eq!(backward.trie_root().unwrap(), root_forward);
    }

    #[test]
    fn historical_rewind_restores_balance_root_and_log() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        let account_addr = addr(0xaa);

        let mut roots = Vec::new();
        for (block, balance) in [(1u64, 100u64), (2, 200), (3, 300)] {
            tds.set_block_nr(block);
            apply_account(&mut tds, account_addr, &balance_account(balance)).unwrap();
            roots.push(tds.trie_root().unwrap());
        }

        tds.unwind_to(1).unwrap();
        assert_eq!(tds.block_nr(), 1);
        let account = tds.read_account_data(account_addr).unwrap().unwrap();
        assert_eq!(account.balance, U256::from(100u64));
        assert_eq!(tds.t.hash(), roots[0]);

        // the current-state row matches and the log for blocks 2..3 is gone
        let addr_hash = keccak256(account_addr);
        let row = tds
            .database()
            .get(Bucket::Accounts, addr_hash.as_slice())
            .unwrap()
            .unwrap();
        assert_eq!(Account::decode(&row).unwrap().balance, U256::from(100u64));
        let as_of = tds
            .database()
            .get_as_of(Bucket::Accounts, Bucket::AccountsHistory, addr_hash.as_slice(), 2)
            .unwrap()
            .unwrap();
        assert_eq!(Account::decode(&as_of).unwrap().balance, U256::from(100u64));
    }

    #[test]
    fn rewind_deletes_accounts_created_after_the_target() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        tds.set_block_nr(1);
        apply_account(&mut tds, addr(0x01), &balance_account(1)).unwrap();
        let root_1 = tds.trie_root().unwrap();

        tds.set_block_nr(2);
        apply_account(&mut tds, addr(0x02), &balance_account(2)).unwrap();
        tds.trie_root().unwrap();

        tds.unwind_to(1).unwrap();
        assert_eq!(tds.read_account_data(addr(0x02)).unwrap(), None);
        assert_eq!(tds.t.hash(), root_1);
    }

    #[test]
    fn unwind_is_left_inverse_of_commit_with_storage() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        let contract = addr(0xcc);

        tds.set_block_nr(1);
        apply_account(&mut tds, contract, &balance_account(7)).unwrap();
        apply_storage(&mut tds, contract, B256::with_last_byte(5), B256::with_last_byte(50)).unwrap();
        let root_1 = tds.trie_root().unwrap();
        let storage_root_1 = tds
            .read_account_data(contract)
            .unwrap()
            .unwrap()
            .storage_root;

        tds.set_block_nr(2);
        apply_storage(&mut tds, contract, B256::with_last_byte(5), B256::with_last_byte(60)).unwrap();
        apply_storage(&mut tds, contract, B256::with_last_byte(6), B256::with_last_byte(61)).unwrap();
        apply_account(&mut tds, contract, &balance_account(8)).unwrap();
        tds.trie_root().unwrap();

        tds.unwind_to(1).unwrap();
        let account = tds.read_account_data(contract).unwrap().unwrap();
        assert_eq!(account.balance, U256::from(7u64));
        assert_eq!(account.storage_root, storage_root_1);
        assert_eq!(tds.t.hash(), root_1);
        assert_eq!(
            tds.read_account_storage(contract, B256::with_last_byte(5)).unwrap(),
            Some(vec![50])
        );
        assert_eq!(
            tds.read_account_storage(contract, B256::with_last_byte(6)).unwrap(),
            None
        );
    }

    #[test]
    fn prune_unloads_old_generations() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        for block in 1..=4u64 {
            tds.set_block_nr(block);
            for i in 0..8u8 {
                let address = Address::repeat_byte(block as u8 * 16 + i);
                apply_account(&mut tds, address, &balance_account(u64::from(i) + block)).unwrap();
            }
            tds.trie_root().unwrap();
        }
        let before = tds.node_count();
        assert!(before > 8);

        // force a prune of everything but the newest generation
        tds.set_max_trie_cache_gen(8);
        tds.prune_tries();
        assert!(tds.node_count() <= 8 + before / 2, "prune must shed nodes");
        assert!(tds.oldest_generation() > 1);

        // reads resolve unloaded paths back in
        let account = tds.read_account_data(Address::repeat_byte(16)).unwrap();
        assert!(account.is_some());
    }

    #[test]
    fn code_caches_roundtrip() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 1);
        let code = b"\x60\x80\x60\x40".to_vec();
        let code_hash = keccak256(&code);
        tds.db_state_writer()
            .update_account_code(code_hash, &code)
            .unwrap();
        assert_eq!(tds.read_account_code(code_hash).unwrap(), code);
        // second read hits the cache even if the row disappears
        tds.database().delete(Bucket::Code, code_hash.as_slice()).unwrap();
        assert_eq!(tds.read_account_code(code_hash).unwrap(), code);
        assert_eq!(tds.read_account_code_size(code_hash).unwrap(), code.len());
        assert_eq!(tds.read_account_code(EMPTY_CODE_HASH).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn modified_accounts_are_recoverable() {
        let mut tds = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        tds.set_block_nr(1);
        apply_account(&mut tds, addr(0x0a), &balance_account(1)).unwrap();
        tds.trie_root().unwrap();
        tds.set_block_nr(2);
        apply_account(&mut tds, addr(0x0b), &balance_account(2)).unwrap();
        tds.trie_root().unwrap();

        let all = tds.get_modified_accounts(1, 2).unwrap();
        assert_eq!(all, vec![addr(0x0a), addr(0x0b)]);
        let only_second = tds.get_modified_accounts(2, 2).unwrap();
        assert_eq!(only_second, vec![addr(0x0b)]);

        // preimage recovery goes through the same bucket
        let addr_hash = keccak256(addr(0x0a));
        assert_eq!(
            tds.get_key(addr_hash.as_slice()).unwrap(),
            Some(addr(0x0a).to_vec())
        );
    }
}
