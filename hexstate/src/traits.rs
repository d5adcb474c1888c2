//! The backing-store contract consumed by the state engine.
//!
//! The store is a set of ordered key-value namespaces ("buckets") holding
//! the flat current state, append-only per-block history logs, contract
//! code, key preimages and the level-5 hash side-table. The engine never
//! assumes anything about the implementation beyond this trait; [`MemDb`]
//! (crate::mem_db::MemDb) is the in-memory reference implementation.
use crate::error::Result;
use alloy_primitives::B256;

/// Key namespaces within the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    /// Current accounts, key = keccak256(address).
    Accounts,
    /// Historical accounts, timestamped with block numbers.
    AccountsHistory,
    /// Current storage, key = address || keccak256(slot).
    Storage,
    /// Historical storage.
    StorageHistory,
    /// Contract code, key = keccak256(code).
    Code,
    /// Preimage recovery, key = keccak256(x), value = x.
    Preimage,
}

impl Bucket {
    /// On-disk namespace tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Accounts => "AT",
            Bucket::AccountsHistory => "hAT",
            Bucket::Storage => "ST",
            Bucket::StorageHistory => "hST",
            Bucket::Code => "CODE",
            Bucket::Preimage => "secure-key-",
        }
    }

    /// The history bucket paired with a state bucket.
    pub fn history(self) -> Bucket {
        match self {
            Bucket::Accounts => Bucket::AccountsHistory,
            Bucket::Storage => Bucket::StorageHistory,
            other => other,
        }
    }

    /// The state bucket paired with a history bucket.
    pub fn current(self) -> Bucket {
        match self {
            Bucket::AccountsHistory => Bucket::Accounts,
            Bucket::StorageHistory => Bucket::Storage,
            other => other,
        }
    }
}

/// Visitor for plain walks: `(key, value) -> keep_walking`.
pub type WalkCallback<'a> = dyn FnMut(&[u8], &[u8]) -> Result<bool> + 'a;

/// Visitor for multi-walks: `(start_key_index, key, value)`.
pub type MultiWalkCallback<'a> = dyn FnMut(usize, &[u8], &[u8]) -> Result<()> + 'a;

/// Visitor for rewind deltas: `(history_bucket, key, value_as_of_target)`,
/// where an empty value means the key did not exist at the target block.
pub type RewindCallback<'a> = dyn FnMut(Bucket, &[u8], &[u8]) -> Result<()> + 'a;

/// A write batch applied atomically on commit.
pub trait DbBatch {
    /// Queue a put.
    fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]);
    /// Queue a delete.
    fn delete(&mut self, bucket: Bucket, key: &[u8]);
    /// Queue a history append stamped with `block`.
    fn put_timestamped(&mut self, bucket: Bucket, key: &[u8], value: &[u8], block: u64);
    /// Apply everything queued as one atomic mutation.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// The ordered key-value backing store.
///
/// Methods take `&self`; implementations provide their own interior
/// mutability (the surrounding engine is single-writer per block, the
/// store may serve concurrent readers).
pub trait Database {
    /// Read the current value for a key.
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write the current value for a key.
    fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key from the current state.
    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()>;

    /// Append a pre-update value to the history log of `bucket`, stamped
    /// with the block that replaced it. An empty value records a delete
    /// marker.
    fn put_timestamped(&self, bucket: Bucket, key: &[u8], value: &[u8], block: u64) -> Result<()>;

    /// Read the value a key had at the beginning of `block`, consulting
    /// the history log before the current state.
    fn get_as_of(
        &self,
        state: Bucket,
        history: Bucket,
        key: &[u8],
        block: u64,
    ) -> Result<Option<Vec<u8>>>;

    /// Walk current keys starting at `start` whose first `fixed_bits` bits
    /// equal those of `start`, in key order.
    fn walk(
        &self,
        bucket: Bucket,
        start: &[u8],
        fixed_bits: usize,
        callback: &mut WalkCallback<'_>,
    ) -> Result<()>;

    /// Walk the state as it stood at the beginning of `block`.
    fn walk_as_of(
        &self,
        state: Bucket,
        history: Bucket,
        start: &[u8],
        fixed_bits: usize,
        block: u64,
        callback: &mut WalkCallback<'_>,
    ) -> Result<()>;

    /// Walk several fixed-bit prefixes of the as-of view in one pass. The
    /// callback receives the index of the prefix that matched. Prefixes
    /// are visited in order; within one prefix keys arrive in key order.
    fn multi_walk_as_of(
        &self,
        state: Bucket,
        history: Bucket,
        starts: &[Vec<u8>],
        fixed_bits: &[usize],
        block: u64,
        callback: &mut MultiWalkCallback<'_>,
    ) -> Result<()>;

    /// Produce the inverse delta between two blocks: for every history key
    /// touched in blocks `(to, from]`, yield the value it had at the
    /// beginning of block `to + 1`.
    fn rewind_data(&self, from: u64, to: u64, callback: &mut RewindCallback<'_>) -> Result<()>;

    /// Drop all history entries stamped with `block`.
    fn delete_timestamp(&self, block: u64) -> Result<()>;

    /// Write a hash side-table slot (packed 20-bit five-nibble prefix).
    fn put_hash(&self, index: u32, hash: B256) -> Result<()>;

    /// Read a hash side-table slot.
    fn get_hash(&self, index: u32) -> Result<Option<B256>>;

    /// Open a write batch committed atomically by the block driver.
    fn new_batch<'a>(&'a self) -> Box<dyn DbBatch + 'a>;
}
