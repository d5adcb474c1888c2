//! In-memory backing store.
//!
//! [`MemDb`] implements the [`Database`] trait over `BTreeMap`s guarded by
//! a [`parking_lot::RwLock`]. It is not a storage engine: it exists as the
//! reference implementation of the backing-store contract, for unit and
//! integration tests and for benches. Persistent deployments plug an
//! ordered key-value store behind the same trait.
use crate::{
    error::Result,
    traits::{Bucket, Database, DbBatch, MultiWalkCallback, RewindCallback, WalkCallback},
};
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;
/// key -> block-of-change -> pre-change value (empty = did not exist).
type History = BTreeMap<Vec<u8>, BTreeMap<u64, Vec<u8>>>;

#[derive(Debug, Default)]
struct MemDbInner {
    /// Current state rows per bucket.
    buckets: HashMap<Bucket, Rows>,
    /// History logs, keyed by the history bucket.
    history: HashMap<Bucket, History>,
    /// Per-block index of touched (history bucket, key) pairs; drives
    /// rewinds and timestamp deletion.
    changes: BTreeMap<u64, BTreeSet<(Bucket, Vec<u8>)>>,
    /// Level-5 hash side-table of the account trie.
    hashes: HashMap<u32, B256>,
}

impl MemDbInner {
    fn rows(&self, bucket: Bucket) -> Option<&Rows> {
        self.buckets.get(&bucket)
    }

    fn rows_mut(&mut self, bucket: Bucket) -> &mut Rows {
        self.buckets.entry(bucket).or_default()
    }

    fn value_as_of(&self, state: Bucket, history: Bucket, key: &[u8], block: u64) -> Option<Vec<u8>> {
        if let Some(per_key) = self.history.get(&history).and_then(|h| h.get(key)) {
            // The first change at or after `block` recorded the value the
            // key still had at the beginning of `block`.
            if let Some((_, value)) = per_key.range(block..).next() {
                return if value.is_empty() {
                    None
                } else {
                    Some(value.clone())
                };
            }
        }
        self.rows(state).and_then(|rows| rows.get(key).cloned())
    }

    /// Sorted keys visible in the as-of view under a fixed-bit prefix.
    fn keys_as_of(&self, state: Bucket, history: Bucket, start: &[u8], fixed_bits: usize) -> Vec<Vec<u8>> {
        let mut keys: BTreeSet<Vec<u8>> = BTreeSet::new();
        if let Some(rows) = self.rows(state) {
            keys.extend(rows.keys().cloned());
        }
        if let Some(per_key) = self.history.get(&history) {
            keys.extend(per_key.keys().cloned());
        }
        keys.into_iter()
            .filter(|k| matches_fixed_bits(k, start, fixed_bits))
            .collect()
    }
}

/// In-memory [`Database`] implementation.
#[derive(Debug, Default)]
pub struct MemDb {
    inner: RwLock<MemDbInner>,
}

impl MemDb {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// True when `key` agrees with `start` on the first `fixed_bits` bits.
fn matches_fixed_bits(key: &[u8], start: &[u8], fixed_bits: usize) -> bool {
    if fixed_bits == 0 {
        return true;
    }
    let full_bytes = fixed_bits / 8;
    if key.len() < (fixed_bits + 7) / 8 || start.len() < (fixed_bits + 7) / 8 {
        return false;
    }
    if key[..full_bytes] != start[..full_bytes] {
        return false;
    }
    let rem = fixed_bits % 8;
    if rem == 0 {
        return true;
    }
    let mask = !(0xffu8 >> rem);
    (key[full_bytes] ^ start[full_bytes]) & mask == 0
}

impl Database for MemDb {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .read()
            .rows(bucket)
            .and_then(|rows| rows.get(key).cloned()))
    }

    fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner
            .write()
            .rows_mut(bucket)
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        self.inner.write().rows_mut(bucket).remove(key);
        Ok(())
    }

    fn put_timestamped(&self, bucket: Bucket, key: &[u8], value: &[u8], block: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .history
            .entry(bucket)
            .or_default()
            .entry(key.to_vec())
            .or_default()
            .insert(block, value.to_vec());
        inner
            .changes
            .entry(block)
            .or_default()
            .insert((bucket, key.to_vec()));
        Ok(())
    }

    fn get_as_of(
        &self,
        state: Bucket,
        history: Bucket,
        key: &[u8],
        block: u64,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().value_as_of(state, history, key, block))
    }

    fn walk(
        &self,
        bucket: Bucket,
        start: &[u8],
        fixed_bits: usize,
        callback: &mut WalkCallback<'_>,
    ) -> Result<()> {
        // Clone the matching range out of the lock; callbacks may re-enter
        // the store.
        let rows: Vec<(Vec<u8>, Vec<u8>)> = {
            let inner = self.inner.read();
            match inner.rows(bucket) {
                Some(rows) => rows
                    .range(start.to_vec()..)
                    .filter(|(k, _)| matches_fixed_bits(k, start, fixed_bits))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        for (key, value) in rows {
            if !callback(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    fn walk_as_of(
        &self,
        state: Bucket,
        history: Bucket,
        start: &[u8],
        fixed_bits: usize,
        block: u64,
        callback: &mut WalkCallback<'_>,
    ) -> Result<()> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let inner = self.inner.read();
            inner
                .keys_as_of(state, history, start, fixed_bits)
                .into_iter()
                .filter(|k| k.as_slice() >= start)
                .filter_map(|k| inner.value_as_of(state, history, &k, block).map(|v| (k, v)))
                .collect()
        };
        for (key, value) in entries {
            if !callback(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    fn multi_walk_as_of(
        &self,
        state: Bucket,
        history: Bucket,
        starts: &[Vec<u8>],
        fixed_bits: &[usize],
        block: u64,
        callback: &mut MultiWalkCallback<'_>,
    ) -> Result<()> {
        debug_assert_eq!(starts.len(), fixed_bits.len());
        for (idx, (start, bits)) in starts.iter().zip(fixed_bits.iter()).enumerate() {
            let entries: Vec<(Vec<u8>, Vec<u8>)> = {
                let inner = self.inner.read();
                inner
                    .keys_as_of(state, history, start, *bits)
                    .into_iter()
                    .filter_map(|k| inner.value_as_of(state, history, &k, block).map(|v| (k, v)))
                    .collect()
            };
            for (key, value) in entries {
                callback(idx, &key, &value)?;
            }
        }
        Ok(())
    }

    fn rewind_data(&self, from: u64, to: u64, callback: &mut RewindCallback<'_>) -> Result<()> {
        let touched: BTreeSet<(Bucket, Vec<u8>)> = {
            let inner = self.inner.read();
            inner
                .changes
                .range(to + 1..=from)
                .flat_map(|(_, set)| set.iter().cloned())
                .collect()
        };
        for (history, key) in touched {
            let value = {
                let inner = self.inner.read();
                inner.value_as_of(history.current(), history, &key, to + 1)
            };
            callback(history, &key, value.as_deref().unwrap_or(&[]))?;
        }
        Ok(())
    }

    fn delete_timestamp(&self, block: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(touched) = inner.changes.remove(&block) else {
            return Ok(());
        };
        for (bucket, key) in touched {
            if let Some(per_key) = inner.history.get_mut(&bucket).and_then(|h| h.get_mut(&key)) {
                per_key.remove(&block);
                if per_key.is_empty() {
                    inner.history.get_mut(&bucket).unwrap().remove(&key);
                }
            }
        }
        Ok(())
    }

    fn put_hash(&self, index: u32, hash: B256) -> Result<()> {
        self.inner.write().hashes.insert(index, hash);
        Ok(())
    }

    fn get_hash(&self, index: u32) -> Result<Option<B256>> {
        Ok(self.inner.read().hashes.get(&index).copied())
    }

    fn new_batch<'a>(&'a self) -> Box<dyn DbBatch + 'a> {
        Box::new(MemBatch {
            db: self,
            ops: Vec::new(),
        })
    }
}

enum BatchOp {
    Put(Bucket, Vec<u8>, Vec<u8>),
    Delete(Bucket, Vec<u8>),
    PutTimestamped(Bucket, Vec<u8>, Vec<u8>, u64),
}

/// Batch of writes applied atomically under one lock acquisition.
pub struct MemBatch<'a> {
    db: &'a MemDb,
    ops: Vec<BatchOp>,
}

impl DbBatch for MemBatch<'_> {
    fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) {
        self.ops
            .push(BatchOp::Put(bucket, key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, bucket: Bucket, key: &[u8]) {
        self.ops.push(BatchOp::Delete(bucket, key.to_vec()));
    }

    fn put_timestamped(&mut self, bucket: Bucket, key: &[u8], value: &[u8], block: u64) {
        self.ops.push(BatchOp::PutTimestamped(
            bucket,
            key.to_vec(),
            value.to_vec(),
            block,
        ));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut inner = self.db.inner.write();
        for op in self.ops {
            match op {
                BatchOp::Put(bucket, key, value) => {
                    inner.rows_mut(bucket).insert(key, value);
                }
                BatchOp::Delete(bucket, key) => {
                    inner.rows_mut(bucket).remove(&key);
                }
                BatchOp::PutTimestamped(bucket, key, value, block) => {
                    inner
                        .history
                        .entry(bucket)
                        .or_default()
                        .entry(key.clone())
                        .or_default()
                        .insert(block, value);
                    inner.changes.entry(block).or_default().insert((bucket, key));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let db = MemDb::new();
        db.put(Bucket::Accounts, b"k", b"v").unwrap();
        assert_eq!(db.get(Bucket::Accounts, b"k").unwrap(), Some(b"v".to_vec()));
        // buckets are disjoint namespaces
        assert_eq!(db.get(Bucket::Storage, b"k").unwrap(), None);
        db.delete(Bucket::Accounts, b"k").unwrap();
        assert_eq!(db.get(Bucket::Accounts, b"k").unwrap(), None);
    }

    #[test]
    fn as_of_reads_prefer_history() {
        let db = MemDb::new();
        // block 1 writes "one" (no prior value), block 2 writes "two"
        db.put_timestamped(Bucket::AccountsHistory, b"k", b"", 1).unwrap();
        db.put_timestamped(Bucket::AccountsHistory, b"k", b"one", 2).unwrap();
        db.put(Bucket::Accounts, b"k", b"two").unwrap();

        let as_of = |block| {
            db.get_as_of(Bucket::Accounts, Bucket::AccountsHistory, b"k", block)
                .unwrap()
        };
        assert_eq!(as_of(1), None, "did not exist before block 1");
        assert_eq!(as_of(2), Some(b"one".to_vec()), "value written by block 1");
        assert_eq!(as_of(3), Some(b"two".to_vec()), "current value");
    }

    #[test]
    fn walk_respects_fixed_bits() {
        let db = MemDb::new();
        for key in [[0x10u8, 0x00], [0x1f, 0xff], [0x20, 0x00], [0x0f, 0x00]] {
            db.put(Bucket::Storage, &key, b"v").unwrap();
        }
        let mut seen = Vec::new();
        db.walk(Bucket::Storage, &[0x10, 0x00], 4, &mut |k, _| {
            seen.push(k.to_vec());
            Ok(true)
        })
        .unwrap();
        // only keys with high nibble 1, at or after the start key
        assert_eq!(seen, vec![vec![0x10, 0x00], vec![0x1f, 0xff]]);
    }

    #[test]
    fn rewind_data_yields_pre_update_values() {
        let db = MemDb::new();
        db.put_timestamped(Bucket::AccountsHistory, b"a", b"", 1).unwrap();
        db.put_timestamped(Bucket::AccountsHistory, b"a", b"v1", 2).unwrap();
        db.put_timestamped(Bucket::AccountsHistory, b"b", b"", 2).unwrap();
        db.put(Bucket::Accounts, b"a", b"v2").unwrap();
        db.put(Bucket::Accounts, b"b", b"w1").unwrap();

        let mut delta = Vec::new();
        db.rewind_data(2, 1, &mut |bucket, key, value| {
            assert_eq!(bucket, Bucket::AccountsHistory);
            delta.push((key.to_vec(), value.to_vec()));
            Ok(())
        })
        .unwrap();
        // at the start of block 2: a = v1, b absent
        assert_eq!(
            delta,
            vec![(b"a".to_vec(), b"v1".to_vec()), (b"b".to_vec(), Vec::new())]
        );
    }

    #[test]
    fn walk_as_of_reconstructs_an_earlier_view() {
        let db = MemDb::new();
        // block 1 creates a and b; block 2 deletes b and creates c
        db.put_timestamped(Bucket::Storage.history(), b"a", b"", 1).unwrap();
        db.put_timestamped(Bucket::Storage.history(), b"b", b"", 1).unwrap();
        db.put_timestamped(Bucket::Storage.history(), b"b", b"bv", 2).unwrap();
        db.put_timestamped(Bucket::Storage.history(), b"c", b"", 2).unwrap();
        db.put(Bucket::Storage, b"a", b"av").unwrap();
        db.put(Bucket::Storage, b"c", b"cv").unwrap();

        let mut seen = Vec::new();
        db.walk_as_of(Bucket::Storage, Bucket::StorageHistory, b"", 0, 2, &mut |k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })
        .unwrap();
        // as of the start of block 2: a and b exist, c does not
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"av".to_vec()),
                (b"b".to_vec(), b"bv".to_vec()),
            ]
        );
    }

    #[test]
    fn delete_timestamp_truncates_history() {
        let db = MemDb::new();
        db.put_timestamped(Bucket::StorageHistory, b"k", b"old", 5).unwrap();
        db.put(Bucket::Storage, b"k", b"new").unwrap();
        db.delete_timestamp(5).unwrap();
        // with history gone the as-of read falls through to current state
        assert_eq!(
            db.get_as_of(Bucket::Storage, Bucket::StorageHistory, b"k", 5).unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn batch_commit_is_atomic_view() {
        let db = MemDb::new();
        db.put(Bucket::Accounts, b"stale", b"0").unwrap();
        let mut batch = db.new_batch();
        batch.put(Bucket::Accounts, b"x", b"1");
        batch.put_timestamped(Bucket::AccountsHistory, b"x", b"", 3);
        batch.delete(Bucket::Accounts, b"stale");
        // nothing visible before commit
        assert_eq!(db.get(Bucket::Accounts, b"x").unwrap(), None);
        assert_eq!(db.get(Bucket::Accounts, b"stale").unwrap(), Some(b"0".to_vec()));
        batch.commit().unwrap();
        assert_eq!(db.get(Bucket::Accounts, b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(Bucket::Accounts, b"stale").unwrap(), None);
    }

    #[test]
    fn hash_side_table() {
        let db = MemDb::new();
        assert_eq!(db.get_hash(42).unwrap(), None);
        db.put_hash(42, B256::repeat_byte(7)).unwrap();
        assert_eq!(db.get_hash(42).unwrap(), Some(B256::repeat_byte(7)));
    }
}
