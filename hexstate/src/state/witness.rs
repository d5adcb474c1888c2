//! Structural witness accumulation and the serialized block proof.
//!
//! While read resolution is on, the tries report the shape of every path a
//! block touches: per-branch sibling masks and hashes, short-node keys,
//! leaf values and looked-up code hashes. Duplicate branch records at the
//! same path are intersected on the mask, keeping only siblings observed
//! by every traversal (the others were descended into and are covered by
//! deeper records); the first-seen hashes and values win so the witness
//! always describes the pre-state. Extraction drains the records into a
//! [`BlockProof`] of parallel arrays in depth-first order.
//!
//! One 32-bit word describes each node: the low 16 bits flag children
//! present as sibling hashes, the high 16 bits flag children the decoder
//! recurses into. A zero word is a short node; a branch word is never zero
//! because a branch keeps at least two children, each contributing a bit.
use crate::{
    constant::HEX_KEY_LEN,
    error::{Result, StateError},
    traits::Bucket,
    trie::{
        node::{DuoNode, FullNode, Node, NodeFlags, ShortNode},
        Trie,
    },
};
use alloy_primitives::{Address, B256};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compact serialized description of every trie node a block touched,
/// sufficient to reconstruct standalone tries covering exactly those
/// paths. Account-side arrays describe the account trie; contract-side
/// (`c_`-prefixed) arrays concatenate the storage tries of `contracts` in
/// order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    /// Addresses whose storage tries are included, in address order.
    pub contracts: Vec<Address>,
    /// Node words of the storage tries.
    pub c_masks: Vec<u32>,
    /// Sibling hashes of the storage tries, in child-index order.
    pub c_hashes: Vec<B256>,
    /// Short-node keys of the storage tries.
    pub c_short_keys: Vec<Vec<u8>>,
    /// Leaf payloads of the storage tries in depth-first order.
    pub c_values: Vec<Vec<u8>>,
    /// Code of every contract whose code hash was looked up.
    pub codes: Vec<Vec<u8>>,
    /// Node words of the account trie.
    pub masks: Vec<u32>,
    /// Sibling hashes of the account trie.
    pub hashes: Vec<B256>,
    /// Short-node keys of the account trie.
    pub short_keys: Vec<Vec<u8>>,
    /// Account-leaf payloads in depth-first order.
    pub values: Vec<Vec<u8>>,
}

/// Per-tree arrays accumulated during depth-first emission.
struct TreeArrays {
    masks: Vec<u32>,
    hashes: Vec<B256>,
    short_keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
}

/// Witness records accumulated during one block.
#[derive(Debug, Default)]
pub struct WitnessState {
    /// (trie prefix, path) -> intersected sibling mask.
    branch_masks: BTreeMap<(Vec<u8>, Vec<u8>), u16>,
    /// (trie prefix, path) -> sibling hashes by child index.
    branch_hashes: BTreeMap<(Vec<u8>, Vec<u8>), [B256; 16]>,
    /// (trie prefix, path) -> short key; first record wins.
    shorts: BTreeMap<(Vec<u8>, Vec<u8>), Vec<u8>>,
    /// (trie prefix, path) -> pre-state leaf value; first record wins.
    values: BTreeMap<(Vec<u8>, Vec<u8>), Vec<u8>>,
    /// Code hashes looked up during execution.
    codes: FxHashSet<B256>,
}

impl WitnessState {
    /// Fold a branch record in, intersecting with whatever an earlier
    /// traversal saw at the same path. A path first seen as a short keeps
    /// that shape: later records describe post-restructure state, and the
    /// witness must describe the pre-state.
    pub fn record_branch(&mut self, prefix: &[u8], key: &[u8], pos: usize, mask: u16, hashes: &[B256]) {
        let record_key = (prefix.to_vec(), key[..pos].to_vec());
        if self.shorts.contains_key(&record_key) {
            return;
        }
        match self.branch_masks.get_mut(&record_key) {
            Some(existing) => {
                // keep only siblings observed by every traversal; the
                // first-seen hashes describe the pre-state
                *existing &= mask;
            }
            None => {
                let mut by_index = [B256::ZERO; 16];
                let mut next = 0usize;
                for nibble in 0..16 {
                    if mask & (1 << nibble) != 0 {
                        by_index[nibble] = hashes[next];
                        next += 1;
                    }
                }
                self.branch_masks.insert(record_key.clone(), mask);
                self.branch_hashes.insert(record_key, by_index);
            }
        }
    }

    /// Record a short-node key; the first structural record at a path
    /// wins, whatever its kind.
    pub fn record_short(&mut self, prefix: &[u8], key: &[u8], pos: usize, short_key: &[u8]) {
        let record_key = (prefix.to_vec(), key[..pos].to_vec());
        if self.branch_masks.contains_key(&record_key) {
            return;
        }
        self.shorts
            .entry(record_key)
            .or_insert_with(|| short_key.to_vec());
    }

    /// Record a pre-state leaf value; first record wins.
    pub fn record_value(&mut self, prefix: &[u8], key: &[u8], pos: usize, value: &[u8]) {
        self.values
            .entry((prefix.to_vec(), key[..pos].to_vec()))
            .or_insert_with(|| value.to_vec());
    }

    /// Record a code hash lookup.
    pub fn record_code(&mut self, code_hash: B256) {
        self.codes.insert(code_hash);
    }

    /// Code hashes collected so far.
    pub fn code_hashes(&self) -> impl Iterator<Item = &B256> {
        self.codes.iter()
    }

    /// Serialize the records into a [`BlockProof`] with the given resolved
    /// code blobs, consuming the witness state.
    pub fn into_block_proof(self, codes: Vec<Vec<u8>>) -> BlockProof {
        let mut proof = BlockProof {
            codes,
            ..Default::default()
        };

        // contracts in address order; the account trie has the empty
        // prefix. A contract participates only with a root record, since
        // the decoder derives each storage trie's extent from its own
        // record stream.
        let mut contracts: Vec<Vec<u8>> = self
            .branch_masks
            .keys()
            .chain(self.shorts.keys())
            .map(|(prefix, path)| (prefix, path.is_empty()))
            .filter(|(prefix, is_root)| *is_root && !prefix.is_empty())
            .map(|(prefix, _)| prefix.clone())
            .collect();
        contracts.sort();
        contracts.dedup();

        self.emit_tree(&[], &mut proof, true);
        for contract in contracts {
            self.emit_tree(&contract, &mut proof, false);
            proof.contracts.push(Address::from_slice(&contract));
        }
        proof
    }

    /// Emit one tree's records depth first from the root path, exactly the
    /// order the decoder consumes them. Records not reachable from the
    /// root (leftovers of mid-block restructuring) are not emitted.
    fn emit_tree(&self, prefix: &[u8], proof: &mut BlockProof, account_side: bool) {
        let root_key = (prefix.to_vec(), Vec::new());
        if !self.branch_masks.contains_key(&root_key) && !self.shorts.contains_key(&root_key) {
            return;
        }
        let mut out = TreeArrays {
            masks: Vec::new(),
            hashes: Vec::new(),
            short_keys: Vec::new(),
            values: Vec::new(),
        };
        self.emit_node(prefix, Vec::new(), &mut out);

        if account_side {
            proof.masks.extend(out.masks);
            proof.hashes.extend(out.hashes);
            proof.short_keys.extend(out.short_keys);
            proof.values.extend(out.values);
        } else {
            proof.c_masks.extend(out.masks);
            proof.c_hashes.extend(out.hashes);
            proof.c_short_keys.extend(out.short_keys);
            proof.c_values.extend(out.values);
        }
    }

    fn emit_node(&self, prefix: &[u8], path: Vec<u8>, out: &mut TreeArrays) {
        let record_key = (prefix.to_vec(), path.clone());
        if let Some(&mask) = self.branch_masks.get(&record_key) {
            let by_index = &self.branch_hashes[&record_key];
            let mut down = 0u32;
            let mut recurse = Vec::new();
            for nibble in 0..16u8 {
                let mut child_path = path.clone();
                child_path.push(nibble);
                let child_key = (prefix.to_vec(), child_path.clone());
                if self.branch_masks.contains_key(&child_key)
                    || self.shorts.contains_key(&child_key)
                {
                    down |= 1 << nibble;
                    recurse.push(child_path);
                }
            }
            out.masks.push(u32::from(mask) | (down << 16));
            for nibble in 0..16 {
                if mask & (1 << nibble) != 0 {
                    out.hashes.push(by_index[nibble]);
                }
            }
            for child_path in recurse {
                self.emit_node(prefix, child_path, out);
            }
        } else if let Some(short_key) = self.shorts.get(&record_key) {
            out.masks.push(0);
            out.short_keys.push(short_key.clone());
            let mut target = path;
            target.extend_from_slice(short_key);
            if target.len() == HEX_KEY_LEN {
                // leaf: its pre-state value rides in the values array
                let value = self
                    .values
                    .get(&(prefix.to_vec(), target))
                    .cloned()
                    .unwrap_or_default();
                out.values.push(value);
            } else {
                self.emit_node(prefix, target, out);
            }
        }
    }
}

/// Cursor over one side of a [`BlockProof`]'s parallel arrays.
pub(crate) struct ProofCursor<'a> {
    masks: &'a [u32],
    hashes: &'a [B256],
    short_keys: &'a [Vec<u8>],
    values: &'a [Vec<u8>],
    mask_idx: usize,
    hash_idx: usize,
    short_idx: usize,
    value_idx: usize,
}

impl<'a> ProofCursor<'a> {
    pub(crate) fn account_side(proof: &'a BlockProof) -> Self {
        Self::new(&proof.masks, &proof.hashes, &proof.short_keys, &proof.values)
    }

    pub(crate) fn contract_side(proof: &'a BlockProof) -> Self {
        Self::new(
            &proof.c_masks,
            &proof.c_hashes,
            &proof.c_short_keys,
            &proof.c_values,
        )
    }

    fn new(
        masks: &'a [u32],
        hashes: &'a [B256],
        short_keys: &'a [Vec<u8>],
        values: &'a [Vec<u8>],
    ) -> Self {
        ProofCursor {
            masks,
            hashes,
            short_keys,
            values,
            mask_idx: 0,
            hash_idx: 0,
            short_idx: 0,
            value_idx: 0,
        }
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.mask_idx == self.masks.len()
    }

    fn next_mask(&mut self) -> Result<u32> {
        let mask = self
            .masks
            .get(self.mask_idx)
            .copied()
            .ok_or_else(|| StateError::InvalidEncoding("proof mask array exhausted".to_string()))?;
        self.mask_idx += 1;
        Ok(mask)
    }

    fn next_hash(&mut self) -> Result<B256> {
        let hash = self
            .hashes
            .get(self.hash_idx)
            .copied()
            .ok_or_else(|| StateError::InvalidEncoding("proof hash array exhausted".to_string()))?;
        self.hash_idx += 1;
        Ok(hash)
    }

    fn next_short_key(&mut self) -> Result<Vec<u8>> {
        let key = self
            .short_keys
            .get(self.short_idx)
            .cloned()
            .ok_or_else(|| StateError::InvalidEncoding("proof short array exhausted".to_string()))?;
        self.short_idx += 1;
        Ok(key)
    }

    fn next_value(&mut self) -> Result<Vec<u8>> {
        let value = self
            .values
            .get(self.value_idx)
            .cloned()
            .ok_or_else(|| StateError::InvalidEncoding("proof value array exhausted".to_string()))?;
        self.value_idx += 1;
        Ok(value)
    }
}

impl Trie {
    /// Construct a standalone trie from proof records, depth first: a zero
    /// word is a short node (followed by its key and, once the path
    /// reaches the full key length, a value), any other word a branch
    /// whose low bits pull sibling hashes and whose high bits recurse.
    pub(crate) fn from_block_proof(
        bucket: Bucket,
        prefix: Vec<u8>,
        cursor: &mut ProofCursor<'_>,
    ) -> Result<Trie> {
        let mut trie = Trie::new(B256::ZERO, bucket, prefix);
        if !cursor.exhausted() {
            trie.root = Some(construct(cursor, 0)?);
        }
        Ok(trie)
    }
}

fn construct(cursor: &mut ProofCursor<'_>, pos: usize) -> Result<Node> {
    let word = cursor.next_mask()?;
    if word == 0 {
        let key = cursor.next_short_key()?;
        if key.is_empty() || pos + key.len() > HEX_KEY_LEN {
            return Err(StateError::InvalidEncoding(format!(
                "short key of length {} at depth {pos}",
                key.len()
            )));
        }
        let next_pos = pos + key.len();
        let val = if next_pos == HEX_KEY_LEN {
            Node::Value(cursor.next_value()?)
        } else {
            construct(cursor, next_pos)?
        };
        return Ok(Node::Short(Box::new(ShortNode {
            key,
            val,
            flags: NodeFlags {
                dirty: true,
                ..Default::default()
            },
        })));
    }

    let hash_mask = (word & 0xffff) as u16;
    let down_mask = (word >> 16) as u16;
    let mut children: [Option<Node>; 17] = Default::default();
    for nibble in 0..16 {
        if hash_mask & (1 << nibble) != 0 {
            children[nibble] = Some(Node::Hash(cursor.next_hash()?));
        }
    }
    for nibble in 0..16 {
        if down_mask & (1 << nibble) != 0 {
            children[nibble] = Some(construct(cursor, pos + 1)?);
        }
    }

    let occupied: Vec<usize> = children
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.is_some().then_some(i))
        .collect();
    if occupied.len() < 2 {
        return Err(StateError::InvalidEncoding(
            "proof branch with fewer than two children".to_string(),
        ));
    }
    if occupied.len() == 2 && occupied[1] < 16 {
        return Ok(Node::Duo(Box::new(DuoNode {
            mask: (1 << occupied[0]) | (1 << occupied[1]),
            child1: children[occupied[0]].take(),
            child2: children[occupied[1]].take(),
            flags: NodeFlags {
                dirty: true,
                ..Default::default()
            },
        })));
    }
    Ok(Node::Full(Box::new(FullNode {
        children,
        flags: NodeFlags {
            dirty: true,
            ..Default::default()
        },
    })))
}
