//! On-demand materialization of subtries from the flat backing store.
//!
//! The backing store holds flat rows, not nodes: the resolver rebuilds the
//! minimal subtries needed by a batch of parked continuations. It sorts
//! the continuations, folds resolve paths contained in earlier ones, walks
//! the as-of view of the store across the resulting fixed-bit prefixes and
//! threads every yielded row through a bottom-up reconstruction stack. At
//! each group boundary the reconstructed subtree's hash is checked against
//! the hash the parent trie recorded; a mismatch is fatal for the batch.
//!
//! Off-path children stay as hash placeholders: a resolved subtree is
//! never expanded deeper than needed to prove the requested keys.
use crate::{
    account::Account,
    constant::{EMPTY_ROOT, HASH_TABLE_LEVEL, HASH_TABLE_SIZE, HEX_KEY_LEN, TERMINATOR},
    error::{Result, StateError},
    traits::Database,
    trie::{
        encoding::{decode_nibbles, keybytes_to_hex, prefix_len},
        hasher::{acquire_hasher, release_hasher, Hasher, NodeRef},
        node::{DuoNode, FullNode, Node, NodeFlags, ShortNode},
        trie::{Trie, TrieContinuation},
        TrieObserver,
    },
};
use alloy_primitives::B256;
use tracing::{debug, info, warn};

/// Batch resolver for one trie. Owns the reconstruction state of a single
/// multi-walk pass.
struct Resolver<'a> {
    trie: &'a Trie,
    block: u64,
    /// Feed the account hash side-table while reconstructing.
    hashes: bool,
    /// Sorted full resolve keys; decides which reconstructed paths stay
    /// materialized.
    resolve_hexes: Vec<Vec<u8>>,
    /// Continuation index leading each walk group.
    leaders: Vec<usize>,
    /// Current row, backing-store prefix stripped.
    key: Vec<u8>,
    value: Vec<u8>,
    key_set: bool,
    key_idx: usize,
    start_level: usize,
    levels: Vec<LevelState>,
    hasher: Hasher,
}

#[derive(Default)]
struct LevelState {
    /// In-progress branch at this depth.
    children: [Option<Node>; 17],
    fill_count: usize,
    /// In-progress short at this depth.
    short: Option<ShortBuild>,
}

struct ShortBuild {
    key: Vec<u8>,
    val: Node,
}

impl LevelState {
    fn clear(&mut self) {
        self.children = Default::default();
        self.fill_count = 0;
        self.short = None;
    }
}

fn dirty_flags() -> NodeFlags {
    NodeFlags {
        dirty: true,
        hash: None,
        t: 0,
        tod: 0,
    }
}

/// Resolve every parked continuation of `continuations` against the
/// backing store, as of `block`. With `hashes` the pass also feeds the
/// account hash side-table.
pub(crate) fn resolve_batch(
    trie: &Trie,
    db: &dyn Database,
    continuations: &mut [TrieContinuation],
    block: u64,
    hashes: bool,
) -> Result<()> {
    // a parked continuation carries the hash it is waiting for; completed
    // ones cleared it
    let pending: Vec<usize> = (0..continuations.len())
        .filter(|&i| {
            continuations[i].resolved.is_none() && continuations[i].resolve_hash != B256::ZERO
        })
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    // Sort by resolve path, shallower first among shared prefixes.
    let mut order = pending;
    order.sort_by(|&a, &b| {
        let (ca, cb) = (&continuations[a], &continuations[b]);
        let m = ca.resolve_pos.min(cb.resolve_pos);
        ca.resolve_key[..m]
            .cmp(&cb.resolve_key[..m])
            .then(ca.resolve_pos.cmp(&cb.resolve_pos))
    });

    let mut resolve_hexes: Vec<Vec<u8>> = order
        .iter()
        .map(|&i| continuations[i].resolve_key.clone())
        .collect();
    resolve_hexes.sort();
    // Keep only paths not covered by a deeper one right after them.
    let mut kept = Vec::with_capacity(resolve_hexes.len());
    for (i, hex) in resolve_hexes.iter().enumerate() {
        if i == resolve_hexes.len() - 1 || !resolve_hexes[i + 1].starts_with(hex) {
            kept.push(hex.clone());
        }
    }
    let resolve_hexes = kept;

    // Group leaders: a continuation whose resolve prefix is not contained
    // in the previous leader's starts a new walk group.
    let mut leaders: Vec<usize> = Vec::new();
    let mut starts: Vec<Vec<u8>> = Vec::new();
    let mut fixed_bits: Vec<usize> = Vec::new();
    let prefix = trie.prefix();
    let mut prev: Option<usize> = None;
    for &idx in &order {
        let c = &continuations[idx];
        let new_group = match prev {
            None => true,
            Some(p) => {
                let pc = &continuations[p];
                c.resolve_pos < pc.resolve_pos
                    || !c.resolve_key[..c.resolve_pos]
                        .starts_with(&pc.resolve_key[..pc.resolve_pos])
            }
        };
        if new_group {
            let mut start = vec![0u8; prefix.len() + 32];
            start[..prefix.len()].copy_from_slice(prefix);
            decode_nibbles(
                &c.resolve_key[..c.resolve_pos],
                &mut start[prefix.len()..],
            );
            starts.push(start);
            fixed_bits.push(8 * prefix.len() + 4 * c.resolve_pos);
            leaders.push(idx);
            prev = Some(idx);
        }
    }

    let start_level = continuations[order[0]].resolve_pos;
    let mut resolver = Resolver {
        trie,
        block,
        hashes,
        resolve_hexes,
        leaders,
        key: Vec::new(),
        value: Vec::new(),
        key_set: false,
        key_idx: 0,
        start_level,
        levels: (0..=HEX_KEY_LEN).map(|_| LevelState::default()).collect(),
        hasher: acquire_hasher(),
    };

    let walk_result = db.multi_walk_as_of(
        trie.bucket(),
        trie.bucket().history(),
        &starts,
        &fixed_bits,
        block,
        &mut |idx, k, v| {
            resolver.on_row(db, continuations, idx, k, v)
        },
    );
    let finish_result = walk_result.and_then(|()| {
        if resolver.key_set {
            let leader = resolver.leaders[resolver.key_idx];
            resolver.finish_previous_key(db, &mut continuations[leader], None)?;
        }
        Ok(())
    });
    release_hasher(resolver.hasher);
    finish_result?;

    for &leader in &resolver.leaders {
        if continuations[leader].resolved.is_none() {
            return Err(StateError::MissingNode {
                expected_hash: continuations[leader].resolve_hash,
                path: continuations[leader].resolve_key
                    [..continuations[leader].resolve_pos]
                    .to_vec(),
            });
        }
    }
    Ok(())
}

impl Resolver<'_> {
    fn on_row(
        &mut self,
        db: &dyn Database,
        continuations: &mut [TrieContinuation],
        idx: usize,
        k: &[u8],
        v: &[u8],
    ) -> Result<()> {
        if idx != self.key_idx {
            if self.key_set {
                let leader = self.leaders[self.key_idx];
                self.finish_previous_key(db, &mut continuations[leader], None)?;
                self.key_set = false;
            }
            self.key_idx = idx;
        }
        if v.is_empty() {
            return Ok(());
        }
        let stripped = &k[self.trie.prefix().len()..];
        if self.key_set {
            let leader = self.leaders[self.key_idx];
            let stripped = stripped.to_vec();
            self.finish_previous_key(db, &mut continuations[leader], Some(&stripped))?;
            self.remember_row(&stripped, v)
        } else {
            self.remember_row(stripped, v)
        }
    }

    fn remember_row(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.key = key.to_vec();
        // account rows carry the storage shape; trie leaves carry the full
        // four-field list
        self.value = if self.trie.is_accounts() {
            Account::decode(value)?.encode_for_trie()
        } else {
            value.to_vec()
        };
        self.key_set = true;
        Ok(())
    }

    /// Fold the remembered row into the reconstruction stacks, promoting
    /// completed levels. With `next_key` absent the current group ends and
    /// the subtree root is extracted and verified.
    fn finish_previous_key(
        &mut self,
        db: &dyn Database,
        tc: &mut TrieContinuation,
        next_key: Option<&[u8]>,
    ) -> Result<()> {
        let p_len = next_key.map_or(0, |k| prefix_len(k, &self.key));
        let mut stop_level = 2 * p_len;
        if let Some(k) = next_key {
            if (k[p_len] ^ self.key[p_len]) & 0xf0 == 0 {
                stop_level += 1;
            }
        }
        let start_level = self
            .start_level
            .max(tc.resolve_pos)
            .max(stop_level);

        let hex = keybytes_to_hex(&self.key);
        self.levels[start_level + 1].short = Some(ShortBuild {
            key: hex[start_level + 1..].to_vec(),
            val: Node::Value(std::mem::take(&mut self.value)),
        });
        self.levels[start_level + 1].fill_count = 1;

        // Longest overlap between this key and any requested resolve path
        // decides how deep the materialized spine reaches.
        let rh_prefix_len = {
            let at = self.resolve_hexes.partition_point(|rh| rh[..] < hex[..]);
            let before = at
                .checked_sub(1)
                .map_or(0, |i| prefix_len(&hex, &self.resolve_hexes[i]));
            let after = self
                .resolve_hexes
                .get(at)
                .map_or(0, |rh| prefix_len(&hex, rh));
            before.max(after)
        };

        for level in (stop_level..=start_level).rev() {
            let nibble = hex[level];
            let on_path = level <= rh_prefix_len;
            if self.levels[level + 1].fill_count == 1 {
                self.promote_short(db, level, nibble, on_path)?;
            } else {
                self.promote_branch(db, level, nibble, on_path)?;
            }
            if level >= tc.resolve_pos {
                self.levels[level + 1].clear();
            }
        }
        self.start_level = stop_level;

        if next_key.is_none() {
            let pos = tc.resolve_pos;
            let root = match self.levels[pos].fill_count {
                0 => None,
                1 => self.levels[pos].short.take().map(|sb| {
                    Node::Short(Box::new(ShortNode {
                        key: sb.key,
                        val: sb.val,
                        flags: dirty_flags(),
                    }))
                }),
                count => {
                    let children = std::mem::take(&mut self.levels[pos].children);
                    Some(branch_from_children(children, count))
                }
            };
            let mut root = root.ok_or(StateError::InvariantViolation(
                "resolver produced no root for a key group",
            ))?;
            match self.hasher.node_ref(&mut root, pos == 0) {
                NodeRef::Hash(got) => {
                    if got != tc.resolve_hash {
                        debug!(
                            expected = %tc.resolve_hash,
                            got = %got,
                            "reconstructed subtrie hash mismatch"
                        );
                        return Err(StateError::MissingNode {
                            expected_hash: tc.resolve_hash,
                            path: tc.resolve_key[..tc.resolve_pos].to_vec(),
                        });
                    }
                }
                NodeRef::Inline(_) => {
                    return Err(StateError::MissingNode {
                        expected_hash: tc.resolve_hash,
                        path: tc.resolve_key[..tc.resolve_pos].to_vec(),
                    });
                }
            }
            tc.resolved = Some(root);
            for level in self.levels.iter_mut() {
                level.clear();
            }
        }
        Ok(())
    }

    /// A single filled slot at `level + 1`: the in-progress short promotes
    /// into the level above, extending its key by the branch nibble.
    fn promote_short(
        &mut self,
        db: &dyn Database,
        level: usize,
        nibble: u8,
        on_path: bool,
    ) -> Result<()> {
        let sb = self.levels[level + 1]
            .short
            .take()
            .ok_or(StateError::InvariantViolation("fill count 1 without a short"))?;
        let mut snode = Node::Short(Box::new(ShortNode {
            key: sb.key.clone(),
            val: sb.val.clone(),
            flags: dirty_flags(),
        }));
        let sref = self.hasher.node_ref(&mut snode, false);

        if self.hashes && self.trie.is_accounts() {
            let span = sb.key.iter().filter(|&&x| x < TERMINATOR).count();
            if level + 1 <= HASH_TABLE_LEVEL && level + 1 + span >= HASH_TABLE_LEVEL {
                if let NodeRef::Hash(h) = &sref {
                    db.put_hash(self.table_slot(), *h)?;
                }
            }
        }

        let child = if on_path {
            snode
        } else {
            match sref {
                NodeRef::Hash(h) => Node::Hash(h),
                NodeRef::Inline(_) => snode,
            }
        };
        let dest = &mut self.levels[level];
        dest.children[nibble as usize] = Some(child);
        dest.fill_count += 1;
        let mut key = Vec::with_capacity(1 + sb.key.len());
        key.push(nibble);
        key.extend_from_slice(&sb.key);
        dest.short = Some(ShortBuild { key, val: sb.val });
        Ok(())
    }

    /// Two or more filled slots at `level + 1`: the in-progress branch
    /// promotes into the level above.
    fn promote_branch(
        &mut self,
        db: &dyn Database,
        level: usize,
        nibble: u8,
        on_path: bool,
    ) -> Result<()> {
        let count = self.levels[level + 1].fill_count;
        let children = std::mem::take(&mut self.levels[level + 1].children);
        let mut bnode = branch_from_children(children, count);
        let bref = self.hasher.node_ref(&mut bnode, false);

        if self.hashes && self.trie.is_accounts() && level + 1 == HASH_TABLE_LEVEL {
            if let NodeRef::Hash(h) = &bref {
                db.put_hash(self.table_slot(), *h)?;
            }
        }

        let child = if on_path {
            bnode
        } else {
            match bref {
                NodeRef::Hash(h) => Node::Hash(h),
                NodeRef::Inline(_) => bnode,
            }
        };
        let dest = &mut self.levels[level];
        dest.children[nibble as usize] = Some(child.clone());
        dest.fill_count += 1;
        dest.short = Some(ShortBuild {
            key: vec![nibble],
            val: child,
        });
        Ok(())
    }

    /// Side-table slot of the key currently being folded: its first five
    /// nibbles, packed.
    fn table_slot(&self) -> u32 {
        let mut slot = 0u32;
        for byte in &self.key[..2] {
            slot = (slot << 8) | u32::from(*byte);
        }
        (slot << 4) | u32::from(self.key[2] >> 4)
    }
}

fn branch_from_children(mut children: [Option<Node>; 17], count: usize) -> Node {
    if count == 2 {
        let occupied: Vec<usize> = children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.is_some().then_some(i))
            .collect();
        let (i1, i2) = (occupied[0], occupied[1]);
        if i2 < 16 {
            return Node::Duo(Box::new(DuoNode {
                mask: (1 << i1) | (1 << i2),
                child1: children[i1].take(),
                child2: children[i2].take(),
                flags: dirty_flags(),
            }));
        }
    }
    Node::Full(Box::new(FullNode {
        children,
        flags: dirty_flags(),
    }))
}

impl Trie {
    /// Resolve a single hash node inline; used by reads that record
    /// witnesses and therefore must materialize everything they traverse.
    pub(crate) fn resolve_hash_node(
        &self,
        db: Option<&dyn Database>,
        key: &[u8],
        pos: usize,
        expected: B256,
        block: u64,
    ) -> Result<Node> {
        let Some(db) = db else {
            return Err(StateError::MissingNode {
                expected_hash: expected,
                path: key[..pos].to_vec(),
            });
        };
        let mut tc = TrieContinuation::resolve_request(key.to_vec(), pos, expected);
        resolve_batch(self, db, std::slice::from_mut(&mut tc), block, false)?;
        tc.resolved.take().ok_or(StateError::MissingNode {
            expected_hash: expected,
            path: key[..pos].to_vec(),
        })
    }

    /// Rebuild the upper account-trie levels from the hash side-table,
    /// falling back to a full resolver pass that reseeds the table when it
    /// disagrees with the trie root.
    pub fn rebuild(
        &mut self,
        db: &dyn Database,
        block: u64,
        obs: &mut dyn TrieObserver,
    ) -> Result<B256> {
        let expected = match self.root.as_ref() {
            None => return Ok(EMPTY_ROOT),
            Some(Node::Hash(h)) => *h,
            Some(_) => return Err(StateError::InvariantViolation(
                "rebuild requires an unresolved root",
            )),
        };
        let (root, root_hash) = rebuild_from_hashes(db)?;
        if root_hash == expected {
            if let Some(mut root) = root {
                root.timestamp_subtree(block, obs);
                self.root = Some(root);
                info!(root = %root_hash, "loaded account trie from the hash table");
                return Ok(root_hash);
            }
        }
        warn!(
            expected = %expected,
            got = %root_hash,
            "hash table does not match the trie root; rebuilding it"
        );
        let mut tc = TrieContinuation::resolve_request(Vec::new(), 0, expected);
        resolve_batch(self, db, std::slice::from_mut(&mut tc), block, true)?;
        let (root, root_hash) = rebuild_from_hashes(db)?;
        if root_hash != expected {
            return Err(StateError::RootMismatch {
                expected,
                got: root_hash,
            });
        }
        let mut root = root.ok_or(StateError::InvariantViolation(
            "verified rebuild produced no root",
        ))?;
        root.timestamp_subtree(block, obs);
        self.root = Some(root);
        info!(root = %root_hash, "rebuilt and verified the hash table");
        Ok(root_hash)
    }
}

/// Reconstruct the upper [`HASH_TABLE_LEVEL`] levels of the account trie
/// from the side-table alone. Missing or zero slots are absent subtrees.
pub fn rebuild_from_hashes(db: &dyn Database) -> Result<(Option<Node>, B256)> {
    const L: usize = HASH_TABLE_LEVEL;
    let mut vertical: Vec<[Option<Node>; 17]> = (0..L).map(|_| Default::default()).collect();
    let mut fill_count = vec![0usize; L];
    let mut last_fill_idx = vec![0u8; L];
    let mut root: Option<Node> = None;

    for i in 0..HASH_TABLE_SIZE as u32 {
        let mut carried: Option<Node> = db
            .get_hash(i)?
            .filter(|h| *h != B256::ZERO)
            .map(Node::Hash);
        for level in (0..L).rev() {
            let v = ((i >> (4 * (L - 1 - level))) & 0xf) as usize;
            if let Some(node) = carried.take() {
                vertical[level][v] = Some(node);
                last_fill_idx[level] = v as u8;
                fill_count[level] += 1;
            }
            if v != 15 {
                break;
            }
            // sixteen cells seen at this level; reduce it
            let promoted = match fill_count[level] {
                0 => None,
                1 => {
                    let idx = last_fill_idx[level];
                    let child = vertical[level][idx as usize].take().expect("tracked fill");
                    Some(match child {
                        // a lone hash belongs to a short spanning this
                        // nibble; it floats up unchanged
                        Node::Hash(_) => child,
                        Node::Short(mut s) => {
                            let mut key = Vec::with_capacity(1 + s.key.len());
                            key.push(idx);
                            key.extend_from_slice(&s.key);
                            s.key = key;
                            Node::Short(s)
                        }
                        branch => Node::Short(Box::new(ShortNode {
                            key: vec![idx],
                            val: branch,
                            flags: dirty_flags(),
                        })),
                    })
                }
                count => {
                    let children = std::mem::take(&mut vertical[level]);
                    Some(branch_from_children(children, count))
                }
            };
            vertical[level] = Default::default();
            fill_count[level] = 0;
            if level == 0 {
                root = promoted;
            } else {
                carried = promoted;
            }
        }
    }

    let root_hash = match root.as_mut() {
        None => EMPTY_ROOT,
        Some(node) => {
            let mut hasher = acquire_hasher();
            let hash = hasher.hash_root(node);
            release_hasher(hasher);
            hash
        }
    };
    debug!(root = %root_hash, "rebuilt upper levels from the hash table");
    Ok((root, root_hash))
}
