//! Node encoding and hashing.
//!
//! A node's encoding is the recursive-length-prefix form described by the
//! trie rules: `Value` payloads are byte strings, `Short` nodes are
//! two-item lists of (compact key, child reference), branches are 17-item
//! lists. A child reference is the child's own encoding when that encoding
//! is shorter than 32 bytes (an "embedded" child), otherwise the 32-byte
//! keccak256 of the encoding. The node hash is keccak256 of the node's
//! encoding and is cached in the node flags once computed.
use crate::{
    constant::HASHER_POOL_SIZE,
    trie::{
        encoding::hex_to_compact_into,
        node::{DuoNode, FullNode, Node, ShortNode},
    },
};
use alloy_primitives::{keccak256, B256};
use alloy_rlp::Header;
use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;

/// Reference to a node from its parent encoding: either a 32-byte hash or
/// the complete embedded encoding of a node shorter than 32 bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRef {
    /// keccak256 of the child's encoding, stored as a 32-byte string.
    Hash(B256),
    /// The child's encoding spliced verbatim into the parent list.
    Inline(Vec<u8>),
}

impl NodeRef {
    fn encoded_len(&self) -> usize {
        match self {
            NodeRef::Hash(_) => 33,
            NodeRef::Inline(enc) => enc.len(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            NodeRef::Hash(h) => append_string(out, h.as_slice()),
            NodeRef::Inline(enc) => out.extend_from_slice(enc),
        }
    }
}

/// Re-entrant node hasher. One instance at a time; obtain through
/// [`acquire_hasher`] and give back through [`release_hasher`].
#[derive(Debug, Default)]
pub struct Hasher {
    // Scratch for compact-key conversion, reused across nodes.
    key_buf: Vec<u8>,
}

impl Hasher {
    /// Compute the reference of a node as seen from its parent. With
    /// `force_hash` the encoding is hashed even when it is embeddable,
    /// which is the rule for trie roots. Computed hashes are cached in the
    /// node's flags and the dirty bit is cleared.
    pub fn node_ref(&mut self, n: &mut Node, force_hash: bool) -> NodeRef {
        match n {
            Node::Hash(h) => NodeRef::Hash(*h),
            Node::Value(v) => {
                let mut enc = Vec::with_capacity(v.len() + 4);
                append_string(&mut enc, v);
                finish(enc, force_hash)
            }
            _ => {
                if let Some(h) = n.cached_hash() {
                    return NodeRef::Hash(h);
                }
                let enc = self.encode_node(n);
                let node_ref = finish(enc, force_hash);
                if let NodeRef::Hash(h) = node_ref {
                    if let Some(flags) = n.flags_mut() {
                        flags.hash = Some(h);
                        flags.dirty = false;
                    }
                }
                node_ref
            }
        }
    }

    /// Hash a node in root position: always a 32-byte digest.
    pub fn hash_root(&mut self, n: &mut Node) -> B256 {
        match self.node_ref(n, true) {
            NodeRef::Hash(h) => h,
            // force_hash never yields an inline reference
            NodeRef::Inline(_) => unreachable!("forced hash produced inline ref"),
        }
    }

    fn encode_node(&mut self, n: &mut Node) -> Vec<u8> {
        match n {
            Node::Short(s) => self.encode_short(s),
            Node::Duo(d) => self.encode_duo(d),
            Node::Full(f) => self.encode_full(f),
            Node::Hash(h) => {
                let mut enc = Vec::with_capacity(33);
                append_string(&mut enc, h.as_slice());
                enc
            }
            Node::Value(v) => {
                let mut enc = Vec::with_capacity(v.len() + 4);
                append_string(&mut enc, v);
                enc
            }
        }
    }

    fn encode_short(&mut self, s: &mut ShortNode) -> Vec<u8> {
        let mut compact = std::mem::take(&mut self.key_buf);
        hex_to_compact_into(&s.key, &mut compact);

        let mut payload = Vec::with_capacity(compact.len() + 40);
        append_string(&mut payload, &compact);
        self.key_buf = compact;

        match &mut s.val {
            Node::Value(v) => append_string(&mut payload, v),
            child => self.node_ref(child, false).write(&mut payload),
        }
        wrap_list(payload)
    }

    fn encode_duo(&mut self, d: &mut DuoNode) -> Vec<u8> {
        let (i1, i2) = d.children_idx();
        let mut refs: [Option<NodeRef>; 2] = [None, None];
        if let Some(c) = d.child1.as_mut() {
            refs[0] = Some(self.node_ref(c, false));
        }
        if let Some(c) = d.child2.as_mut() {
            refs[1] = Some(self.node_ref(c, false));
        }

        let payload_len = 17
            + refs
                .iter()
                .flatten()
                .map(|r| r.encoded_len().saturating_sub(1))
                .sum::<usize>();
        let mut payload = Vec::with_capacity(payload_len);
        for nibble in 0..17u8 {
            if nibble == i1 {
                write_slot(&mut payload, refs[0].as_ref());
            } else if nibble == i2 {
                write_slot(&mut payload, refs[1].as_ref());
            } else {
                payload.push(alloy_rlp::EMPTY_STRING_CODE);
            }
        }
        wrap_list(payload)
    }

    fn encode_full(&mut self, f: &mut FullNode) -> Vec<u8> {
        let mut payload = Vec::with_capacity(17 * 33);
        for nibble in 0..16 {
            match f.children[nibble].as_mut() {
                Some(child) => self.node_ref(child, false).write(&mut payload),
                None => payload.push(alloy_rlp::EMPTY_STRING_CODE),
            }
        }
        match f.children[16].as_mut() {
            Some(Node::Value(v)) => append_string(&mut payload, v),
            Some(_) => {
                debug_assert!(false, "value slot must hold a value node");
                payload.push(alloy_rlp::EMPTY_STRING_CODE);
            }
            None => payload.push(alloy_rlp::EMPTY_STRING_CODE),
        }
        wrap_list(payload)
    }
}

fn write_slot(out: &mut Vec<u8>, node_ref: Option<&NodeRef>) {
    match node_ref {
        Some(r) => r.write(out),
        None => out.push(alloy_rlp::EMPTY_STRING_CODE),
    }
}

fn finish(enc: Vec<u8>, force_hash: bool) -> NodeRef {
    if enc.len() < 32 && !force_hash {
        NodeRef::Inline(enc)
    } else {
        NodeRef::Hash(keccak256(&enc))
    }
}

/// RLP byte-string item.
fn append_string(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() == 1 && bytes[0] < alloy_rlp::EMPTY_STRING_CODE {
        out.push(bytes[0]);
    } else {
        Header {
            list: false,
            payload_length: bytes.len(),
        }
        .encode(out);
        out.extend_from_slice(bytes);
    }
}

/// RLP list item around an already-encoded payload.
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

static HASHER_POOL: Lazy<(Sender<Hasher>, Receiver<Hasher>)> =
    Lazy::new(|| bounded(HASHER_POOL_SIZE));

/// Take a hasher from the shared pool, constructing one when the pool is
/// empty.
pub fn acquire_hasher() -> Hasher {
    HASHER_POOL.1.try_recv().unwrap_or_default()
}

/// Return a hasher to the pool. A full pool drops the instance.
pub fn release_hasher(hasher: Hasher) {
    let _ = HASHER_POOL.0.try_send(hasher);
}
