//! Tiger-Tree-Hash: a Merkle tree over 1024-byte leaves using the Tiger hash
//! function (THEX). The root identifies file content; it is what peers
//! exchange as `TR`/`TTH/<base32>` in searches, file lists and `ADCGET`.

use digest::Digest;
use std::fmt;
use tiger::Tiger;

use crate::base32;

/// Size in bytes of each leaf hashed at the bottom of the tree.
pub const LEAF_SIZE: usize = 1024;

/// A Tiger-Tree-Hash root: 24 raw bytes, displayed/encoded as 39 base32 characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tth([u8; 24]);

/// Tiger hash prefix byte for a leaf node, per the THEX spec.
const LEAF_PREFIX: u8 = 0x00;
/// Tiger hash prefix byte for an internal node.
const NODE_PREFIX: u8 = 0x01;

impl Tth {
    /// Wrap 24 raw hash bytes.
    pub fn from_bytes(bytes: [u8; 24]) -> Self {
        Self(bytes)
    }

    /// The raw 24-byte hash.
    pub fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }

    /// Parse a base32-encoded TTH root, as seen on the wire (`TR`/`TTH/...`).
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = base32::decode(s)?;
        let arr: [u8; 24] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Encode as the base32 string peers expect on the wire.
    pub fn to_base32(&self) -> String {
        base32::encode(&self.0)
    }

    /// Hash a single leaf (at most [`LEAF_SIZE`] bytes).
    fn hash_leaf(data: &[u8]) -> [u8; 24] {
        let mut hasher = Tiger::new();
        hasher.update([LEAF_PREFIX]);
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; 24];
        out.copy_from_slice(&digest[..24]);
        out
    }

    /// Combine two (or one, when odd) child hashes into their parent.
    fn hash_node(children: &[[u8; 24]]) -> [u8; 24] {
        if children.len() == 1 {
            return children[0];
        }
        let mut hasher = Tiger::new();
        hasher.update([NODE_PREFIX]);
        for child in children {
            hasher.update(child);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 24];
        out.copy_from_slice(&digest[..24]);
        out
    }

    /// Compute the TTH root of a complete in-memory buffer.
    ///
    /// This is the simple, non-incremental path; [`TigerTreeHasher`] is used
    /// when bytes arrive progressively (downloads).
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = TigerTreeHasher::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Debug for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tth({})", self.to_base32())
    }
}

impl fmt::Display for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

/// Incremental Tiger-Tree-Hash accumulator.
///
/// Bytes are buffered up to [`LEAF_SIZE`], hashed into a leaf, and the leaf
/// hashes are reduced pairwise bottom-up once `finalize` is called. This
/// mirrors how the download path accumulates bytes as they arrive off the
/// wire, without holding the whole file in memory.
#[derive(Default)]
pub struct TigerTreeHasher {
    leaves: Vec<[u8; 24]>,
    buf: Vec<u8>,
}

impl TigerTreeHasher {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes into the accumulator.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (LEAF_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == LEAF_SIZE {
                self.leaves.push(Tth::hash_leaf(&self.buf));
                self.buf.clear();
            }
        }
    }

    /// Finish hashing and return the root.
    ///
    /// An empty input (zero-byte file) hashes as a single empty leaf, per THEX.
    pub fn finalize(mut self) -> Tth {
        if !self.buf.is_empty() || self.leaves.is_empty() {
            self.leaves.push(Tth::hash_leaf(&self.buf));
        }
        let mut level = self.leaves;
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(Tth::hash_node)
                .collect::<Vec<_>>();
        }
        Tth(level[0])
    }
}

/// A plain (non-tree) Tiger hash of `data`, with no THEX leaf/node prefix.
///
/// Used for the ADC login password hash (`HPAS`): Tiger-hash of the
/// hub-provided salt concatenated with the password, base32-encoded.
pub fn tiger_hash(data: &[u8]) -> [u8; 24] {
    let mut hasher = Tiger::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 24];
    out.copy_from_slice(&digest[..24]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_hashes_as_single_empty_leaf() {
        let root = Tth::of(&[]);
        let expected = Tth::hash_leaf(&[]);
        assert_eq!(root.0, expected);
    }

    #[test]
    fn matches_known_test_vector() {
        // 10000 'A' bytes, TTH used throughout the seed end-to-end test suite.
        let data = vec![b'A'; 10000];
        let root = Tth::of(&data);
        assert_eq!(root.to_base32(), "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY");
    }

    #[test]
    fn base32_round_trips() {
        let root = Tth::of(b"hello world");
        let encoded = root.to_base32();
        assert_eq!(Tth::parse(&encoded).unwrap(), root);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data = vec![b'B'; 10_000];
        let mut hasher = TigerTreeHasher::new();
        for chunk in data.chunks(777) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), Tth::of(&data));
    }
}
