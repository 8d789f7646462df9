//! Merkle trees of the distribution report: cumulative rewards per operator
//! and strike histories per validator key.

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};

use lido_oracle_client::ipfs::Cid;
use lido_oracle_shared::merkle::{
    json_num::{json_to_u256, json_to_u64, u256_to_json, u64_to_json},
    Error as MerkleError, MerkleLeaf, StandardMerkleTree, TreeDump,
};
use lido_oracle_shared::strikes::StrikesList;
use lido_oracle_shared::types::{BlsPubkey, Hash256, NodeOperatorId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardsTreeLeaf {
    pub node_operator_id: NodeOperatorId,
    pub shares: U256,
}

impl MerkleLeaf for RewardsTreeLeaf {
    fn encoding() -> Vec<String> {
        vec!["uint256".to_owned(), "uint256".to_owned()]
    }

    fn abi_encode(&self) -> Vec<u8> {
        (U256::from(self.node_operator_id), self.shares).abi_encode()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(vec![u64_to_json(self.node_operator_id), u256_to_json(self.shares)])
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, MerkleError> {
        let items = value
            .as_array()
            .ok_or_else(|| MerkleError::LeafDecode("rewards leaf is not an array".into()))?;
        match items.as_slice() {
            [id, shares] => Ok(Self {
                node_operator_id: json_to_u64(id)?,
                shares: json_to_u256(shares)?,
            }),
            _ => Err(MerkleError::LeafDecode("rewards leaf has wrong arity".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrikesTreeLeaf {
    pub node_operator_id: NodeOperatorId,
    pub pubkey: BlsPubkey,
    pub strikes: Vec<u64>,
}

impl MerkleLeaf for StrikesTreeLeaf {
    fn encoding() -> Vec<String> {
        vec!["uint256".to_owned(), "bytes".to_owned(), "uint256[]".to_owned()]
    }

    fn abi_encode(&self) -> Vec<u8> {
        let strikes: Vec<U256> = self.strikes.iter().map(|s| U256::from(*s)).collect();
        (
            U256::from(self.node_operator_id),
            Bytes::copy_from_slice(self.pubkey.as_slice()),
            strikes,
        )
            .abi_encode()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(vec![
            u64_to_json(self.node_operator_id),
            serde_json::Value::String(format!("{:#x}", self.pubkey)),
            serde_json::Value::Array(self.strikes.iter().map(|s| u64_to_json(*s)).collect()),
        ])
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, MerkleError> {
        let items = value
            .as_array()
            .ok_or_else(|| MerkleError::LeafDecode("strikes leaf is not an array".into()))?;
        let [id, pubkey, strikes] = items.as_slice() else {
            return Err(MerkleError::LeafDecode("strikes leaf has wrong arity".into()));
        };
        let pubkey = pubkey
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| MerkleError::LeafDecode("strikes leaf pubkey is not 48-byte hex".into()))?;
        let strikes = strikes
            .as_array()
            .ok_or_else(|| MerkleError::LeafDecode("strikes are not an array".into()))?
            .iter()
            .map(json_to_u64)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            node_operator_id: json_to_u64(id)?,
            pubkey,
            strikes,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeMeta {
    #[serde(rename = "stateCID", skip_serializing_if = "Option::is_none")]
    state_cid: Option<Cid>,
}

fn encode_with_metadata(dump: &TreeDump, state_cid: Option<&Cid>) -> Vec<u8> {
    let mut value = serde_json::to_value(dump).expect("tree dump serialization is infallible");
    if let Some(cid) = state_cid {
        value["metadata"] = serde_json::to_value(TreeMeta {
            state_cid: Some(cid.clone()),
        })
        .expect("metadata serialization is infallible");
    }
    serde_json::to_vec(&value).expect("tree serialization is infallible")
}

fn decode_dump(content: &[u8]) -> Result<TreeDump, MerkleError> {
    serde_json::from_slice(content).map_err(|e| MerkleError::MalformedDump(e.to_string()))
}

/// Cumulative rewards tree, leaves `(node_operator_id, cumulative_shares)`
/// ordered by operator id.
pub struct RewardsTree {
    pub tree: StandardMerkleTree<RewardsTreeLeaf>,
}

impl RewardsTree {
    pub fn new(values: Vec<RewardsTreeLeaf>) -> Self {
        Self {
            tree: StandardMerkleTree::build(values),
        }
    }

    pub fn root(&self) -> Hash256 {
        self.tree.root()
    }

    pub fn encode(&self, state_cid: Option<&Cid>) -> Vec<u8> {
        encode_with_metadata(&self.tree.dump(), state_cid)
    }

    pub fn decode(content: &[u8]) -> Result<Self, MerkleError> {
        Ok(Self {
            tree: StandardMerkleTree::load(&decode_dump(content)?)?,
        })
    }
}

/// Strike histories tree, leaves `(node_operator_id, pubkey, strikes)`
/// ordered by (operator id, pubkey).
pub struct StrikesTree {
    pub tree: StandardMerkleTree<StrikesTreeLeaf>,
}

impl StrikesTree {
    pub fn new(values: Vec<StrikesTreeLeaf>) -> Self {
        Self {
            tree: StandardMerkleTree::build(values),
        }
    }

    pub fn from_strikes(strikes: &std::collections::BTreeMap<(NodeOperatorId, BlsPubkey), StrikesList>) -> Self {
        Self::new(
            strikes
                .iter()
                .map(|((node_operator_id, pubkey), list)| StrikesTreeLeaf {
                    node_operator_id: *node_operator_id,
                    pubkey: *pubkey,
                    strikes: list.to_vec(),
                })
                .collect(),
        )
    }

    pub fn root(&self) -> Hash256 {
        self.tree.root()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_with_metadata(&self.tree.dump(), None)
    }

    pub fn decode(content: &[u8]) -> Result<Self, MerkleError> {
        Ok(Self {
            tree: StandardMerkleTree::load(&decode_dump(content)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewards_tree_roundtrip() {
        let tree = RewardsTree::new(vec![
            RewardsTreeLeaf {
                node_operator_id: 0,
                shares: U256::from(100),
            },
            RewardsTreeLeaf {
                node_operator_id: 1,
                shares: U256::from_str_radix("100000000000000000000", 10).unwrap(),
            },
        ]);
        let cid = Cid("bafy-state".to_owned());
        let encoded = tree.encode(Some(&cid));

        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.contains("\"stateCID\":\"bafy-state\""));
        assert!(text.contains("\"standard-v1\""));

        let decoded = RewardsTree::decode(&encoded).unwrap();
        assert_eq!(decoded.root(), tree.root());
        assert_eq!(decoded.tree.values(), tree.tree.values());
    }

    #[test]
    fn strikes_tree_roundtrip() {
        let tree = StrikesTree::new(vec![
            StrikesTreeLeaf {
                node_operator_id: 1,
                pubkey: BlsPubkey::repeat_byte(0xaa),
                strikes: vec![1, 0, 0, 1],
            },
            StrikesTreeLeaf {
                node_operator_id: 2,
                pubkey: BlsPubkey::repeat_byte(0xbb),
                strikes: vec![0, 1],
            },
        ]);
        let decoded = StrikesTree::decode(&tree.encode()).unwrap();
        assert_eq!(decoded.root(), tree.root());
        assert_eq!(decoded.tree.values(), tree.tree.values());
    }

    #[test]
    fn tampered_rewards_dump_is_rejected() {
        let tree = RewardsTree::new(vec![RewardsTreeLeaf {
            node_operator_id: 0,
            shares: U256::from(1),
        }]);
        let mut value: serde_json::Value = serde_json::from_slice(&tree.encode(None)).unwrap();
        value["values"][0]["value"][1] = serde_json::json!(2);
        let tampered = serde_json::to_vec(&value).unwrap();
        assert!(RewardsTree::decode(&tampered).is_err());
    }
}
