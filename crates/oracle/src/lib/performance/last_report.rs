//! Previously published distribution state: cumulative rewards and strike
//! histories restored from content-addressed storage and verified against
//! the on-chain roots.

use std::collections::BTreeMap;

use alloy_primitives::U256;

use lido_oracle_client::execution::contracts::CsmWrapper;
use lido_oracle_client::execution::DefaultProvider;
use lido_oracle_client::ipfs::{Cid, ContentStorage, StorageClient};
use lido_oracle_shared::strikes::StrikesList;
use lido_oracle_shared::types::{Hash256, NodeOperatorId, ZERO_HASH};

use super::distribution::StrikesKey;
use super::tree::{RewardsTree, StrikesTree};
use crate::consensus::Error;

#[derive(Debug)]
pub struct LastReport {
    pub rewards_tree_root: Hash256,
    pub rewards_tree_cid: Option<Cid>,
    pub strikes_tree_root: Hash256,
    pub strikes_tree_cid: Option<Cid>,
    pub rewards: Vec<(NodeOperatorId, U256)>,
    pub strikes: BTreeMap<StrikesKey, StrikesList>,
}

fn check_consistency(root: Hash256, cid: &Option<Cid>, what: &str) -> Result<(), Error> {
    if cid.is_none() != (root == ZERO_HASH) {
        return Err(Error::InvalidReport(format!(
            "inconsistent previous {what} tree data: root={root:#x}, cid={cid:?}"
        )));
    }
    Ok(())
}

fn non_empty(cid: Cid) -> Option<Cid> {
    (!cid.is_empty()).then_some(cid)
}

impl LastReport {
    pub async fn load(
        csm: &CsmWrapper<DefaultProvider>,
        storage: &StorageClient,
        block_hash: Hash256,
    ) -> Result<Self, Error> {
        let rewards_tree_root = csm.get_rewards_tree_root(block_hash).await?;
        let rewards_tree_cid = non_empty(csm.get_rewards_tree_cid(block_hash).await?);
        check_consistency(rewards_tree_root, &rewards_tree_cid, "rewards")?;

        let strikes_tree_root = csm.get_strikes_tree_root(block_hash).await?;
        let strikes_tree_cid = non_empty(csm.get_strikes_tree_cid(block_hash).await?);
        check_consistency(strikes_tree_root, &strikes_tree_cid, "strikes")?;

        let rewards = match &rewards_tree_cid {
            None => {
                tracing::info!("No rewards distributed so far");
                Vec::new()
            }
            Some(cid) => {
                tracing::info!(%cid, "Fetching rewards tree from storage");
                let tree = RewardsTree::decode(&storage.fetch(cid).await?)?;
                if tree.root() != rewards_tree_root {
                    return Err(Error::InvalidReport(format!(
                        "restored rewards tree root {:#x} does not match the on-chain root {rewards_tree_root:#x}",
                        tree.root()
                    )));
                }
                tree.tree
                    .values()
                    .iter()
                    .map(|leaf| (leaf.node_operator_id, leaf.shares))
                    .collect()
            }
        };

        let strikes = match &strikes_tree_cid {
            None => {
                tracing::info!("No strikes reported so far");
                BTreeMap::new()
            }
            Some(cid) => {
                tracing::info!(%cid, "Fetching strikes tree from storage");
                let tree = StrikesTree::decode(&storage.fetch(cid).await?)?;
                if tree.root() != strikes_tree_root {
                    return Err(Error::InvalidReport(format!(
                        "restored strikes tree root {:#x} does not match the on-chain root {strikes_tree_root:#x}",
                        tree.root()
                    )));
                }
                tree.tree
                    .values()
                    .iter()
                    .map(|leaf| {
                        (
                            (leaf.node_operator_id, leaf.pubkey),
                            StrikesList::new(leaf.strikes.iter().copied()),
                        )
                    })
                    .collect()
            }
        };

        Ok(Self {
            rewards_tree_root,
            rewards_tree_cid,
            strikes_tree_root,
            strikes_tree_cid,
            rewards,
            strikes,
        })
    }
}
