//! Blockstamp construction and non-missed-slot resolution.

use thiserror::Error;

use lido_oracle_shared::types::{BlockStamp, Epoch, ReferenceBlockStamp, Slot};

use crate::consensus::types::BlockDetails;
use crate::consensus::{ConsensusClient, Error as ClientError, StateId};

const LOG_LOOKBACK_ATTEMPT_DELAY: u64 = 20;
const LOG_LOOKBACK_ATTEMPT_INTERVAL: u64 = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No non-missed slot found between {from} and {to}")]
    NoNonMissedSlot { from: Slot, to: Slot },

    #[error(transparent)]
    Client(#[from] ClientError),
}

pub fn build_blockstamp(details: &BlockDetails) -> BlockStamp {
    let payload = &details.message.body.execution_payload;
    BlockStamp {
        state_root: details.message.state_root,
        slot_number: details.message.slot,
        block_hash: payload.block_hash,
        block_number: payload.block_number,
        block_timestamp: payload.timestamp,
    }
}

/// Walks backward from `slot` to the closest slot that has a block. The walk
/// is bounded below by slot 0 and starts no higher than the last finalized
/// slot the caller observed.
pub async fn get_prev_non_missed_slot(
    cc: &ConsensusClient,
    slot: Slot,
    last_finalized_slot: Slot,
) -> Result<BlockDetails, Error> {
    let start = slot.min(last_finalized_slot);
    let mut attempt_slot = start;
    let mut attempt_count: u64 = 0;

    loop {
        match cc.get_block_details(&StateId::Slot(attempt_slot)).await {
            Ok(details) => return Ok(details),
            Err(err) if err.is_not_found() => {
                if attempt_slot == 0 {
                    return Err(Error::NoNonMissedSlot { from: start, to: 0 });
                }
                if attempt_count >= LOG_LOOKBACK_ATTEMPT_DELAY && attempt_count % LOG_LOOKBACK_ATTEMPT_INTERVAL == 0 {
                    tracing::warn!(
                        "Cannot find non-missed slot below {start} for {attempt_count} attempts; last checked slot {attempt_slot}"
                    );
                }
                attempt_count += 1;
                attempt_slot -= 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub async fn get_blockstamp(cc: &ConsensusClient, slot: Slot, last_finalized_slot: Slot) -> Result<BlockStamp, Error> {
    let details = get_prev_non_missed_slot(cc, slot, last_finalized_slot).await?;
    Ok(build_blockstamp(&details))
}

/// Resolves the blockstamp a report should be built against. When the
/// nominal reference slot was missed the closest earlier block is used,
/// while `ref_slot`/`ref_epoch` keep the frame's nominal coordinates.
pub async fn get_reference_blockstamp(
    cc: &ConsensusClient,
    ref_slot: Slot,
    ref_epoch: Epoch,
    last_finalized_slot: Slot,
) -> Result<ReferenceBlockStamp, Error> {
    let details = get_prev_non_missed_slot(cc, ref_slot, last_finalized_slot).await?;
    let bs = build_blockstamp(&details);
    if bs.slot_number != ref_slot {
        tracing::info!(
            ref_slot,
            resolved_slot = bs.slot_number,
            "Reference slot was missed, using the previous non-missed slot"
        );
    }
    Ok(ReferenceBlockStamp {
        state_root: bs.state_root,
        slot_number: bs.slot_number,
        block_hash: bs.block_hash,
        block_number: bs.block_number,
        block_timestamp: bs.block_timestamp,
        ref_slot,
        ref_epoch,
    })
}

pub async fn get_latest_blockstamp(cc: &ConsensusClient, state_id: &StateId) -> Result<BlockStamp, Error> {
    let root = cc.get_block_root(state_id).await?;
    let details = cc.get_block_details(&StateId::Root(root)).await?;
    Ok(build_blockstamp(&details))
}
