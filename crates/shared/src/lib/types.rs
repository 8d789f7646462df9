use std::fmt;

use alloy_primitives::FixedBytes;
use serde::{Deserialize, Serialize};

pub type Slot = u64;
pub type Epoch = u64;
pub type FrameNumber = u64;
pub type ValidatorIndex = u64;
pub type NodeOperatorId = u64;
pub type StakingModuleId = u64;
pub type CommitteeIndex = u64;
pub type Gwei = u64;
pub type BlockNumber = u64;

pub type Hash256 = alloy_primitives::B256;
pub type Address = alloy_primitives::Address;
pub type Wei = alloy_primitives::U256;

pub type BlsPubkey = FixedBytes<48>;
pub type BlsSignatureBytes = FixedBytes<96>;
pub type ForkVersion = FixedBytes<4>;

pub const ZERO_HASH: Hash256 = Hash256::ZERO;

/// Chain-level timing parameters, cross-checked against the CL node's spec
/// before any report is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub slots_per_epoch: u64,
    pub seconds_per_slot: u64,
    pub genesis_time: u64,
}

/// Reporting-frame parameters as stored in the hash-consensus contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    pub initial_epoch: Epoch,
    pub epochs_per_frame: u64,
    pub fast_lane_length_slots: u64,
}

/// A finalized (or otherwise pinned) point observed on both layers at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStamp {
    pub state_root: Hash256,
    pub slot_number: Slot,
    pub block_hash: Hash256,
    pub block_number: BlockNumber,
    pub block_timestamp: u64,
}

/// A blockstamp bound to a frame's nominal reference slot. If the reference
/// slot itself was missed, `slot_number` points at the previous non-missed
/// slot while `ref_slot`/`ref_epoch` keep their nominal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceBlockStamp {
    pub state_root: Hash256,
    pub slot_number: Slot,
    pub block_hash: Hash256,
    pub block_number: BlockNumber,
    pub block_timestamp: u64,
    pub ref_slot: Slot,
    pub ref_epoch: Epoch,
}

impl ReferenceBlockStamp {
    pub fn as_blockstamp(&self) -> BlockStamp {
        BlockStamp {
            state_root: self.state_root,
            slot_number: self.slot_number,
            block_hash: self.block_hash,
            block_number: self.block_number,
            block_timestamp: self.block_timestamp,
        }
    }
}

impl fmt::Display for ReferenceBlockStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ref_slot={} slot={} block={}",
            self.ref_slot, self.slot_number, self.block_number
        )
    }
}

/// Validator record as served by the Beacon API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: Hash256,
    pub effective_balance: Gwei,
    pub slashed: bool,
    pub activation_eligibility_epoch: Epoch,
    pub activation_epoch: Epoch,
    pub exit_epoch: Epoch,
    pub withdrawable_epoch: Epoch,
}

/// Validator together with its registry index and current balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedValidator {
    pub index: ValidatorIndex,
    pub balance: Gwei,
    pub validator: Validator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeposit {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: Hash256,
    pub amount: Gwei,
    pub signature: BlsSignatureBytes,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPartialWithdrawal {
    pub validator_index: ValidatorIndex,
    pub amount: Gwei,
    pub withdrawable_epoch: Epoch,
}

/// The slice of a beacon state the ejector and sweep models read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconStateView {
    pub slot: Slot,
    pub validators: Vec<IndexedValidator>,
    pub earliest_exit_epoch: Epoch,
    pub exit_balance_to_consume: Gwei,
    pub pending_deposits: Vec<PendingDeposit>,
    pub pending_partial_withdrawals: Vec<PendingPartialWithdrawal>,
}

impl BeaconStateView {
    /// Validators are served in registry order, so lookup by index is a
    /// binary search rather than a scan.
    pub fn validator(&self, index: ValidatorIndex) -> Option<&IndexedValidator> {
        self.validators
            .binary_search_by_key(&index, |v| v.index)
            .ok()
            .map(|pos| &self.validators[pos])
    }

    pub fn balance(&self, index: ValidatorIndex) -> Option<Gwei> {
        self.validator(index).map(|v| v.balance)
    }
}

pub trait HasEpoch {
    fn epoch(&self, slots_per_epoch: u64) -> Epoch;
}

impl HasEpoch for BlockStamp {
    fn epoch(&self, slots_per_epoch: u64) -> Epoch {
        self.slot_number / slots_per_epoch
    }
}
