//! Per-frame diagnostics published alongside the distribution report. Not
//! consensus-critical; the log CID lands in the on-chain report so anyone
//! can audit how every key performed.

use std::collections::BTreeMap;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use lido_oracle_shared::duties::{DutyAccumulator, PerformanceCoefficients};
use lido_oracle_shared::types::{Hash256, NodeOperatorId, ReferenceBlockStamp, Slot, ValidatorIndex};

use super::state::Frame;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorFrameSummary {
    pub threshold: f64,
    pub reward_share_bp: u64,
    pub performance: f64,
    pub slashed: bool,
    pub strikes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_duty: Option<DutyAccumulator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_duty: Option<DutyAccumulator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_duty: Option<DutyAccumulator>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorFrameSummary {
    pub distributed_rewards: U256,
    pub participation_share: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_coefficients: Option<PerformanceCoefficients>,
    pub validators: BTreeMap<ValidatorIndex, ValidatorFrameSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramePerfLog {
    pub frame: Frame,
    pub ref_slot: Slot,
    pub block_hash: Hash256,
    pub distributable: U256,
    pub distributed_rewards: U256,
    pub rebate_to_protocol: U256,
    pub operators: BTreeMap<NodeOperatorId, OperatorFrameSummary>,
}

impl FramePerfLog {
    pub fn new(blockstamp: &ReferenceBlockStamp, frame: Frame) -> Self {
        Self {
            frame,
            ref_slot: blockstamp.ref_slot,
            block_hash: blockstamp.block_hash,
            distributable: U256::ZERO,
            distributed_rewards: U256::ZERO,
            rebate_to_protocol: U256::ZERO,
            operators: BTreeMap::new(),
        }
    }

    /// All frame logs of a report as one minified JSON document.
    pub fn encode_all(logs: &[FramePerfLog]) -> Vec<u8> {
        serde_json::to_vec(logs).expect("log serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_log_is_minified_json() {
        let mut log = FramePerfLog::new(
            &ReferenceBlockStamp {
                state_root: Hash256::ZERO,
                slot_number: 100,
                block_hash: Hash256::repeat_byte(1),
                block_number: 1,
                block_timestamp: 0,
                ref_slot: 100,
                ref_epoch: 3,
            },
            (0, 31),
        );
        log.operators.entry(5).or_default().participation_share = 10;

        let encoded = FramePerfLog::encode_all(std::slice::from_ref(&log));
        let text = String::from_utf8(encoded).unwrap();
        assert!(!text.contains('\n'));
        assert!(text.contains("\"participation_share\":10"));

        let decoded: Vec<FramePerfLog> = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded[0].frame, (0, 31));
    }
}
