//! Beacon API response DTOs. Integers arrive as quoted decimal strings and
//! byte values as 0x-hex, per the standard Eth Beacon Node API.

use serde::{Deserialize, Serialize};

use lido_oracle_shared::types::{
    BlsPubkey, BlsSignatureBytes, ForkVersion, Hash256, IndexedValidator, PendingDeposit,
    PendingPartialWithdrawal, Validator,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionedEnvelope<T> {
    pub data: T,
    #[serde(default)]
    pub execution_optimistic: bool,
    #[serde(default)]
    pub finalized: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependentEnvelope<T> {
    pub dependent_root: Hash256,
    pub data: T,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Genesis {
    #[serde(with = "serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: Hash256,
    pub genesis_fork_version: ForkVersion,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigSpec {
    #[serde(rename = "SECONDS_PER_SLOT", with = "serde_utils::quoted_u64")]
    pub seconds_per_slot: u64,
    #[serde(rename = "SLOTS_PER_EPOCH", with = "serde_utils::quoted_u64")]
    pub slots_per_epoch: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRootData {
    pub root: Hash256,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BeaconBlockHeaderMessage {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeaderMessage,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockHeaderData {
    pub root: Hash256,
    pub canonical: bool,
    pub header: SignedBeaconBlockHeader,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttestationData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockAttestation {
    /// SSZ bitlist, 0x-hex with the little-endian length bit.
    pub aggregation_bits: String,
    /// SSZ bitvector of committees covered by this (post-Electra) attestation.
    /// Absent on pre-Electra blocks, where `data.index` names the committee.
    #[serde(default)]
    pub committee_bits: Option<String>,
    pub data: AttestationData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAggregate {
    /// SSZ bitvector of sync-committee participation.
    pub sync_committee_bits: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionPayloadDto {
    pub block_hash: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub block_number: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockBodyDto {
    pub execution_payload: ExecutionPayloadDto,
    #[serde(default)]
    pub attestations: Vec<BlockAttestation>,
    pub sync_aggregate: SyncAggregate,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockMessageDto {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body: BlockBodyDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockDetails {
    pub message: BlockMessageDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Committee {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub validators: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProposerDuty {
    pub pubkey: BlsPubkey,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncCommittee {
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub validators: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidatorStateDto {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub effective_balance: u64,
    pub slashed: bool,
    #[serde(with = "serde_utils::quoted_u64")]
    pub activation_eligibility_epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub activation_epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub exit_epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub withdrawable_epoch: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexedValidatorDto {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub balance: u64,
    pub validator: ValidatorStateDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingDepositDto {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: u64,
    pub signature: BlsSignatureBytes,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingPartialWithdrawalDto {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub withdrawable_epoch: u64,
}

/// Slice of the debug beacon-state endpoint the oracle consumes. Unknown
/// fields of the (very large) state JSON are skipped by serde.
#[derive(Debug, Serialize, Deserialize)]
pub struct BeaconStateDto {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    pub validators: Vec<ValidatorStateDto>,
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub balances: Vec<u64>,
    #[serde(default, with = "serde_utils::quoted_u64")]
    pub earliest_exit_epoch: u64,
    #[serde(default, with = "serde_utils::quoted_u64")]
    pub exit_balance_to_consume: u64,
    #[serde(default)]
    pub pending_deposits: Vec<PendingDepositDto>,
    #[serde(default)]
    pub pending_partial_withdrawals: Vec<PendingPartialWithdrawalDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateBlockRootsDto {
    pub block_roots: Vec<Hash256>,
}

impl From<ValidatorStateDto> for Validator {
    fn from(value: ValidatorStateDto) -> Self {
        Validator {
            pubkey: value.pubkey,
            withdrawal_credentials: value.withdrawal_credentials,
            effective_balance: value.effective_balance,
            slashed: value.slashed,
            activation_eligibility_epoch: value.activation_eligibility_epoch,
            activation_epoch: value.activation_epoch,
            exit_epoch: value.exit_epoch,
            withdrawable_epoch: value.withdrawable_epoch,
        }
    }
}

impl From<IndexedValidatorDto> for IndexedValidator {
    fn from(value: IndexedValidatorDto) -> Self {
        IndexedValidator {
            index: value.index,
            balance: value.balance,
            validator: value.validator.into(),
        }
    }
}

impl From<PendingDepositDto> for PendingDeposit {
    fn from(value: PendingDepositDto) -> Self {
        PendingDeposit {
            pubkey: value.pubkey,
            withdrawal_credentials: value.withdrawal_credentials,
            amount: value.amount,
            signature: value.signature,
            slot: value.slot,
        }
    }
}

impl From<PendingPartialWithdrawalDto> for PendingPartialWithdrawal {
    fn from(value: PendingPartialWithdrawalDto) -> Self {
        PendingPartialWithdrawal {
            validator_index: value.validator_index,
            amount: value.amount,
            withdrawable_epoch: value.withdrawable_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_integers_and_hex() {
        let raw = r#"{
            "index": "123",
            "balance": "32000000000",
            "validator": {
                "pubkey": "0x93247f2209abcacf57b75a51dafae777f9dd38bc7053d1af526f220a7489a6d3a2753e5f3e8b1cfe39b56f43611df74a",
                "withdrawal_credentials": "0x0100000000000000000000000000000000000000000000000000000000000001",
                "effective_balance": "32000000000",
                "slashed": false,
                "activation_eligibility_epoch": "0",
                "activation_epoch": "0",
                "exit_epoch": "18446744073709551615",
                "withdrawable_epoch": "18446744073709551615"
            }
        }"#;
        let parsed: IndexedValidatorDto = serde_json::from_str(raw).unwrap();
        let validator: IndexedValidator = parsed.into();
        assert_eq!(validator.index, 123);
        assert_eq!(validator.validator.exit_epoch, u64::MAX);
        assert_eq!(validator.validator.withdrawal_credentials[0], 0x01);
    }
}
