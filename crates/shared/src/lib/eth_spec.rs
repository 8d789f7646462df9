//! Beacon-chain spec constants and validator-state predicates.
//!
//! Values follow the consensus specs:
//! https://github.com/ethereum/consensus-specs/blob/dev/specs/phase0/beacon-chain.md
//! https://github.com/ethereum/consensus-specs/blob/dev/specs/electra/beacon-chain.md

use crate::types::{Epoch, Gwei, Validator};

pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;
pub const MIN_VALIDATOR_WITHDRAWABILITY_DELAY: u64 = 2u64.pow(8);
pub const MAX_SEED_LOOKAHEAD: u64 = 4;
pub const EPOCHS_PER_SLASHINGS_VECTOR: u64 = 2u64.pow(13);
pub const SLOTS_PER_HISTORICAL_ROOT: u64 = 2u64.pow(13);
pub const EPOCHS_PER_SYNC_COMMITTEE_PERIOD: u64 = 256;

pub const EFFECTIVE_BALANCE_INCREMENT: Gwei = 10u64.pow(9);
pub const MAX_EFFECTIVE_BALANCE: Gwei = 32 * 10u64.pow(9);
pub const MAX_EFFECTIVE_BALANCE_ELECTRA: Gwei = 2048 * 10u64.pow(9);
pub const MIN_ACTIVATION_BALANCE: Gwei = 32 * 10u64.pow(9);

pub const MIN_PER_EPOCH_CHURN_LIMIT: u64 = 4;
pub const CHURN_LIMIT_QUOTIENT: u64 = 2u64.pow(16);
pub const MIN_PER_EPOCH_CHURN_LIMIT_ELECTRA: Gwei = 128 * 10u64.pow(9);
pub const MAX_PER_EPOCH_ACTIVATION_EXIT_CHURN_LIMIT: Gwei = 256 * 10u64.pow(9);

pub const MAX_WITHDRAWALS_PER_PAYLOAD: u64 = 2u64.pow(4);
pub const MAX_PENDING_PARTIALS_PER_WITHDRAWALS_SWEEP: u64 = 2u64.pow(3);

pub const ETH1_ADDRESS_WITHDRAWAL_PREFIX: u8 = 0x01;
pub const COMPOUNDING_WITHDRAWAL_PREFIX: u8 = 0x02;

pub const DOMAIN_DEPOSIT: [u8; 4] = [0x03, 0x00, 0x00, 0x00];

pub const GWEI_TO_WEI: u64 = 10u64.pow(9);
pub const TOTAL_BASIS_POINTS: u64 = 10_000;
pub const SECONDS_IN_YEAR: u64 = 365 * 24 * 60 * 60;
pub const BLOCKS_PER_YEAR: u64 = 2_628_000;
pub const SHARE_RATE_PRECISION_E27: u128 = 10u128.pow(27);

// We assume the Lido deposit amount is 32 ETH (MIN_ACTIVATION_BALANCE). If
// 0x02 credentials get adopted for Lido keys this needs revisiting.
pub const LIDO_DEPOSIT_AMOUNT: Gwei = MIN_ACTIVATION_BALANCE;

pub fn is_active_validator(validator: &Validator, epoch: Epoch) -> bool {
    validator.activation_epoch <= epoch && epoch < validator.exit_epoch
}

pub fn has_eth1_withdrawal_credential(validator: &Validator) -> bool {
    validator.withdrawal_credentials[0] == ETH1_ADDRESS_WITHDRAWAL_PREFIX
}

pub fn has_compounding_withdrawal_credential(validator: &Validator) -> bool {
    validator.withdrawal_credentials[0] == COMPOUNDING_WITHDRAWAL_PREFIX
}

pub fn has_execution_withdrawal_credential(validator: &Validator) -> bool {
    has_eth1_withdrawal_credential(validator) || has_compounding_withdrawal_credential(validator)
}

pub fn get_max_effective_balance(validator: &Validator) -> Gwei {
    if has_compounding_withdrawal_credential(validator) {
        MAX_EFFECTIVE_BALANCE_ELECTRA
    } else {
        MIN_ACTIVATION_BALANCE
    }
}

pub fn is_fully_withdrawable_validator(validator: &Validator, balance: Gwei, epoch: Epoch) -> bool {
    has_execution_withdrawal_credential(validator) && validator.withdrawable_epoch <= epoch && balance > 0
}

pub fn is_partially_withdrawable_validator(validator: &Validator, balance: Gwei) -> bool {
    let max_effective_balance = get_max_effective_balance(validator);
    has_execution_withdrawal_credential(validator)
        && validator.effective_balance == max_effective_balance
        && balance > max_effective_balance
}

pub fn compute_activation_exit_epoch(epoch: Epoch) -> Epoch {
    epoch + 1 + MAX_SEED_LOOKAHEAD
}

pub fn compute_exit_churn_limit(active_validators_count: u64) -> u64 {
    MIN_PER_EPOCH_CHURN_LIMIT.max(active_validators_count / CHURN_LIMIT_QUOTIENT)
}

pub fn get_balance_churn_limit(total_active_balance: Gwei) -> Gwei {
    let churn = MIN_PER_EPOCH_CHURN_LIMIT_ELECTRA.max(total_active_balance / CHURN_LIMIT_QUOTIENT);
    churn - churn % EFFECTIVE_BALANCE_INCREMENT
}

pub fn get_activation_exit_churn_limit(total_active_balance: Gwei) -> Gwei {
    MAX_PER_EPOCH_ACTIVATION_EXIT_CHURN_LIMIT.min(get_balance_churn_limit(total_active_balance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash256;

    fn validator(wc_prefix: u8, effective_balance: Gwei, withdrawable_epoch: Epoch) -> Validator {
        let mut wc = [0u8; 32];
        wc[0] = wc_prefix;
        Validator {
            pubkey: Default::default(),
            withdrawal_credentials: Hash256::from(wc),
            effective_balance,
            slashed: false,
            activation_eligibility_epoch: 0,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch,
        }
    }

    #[test]
    fn fully_withdrawable_needs_execution_credential() {
        let v = validator(0x00, MAX_EFFECTIVE_BALANCE, 10);
        assert!(!is_fully_withdrawable_validator(&v, MAX_EFFECTIVE_BALANCE, 20));

        let v = validator(ETH1_ADDRESS_WITHDRAWAL_PREFIX, MAX_EFFECTIVE_BALANCE, 10);
        assert!(is_fully_withdrawable_validator(&v, MAX_EFFECTIVE_BALANCE, 20));
        assert!(!is_fully_withdrawable_validator(&v, MAX_EFFECTIVE_BALANCE, 5));
        assert!(!is_fully_withdrawable_validator(&v, 0, 20));
    }

    #[test]
    fn partially_withdrawable_depends_on_credential_type() {
        let v = validator(ETH1_ADDRESS_WITHDRAWAL_PREFIX, MIN_ACTIVATION_BALANCE, FAR_FUTURE_EPOCH);
        assert!(is_partially_withdrawable_validator(&v, MIN_ACTIVATION_BALANCE + 1));
        assert!(!is_partially_withdrawable_validator(&v, MIN_ACTIVATION_BALANCE));

        // A compounding validator at 32 ETH effective balance has headroom.
        let v = validator(COMPOUNDING_WITHDRAWAL_PREFIX, MIN_ACTIVATION_BALANCE, FAR_FUTURE_EPOCH);
        assert!(!is_partially_withdrawable_validator(&v, MIN_ACTIVATION_BALANCE + 1));
    }

    #[test]
    fn churn_limits() {
        assert_eq!(compute_exit_churn_limit(1000), MIN_PER_EPOCH_CHURN_LIMIT);
        assert_eq!(compute_exit_churn_limit(2u64.pow(16) * 10), 10);
        assert_eq!(
            get_activation_exit_churn_limit(10u64.pow(15)),
            MAX_PER_EPOCH_ACTIVATION_EXIT_CHURN_LIMIT
        );
        assert_eq!(
            get_activation_exit_churn_limit(2u64.pow(16) * EFFECTIVE_BALANCE_INCREMENT),
            MIN_PER_EPOCH_CHURN_LIMIT_ELECTRA
        );
    }
}
