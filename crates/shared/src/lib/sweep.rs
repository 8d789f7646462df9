//! Prediction of the validator-sweep cycle length, used by the ejector to
//! estimate when ejected balances actually land.
//!
//! Models post-Electra withdrawal processing:
//! https://github.com/ethereum/consensus-specs/blob/dev/specs/electra/beacon-chain.md#modified-get_expected_withdrawals

use std::collections::HashMap;

use crate::eth_spec::{
    get_max_effective_balance, is_fully_withdrawable_validator, is_partially_withdrawable_validator,
    FAR_FUTURE_EPOCH, MAX_PENDING_PARTIALS_PER_WITHDRAWALS_SWEEP, MAX_WITHDRAWALS_PER_PAYLOAD,
    MIN_ACTIVATION_BALANCE,
};
use crate::types::{BeaconStateView, ChainConfig, Gwei, ValidatorIndex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    pub validator_index: ValidatorIndex,
    pub amount: Gwei,
}

/// Expected withdrawal delay in epochs. A validator is swept, on average, in
/// half the time of a full sweep cycle.
pub fn get_sweep_delay_in_epochs(state: &BeaconStateView, chain_config: &ChainConfig) -> u64 {
    let withdrawals_number = predict_withdrawals_number_in_sweep_cycle(state, chain_config.slots_per_epoch);
    let full_cycle_in_epochs =
        withdrawals_number.div_ceil(MAX_WITHDRAWALS_PER_PAYLOAD * chain_config.slots_per_epoch);

    full_cycle_in_epochs / 2
}

/// Over-approximates the number of withdrawals in a single sweep cycle.
///
/// Assumes every pending partial withdrawal has reached its withdrawable
/// epoch, that pending partials execute ahead of the validator sweep, and
/// that MAX_VALIDATORS_PER_WITHDRAWALS_SWEEP is never the binding limit.
pub fn predict_withdrawals_number_in_sweep_cycle(state: &BeaconStateView, slots_per_epoch: u64) -> u64 {
    let pending_partial_withdrawals = get_pending_partial_withdrawals(state);
    let validators_withdrawals =
        get_validators_withdrawals(state, &pending_partial_withdrawals, slots_per_epoch);

    let pending_partial_withdrawals_number = pending_partial_withdrawals.len() as u64;
    let validators_withdrawals_number = validators_withdrawals.len() as u64;

    // Each payload fits at most MAX_PENDING_PARTIALS_PER_WITHDRAWALS_SWEEP
    // pending partials out of MAX_WITHDRAWALS_PER_PAYLOAD, which bounds the
    // pending-partial share of a cycle:
    //
    // pending_partial_withdrawals                  MAX_PENDING_PARTIALS_PER_WITHDRAWALS_SWEEP
    // ---------------------------- = ------------------------------------------------------------------------
    //    validators_withdrawals      MAX_WITHDRAWALS_PER_PAYLOAD - MAX_PENDING_PARTIALS_PER_WITHDRAWALS_SWEEP
    let pending_partials_max_in_cycle = (validators_withdrawals_number
        * MAX_PENDING_PARTIALS_PER_WITHDRAWALS_SWEEP)
        .div_ceil(MAX_WITHDRAWALS_PER_PAYLOAD - MAX_PENDING_PARTIALS_PER_WITHDRAWALS_SWEEP);

    validators_withdrawals_number + pending_partial_withdrawals_number.min(pending_partials_max_in_cycle)
}

/// Withdrawals executable from `state.pending_partial_withdrawals`. The
/// withdrawable-epoch and per-sweep-count cutoffs of the spec are
/// intentionally not applied - this is an upper bound.
pub fn get_pending_partial_withdrawals(state: &BeaconStateView) -> Vec<Withdrawal> {
    let mut withdrawals = Vec::new();

    for pending in &state.pending_partial_withdrawals {
        let Some(indexed) = state.validator(pending.validator_index) else {
            continue;
        };
        let validator = &indexed.validator;

        let has_sufficient_effective_balance = validator.effective_balance >= MIN_ACTIVATION_BALANCE;
        let has_excess_balance = indexed.balance > MIN_ACTIVATION_BALANCE;

        if validator.exit_epoch == FAR_FUTURE_EPOCH && has_sufficient_effective_balance && has_excess_balance {
            let withdrawable_balance = (indexed.balance - MIN_ACTIVATION_BALANCE).min(pending.amount);
            withdrawals.push(Withdrawal {
                validator_index: pending.validator_index,
                amount: withdrawable_balance,
            });
        }
    }

    withdrawals
}

/// Full and partial withdrawals of the validator sweep, with balances net of
/// the pending partials already counted.
pub fn get_validators_withdrawals(
    state: &BeaconStateView,
    partial_withdrawals: &[Withdrawal],
    slots_per_epoch: u64,
) -> Vec<Withdrawal> {
    let epoch = state.slot / slots_per_epoch;

    let mut partially_withdrawn: HashMap<ValidatorIndex, Gwei> = HashMap::new();
    for withdrawal in partial_withdrawals {
        *partially_withdrawn.entry(withdrawal.validator_index).or_default() += withdrawal.amount;
    }

    let mut withdrawals = Vec::new();
    for indexed in &state.validators {
        let deducted = partially_withdrawn.get(&indexed.index).copied().unwrap_or(0);
        let balance = indexed.balance.saturating_sub(deducted);

        if is_fully_withdrawable_validator(&indexed.validator, balance, epoch) {
            withdrawals.push(Withdrawal {
                validator_index: indexed.index,
                amount: balance,
            });
        } else if is_partially_withdrawable_validator(&indexed.validator, balance) {
            withdrawals.push(Withdrawal {
                validator_index: indexed.index,
                amount: balance - get_max_effective_balance(&indexed.validator),
            });
        }
    }

    withdrawals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth_spec::ETH1_ADDRESS_WITHDRAWAL_PREFIX;
    use crate::types::{Hash256, IndexedValidator, PendingPartialWithdrawal, Validator};

    fn eth1_validator(
        index: ValidatorIndex,
        balance: Gwei,
        effective_balance: Gwei,
        withdrawable_epoch: u64,
    ) -> IndexedValidator {
        let mut wc = [0u8; 32];
        wc[0] = ETH1_ADDRESS_WITHDRAWAL_PREFIX;
        IndexedValidator {
            index,
            balance,
            validator: Validator {
                pubkey: Default::default(),
                withdrawal_credentials: Hash256::from(wc),
                effective_balance,
                slashed: false,
                activation_eligibility_epoch: 0,
                activation_epoch: 0,
                exit_epoch: FAR_FUTURE_EPOCH,
                withdrawable_epoch,
            },
        }
    }

    fn state(validators: Vec<IndexedValidator>, pending: Vec<PendingPartialWithdrawal>) -> BeaconStateView {
        BeaconStateView {
            slot: 320,
            validators,
            earliest_exit_epoch: 0,
            exit_balance_to_consume: 0,
            pending_deposits: vec![],
            pending_partial_withdrawals: pending,
        }
    }

    #[test]
    fn counts_fully_and_partially_withdrawable() {
        let state = state(
            vec![
                // Fully withdrawable: past withdrawable epoch with balance.
                eth1_validator(0, 31_000_000_000, 32_000_000_000, 1),
                // Partially withdrawable: above max effective balance.
                eth1_validator(1, 33_000_000_000, 32_000_000_000, u64::MAX),
                // Neither.
                eth1_validator(2, 32_000_000_000, 32_000_000_000, u64::MAX),
            ],
            vec![],
        );

        let withdrawals = get_validators_withdrawals(&state, &[], 32);
        assert_eq!(withdrawals.len(), 2);
        assert_eq!(withdrawals[0].amount, 31_000_000_000);
        assert_eq!(withdrawals[1].amount, 1_000_000_000);
    }

    #[test]
    fn pending_partials_capped_by_excess_balance() {
        let state = state(
            vec![eth1_validator(0, 40_000_000_000, 32_000_000_000, u64::MAX)],
            vec![PendingPartialWithdrawal {
                validator_index: 0,
                amount: 100_000_000_000,
                withdrawable_epoch: 0,
            }],
        );

        let pending = get_pending_partial_withdrawals(&state);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount, 8_000_000_000);
    }

    #[test]
    fn cycle_count_caps_pending_partial_share() {
        // 8 validator withdrawals allow at most ceil(8*8/8) = 8 partials.
        let validators: Vec<_> = (0..8)
            .map(|i| eth1_validator(i, 33_000_000_000, 32_000_000_000, u64::MAX))
            .collect();
        let pending: Vec<_> = (0..100)
            .map(|i| PendingPartialWithdrawal {
                validator_index: i % 8,
                amount: 1,
                withdrawable_epoch: 0,
            })
            .collect();
        let state = state(validators, pending);

        let total = predict_withdrawals_number_in_sweep_cycle(&state, 32);
        assert_eq!(total, 8 + 8);
    }

    #[test]
    fn delay_is_half_the_cycle() {
        // 1024 withdrawable validators, no partials: cycle = ceil(1024/16/32) = 2 epochs.
        let validators: Vec<_> = (0..1024)
            .map(|i| eth1_validator(i, 33_000_000_000, 32_000_000_000, u64::MAX))
            .collect();
        let state = state(validators, vec![]);
        let chain = ChainConfig {
            slots_per_epoch: 32,
            seconds_per_slot: 12,
            genesis_time: 0,
        };

        assert_eq!(get_sweep_delay_in_epochs(&state, &chain), 1);
    }
}
