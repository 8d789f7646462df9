//! Ejector module: selects the validator set to request exits for, so that
//! projected future balances cover the unfinalized withdrawal demand.

pub mod data;
pub mod prediction;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::U256;
use alloy_sol_types::SolValue;

use lido_oracle_client::execution::contracts::{
    daemon_config_keys, BaseOracleWrapper, ExitBusOracle, NodeOperatorRegistryWrapper,
};
use lido_oracle_client::execution::DefaultProvider;
use lido_oracle_shared::converter::FrameConverter;
use lido_oracle_shared::eth_spec::{
    compute_activation_exit_epoch, compute_exit_churn_limit, get_activation_exit_churn_limit,
    is_active_validator, is_fully_withdrawable_validator, FAR_FUTURE_EPOCH, MAX_EFFECTIVE_BALANCE,
    MIN_ACTIVATION_BALANCE, MIN_VALIDATOR_WITHDRAWABILITY_DELAY,
};
use lido_oracle_shared::sweep::get_sweep_delay_in_epochs;
use lido_oracle_shared::types::{
    BlockStamp, ChainConfig, Epoch, Gwei, IndexedValidator, ReferenceBlockStamp, Wei,
};
use lido_oracle_shared::util::gwei_to_wei;

use crate::consensus::{ConsensusDriver, ConsensusModule, Error, ReportEncoding};
use crate::lido_validators::get_lido_validators;
use crate::Web3Context;
use data::{encode_data, NodeOperatorGlobalIndex};

impl ReportEncoding for ExitBusOracle::ReportData {
    fn abi_encode(&self) -> Vec<u8> {
        SolValue::abi_encode(self)
    }
}

#[derive(Debug, Clone)]
pub struct ExitCandidate {
    pub global_index: NodeOperatorGlobalIndex,
    pub validator: IndexedValidator,
    /// Must be ejected regardless of the balance comparison (operator is
    /// under a forced target limit).
    pub forced: bool,
}

/// The balance-projection model over prefetched chain data. Everything here
/// is pure, so the greedy selection is deterministic and testable.
#[derive(Debug, Clone)]
pub struct EjectionPlanner {
    pub chain_config: ChainConfig,
    pub ref_epoch: Epoch,
    pub consensus_version: u64,
    pub to_withdraw_amount: Wei,
    pub total_el_balance: Wei,
    pub going_to_withdraw_balance: Wei,
    pub going_to_exit_count: u64,
    pub rewards_per_epoch: Wei,
    pub sweep_delay_epochs: u64,
    pub lido_validators: Vec<IndexedValidator>,
    // Exit-queue churn model inputs.
    pub max_exit_epoch: Epoch,
    pub latest_to_exit_count: u64,
    pub total_active_validators: u64,
    pub total_active_balance: Gwei,
    pub earliest_exit_epoch: Epoch,
    pub exit_balance_to_consume: Gwei,
}

impl EjectionPlanner {
    /// What a validator is expected to deliver once swept. Balance above the
    /// max effective balance was already skimmed.
    pub fn predicted_withdrawable_balance(validator: &IndexedValidator) -> Wei {
        gwei_to_wei(validator.balance.min(MAX_EFFECTIVE_BALANCE))
    }

    /// Latest exit epoch and the exiting-validator count at it, scanned from
    /// the validator registry.
    pub fn scan_latest_exit_epoch(validators: &[IndexedValidator]) -> (Epoch, u64) {
        let mut max_exit_epoch: Epoch = 0;
        let mut latest_to_exit_count: u64 = 0;
        for validator in validators {
            let exit_epoch = validator.validator.exit_epoch;
            if exit_epoch == FAR_FUTURE_EPOCH {
                continue;
            }
            match exit_epoch.cmp(&max_exit_epoch) {
                std::cmp::Ordering::Greater => {
                    max_exit_epoch = exit_epoch;
                    latest_to_exit_count = 1;
                }
                std::cmp::Ordering::Equal => latest_to_exit_count += 1,
                std::cmp::Ordering::Less => {}
            }
        }
        (max_exit_epoch, latest_to_exit_count)
    }

    /// Epoch at which `validators_to_eject_count` more validators entering
    /// the exit queue now would all be withdrawable.
    pub fn predicted_withdrawable_epoch(&self, validators_to_eject_count: u64) -> Epoch {
        let activation_exit_epoch = compute_activation_exit_epoch(self.ref_epoch);

        if self.consensus_version >= 2 {
            // Balance-based churn (post-Electra): the queue consumes a
            // per-epoch ether budget rather than a validator count.
            let per_epoch_churn = get_activation_exit_churn_limit(self.total_active_balance);
            let mut earliest_exit_epoch = self.earliest_exit_epoch.max(activation_exit_epoch);
            let balance_to_consume = if self.earliest_exit_epoch < activation_exit_epoch {
                per_epoch_churn
            } else {
                self.exit_balance_to_consume
            };

            let exit_balance = validators_to_eject_count * MIN_ACTIVATION_BALANCE;
            if exit_balance > balance_to_consume {
                let balance_to_process = exit_balance - balance_to_consume;
                earliest_exit_epoch += balance_to_process / per_epoch_churn + 1;
            }
            return earliest_exit_epoch + MIN_VALIDATOR_WITHDRAWABILITY_DELAY;
        }

        let (mut max_exit_epoch, mut latest_to_exit_count) = (self.max_exit_epoch, self.latest_to_exit_count);
        if activation_exit_epoch > max_exit_epoch {
            max_exit_epoch = activation_exit_epoch;
            latest_to_exit_count = 0;
        }

        let churn_limit = compute_exit_churn_limit(self.total_active_validators);
        let epochs_required = (validators_to_eject_count + latest_to_exit_count) / churn_limit;
        max_exit_epoch + epochs_required + MIN_VALIDATOR_WITHDRAWABILITY_DELAY
    }

    /// Balances of currently-withdrawable validators that the sweep will
    /// have delivered by `on_epoch`.
    pub fn withdrawable_validators_balance_at(&self, on_epoch: Epoch) -> Wei {
        self.lido_validators
            .iter()
            .filter(|v| is_fully_withdrawable_validator(&v.validator, v.balance, on_epoch))
            .map(Self::predicted_withdrawable_balance)
            .sum()
    }

    /// Everything expected to be available for finalization once
    /// `vals_to_exit` more validators are ejected.
    pub fn expected_balance(&self, vals_to_exit: u64) -> Wei {
        let withdrawal_epoch = self.predicted_withdrawable_epoch(self.going_to_exit_count + vals_to_exit + 1);
        let future_withdrawals = self.withdrawable_validators_balance_at(withdrawal_epoch);
        let future_rewards = U256::from(withdrawal_epoch + self.sweep_delay_epochs - self.ref_epoch)
            * self.rewards_per_epoch;

        future_rewards + future_withdrawals + self.total_el_balance + self.going_to_withdraw_balance
    }

    /// Smallest candidate prefix covering the withdrawal demand, in the
    /// deterministic (module, operator, index) order.
    pub fn select_validators_to_eject<'a>(&self, candidates: &'a [ExitCandidate]) -> Vec<&'a ExitCandidate> {
        let mut selected: Vec<&ExitCandidate> = Vec::new();
        let mut selected_balance_sum = Wei::ZERO;

        let mut expected_balance = self.expected_balance(0);
        let mut iterator = candidates.iter();
        while expected_balance < self.to_withdraw_amount {
            let Some(candidate) = iterator.next() else {
                break;
            };
            selected.push(candidate);
            selected_balance_sum += Self::predicted_withdrawable_balance(&candidate.validator);
            expected_balance = self.expected_balance(selected.len() as u64) + selected_balance_sum;
        }

        tracing::info!(
            expected_balance = %expected_balance,
            to_withdraw_amount = %self.to_withdraw_amount,
            validators_to_eject_count = selected.len(),
            "Calculated validators to eject"
        );
        selected
    }
}

pub struct EjectorModule {
    ctx: Arc<Web3Context>,
}

impl EjectorModule {
    pub fn new(ctx: Arc<Web3Context>) -> Self {
        Self { ctx }
    }

    /// Active protocol validators mapped to their (module, operator) pair,
    /// eligible for an exit request, in exit-priority order; plus the forced
    /// set of operators under a forced target limit.
    async fn collect_candidates(
        &self,
        blockstamp: &ReferenceBlockStamp,
        lido_validators: &[&IndexedValidator],
        recently_requested: &HashSet<u64>,
    ) -> Result<Vec<ExitCandidate>, Error> {
        let by_pubkey: HashMap<_, _> = lido_validators.iter().map(|v| (v.validator.pubkey, *v)).collect();

        let mut candidates = Vec::new();
        for module in self.ctx.staking_router.get_staking_modules(blockstamp.block_hash).await? {
            let registry = NodeOperatorRegistryWrapper::new(
                Arc::clone(&self.ctx.provider),
                module.address,
                Arc::new(self.ctx.metrics.services.execution_client.clone()),
            );

            let operators_count = registry.get_node_operators_count(blockstamp.block_hash).await?;
            for operator in 0..operators_count {
                let summary = registry.get_node_operator_summary(operator, blockstamp.block_hash).await?;
                let pubkeys = registry.get_used_signing_keys(operator, blockstamp.block_hash).await?;

                let mut operator_validators: Vec<&IndexedValidator> = pubkeys
                    .iter()
                    .filter_map(|pubkey| by_pubkey.get(pubkey).copied())
                    .filter(|v| {
                        is_active_validator(&v.validator, blockstamp.ref_epoch)
                            && v.validator.exit_epoch == FAR_FUTURE_EPOCH
                            && !recently_requested.contains(&v.index)
                    })
                    .collect();
                operator_validators.sort_by_key(|v| v.index);

                // Under a forced target limit everything beyond the target
                // count must leave, regardless of the demand.
                let forced_from = if summary.target_limit_mode == 2 {
                    summary.target_validators_count as usize
                } else {
                    usize::MAX
                };

                for (position, validator) in operator_validators.into_iter().enumerate() {
                    candidates.push(ExitCandidate {
                        global_index: (module.id, operator),
                        validator: validator.clone(),
                        forced: position >= forced_from,
                    });
                }
            }
        }

        candidates.sort_by_key(|c| (c.global_index, c.validator.index));
        Ok(candidates)
    }

    async fn prepare_planner(
        &self,
        blockstamp: &ReferenceBlockStamp,
        converter: &FrameConverter,
        lido_validators: &[&IndexedValidator],
        consensus_version: u64,
    ) -> Result<(EjectionPlanner, HashSet<u64>), Error> {
        let chain_config = converter.chain_config;

        let to_withdraw_amount = self.ctx.withdrawal_queue.unfinalized_steth(blockstamp.block_hash).await?;
        tracing::info!(to_withdraw_amount = %to_withdraw_amount, "Calculated amount to withdraw");

        let state_view = self.ctx.cc.get_state_view(&blockstamp.as_blockstamp()).await?;

        // Validators whose exits were requested recently and have not
        // happened yet; their balances are already on the way out.
        let delayed_timeout_in_slots = self
            .ctx
            .daemon_config
            .get_u64(daemon_config_keys::VALIDATOR_DELAYED_TIMEOUT_IN_SLOTS, blockstamp.block_hash)
            .await?;
        let from_block = blockstamp.block_number.saturating_sub(delayed_timeout_in_slots);
        let exit_requests = self
            .ctx
            .exit_bus_oracle
            .get_exit_request_events(from_block, blockstamp.block_number)
            .await?;

        let lido_indices: HashSet<u64> = lido_validators.iter().map(|v| v.index).collect();
        let recently_requested: HashSet<u64> = exit_requests
            .iter()
            .map(|e| e.validator_index)
            .filter(|index| lido_indices.contains(index))
            .collect();

        let going_to_exit: Vec<&&IndexedValidator> = lido_validators
            .iter()
            .filter(|v| recently_requested.contains(&v.index) && v.validator.exit_epoch == FAR_FUTURE_EPOCH)
            .collect();
        let going_to_withdraw_balance = going_to_exit
            .iter()
            .map(|v| EjectionPlanner::predicted_withdrawable_balance(v))
            .sum();

        let sweep_delay_epochs = get_sweep_delay_in_epochs(&state_view, &chain_config);
        tracing::info!(sweep_delay_epochs, "Calculated epochs to sweep");

        let prediction_duration_in_slots = self
            .ctx
            .daemon_config
            .get_u64(daemon_config_keys::PREDICTION_DURATION_IN_SLOTS, blockstamp.block_hash)
            .await?;
        let rebase_events = self
            .ctx
            .lido
            .get_rebase_events(
                blockstamp.block_number.saturating_sub(prediction_duration_in_slots),
                blockstamp.block_number,
            )
            .await?;
        let rewards_per_epoch = prediction::rewards_per_epoch(&rebase_events, &chain_config);
        tracing::info!(rewards_per_epoch = %rewards_per_epoch, "Calculated average rewards speed per epoch");

        let total_el_balance = self
            .ctx
            .el
            .get_balance(self.ctx.el_rewards_vault_address, blockstamp.block_hash)
            .await?
            + self
                .ctx
                .el
                .get_balance(self.ctx.withdrawal_vault_address, blockstamp.block_hash)
                .await?
            + self.ctx.lido.get_buffered_ether(blockstamp.block_hash).await?;

        let (max_exit_epoch, latest_to_exit_count) =
            EjectionPlanner::scan_latest_exit_epoch(&state_view.validators);
        let total_active_validators = state_view
            .validators
            .iter()
            .filter(|v| is_active_validator(&v.validator, blockstamp.ref_epoch))
            .count() as u64;
        let total_active_balance: Gwei = state_view
            .validators
            .iter()
            .filter(|v| is_active_validator(&v.validator, blockstamp.ref_epoch))
            .map(|v| v.validator.effective_balance)
            .sum();

        let planner = EjectionPlanner {
            chain_config,
            ref_epoch: blockstamp.ref_epoch,
            consensus_version,
            to_withdraw_amount,
            total_el_balance,
            going_to_withdraw_balance,
            going_to_exit_count: going_to_exit.len() as u64,
            rewards_per_epoch,
            sweep_delay_epochs,
            lido_validators: lido_validators.iter().map(|v| (*v).clone()).collect(),
            max_exit_epoch,
            latest_to_exit_count,
            total_active_validators,
            total_active_balance,
            earliest_exit_epoch: state_view.earliest_exit_epoch,
            exit_balance_to_consume: state_view.exit_balance_to_consume,
        };
        Ok((planner, recently_requested))
    }
}

impl ConsensusModule for EjectorModule {
    type Report = ExitBusOracle::ReportData;

    const COMPATIBLE_CONTRACT_VERSION: u64 = 1;
    const COMPATIBLE_CONSENSUS_VERSION: u64 = 2;

    fn name(&self) -> &'static str {
        "ejector"
    }

    fn report_contract(&self) -> &BaseOracleWrapper<DefaultProvider> {
        &self.ctx.exit_bus_oracle_base
    }

    async fn build_report(&self, blockstamp: &ReferenceBlockStamp) -> Result<Self::Report, Error> {
        let driver = ConsensusDriver::new(&self.ctx);
        let converter = driver
            .get_converter(self.report_contract(), &blockstamp.as_blockstamp())
            .await?;
        let consensus_version = self
            .report_contract()
            .get_consensus_version(blockstamp.block_hash)
            .await?;

        let validators = self.ctx.cc.get_validators(&blockstamp.as_blockstamp()).await?;
        let lido_validators = get_lido_validators(&validators, &self.ctx.lido_withdrawal_credentials);

        let (planner, recently_requested) = self
            .prepare_planner(blockstamp, &converter, &lido_validators, consensus_version)
            .await?;
        let candidates = self
            .collect_candidates(blockstamp, &lido_validators, &recently_requested)
            .await?;

        let selected = planner.select_validators_to_eject(&candidates);
        let selected_indices: HashSet<u64> = selected.iter().map(|c| c.validator.index).collect();

        let mut requests: Vec<_> = selected
            .iter()
            .map(|c| (c.global_index, c.validator.index, c.validator.pubkey))
            .collect();

        // Forced validators ride along after the greedy set.
        if consensus_version != 1 {
            let forced: Vec<_> = candidates
                .iter()
                .filter(|c| c.forced && !selected_indices.contains(&c.validator.index))
                .map(|c| (c.global_index, c.validator.index, c.validator.pubkey))
                .collect();
            if !forced.is_empty() {
                tracing::info!(count = forced.len(), "Ejecting forced-to-exit validators");
                requests.extend(forced);
            }
        }

        let (request_data, data_format) = encode_data(&requests);

        Ok(ExitBusOracle::ReportData {
            consensusVersion: U256::from(consensus_version),
            refSlot: U256::from(blockstamp.ref_slot),
            requestsCount: U256::from(requests.len()),
            dataFormat: U256::from(data_format),
            data: request_data,
        })
    }

    async fn is_main_data_submitted(&self, blockstamp: &BlockStamp) -> Result<bool, Error> {
        let state = self.ctx.exit_bus_oracle.get_processing_state(blockstamp.block_hash).await?;
        Ok(state.data_submitted)
    }

    async fn is_contract_reportable(&self, blockstamp: &BlockStamp) -> Result<bool, Error> {
        Ok(!self.is_main_data_submitted(blockstamp).await?)
    }

    /// No exit requests leave the process while the exit bus is paused.
    async fn is_reporting_allowed(&self, blockstamp: &ReferenceBlockStamp) -> Result<bool, Error> {
        let on_pause = self.ctx.exit_bus_oracle.is_paused(blockstamp.block_hash).await?;
        self.ctx
            .metrics
            .frame
            .contract_on_pause
            .with_label_values(&["exit_bus"])
            .set(on_pause as u64);
        Ok(!on_pause)
    }

    async fn submit_report_data(&self, report: Self::Report) -> Result<(), Error> {
        self.ctx
            .exit_bus_oracle
            .submit_report_data(report, Self::COMPATIBLE_CONTRACT_VERSION, self.ctx.dry_run)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lido_oracle_shared::types::{BlsPubkey, Hash256, Validator};

    fn candidate(module: u64, operator: u64, index: u64, balance: Gwei) -> ExitCandidate {
        ExitCandidate {
            global_index: (module, operator),
            validator: IndexedValidator {
                index,
                balance,
                validator: Validator {
                    pubkey: BlsPubkey::repeat_byte(index as u8 + 1),
                    withdrawal_credentials: Hash256::ZERO,
                    effective_balance: balance,
                    slashed: false,
                    activation_eligibility_epoch: 0,
                    activation_epoch: 0,
                    exit_epoch: FAR_FUTURE_EPOCH,
                    withdrawable_epoch: FAR_FUTURE_EPOCH,
                },
            },
            forced: false,
        }
    }

    fn planner(to_withdraw: Wei, el_balance: Wei) -> EjectionPlanner {
        EjectionPlanner {
            chain_config: ChainConfig {
                slots_per_epoch: 32,
                seconds_per_slot: 12,
                genesis_time: 0,
            },
            ref_epoch: 1000,
            consensus_version: 1,
            to_withdraw_amount: to_withdraw,
            total_el_balance: el_balance,
            going_to_withdraw_balance: Wei::ZERO,
            going_to_exit_count: 0,
            rewards_per_epoch: Wei::ZERO,
            sweep_delay_epochs: 0,
            lido_validators: vec![],
            max_exit_epoch: 0,
            latest_to_exit_count: 0,
            total_active_validators: 100_000,
            total_active_balance: 100_000 * 32_000_000_000,
            earliest_exit_epoch: 0,
            exit_balance_to_consume: 0,
        }
    }

    #[test]
    fn selects_exactly_enough_validators_to_cover_demand() {
        // Demand 200 gwei-units, base balance 100, each candidate predicts 50.
        let to_withdraw = gwei_to_wei(200);
        let p = planner(to_withdraw, gwei_to_wei(100));

        let candidates: Vec<ExitCandidate> = (0..10).map(|i| candidate(1, 0, i, 50)).collect();
        let selected = p.select_validators_to_eject(&candidates);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].validator.index, 0);
        assert_eq!(selected[1].validator.index, 1);
    }

    #[test]
    fn selects_nothing_when_balance_already_covers_demand() {
        let p = planner(gwei_to_wei(100), gwei_to_wei(100));
        let candidates: Vec<ExitCandidate> = (0..3).map(|i| candidate(1, 0, i, 50)).collect();
        assert!(p.select_validators_to_eject(&candidates).is_empty());
    }

    #[test]
    fn selects_all_candidates_when_demand_cannot_be_covered() {
        let p = planner(gwei_to_wei(10_000), Wei::ZERO);
        let candidates: Vec<ExitCandidate> = (0..3).map(|i| candidate(1, 0, i, 50)).collect();
        assert_eq!(p.select_validators_to_eject(&candidates).len(), 3);
    }

    #[test]
    fn predicted_balance_is_capped_at_max_effective() {
        let big = candidate(1, 0, 0, MAX_EFFECTIVE_BALANCE + 5_000_000_000);
        assert_eq!(
            EjectionPlanner::predicted_withdrawable_balance(&big.validator),
            gwei_to_wei(MAX_EFFECTIVE_BALANCE)
        );
    }

    #[test]
    fn withdrawable_epoch_honours_churn_v1() {
        let mut p = planner(Wei::ZERO, Wei::ZERO);
        p.total_active_validators = 2u64.pow(16) * 8; // churn limit 8

        // Queue is empty: the first exit lands at activation_exit_epoch.
        let activation_exit = compute_activation_exit_epoch(p.ref_epoch);
        assert_eq!(
            p.predicted_withdrawable_epoch(1),
            activation_exit + MIN_VALIDATOR_WITHDRAWABILITY_DELAY
        );

        // More than one churn's worth pushes the epoch out.
        assert_eq!(
            p.predicted_withdrawable_epoch(17),
            activation_exit + 2 + MIN_VALIDATOR_WITHDRAWABILITY_DELAY
        );
    }

    #[test]
    fn withdrawable_epoch_uses_balance_churn_v2() {
        let mut p = planner(Wei::ZERO, Wei::ZERO);
        p.consensus_version = 2;
        p.total_active_balance = 2u64.pow(16) * 256_000_000_000; // cap applies
        p.earliest_exit_epoch = 0;
        p.exit_balance_to_consume = 0;

        let activation_exit = compute_activation_exit_epoch(p.ref_epoch);
        // One 32 ETH exit fits the per-epoch churn budget refreshed at
        // activation_exit_epoch.
        assert_eq!(
            p.predicted_withdrawable_epoch(1),
            activation_exit + MIN_VALIDATOR_WITHDRAWABILITY_DELAY
        );

        // A large batch consumes several epochs of budget.
        // 100 * 32 ETH = 3200 ETH; churn = 256 ETH/epoch; budget 256 covers
        // the first chunk, (3200-256)/256 + 1 = 12 extra epochs.
        assert_eq!(
            p.predicted_withdrawable_epoch(100),
            activation_exit + 12 + MIN_VALIDATOR_WITHDRAWABILITY_DELAY
        );
    }

    #[test]
    fn scan_latest_exit_epoch_counts_the_tail() {
        let mut validators: Vec<IndexedValidator> = (0..5).map(|i| candidate(1, 0, i, 32).validator).collect();
        validators[1].validator.exit_epoch = 900;
        validators[2].validator.exit_epoch = 950;
        validators[3].validator.exit_epoch = 950;

        let (epoch, count) = EjectionPlanner::scan_latest_exit_epoch(&validators);
        assert_eq!(epoch, 950);
        assert_eq!(count, 2);
    }
}
