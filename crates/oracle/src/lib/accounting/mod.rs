//! Accounting oracle module: pooled-ether rebase inputs, withdrawal-queue
//! finalization and the per-vault valuation tree, submitted as one report.

pub mod vaults;

use std::sync::Arc;

use alloy_primitives::U256;
use alloy_sol_types::SolValue;

use lido_oracle_client::execution::contracts::{daemon_config_keys, AccountingOracle, BaseOracleWrapper};
use lido_oracle_client::execution::DefaultProvider;
use lido_oracle_shared::converter::FrameConverter;
use lido_oracle_shared::eth_spec::SHARE_RATE_PRECISION_E27;
use lido_oracle_shared::merkle::StandardMerkleTree;
use lido_oracle_shared::types::{BlockStamp, Epoch, Hash256, ReferenceBlockStamp, Wei, ZERO_HASH};
use lido_oracle_shared::util::gwei_to_wei;

use crate::consensus::{ConsensusDriver, ConsensusModule, Error, ReportEncoding};
use crate::lido_validators::get_lido_validators;
use crate::safe_border::SafeBorder;
use crate::Web3Context;
use vaults::{build_tree_data, CoreAprRatio, StakingVaultsService};

// No extra data items in the report: everything lands in the main tuple.
const EXTRA_DATA_FORMAT_EMPTY: u64 = 0;

impl ReportEncoding for AccountingOracle::ReportData {
    fn abi_encode(&self) -> Vec<u8> {
        SolValue::abi_encode(self)
    }
}

pub struct AccountingModule {
    ctx: Arc<Web3Context>,
    vaults_service: StakingVaultsService,
}

impl AccountingModule {
    pub fn new(ctx: Arc<Web3Context>) -> Self {
        Self {
            vaults_service: StakingVaultsService::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    /// Negative-rebase detection: the observed consensus-layer balance of
    /// the protocol's validators dropped below what the previous report
    /// recorded. Conservative finalization (bunker mode) kicks in on it.
    async fn detect_bunker_mode(&self, blockstamp: &ReferenceBlockStamp, current_cl_balance: Wei) -> Result<bool, Error> {
        let (_, beacon_validators, reported_balance) =
            self.ctx.lido.get_beacon_stat(blockstamp.block_hash).await?;
        if beacon_validators == 0 {
            return Ok(false);
        }
        let is_bunker = current_cl_balance < reported_balance;
        if is_bunker {
            tracing::warn!(
                %current_cl_balance,
                %reported_balance,
                "Negative consensus-layer rebase detected, reporting bunker mode"
            );
        }
        Ok(is_bunker)
    }

    /// Largest withdrawal request created before the safe border, as a
    /// single finalization batch. Requests are created in timestamp order,
    /// so a binary search over ids is enough.
    async fn get_finalization_batches(
        &self,
        border_epoch: Epoch,
        converter: &FrameConverter,
        blockstamp: &ReferenceBlockStamp,
    ) -> Result<Vec<u64>, Error> {
        let wq = &self.ctx.withdrawal_queue;
        let last_finalized = wq.get_last_finalized_request_id(blockstamp.block_hash).await?;
        let last_request = wq.get_last_request_id(blockstamp.block_hash).await?;
        if last_request <= last_finalized {
            return Ok(vec![]);
        }

        let border_timestamp = converter
            .chain()
            .timestamp_of_slot(converter.get_epoch_first_slot(border_epoch));

        let mut lo = last_finalized + 1;
        let mut hi = last_request;
        let mut found = None;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let timestamp = wq.get_withdrawal_request_timestamp(mid, blockstamp.block_hash).await?;
            if timestamp <= border_timestamp {
                found = Some(mid);
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }

        Ok(found.map(|id| vec![id]).unwrap_or_default())
    }

    /// Builds the vault subsystem part of the report: total values, fees,
    /// slashing reserves and the published Merkle tree.
    async fn build_vaults_report(
        &self,
        blockstamp: &ReferenceBlockStamp,
        converter: &FrameConverter,
    ) -> Result<(Hash256, String), Error> {
        let chain_config = &converter.chain_config;
        let frame_config = &converter.frame_config;

        let vaults = self.vaults_service.get_vaults(blockstamp.block_hash).await?;
        if vaults.is_empty() {
            return Ok((ZERO_HASH, String::new()));
        }

        let genesis = self.ctx.cc.get_genesis().await?;
        let state_view = self.ctx.cc.get_state_view(&blockstamp.as_blockstamp()).await?;

        let total_values = vaults::get_vaults_total_values(
            &vaults,
            &state_view.validators,
            &state_view.pending_deposits,
            genesis.genesis_fork_version,
        );

        let we_left_shift = self
            .ctx
            .daemon_config
            .get_u64(daemon_config_keys::SLASHING_RESERVE_WE_LEFT_SHIFT, blockstamp.block_hash)
            .await?;
        let we_right_shift = self
            .ctx
            .daemon_config
            .get_u64(daemon_config_keys::SLASHING_RESERVE_WE_RIGHT_SHIFT, blockstamp.block_hash)
            .await?;
        let slashing_reserves = self
            .vaults_service
            .get_vaults_slashing_reserve(
                blockstamp,
                &vaults,
                &state_view.validators,
                chain_config,
                we_left_shift,
                we_right_shift,
            )
            .await?;

        let latest_onchain = self.ctx.lazy_oracle.get_latest_report_data(blockstamp.block_hash).await?;
        let (prev_report, prev_block_number, prev_block_hash) = self
            .vaults_service
            .get_start_point_for_fee_calculations(blockstamp, &latest_onchain, frame_config, chain_config)
            .await?;

        // Core APR over the accrual window, from share-rate growth between
        // the start point and the reference block.
        let pre_total_pooled_ether = self.ctx.lido.get_total_pooled_ether(prev_block_hash).await?;
        let pre_total_shares = self.ctx.lido.get_total_shares(prev_block_hash).await?;
        let post_total_pooled_ether = self.ctx.lido.get_total_pooled_ether(blockstamp.block_hash).await?;
        let post_total_shares = self.ctx.lido.get_total_shares(blockstamp.block_hash).await?;

        let prev_ref_slot = prev_report
            .as_ref()
            .map(|r| r.ref_slot)
            .unwrap_or(frame_config.initial_epoch * chain_config.slots_per_epoch);
        let time_elapsed = blockstamp.ref_slot.saturating_sub(prev_ref_slot) * chain_config.seconds_per_slot;
        let core_apr_ratio = if time_elapsed == 0 {
            CoreAprRatio::zero()
        } else {
            CoreAprRatio::from_share_rates(
                pre_total_pooled_ether,
                pre_total_shares,
                post_total_pooled_ether,
                post_total_shares,
                time_elapsed,
            )?
        };

        let fees = self
            .vaults_service
            .get_vaults_fees(
                blockstamp,
                &vaults,
                &total_values,
                prev_report.as_ref(),
                prev_block_number,
                prev_block_hash,
                &core_apr_ratio,
                pre_total_pooled_ether,
                pre_total_shares,
            )
            .await?;

        let leaves = build_tree_data(&vaults, &total_values, &fees, &slashing_reserves)?;
        let tree = StandardMerkleTree::build(leaves);

        let prev_tree_cid = latest_onchain.report_cid.0.clone();
        let cid = self
            .vaults_service
            .publish_tree(&tree, &vaults, blockstamp, &prev_tree_cid, chain_config, &fees)
            .await?;

        Ok((tree.root(), cid.0))
    }
}

impl ConsensusModule for AccountingModule {
    type Report = AccountingOracle::ReportData;

    const COMPATIBLE_CONTRACT_VERSION: u64 = 1;
    const COMPATIBLE_CONSENSUS_VERSION: u64 = 3;

    fn name(&self) -> &'static str {
        "accounting"
    }

    fn report_contract(&self) -> &BaseOracleWrapper<DefaultProvider> {
        &self.ctx.accounting_oracle_base
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

        let validators_count = lido_validators.len() as u64;
        let cl_balance_gwei: u64 = lido_validators.iter().map(|v| v.balance).sum();

        // Per-module exited counters, reported only for modules whose
        // registries moved past the values the router has accounted.
        let mut module_ids_with_exited = Vec::new();
        let mut exited_by_module = Vec::new();
        for module in self.ctx.staking_router.get_staking_modules(blockstamp.block_hash).await? {
            let (total_exited, _) = self
                .ctx
                .staking_router
                .get_staking_module_summary(module.id, blockstamp.block_hash)
                .await?;
            if total_exited > module.exited_validators_count {
                module_ids_with_exited.push(U256::from(module.id));
                exited_by_module.push(U256::from(total_exited));
            }
        }

        let withdrawal_vault_balance = self
            .ctx
            .el
            .get_balance(self.ctx.withdrawal_vault_address, blockstamp.block_hash)
            .await?;
        let el_rewards_vault_balance = self
            .ctx
            .el
            .get_balance(self.ctx.el_rewards_vault_address, blockstamp.block_hash)
            .await?;
        let shares_requested_to_burn = self.ctx.burner.get_shares_requested_to_burn(blockstamp.block_hash).await?;

        let is_bunker = self
            .detect_bunker_mode(blockstamp, gwei_to_wei(cl_balance_gwei))
            .await?;

        let safe_border = SafeBorder::init(&self.ctx, blockstamp, converter).await?;
        let border_epoch = safe_border.get_safe_border_epoch(is_bunker, &lido_validators).await?;
        let withdrawal_finalization_batches = self
            .get_finalization_batches(border_epoch, &converter, blockstamp)
            .await?
            .into_iter()
            .map(U256::from)
            .collect();

        let total_pooled_ether = self.ctx.lido.get_total_pooled_ether(blockstamp.block_hash).await?;
        let total_shares = self.ctx.lido.get_total_shares(blockstamp.block_hash).await?;
        let finalization_share_rate = if total_shares.is_zero() {
            U256::ZERO
        } else {
            total_pooled_ether * U256::from(SHARE_RATE_PRECISION_E27) / total_shares
        };

        let (vaults_tree_root, vaults_tree_cid) = self.build_vaults_report(blockstamp, &converter).await?;

        Ok(AccountingOracle::ReportData {
            consensusVersion: U256::from(consensus_version),
            refSlot: U256::from(blockstamp.ref_slot),
            numValidators: U256::from(validators_count),
            clBalanceGwei: U256::from(cl_balance_gwei),
            stakingModuleIdsWithNewlyExitedValidators: module_ids_with_exited,
            numExitedValidatorsByStakingModule: exited_by_module,
            withdrawalVaultBalance: withdrawal_vault_balance,
            elRewardsVaultBalance: el_rewards_vault_balance,
            sharesRequestedToBurn: shares_requested_to_burn,
            withdrawalFinalizationBatches: withdrawal_finalization_batches,
            simulatedShareRate: finalization_share_rate,
            isBunkerMode: is_bunker,
            vaultsTreeRoot: vaults_tree_root,
            vaultsTreeCid: vaults_tree_cid,
            extraDataFormat: U256::from(EXTRA_DATA_FORMAT_EMPTY),
            extraDataHash: ZERO_HASH,
            extraDataItemsCount: U256::ZERO,
        })
    }

    async fn is_main_data_submitted(&self, blockstamp: &BlockStamp) -> Result<bool, Error> {
        let state = self.ctx.accounting_oracle.get_processing_state(blockstamp.block_hash).await?;
        Ok(state.main_data_submitted)
    }

    async fn is_contract_reportable(&self, blockstamp: &BlockStamp) -> Result<bool, Error> {
        Ok(!self.is_main_data_submitted(blockstamp).await?)
    }

    async fn is_reporting_allowed(&self, _blockstamp: &ReferenceBlockStamp) -> Result<bool, Error> {
        Ok(true)
    }

    async fn submit_report_data(&self, report: Self::Report) -> Result<(), Error> {
        self.ctx
            .accounting_oracle
            .submit_report_data(report, Self::COMPATIBLE_CONTRACT_VERSION, self.ctx.dry_run)
            .await?;
        Ok(())
    }
}
