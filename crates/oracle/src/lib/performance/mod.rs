//! Performance oracle module: turns collected duties into the per-operator
//! reward distribution report.

pub mod distribution;
pub mod last_report;
pub mod log;
pub mod state;
pub mod tree;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy_sol_types::SolValue;

use lido_oracle_client::blockstamp::get_reference_blockstamp;
use lido_oracle_client::execution::contracts::{BaseOracleWrapper, CsFeeOracle, CurveParams};
use lido_oracle_client::execution::DefaultProvider;
use lido_oracle_client::ipfs::ContentStorage;
use lido_oracle_shared::converter::FrameConverter;
use lido_oracle_shared::eth_spec::is_active_validator;
use lido_oracle_shared::types::{
    BlockStamp, BlsPubkey, Epoch, IndexedValidator, NodeOperatorId, ReferenceBlockStamp, ZERO_HASH,
};

use crate::consensus::{ConsensusDriver, ConsensusModule, Error, ReportEncoding};
use crate::store::DutyStore;
use crate::Web3Context;
use distribution::{DistributionResult, FrameInput, OperatorValidator};
use last_report::LastReport;
use log::FramePerfLog;
use state::State;
use tree::{RewardsTree, RewardsTreeLeaf, StrikesTree};

pub const EPOCHS_DEMAND_CONSUMER: &str = "performance";

impl ReportEncoding for CsFeeOracle::ReportData {
    fn abi_encode(&self) -> Vec<u8> {
        SolValue::abi_encode(self)
    }
}

pub struct PerformanceModule {
    ctx: Arc<Web3Context>,
    store: Arc<DutyStore>,
    state_path: PathBuf,
}

impl PerformanceModule {
    pub fn new(ctx: Arc<Web3Context>, store: Arc<DutyStore>, cache_dir: &Path) -> Self {
        Self {
            ctx,
            store,
            state_path: cache_dir.join("performance_state.json"),
        }
    }

    /// Epoch range covered by the current report: everything after the last
    /// processed reference epoch, up to the current one.
    fn current_frame_range(
        &self,
        converter: &FrameConverter,
        last_processing_ref_slot: u64,
        blockstamp: &ReferenceBlockStamp,
    ) -> (Epoch, Epoch) {
        let l_epoch = if last_processing_ref_slot == 0 {
            converter.frame_config.initial_epoch
        } else {
            converter.get_epoch_by_slot(last_processing_ref_slot) + 1
        };
        (l_epoch, blockstamp.ref_epoch)
    }

    async fn collect_frame_inputs(
        &self,
        state: &State,
        blockstamp: &ReferenceBlockStamp,
        converter: &FrameConverter,
        last_report: &LastReport,
    ) -> Result<Vec<FrameInput>, Error> {
        let mut inputs = Vec::with_capacity(state.frames().len());

        for frame in state.frames() {
            let (_, to_epoch) = frame;
            let frame_blockstamp = if to_epoch == blockstamp.ref_epoch {
                *blockstamp
            } else {
                get_reference_blockstamp(
                    &self.ctx.cc,
                    converter.get_epoch_last_slot(to_epoch),
                    to_epoch,
                    blockstamp.slot_number,
                )
                .await?
            };

            let validators = self.ctx.cc.get_validators(&frame_blockstamp.as_blockstamp()).await?;
            let by_pubkey: HashMap<BlsPubkey, &IndexedValidator> =
                validators.iter().map(|v| (v.validator.pubkey, v)).collect();

            let operators_count = self
                .ctx
                .csm
                .get_node_operators_count(frame_blockstamp.block_hash)
                .await?;

            let mut operators_to_validators: BTreeMap<NodeOperatorId, Vec<OperatorValidator>> = BTreeMap::new();
            for operator in 0..operators_count {
                let keys = self.ctx.csm.get_signing_keys(operator, frame_blockstamp.block_hash).await?;
                let module_validators: Vec<OperatorValidator> = keys
                    .iter()
                    .filter_map(|pubkey| by_pubkey.get(pubkey))
                    .map(|v| OperatorValidator {
                        index: v.index,
                        pubkey: v.validator.pubkey,
                        slashed: v.validator.slashed,
                    })
                    .collect();
                if !module_validators.is_empty() {
                    operators_to_validators.insert(operator, module_validators);
                }
            }

            let total_rewards_to_distribute =
                self.ctx.csm.shares_to_distribute(frame_blockstamp.block_hash).await?;

            // Curve parameters for every operator in the frame plus every
            // operator still carrying strike history.
            let mut curve_operators: BTreeSet<NodeOperatorId> = operators_to_validators.keys().copied().collect();
            curve_operators.extend(last_report.strikes.keys().map(|(operator, _)| *operator));

            let mut curve_params: BTreeMap<NodeOperatorId, CurveParams> = BTreeMap::new();
            for operator in curve_operators {
                curve_params.insert(
                    operator,
                    self.ctx.csm.get_curve_params(operator, frame_blockstamp.block_hash).await?,
                );
            }

            inputs.push(FrameInput {
                frame,
                blockstamp: frame_blockstamp,
                operators_to_validators,
                total_rewards_to_distribute,
                curve_params,
            });
        }

        Ok(inputs)
    }

    async fn publish_trees(
        &self,
        result: &DistributionResult,
        last_report: &LastReport,
    ) -> Result<(lido_oracle_shared::types::Hash256, String, String), Error> {
        let log_cid = self
            .ctx
            .storage
            .publish(&FramePerfLog::encode_all(&result.logs), "performance_log.json")
            .await?;

        if result.total_rewards_map.is_empty() {
            // Nothing was ever distributed; the empty tree is represented by
            // the zero root with no CID.
            return Ok((ZERO_HASH, String::new(), log_cid.0));
        }

        let state_bytes = std::fs::read(&self.state_path)
            .map_err(|e| Error::InvalidReport(format!("state snapshot is not readable: {e}")))?;
        let state_cid = self.ctx.storage.publish(&state_bytes, "performance_state.json").await?;

        let rewards_tree = RewardsTree::new(
            result
                .total_rewards_map
                .iter()
                .map(|(node_operator_id, shares)| RewardsTreeLeaf {
                    node_operator_id: *node_operator_id,
                    shares: *shares,
                })
                .collect(),
        );
        let tree_cid = self
            .ctx
            .storage
            .publish(&rewards_tree.encode(Some(&state_cid)), "rewards_tree.json")
            .await?;

        if !result.strikes.is_empty() {
            let strikes_tree = StrikesTree::from_strikes(&result.strikes);
            let strikes_cid = self
                .ctx
                .storage
                .publish(&strikes_tree.encode(), "strikes_tree.json")
                .await?;
            tracing::info!(
                root = %strikes_tree.root(),
                cid = %strikes_cid,
                "Published strikes tree"
            );
        } else if last_report.strikes_tree_root != ZERO_HASH {
            tracing::info!("All strike histories expired in this frame");
        }

        Ok((rewards_tree.root(), tree_cid.0, log_cid.0))
    }
}

impl ConsensusModule for PerformanceModule {
    type Report = CsFeeOracle::ReportData;

    const COMPATIBLE_CONTRACT_VERSION: u64 = 2;
    const COMPATIBLE_CONSENSUS_VERSION: u64 = 3;

    fn name(&self) -> &'static str {
        "performance"
    }

    fn report_contract(&self) -> &BaseOracleWrapper<DefaultProvider> {
        &self.ctx.cs_fee_oracle_base
    }

    async fn build_report(&self, blockstamp: &ReferenceBlockStamp) -> Result<Self::Report, Error> {
        let driver = ConsensusDriver::new(&self.ctx);
        let converter = driver
            .get_converter(self.report_contract(), &blockstamp.as_blockstamp())
            .await?;

        let last_processing_ref_slot = self
            .report_contract()
            .get_last_processing_ref_slot(blockstamp.block_hash)
            .await?;
        let (l_epoch, r_epoch) = self.current_frame_range(&converter, last_processing_ref_slot, blockstamp);

        // The collector is driven by this registration; reporting waits
        // until it has the whole range.
        self.store.set_epochs_demand(EPOCHS_DEMAND_CONSUMER, l_epoch, r_epoch)?;
        if !self.store.is_range_available(l_epoch, r_epoch)? {
            return Err(Error::DutyDataNotReady { l_epoch, r_epoch });
        }

        let consensus_version = self
            .report_contract()
            .get_consensus_version(blockstamp.block_hash)
            .await?;

        let mut state = State::load(&self.state_path);
        state.init_or_migrate(
            l_epoch,
            r_epoch,
            converter.frame_config.epochs_per_frame,
            consensus_version,
        )?;

        let registry = self.ctx.cc.get_validators(&blockstamp.as_blockstamp()).await?;
        for epoch in l_epoch..=r_epoch {
            let record = self
                .store
                .get_epoch(epoch)?
                .ok_or(Error::DutyDataNotReady { l_epoch, r_epoch })?;
            let assigned = registry
                .iter()
                .filter(|v| is_active_validator(&v.validator, epoch))
                .map(|v| v.index);
            state.fold_epoch(&record, assigned, converter.chain_config.slots_per_epoch)?;
        }
        state.validate_for_report(l_epoch, r_epoch)?;
        state.commit(&self.state_path)?;

        let last_report = LastReport::load(&self.ctx.csm, &self.ctx.storage, blockstamp.block_hash).await?;
        let frame_inputs = self
            .collect_frame_inputs(&state, blockstamp, &converter, &last_report)
            .await?;

        let result = distribution::calculate(&state, &frame_inputs, &last_report.rewards, &last_report.strikes)?;

        let (tree_root, tree_cid, log_cid) = self.publish_trees(&result, &last_report).await?;

        Ok(CsFeeOracle::ReportData {
            consensusVersion: alloy_primitives::U256::from(consensus_version),
            refSlot: alloy_primitives::U256::from(blockstamp.ref_slot),
            treeRoot: tree_root,
            treeCid: tree_cid,
            logCid: log_cid,
            distributed: result.total_rewards,
        })
    }

    async fn is_main_data_submitted(&self, blockstamp: &BlockStamp) -> Result<bool, Error> {
        let state = self.ctx.cs_fee_oracle.get_processing_state(blockstamp.block_hash).await?;
        Ok(state.report_processed)
    }

    async fn is_contract_reportable(&self, blockstamp: &BlockStamp) -> Result<bool, Error> {
        Ok(!self.is_main_data_submitted(blockstamp).await?)
    }

    async fn is_reporting_allowed(&self, _blockstamp: &ReferenceBlockStamp) -> Result<bool, Error> {
        Ok(true)
    }

    async fn submit_report_data(&self, report: Self::Report) -> Result<(), Error> {
        self.ctx
            .cs_fee_oracle
            .submit_report_data(report, Self::COMPATIBLE_CONTRACT_VERSION, self.ctx.dry_run)
            .await?;
        Ok(())
    }
}
