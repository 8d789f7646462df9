//! Hash-consensus participation: frame detection, report hash submission,
//! fast-lane ordering and the two-phase (hash, then data) protocol.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::keccak256;
use thiserror::Error;

use lido_oracle_client::blockstamp::{self, get_latest_blockstamp, get_reference_blockstamp};
use lido_oracle_client::execution::contracts::{BaseOracleWrapper, CurrentFrame, HashConsensusWrapper};
use lido_oracle_client::execution::{ContractError, DefaultProvider};
use lido_oracle_client::{consensus as cl, ipfs};
use lido_oracle_shared::converter::FrameConverter;
use lido_oracle_shared::types::{
    BlockStamp, ChainConfig, FrameConfig, Hash256, ReferenceBlockStamp, Slot, ZERO_HASH,
};

use crate::Web3Context;

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "Provided account is not part of the oracle committee and has no submit role. \
         For dry mode remove the member account from the configuration."
    )]
    IsNotMember,

    #[error(
        "Incompatible oracle version. Expected contract version {expected_contract}, \
         consensus version {expected_consensus}; got ({got_contract}, {got_consensus})"
    )]
    IncompatibleOracleVersion {
        expected_contract: u64,
        expected_consensus: u64,
        got_contract: u64,
        got_consensus: u64,
    },

    #[error(
        "The contract or consensus version differs between the latest block and the reference \
         blockstamp; processing the report could lead to unexpected behavior"
    )]
    ContractVersionMismatch,

    #[error("Contract chain config is not compatible with the beacon chain: {0}")]
    ChainConfigMismatch(String),

    #[error("Report invariant violated: {0}")]
    InvalidReport(String),

    #[error("Duty data for epochs [{l_epoch}; {r_epoch}] is not collected yet")]
    DutyDataNotReady { l_epoch: u64, r_epoch: u64 },

    #[error("Max available epoch to check is lower than the minimum epoch in the store. CL node is not synced")]
    ClNodeNotSynced,

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Client(#[from] cl::Error),

    #[error(transparent)]
    Blockstamp(#[from] blockstamp::Error),

    #[error(transparent)]
    Ipfs(#[from] ipfs::Error),

    #[error(transparent)]
    Store(#[from] crate::store::Error),

    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::Error),

    #[error(transparent)]
    Duties(#[from] lido_oracle_shared::duties::Error),

    #[error(transparent)]
    Merkle(#[from] lido_oracle_shared::merkle::Error),

    #[error(transparent)]
    State(#[from] crate::performance::state::StateError),

    #[error(transparent)]
    Distribution(#[from] crate::performance::distribution::DistributionError),

    #[error(transparent)]
    Vaults(#[from] crate::accounting::vaults::VaultsError),

    #[error(transparent)]
    SafeBorder(#[from] crate::safe_border::SafeBorderError),
}

/// What the main loop should wait for before calling the module again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleExecuteDelay {
    NextSlot,
    NextFinalizedEpoch,
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub is_report_member: bool,
    pub is_submit_member: bool,
    pub is_fast_lane: bool,
    pub last_report_ref_slot: Slot,
    pub fast_lane_length_slots: u64,
    pub current_frame_consensus_report: Hash256,
    pub current_frame_ref_slot: Slot,
    pub current_frame_member_report: Hash256,
    pub deadline_slot: Slot,
}

/// ABI encoding of a report tuple. The committed hash is
/// `keccak256(abi.encode(tuple))`.
pub trait ReportEncoding {
    fn abi_encode(&self) -> Vec<u8>;

    fn hash(&self) -> Hash256 {
        keccak256(self.abi_encode())
    }
}

/// One oracle module participating in hash consensus. The driver below is
/// generic over this trait; modules only supply report building and the
/// module-specific contract reads.
#[allow(async_fn_in_trait)]
pub trait ConsensusModule {
    type Report: ReportEncoding + std::fmt::Debug;

    const COMPATIBLE_CONTRACT_VERSION: u64;
    const COMPATIBLE_CONSENSUS_VERSION: u64;

    fn name(&self) -> &'static str;

    fn report_contract(&self) -> &BaseOracleWrapper<DefaultProvider>;

    async fn build_report(&self, blockstamp: &ReferenceBlockStamp) -> Result<Self::Report, Error>;

    async fn is_main_data_submitted(&self, blockstamp: &BlockStamp) -> Result<bool, Error>;

    async fn is_contract_reportable(&self, blockstamp: &BlockStamp) -> Result<bool, Error>;

    /// Last-line safety check before any transaction leaves the process.
    async fn is_reporting_allowed(&self, blockstamp: &ReferenceBlockStamp) -> Result<bool, Error>;

    async fn submit_report_data(&self, report: Self::Report) -> Result<(), Error>;
}

pub struct ConsensusDriver<'a> {
    ctx: &'a Web3Context,
}

impl<'a> ConsensusDriver<'a> {
    pub fn new(ctx: &'a Web3Context) -> Self {
        Self { ctx }
    }

    async fn consensus_contract(
        &self,
        oracle: &BaseOracleWrapper<DefaultProvider>,
        block_hash: Hash256,
    ) -> Result<HashConsensusWrapper<DefaultProvider>, Error> {
        let address = oracle.get_consensus_contract(block_hash).await?;
        Ok(HashConsensusWrapper::new(
            Arc::clone(&self.ctx.provider),
            address,
            Arc::new(self.ctx.metrics.services.execution_client.clone()),
        ))
    }

    pub async fn get_chain_config(
        &self,
        oracle: &BaseOracleWrapper<DefaultProvider>,
        blockstamp: &BlockStamp,
    ) -> Result<ChainConfig, Error> {
        let consensus = self.consensus_contract(oracle, blockstamp.block_hash).await?;
        Ok(consensus.get_chain_config(blockstamp.block_hash).await?)
    }

    pub async fn get_frame_config(
        &self,
        oracle: &BaseOracleWrapper<DefaultProvider>,
        blockstamp: &BlockStamp,
    ) -> Result<FrameConfig, Error> {
        let consensus = self.consensus_contract(oracle, blockstamp.block_hash).await?;
        Ok(consensus.get_frame_config(blockstamp.block_hash).await?)
    }

    pub async fn get_converter(
        &self,
        oracle: &BaseOracleWrapper<DefaultProvider>,
        blockstamp: &BlockStamp,
    ) -> Result<FrameConverter, Error> {
        Ok(FrameConverter::new(
            self.get_chain_config(oracle, blockstamp).await?,
            self.get_frame_config(oracle, blockstamp).await?,
        ))
    }

    /// The contract's chain config has to agree with the node the oracle
    /// observes; reporting against a different chain is never recoverable.
    pub async fn check_contract_configs(&self, oracle: &BaseOracleWrapper<DefaultProvider>) -> Result<(), Error> {
        let bs = get_latest_blockstamp(&self.ctx.cc, &cl::StateId::Head).await?;
        let config = self.get_chain_config(oracle, &bs).await?;

        let cc_spec = self.ctx.cc.get_config_spec().await?;
        let genesis = self.ctx.cc.get_genesis().await?;
        self.ctx.metrics.metadata.genesis_time.set(genesis.genesis_time as i64);

        if config.genesis_time != genesis.genesis_time
            || config.seconds_per_slot != cc_spec.seconds_per_slot
            || config.slots_per_epoch != cc_spec.slots_per_epoch
        {
            return Err(Error::ChainConfigMismatch(format!(
                "contract config: {config:?}, beacon chain: genesis_time={}, seconds_per_slot={}, slots_per_epoch={}",
                genesis.genesis_time, cc_spec.seconds_per_slot, cc_spec.slots_per_epoch
            )));
        }
        Ok(())
    }

    /// Before the initial epoch the contract reverts; the first frame is
    /// synthesized from the frame config, with the reference slot being the
    /// last slot before frame zero.
    pub async fn get_initial_or_current_frame(
        &self,
        oracle: &BaseOracleWrapper<DefaultProvider>,
        blockstamp: &BlockStamp,
    ) -> Result<CurrentFrame, Error> {
        let consensus = self.consensus_contract(oracle, blockstamp.block_hash).await?;
        match consensus.get_current_frame(blockstamp.block_hash).await {
            Ok(frame) => Ok(frame),
            Err(ContractError::InitialEpochIsYetToArrive) => {
                let converter = self.get_converter(oracle, blockstamp).await?;
                Ok(CurrentFrame {
                    ref_slot: converter.get_frame_first_slot(0) - 1,
                    report_processing_deadline_slot: converter.get_frame_last_slot(0),
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    pub async fn get_member_info(
        &self,
        oracle: &BaseOracleWrapper<DefaultProvider>,
        blockstamp: &BlockStamp,
    ) -> Result<MemberInfo, Error> {
        let current_frame = self.get_initial_or_current_frame(oracle, blockstamp).await?;
        let frame_config = self.get_frame_config(oracle, blockstamp).await?;

        // Defaults for dry mode.
        let mut is_member = true;
        let mut is_submit_member = true;
        let mut is_fast_lane = true;
        let mut last_report_ref_slot = 0;
        let mut current_frame_consensus_report = ZERO_HASH;
        let mut current_frame_member_report = ZERO_HASH;

        if let Some(account) = self.ctx.account {
            let consensus = self.consensus_contract(oracle, blockstamp.block_hash).await?;
            match consensus
                .get_consensus_state_for_member(account, blockstamp.block_hash)
                .await
            {
                Ok(state) => {
                    is_member = state.is_member;
                    is_fast_lane = state.is_fast_lane;
                    last_report_ref_slot = state.last_member_report_ref_slot;
                    current_frame_consensus_report = state.current_frame_consensus_report;
                    current_frame_member_report = state.current_frame_member_report;
                }
                Err(ContractError::InitialEpochIsYetToArrive) => {}
                Err(other) => return Err(other.into()),
            }

            is_submit_member = oracle.has_submit_data_role(account, blockstamp.block_hash).await?;

            if !is_member && !is_submit_member {
                return Err(Error::IsNotMember);
            }
        }

        let member_info = MemberInfo {
            is_report_member: is_member,
            is_submit_member,
            is_fast_lane,
            last_report_ref_slot,
            fast_lane_length_slots: frame_config.fast_lane_length_slots,
            current_frame_consensus_report,
            current_frame_ref_slot: current_frame.ref_slot,
            current_frame_member_report,
            deadline_slot: current_frame.report_processing_deadline_slot,
        };
        tracing::debug!(?member_info, "Fetched member info");

        let frame = &self.ctx.metrics.frame;
        frame.current_ref_slot.set(member_info.current_frame_ref_slot);
        frame.deadline_slot.set(member_info.deadline_slot);
        frame.last_report_ref_slot.set(member_info.last_report_ref_slot);
        for (flag, value) in [
            ("is_report_member", member_info.is_report_member),
            ("is_submit_member", member_info.is_submit_member),
            ("is_fast_lane", member_info.is_fast_lane),
        ] {
            frame.member_info.with_label_values(&[flag]).set(value as u64);
        }

        Ok(member_info)
    }

    /// The blockstamp a report for the current frame should be built
    /// against, or `None` when the frame is not reportable yet (or anymore).
    pub async fn get_blockstamp_for_report<M: ConsensusModule>(
        &self,
        module: &M,
        last_finalized: &BlockStamp,
    ) -> Result<Option<ReferenceBlockStamp>, Error> {
        let latest_blockstamp = self.latest_blockstamp().await?;

        if !module.is_contract_reportable(&latest_blockstamp).await? {
            tracing::info!(module = module.name(), "Contract is not reportable");
            return Ok(None);
        }

        let member_info = self.get_member_info(module.report_contract(), &latest_blockstamp).await?;

        if last_finalized.slot_number < member_info.current_frame_ref_slot {
            tracing::info!(module = module.name(), "Reference slot is not yet finalized");
            return Ok(None);
        }

        if latest_blockstamp.slot_number >= member_info.deadline_slot {
            tracing::info!(module = module.name(), "Deadline missed");
            return Ok(None);
        }

        let converter = self.get_converter(module.report_contract(), last_finalized).await?;
        let bs = get_reference_blockstamp(
            &self.ctx.cc,
            member_info.current_frame_ref_slot,
            converter.get_epoch_by_slot(member_info.current_frame_ref_slot),
            last_finalized.slot_number,
        )
        .await?;
        tracing::info!(module = module.name(), blockstamp = %bs, "Calculated blockstamp for report");
        Ok(Some(bs))
    }

    /// Whether the oracle can process the report at the reference blockstamp,
    /// or should idle waiting for a protocol upgrade. Versions above the
    /// compiled-in support are fatal.
    pub async fn check_compatibility<M: ConsensusModule>(
        &self,
        module: &M,
        blockstamp: &BlockStamp,
    ) -> Result<bool, Error> {
        let oracle = module.report_contract();
        let contract_version = oracle.get_contract_version(blockstamp.block_hash).await?;
        let consensus_version = oracle.get_consensus_version(blockstamp.block_hash).await?;

        if contract_version > M::COMPATIBLE_CONTRACT_VERSION || consensus_version > M::COMPATIBLE_CONSENSUS_VERSION {
            return Err(Error::IncompatibleOracleVersion {
                expected_contract: M::COMPATIBLE_CONTRACT_VERSION,
                expected_consensus: M::COMPATIBLE_CONSENSUS_VERSION,
                got_contract: contract_version,
                got_consensus: consensus_version,
            });
        }

        let contract_version_latest = oracle.get_contract_version_latest().await?;
        let consensus_version_latest = oracle.get_consensus_version_latest().await?;
        if contract_version != contract_version_latest || consensus_version != consensus_version_latest {
            return Err(Error::ContractVersionMismatch);
        }

        let ready_to_report = contract_version == M::COMPATIBLE_CONTRACT_VERSION
            && consensus_version == M::COMPATIBLE_CONSENSUS_VERSION;
        if !ready_to_report {
            tracing::info!(
                module = module.name(),
                expected_contract_version = M::COMPATIBLE_CONTRACT_VERSION,
                expected_consensus_version = M::COMPATIBLE_CONSENSUS_VERSION,
                actual_contract_version = contract_version_latest,
                actual_consensus_version = consensus_version_latest,
                "Oracle waits for contracts to be updated"
            );
        }
        Ok(ready_to_report)
    }

    /// Builds and sends the report for the current frame in two phases.
    pub async fn process_report<M: ConsensusModule>(
        &self,
        module: &M,
        blockstamp: &ReferenceBlockStamp,
    ) -> Result<(), Error> {
        let report = module.build_report(blockstamp).await?;
        tracing::info!(module = module.name(), ?report, "Built report");

        let report_hash = report.hash();
        tracing::info!(module = module.name(), hash = %report_hash, "Calculated report hash");

        // The report has to pass the module's own sanity checks before the
        // hash leaves the process - a committed hash cannot be retracted.
        if !module.is_reporting_allowed(blockstamp).await? {
            tracing::warn!(module = module.name(), "Reporting checks are not passed, report will not be sent");
            return Ok(());
        }

        self.process_report_hash(module, blockstamp, report_hash).await?;
        // Even if the hash transaction failed earlier we still check whether
        // data can be submitted for the current frame.
        self.process_report_data(module, blockstamp, report, report_hash).await
    }

    async fn latest_blockstamp(&self) -> Result<BlockStamp, Error> {
        let bs = get_latest_blockstamp(&self.ctx.cc, &cl::StateId::Head).await?;
        let meta = &self.ctx.metrics.metadata;
        meta.oracle_slot_number.with_label_values(&["head"]).set(bs.slot_number);
        meta.oracle_block_number.with_label_values(&["head"]).set(bs.block_number);
        Ok(bs)
    }

    async fn get_latest_data(
        &self,
        oracle: &BaseOracleWrapper<DefaultProvider>,
    ) -> Result<(BlockStamp, MemberInfo), Error> {
        let latest = self.latest_blockstamp().await?;
        let member_info = self.get_member_info(oracle, &latest).await?;
        Ok((latest, member_info))
    }

    async fn process_report_hash<M: ConsensusModule>(
        &self,
        module: &M,
        blockstamp: &ReferenceBlockStamp,
        report_hash: Hash256,
    ) -> Result<(), Error> {
        let (latest_blockstamp, member_info) = self.get_latest_data(module.report_contract()).await?;

        if !member_info.is_report_member {
            tracing::info!("Account can't submit report hash");
            return Ok(());
        }

        if member_info.current_frame_member_report == report_hash {
            tracing::info!("Account already submitted the provided hash");
            return Ok(());
        }

        if !member_info.is_fast_lane {
            if latest_blockstamp.slot_number < member_info.current_frame_ref_slot + member_info.fast_lane_length_slots
            {
                tracing::info!(
                    fast_lane_length_slots = member_info.fast_lane_length_slots,
                    "Member is not in the fast lane, report hash is postponed"
                );
                return Ok(());
            }

            if member_info.current_frame_consensus_report == report_hash {
                tracing::info!("Consensus reached with the provided hash");
                return Ok(());
            }
        }

        tracing::info!(consensus_version = M::COMPATIBLE_CONSENSUS_VERSION, "Sending report hash");
        let consensus = self
            .consensus_contract(module.report_contract(), latest_blockstamp.block_hash)
            .await?;
        consensus
            .submit_report(
                blockstamp.ref_slot,
                report_hash,
                M::COMPATIBLE_CONSENSUS_VERSION,
                self.ctx.dry_run,
            )
            .await?;
        Ok(())
    }

    async fn process_report_data<M: ConsensusModule>(
        &self,
        module: &M,
        blockstamp: &ReferenceBlockStamp,
        report: M::Report,
        report_hash: Hash256,
    ) -> Result<(), Error> {
        let (mut latest_blockstamp, member_info) = self.get_latest_data(module.report_contract()).await?;

        if member_info.current_frame_consensus_report == ZERO_HASH {
            tracing::info!("Quorum is not ready");
            return Ok(());
        }

        if member_info.current_frame_consensus_report != report_hash {
            tracing::error!(
                consensus_report_hash = %member_info.current_frame_consensus_report,
                report_hash = %report_hash,
                "Oracle's hash differs from the consensus report hash"
            );
            return Ok(());
        }

        if module.is_main_data_submitted(&latest_blockstamp).await? {
            tracing::info!("Main data already submitted");
            return Ok(());
        }

        let slots_to_sleep = self.get_slot_delay_before_data_submit(module, &latest_blockstamp).await?;
        if slots_to_sleep > 0 {
            let chain_config = self
                .get_chain_config(module.report_contract(), &blockstamp.as_blockstamp())
                .await?;
            tracing::info!(slots_to_sleep, "Sleeping before sending data");
            for _ in 0..slots_to_sleep {
                tokio::time::sleep(Duration::from_secs(chain_config.seconds_per_slot)).await;

                latest_blockstamp = self.latest_blockstamp().await?;
                if module.is_main_data_submitted(&latest_blockstamp).await? {
                    tracing::info!("Main data already submitted");
                    return Ok(());
                }
            }
        }

        if module.is_main_data_submitted(&latest_blockstamp).await? {
            tracing::info!("Main data already submitted");
            return Ok(());
        }

        tracing::info!(contract_version = M::COMPATIBLE_CONTRACT_VERSION, "Sending report data");
        // If data got submitted by someone else in between, the transaction
        // reverts locally; no extra status check is needed.
        module.submit_report_data(report).await
    }

    /// Off-chain fast-lane for report data: non-submit members take turns by
    /// their position in the committee list relative to the frame number.
    /// The member list order can change on-chain, which silently reshuffles
    /// the delays; the computed position is logged for that reason.
    async fn get_slot_delay_before_data_submit<M: ConsensusModule>(
        &self,
        module: &M,
        blockstamp: &BlockStamp,
    ) -> Result<u64, Error> {
        let member_info = self.get_member_info(module.report_contract(), blockstamp).await?;
        if member_info.is_submit_member {
            return Ok(0);
        }
        let Some(account) = self.ctx.account else {
            return Ok(0);
        };

        let consensus = self
            .consensus_contract(module.report_contract(), blockstamp.block_hash)
            .await?;
        let members = consensus.get_members(blockstamp.block_hash).await?;
        let member_position = members
            .iter()
            .position(|m| *m == account)
            .ok_or(Error::IsNotMember)? as u64;

        let converter = self.get_converter(module.report_contract(), blockstamp).await?;
        let current_frame_number = converter.get_frame_by_slot(blockstamp.slot_number);
        let committee_size = members.len() as u64;
        let current_position = current_frame_number % committee_size;

        let sleep_count = (member_position + committee_size - current_position) % committee_size;
        // 1 is the default delay for non-submit members.
        let total_delay = (1 + sleep_count) * self.ctx.submit_data_delay_in_slots;

        tracing::warn!(
            member_position,
            current_position,
            total_delay,
            "Calculated slots delay from the current committee order"
        );
        Ok(total_delay)
    }
}

/// One module invocation of the main loop: find a reportable frame, check
/// compatibility, build and submit.
pub async fn execute_consensus_module<M: ConsensusModule>(
    ctx: &Web3Context,
    module: &M,
    last_finalized: &BlockStamp,
) -> Result<ModuleExecuteDelay, Error> {
    let driver = ConsensusDriver::new(ctx);

    let Some(report_blockstamp) = driver.get_blockstamp_for_report(module, last_finalized).await? else {
        return Ok(ModuleExecuteDelay::NextFinalizedEpoch);
    };

    if !driver.check_compatibility(module, &report_blockstamp.as_blockstamp()).await? {
        return Ok(ModuleExecuteDelay::NextFinalizedEpoch);
    }

    driver.process_report(module, &report_blockstamp).await?;
    Ok(ModuleExecuteDelay::NextSlot)
}
