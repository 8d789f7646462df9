//! Typed wrappers over the protocol contracts. Every read is parameterized
//! by the block hash of the blockstamp it serves, so results are pinned to
//! the chain the oracle observed rather than whatever `latest` resolves to.

use std::sync::Arc;

use alloy::network::Ethereum;
use alloy::providers::Provider;
use alloy::sol;
use alloy_primitives::{Bytes, I256, U256};

use lido_oracle_shared::types::{Address, BlockNumber, ChainConfig, FrameConfig, Hash256, Slot, Wei};

use super::{block_id_by_hash, u256_to_u64, ContractError};
use crate::ipfs::Cid;
use crate::prometheus_metrics::{operations::execution_client as ops, Service};

sol! {
    #[sol(rpc)]
    interface LidoLocator {
        function lido() external view returns (address);
        function accountingOracle() external view returns (address);
        function validatorsExitBusOracle() external view returns (address);
        function withdrawalQueue() external view returns (address);
        function withdrawalVault() external view returns (address);
        function elRewardsVault() external view returns (address);
        function burner() external view returns (address);
        function stakingRouter() external view returns (address);
        function oracleDaemonConfig() external view returns (address);
        function oracleReportSanityChecker() external view returns (address);
        function vaultHub() external view returns (address);
        function lazyOracle() external view returns (address);
    }

    #[sol(rpc)]
    interface Lido {
        event ETHDistributed(
            uint256 indexed reportTimestamp,
            uint256 preCLBalance,
            uint256 postCLBalance,
            uint256 withdrawalsWithdrawn,
            uint256 executionLayerRewardsWithdrawn,
            uint256 postBufferedEther
        );
        event TokenRebased(
            uint256 indexed reportTimestamp,
            uint256 timeElapsed,
            uint256 preTotalShares,
            uint256 preTotalEther,
            uint256 postTotalShares,
            uint256 postTotalEther,
            uint256 sharesMintedAsFees
        );

        function getBufferedEther() external view returns (uint256);
        function getTotalPooledEther() external view returns (uint256);
        function getTotalShares() external view returns (uint256);
        function getBeaconStat() external view returns (
            uint256 depositedValidators,
            uint256 beaconValidators,
            uint256 beaconBalance
        );
    }

    #[sol(rpc)]
    interface NodeOperatorRegistry {
        function getNodeOperatorsCount() external view returns (uint256);
        function getTotalSigningKeyCount(uint256 _nodeOperatorId) external view returns (uint256);
        function getSigningKeys(uint256 _nodeOperatorId, uint256 _offset, uint256 _limit)
            external view returns (bytes memory pubkeys, bytes memory signatures, bool[] memory used);
        function getNodeOperatorSummary(uint256 _nodeOperatorId) external view returns (
            uint256 targetLimitMode,
            uint256 targetValidatorsCount,
            uint256 stuckValidatorsCount,
            uint256 refundedValidatorsCount,
            uint256 stuckPenaltyEndTimestamp,
            uint256 totalExitedValidators,
            uint256 totalDepositedValidators,
            uint256 depositableValidatorsCount
        );
    }

    #[sol(rpc)]
    interface Burner {
        function getSharesRequestedToBurn() external view returns (uint256 coverShares, uint256 nonCoverShares);
    }

    #[sol(rpc)]
    interface HashConsensus {
        function getChainConfig() external view returns (
            uint256 slotsPerEpoch,
            uint256 secondsPerSlot,
            uint256 genesisTime
        );
        function getFrameConfig() external view returns (
            uint256 initialEpoch,
            uint256 epochsPerFrame,
            uint256 fastLaneLengthSlots
        );
        function getCurrentFrame() external view returns (
            uint256 refSlot,
            uint256 reportProcessingDeadlineSlot
        );
        function getInitialRefSlot() external view returns (uint256);
        function getMembers() external view returns (
            address[] memory addresses,
            uint256[] memory lastReportedRefSlots
        );
        function getConsensusStateForMember(address addr) external view returns (
            uint256 currentFrameRefSlot,
            bytes32 currentFrameConsensusReport,
            bool isMember,
            bool isFastLane,
            bool canReport,
            uint256 lastMemberReportRefSlot,
            bytes32 currentFrameMemberReport
        );
        function submitReport(uint256 slot, bytes32 report, uint256 consensusVersion) external;
    }

    #[sol(rpc)]
    interface BaseOracle {
        function getConsensusContract() external view returns (address);
        function getConsensusVersion() external view returns (uint256);
        function getContractVersion() external view returns (uint256);
        function getLastProcessingRefSlot() external view returns (uint256);
        function SUBMIT_DATA_ROLE() external view returns (bytes32);
        function hasRole(bytes32 role, address account) external view returns (bool);
    }

    #[sol(rpc)]
    interface AccountingOracle {
        #[derive(Debug)]
        struct ReportData {
            uint256 consensusVersion;
            uint256 refSlot;
            uint256 numValidators;
            uint256 clBalanceGwei;
            uint256[] stakingModuleIdsWithNewlyExitedValidators;
            uint256[] numExitedValidatorsByStakingModule;
            uint256 withdrawalVaultBalance;
            uint256 elRewardsVaultBalance;
            uint256 sharesRequestedToBurn;
            uint256[] withdrawalFinalizationBatches;
            uint256 simulatedShareRate;
            bool isBunkerMode;
            bytes32 vaultsTreeRoot;
            string vaultsTreeCid;
            uint256 extraDataFormat;
            bytes32 extraDataHash;
            uint256 extraDataItemsCount;
        }

        function submitReportData(ReportData calldata data, uint256 contractVersion) external;
        function getProcessingState() external view returns (
            uint256 currentFrameRefSlot,
            uint256 processingDeadlineTime,
            bytes32 mainDataHash,
            bool mainDataSubmitted,
            bytes32 extraDataHash,
            uint256 extraDataFormat,
            bool extraDataSubmitted,
            uint256 extraDataItemsCount,
            uint256 extraDataItemsSubmitted
        );
    }

    #[sol(rpc)]
    interface ExitBusOracle {
        #[derive(Debug)]
        struct ReportData {
            uint256 consensusVersion;
            uint256 refSlot;
            uint256 requestsCount;
            uint256 dataFormat;
            bytes data;
        }

        function submitReportData(ReportData calldata data, uint256 contractVersion) external;
        function getProcessingState() external view returns (
            uint256 currentFrameRefSlot,
            uint256 processingDeadlineTime,
            bytes32 dataHash,
            bool dataSubmitted,
            uint256 dataFormat,
            uint256 requestsCount,
            uint256 requestsSubmitted
        );
        function isPaused() external view returns (bool);

        event ValidatorExitRequest(
            uint256 indexed stakingModuleId,
            uint256 indexed nodeOperatorId,
            uint256 indexed validatorIndex,
            bytes validatorPubkey,
            uint256 timestamp
        );
    }

    #[sol(rpc)]
    interface CsFeeOracle {
        #[derive(Debug)]
        struct ReportData {
            uint256 consensusVersion;
            uint256 refSlot;
            bytes32 treeRoot;
            string treeCid;
            string logCid;
            uint256 distributed;
        }

        function submitReportData(ReportData calldata data, uint256 contractVersion) external;
        function getProcessingState() external view returns (
            uint256 currentFrameRefSlot,
            uint256 processingDeadlineTime,
            bytes32 reportHash,
            bool reportProcessed
        );
    }

    #[sol(rpc)]
    interface WithdrawalQueue {
        struct WithdrawalRequestStatus {
            uint256 amountOfStETH;
            uint256 amountOfShares;
            address owner;
            uint256 timestamp;
            bool isFinalized;
            bool isClaimed;
        }

        function unfinalizedStETH() external view returns (uint256);
        function bunkerModeSinceTimestamp() external view returns (uint256);
        function isBunkerModeActive() external view returns (bool);
        function getLastRequestId() external view returns (uint256);
        function getLastFinalizedRequestId() external view returns (uint256);
        function getWithdrawalStatus(uint256[] calldata _requestIds)
            external view returns (WithdrawalRequestStatus[] memory statuses);
        function isPaused() external view returns (bool);
    }

    #[sol(rpc)]
    interface OracleReportSanityChecker {
        struct LimitsList {
            uint256 exitedValidatorsPerDayLimit;
            uint256 appearedValidatorsPerDayLimit;
            uint256 annualBalanceIncreaseBPLimit;
            uint256 simulatedShareRateDeviationBPLimit;
            uint256 maxValidatorExitRequestsPerReport;
            uint256 maxItemsPerExtraDataTransaction;
            uint256 maxNodeOperatorsPerExtraDataItem;
            uint256 requestTimestampMargin;
            uint256 maxPositiveTokenRebase;
            uint256 initialSlashingAmountPWei;
            uint256 inactivityPenaltiesAmountPWei;
            uint256 clBalanceOraclesErrorUpperBPLimit;
        }

        function getOracleReportLimits() external view returns (LimitsList memory);
    }

    #[sol(rpc)]
    interface OracleDaemonConfig {
        function get(string calldata _key) external view returns (bytes memory);
    }

    #[sol(rpc)]
    interface StakingRouter {
        struct StakingModule {
            uint24 id;
            address stakingModuleAddress;
            uint16 stakingModuleFee;
            uint16 treasuryFee;
            uint16 stakeShareLimit;
            uint8 status;
            string name;
            uint64 lastDepositAt;
            uint256 lastDepositBlock;
            uint256 exitedValidatorsCount;
            uint16 priorityExitShareThreshold;
            uint64 maxDepositsPerBlock;
            uint64 minDepositBlockDistance;
        }

        function getStakingModules() external view returns (StakingModule[] memory res);
        function getStakingModuleSummary(uint256 _stakingModuleId) external view returns (
            uint256 totalExitedValidators,
            uint256 totalDepositedValidators,
            uint256 depositableValidatorsCount
        );
    }

    #[sol(rpc)]
    interface VaultHub {
        event MintedSharesOnVault(address indexed vault, uint256 amountOfShares, uint256 lockedAmount);
        event BurnedSharesOnVault(address indexed vault, uint256 amountOfShares);
        event VaultFeesUpdated(
            address indexed vault,
            uint256 preInfraFeeBP,
            uint256 infraFeeBP,
            uint256 preLiquidityFeeBP,
            uint256 liquidityFeeBP,
            uint256 preReservationFeeBP,
            uint256 reservationFeeBP
        );
        event VaultRebalanced(address indexed vault, uint256 sharesBurned, uint256 etherWithdrawn);
        event BadDebtSocialized(address indexed vaultDonor, address indexed vaultAcceptor, uint256 badDebtShares);
        event BadDebtWrittenOffToBeInternalized(address indexed vault, uint256 badDebtShares);
        event VaultConnected(
            address indexed vault,
            uint256 shareLimit,
            uint256 reserveRatioBP,
            uint256 forcedRebalanceThresholdBP,
            uint256 infraFeeBP,
            uint256 liquidityFeeBP,
            uint256 reservationFeeBP
        );
    }

    #[sol(rpc)]
    interface LazyOracle {
        struct VaultInfo {
            address vault;
            uint256 aggregatedBalance;
            int256 inOutDelta;
            bytes32 withdrawalCredentials;
            uint256 liabilityShares;
            uint256 maxLiabilityShares;
            uint256 mintableStETH;
            uint256 shareLimit;
            uint256 reserveRatioBP;
            uint256 forcedRebalanceThresholdBP;
            uint256 infraFeeBP;
            uint256 liquidityFeeBP;
            uint256 reservationFeeBP;
            bool pendingDisconnect;
        }

        function vaultsCount() external view returns (uint256);
        function batchVaultsInfo(uint256 _offset, uint256 _limit) external view returns (VaultInfo[] memory);
        function latestReportData() external view returns (
            uint256 timestamp,
            uint256 refSlot,
            bytes32 treeRoot,
            string memory reportCid
        );
    }

    #[sol(rpc)]
    interface CsModule {
        function getNodeOperatorsCount() external view returns (uint256);
        function getSigningKeys(uint256 nodeOperatorId, uint256 startIndex, uint256 keysCount)
            external view returns (bytes memory);
        function getNodeOperatorTotalDepositedKeys(uint256 nodeOperatorId) external view returns (uint256);
        function accounting() external view returns (address);
        function PARAMETERS_REGISTRY() external view returns (address);
    }

    #[sol(rpc)]
    interface CsAccounting {
        function getBondCurveId(uint256 nodeOperatorId) external view returns (uint256);
        function feeDistributor() external view returns (address);
    }

    #[sol(rpc)]
    interface CsFeeDistributor {
        function pendingSharesToDistribute() external view returns (uint256);
        function treeRoot() external view returns (bytes32);
        function treeCid() external view returns (string memory);
        function logCid() external view returns (string memory);
    }

    #[sol(rpc)]
    interface CsStrikes {
        function treeRoot() external view returns (bytes32);
        function treeCid() external view returns (string memory);
    }

    #[sol(rpc)]
    interface CsParametersRegistry {
        struct KeyNumberValueInterval {
            uint256 minKeyNumber;
            uint256 value;
        }

        function getPerformanceCoefficients(uint256 curveId) external view returns (
            uint256 attestationsWeight,
            uint256 blocksWeight,
            uint256 syncWeight
        );
        function getPerformanceLeewayData(uint256 curveId)
            external view returns (KeyNumberValueInterval[] memory);
        function getRewardShareData(uint256 curveId)
            external view returns (KeyNumberValueInterval[] memory);
        function getStrikesParams(uint256 curveId) external view returns (uint256 lifetime, uint256 threshold);
    }
}

/// Member state of the hash-consensus committee, observed at a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberConsensusState {
    pub current_frame_ref_slot: Slot,
    pub current_frame_consensus_report: Hash256,
    pub is_member: bool,
    pub is_fast_lane: bool,
    pub can_report: bool,
    pub last_member_report_ref_slot: Slot,
    pub current_frame_member_report: Hash256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentFrame {
    pub ref_slot: Slot,
    pub report_processing_deadline_slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultInfo {
    pub vault: Address,
    pub aggregated_balance: Wei,
    pub in_out_delta: I256,
    pub withdrawal_credentials: Hash256,
    pub liability_shares: U256,
    pub max_liability_shares: U256,
    pub mintable_st_eth: U256,
    pub share_limit: U256,
    pub reserve_ratio_bp: u64,
    pub forced_rebalance_threshold_bp: u64,
    pub infra_fee_bp: u64,
    pub liquidity_fee_bp: u64,
    pub reservation_fee_bp: u64,
    pub pending_disconnect: bool,
}

impl TryFrom<LazyOracle::VaultInfo> for VaultInfo {
    type Error = ContractError;

    fn try_from(value: LazyOracle::VaultInfo) -> Result<Self, Self::Error> {
        Ok(Self {
            vault: value.vault,
            aggregated_balance: value.aggregatedBalance,
            in_out_delta: value.inOutDelta,
            withdrawal_credentials: value.withdrawalCredentials,
            liability_shares: value.liabilityShares,
            max_liability_shares: value.maxLiabilityShares,
            mintable_st_eth: value.mintableStETH,
            share_limit: value.shareLimit,
            reserve_ratio_bp: u256_to_u64(value.reserveRatioBP)?,
            forced_rebalance_threshold_bp: u256_to_u64(value.forcedRebalanceThresholdBP)?,
            infra_fee_bp: u256_to_u64(value.infraFeeBP)?,
            liquidity_fee_bp: u256_to_u64(value.liquidityFeeBP)?,
            reservation_fee_bp: u256_to_u64(value.reservationFeeBP)?,
            pending_disconnect: value.pendingDisconnect,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainVaultReportData {
    pub timestamp: u64,
    pub ref_slot: Slot,
    pub tree_root: Hash256,
    pub report_cid: Cid,
}

/// One vault-hub event with its position in the chain. Ordering is by
/// `(block_number, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultEvent {
    pub block_number: BlockNumber,
    pub log_index: u64,
    pub kind: VaultEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEventKind {
    MintedShares { vault: Address, amount_of_shares: U256 },
    BurnedShares { vault: Address, amount_of_shares: U256 },
    FeesUpdated { vault: Address, pre_liquidity_fee_bp: u64 },
    Rebalanced { vault: Address, shares_burned: U256 },
    BadDebtSocialized { vault_donor: Address, vault_acceptor: Address, bad_debt_shares: U256 },
    BadDebtWrittenOff { vault: Address, bad_debt_shares: U256 },
    Connected { vault: Address },
}

impl VaultEventKind {
    /// Vaults whose fee walk has to visit this event.
    pub fn touched_vaults(&self) -> Vec<Address> {
        match self {
            VaultEventKind::MintedShares { vault, .. }
            | VaultEventKind::BurnedShares { vault, .. }
            | VaultEventKind::FeesUpdated { vault, .. }
            | VaultEventKind::Rebalanced { vault, .. }
            | VaultEventKind::BadDebtWrittenOff { vault, .. }
            | VaultEventKind::Connected { vault } => vec![*vault],
            VaultEventKind::BadDebtSocialized {
                vault_donor,
                vault_acceptor,
                ..
            } => vec![*vault_donor, *vault_acceptor],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNumberValueInterval {
    pub min_key_number: u64,
    pub value_bp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrikesParams {
    pub lifetime: u64,
    pub threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurveParams {
    pub perf_coeffs: lido_oracle_shared::duties::PerformanceCoefficients,
    pub perf_leeway_data: Vec<KeyNumberValueInterval>,
    pub reward_share_data: Vec<KeyNumberValueInterval>,
    pub strikes_params: StrikesParams,
}

fn to_intervals(raw: Vec<CsParametersRegistry::KeyNumberValueInterval>) -> Result<Vec<KeyNumberValueInterval>, ContractError> {
    raw.into_iter()
        .map(|i| {
            Ok(KeyNumberValueInterval {
                min_key_number: u256_to_u64(i.minKeyNumber)?,
                value_bp: u256_to_u64(i.value)?,
            })
        })
        .collect()
}

macro_rules! instrumented {
    ($self:expr, $body:expr) => {
        $self
            .metrics
            .run_with_metrics_and_logs_async(ops::CONTRACT_CALL, || async { $body })
            .await
    };
}

pub struct LidoLocatorWrapper<P: Provider<Ethereum> + Clone> {
    contract: LidoLocator::LidoLocatorInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> LidoLocatorWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: LidoLocator::LidoLocatorInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn lido(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.lido().call().await?))
    }

    pub async fn accounting_oracle(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.accountingOracle().call().await?))
    }

    pub async fn validators_exit_bus_oracle(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.validatorsExitBusOracle().call().await?))
    }

    pub async fn withdrawal_queue(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.withdrawalQueue().call().await?))
    }

    pub async fn withdrawal_vault(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.withdrawalVault().call().await?))
    }

    pub async fn el_rewards_vault(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.elRewardsVault().call().await?))
    }

    pub async fn burner(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.burner().call().await?))
    }

    pub async fn staking_router(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.stakingRouter().call().await?))
    }

    pub async fn oracle_daemon_config(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.oracleDaemonConfig().call().await?))
    }

    pub async fn oracle_report_sanity_checker(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.oracleReportSanityChecker().call().await?))
    }

    pub async fn vault_hub(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.vaultHub().call().await?))
    }

    pub async fn lazy_oracle(&self) -> Result<Address, ContractError> {
        instrumented!(self, Ok(self.contract.lazyOracle().call().await?))
    }
}

pub struct LidoWrapper<P: Provider<Ethereum> + Clone> {
    contract: Lido::LidoInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> LidoWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: Lido::LidoInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_buffered_ether(&self, block_hash: Hash256) -> Result<Wei, ContractError> {
        instrumented!(
            self,
            Ok(self.contract.getBufferedEther().block(block_id_by_hash(block_hash)).call().await?)
        )
    }

    pub async fn get_total_pooled_ether(&self, block_hash: Hash256) -> Result<Wei, ContractError> {
        instrumented!(
            self,
            Ok(self
                .contract
                .getTotalPooledEther()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?)
        )
    }

    pub async fn get_total_shares(&self, block_hash: Hash256) -> Result<U256, ContractError> {
        instrumented!(
            self,
            Ok(self.contract.getTotalShares().block(block_id_by_hash(block_hash)).call().await?)
        )
    }

    pub async fn get_beacon_stat(&self, block_hash: Hash256) -> Result<(u64, u64, Wei), ContractError> {
        instrumented!(self, {
            let stat = self
                .contract
                .getBeaconStat()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok((
                u256_to_u64(stat.depositedValidators)?,
                u256_to_u64(stat.beaconValidators)?,
                stat.beaconBalance,
            ))
        })
    }

    /// Rebase history over a block range, pairing `ETHDistributed` balance
    /// movements with `TokenRebased` elapsed time by report timestamp.
    pub async fn get_rebase_events(
        &self,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<Vec<RebaseEvent>, ContractError> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_EVENTS, || async {
                let distributed = self
                    .contract
                    .ETHDistributed_filter()
                    .from_block(from_block)
                    .to_block(to_block)
                    .query()
                    .await?;
                let rebased = self
                    .contract
                    .TokenRebased_filter()
                    .from_block(from_block)
                    .to_block(to_block)
                    .query()
                    .await?;

                let time_by_report: std::collections::HashMap<U256, U256> = rebased
                    .into_iter()
                    .map(|(event, _)| (event.reportTimestamp, event.timeElapsed))
                    .collect();

                let mut events = Vec::new();
                for (event, _) in distributed {
                    let Some(time_elapsed) = time_by_report.get(&event.reportTimestamp) else {
                        continue;
                    };
                    events.push(RebaseEvent {
                        pre_cl_balance: event.preCLBalance,
                        post_cl_balance: event.postCLBalance,
                        withdrawals_withdrawn: event.withdrawalsWithdrawn,
                        el_rewards: event.executionLayerRewardsWithdrawn,
                        time_elapsed: u256_to_u64(*time_elapsed)?,
                    });
                }
                Ok(events)
            })
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseEvent {
    pub pre_cl_balance: Wei,
    pub post_cl_balance: Wei,
    pub withdrawals_withdrawn: Wei,
    pub el_rewards: Wei,
    pub time_elapsed: u64,
}

pub struct BurnerWrapper<P: Provider<Ethereum> + Clone> {
    contract: Burner::BurnerInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> BurnerWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: Burner::BurnerInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_shares_requested_to_burn(&self, block_hash: Hash256) -> Result<U256, ContractError> {
        instrumented!(self, {
            let result = self
                .contract
                .getSharesRequestedToBurn()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(result.coverShares + result.nonCoverShares)
        })
    }
}

pub struct HashConsensusWrapper<P: Provider<Ethereum> + Clone> {
    contract: HashConsensus::HashConsensusInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> HashConsensusWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: HashConsensus::HashConsensusInstance::new(address, provider),
            metrics,
        }
    }

    pub fn address(&self) -> &Address {
        self.contract.address()
    }

    pub async fn get_chain_config(&self, block_hash: Hash256) -> Result<ChainConfig, ContractError> {
        instrumented!(self, {
            let result = self
                .contract
                .getChainConfig()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(ChainConfig {
                slots_per_epoch: u256_to_u64(result.slotsPerEpoch)?,
                seconds_per_slot: u256_to_u64(result.secondsPerSlot)?,
                genesis_time: u256_to_u64(result.genesisTime)?,
            })
        })
    }

    pub async fn get_frame_config(&self, block_hash: Hash256) -> Result<FrameConfig, ContractError> {
        instrumented!(self, {
            let result = self
                .contract
                .getFrameConfig()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(FrameConfig {
                initial_epoch: u256_to_u64(result.initialEpoch)?,
                epochs_per_frame: u256_to_u64(result.epochsPerFrame)?,
                fast_lane_length_slots: u256_to_u64(result.fastLaneLengthSlots)?,
            })
        })
    }

    /// Reverts with `InitialEpochIsYetToArrive` before the initial frame;
    /// the caller synthesizes the pre-initial frame from the frame config.
    pub async fn get_current_frame(&self, block_hash: Hash256) -> Result<CurrentFrame, ContractError> {
        instrumented!(self, {
            let result = self
                .contract
                .getCurrentFrame()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(CurrentFrame {
                ref_slot: u256_to_u64(result.refSlot)?,
                report_processing_deadline_slot: u256_to_u64(result.reportProcessingDeadlineSlot)?,
            })
        })
    }

    pub async fn get_members(&self, block_hash: Hash256) -> Result<Vec<Address>, ContractError> {
        instrumented!(self, {
            let result = self
                .contract
                .getMembers()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(result.addresses)
        })
    }

    pub async fn get_consensus_state_for_member(
        &self,
        member: Address,
        block_hash: Hash256,
    ) -> Result<MemberConsensusState, ContractError> {
        instrumented!(self, {
            let result = self
                .contract
                .getConsensusStateForMember(member)
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(MemberConsensusState {
                current_frame_ref_slot: u256_to_u64(result.currentFrameRefSlot)?,
                current_frame_consensus_report: result.currentFrameConsensusReport,
                is_member: result.isMember,
                is_fast_lane: result.isFastLane,
                can_report: result.canReport,
                last_member_report_ref_slot: u256_to_u64(result.lastMemberReportRefSlot)?,
                current_frame_member_report: result.currentFrameMemberReport,
            })
        })
    }

    pub async fn submit_report(
        &self,
        ref_slot: Slot,
        report_hash: Hash256,
        consensus_version: u64,
        dry_run: bool,
    ) -> Result<(), ContractError> {
        let tx_builder = self
            .contract
            .submitReport(U256::from(ref_slot), report_hash, U256::from(consensus_version));

        // Preflight surfaces revert reasons before gas is spent, and is all
        // that runs in dry mode.
        tx_builder.call().await?;
        if dry_run {
            tracing::info!(ref_slot, report_hash = %report_hash, "Dry run: skipping submitReport transaction");
            return Ok(());
        }

        self.metrics
            .run_with_metrics_and_logs_async(ops::SUBMIT_TX, || async {
                let pending = tx_builder.send().await?;
                let receipt = pending.get_receipt().await?;
                if !receipt.status() {
                    return Err(ContractError::TransactionReverted(format!(
                        "submitReport tx {:#x}",
                        receipt.transaction_hash
                    )));
                }
                tracing::info!(tx = %receipt.transaction_hash, ref_slot, "Submitted report hash");
                Ok(())
            })
            .await
    }
}

pub struct WithdrawalQueueWrapper<P: Provider<Ethereum> + Clone> {
    contract: WithdrawalQueue::WithdrawalQueueInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> WithdrawalQueueWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: WithdrawalQueue::WithdrawalQueueInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn unfinalized_steth(&self, block_hash: Hash256) -> Result<Wei, ContractError> {
        instrumented!(
            self,
            Ok(self
                .contract
                .unfinalizedStETH()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?)
        )
    }

    pub async fn bunker_mode_since_timestamp(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let ts = self
                .contract
                .bunkerModeSinceTimestamp()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(ts)
        })
    }

    pub async fn is_bunker_mode_active(&self, block_hash: Hash256) -> Result<bool, ContractError> {
        instrumented!(
            self,
            Ok(self
                .contract
                .isBunkerModeActive()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?)
        )
    }

    pub async fn get_last_finalized_request_id(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let id = self
                .contract
                .getLastFinalizedRequestId()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(id)
        })
    }

    pub async fn get_last_request_id(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let id = self
                .contract
                .getLastRequestId()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(id)
        })
    }

    /// Timestamp of a single withdrawal request.
    pub async fn get_withdrawal_request_timestamp(
        &self,
        request_id: u64,
        block_hash: Hash256,
    ) -> Result<u64, ContractError> {
        instrumented!(self, {
            let statuses = self
                .contract
                .getWithdrawalStatus(vec![U256::from(request_id)])
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            let status = statuses
                .first()
                .ok_or_else(|| ContractError::Rejection(format!("no status for request {request_id}")))?;
            u256_to_u64(status.timestamp)
        })
    }

    pub async fn is_paused(&self, block_hash: Hash256) -> Result<bool, ContractError> {
        instrumented!(
            self,
            Ok(self.contract.isPaused().block(block_id_by_hash(block_hash)).call().await?)
        )
    }
}

pub struct SanityCheckerWrapper<P: Provider<Ethereum> + Clone> {
    contract: OracleReportSanityChecker::OracleReportSanityCheckerInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> SanityCheckerWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: OracleReportSanityChecker::OracleReportSanityCheckerInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_request_timestamp_margin(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let limits = self
                .contract
                .getOracleReportLimits()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(limits.requestTimestampMargin)
        })
    }
}

pub mod daemon_config_keys {
    pub const FINALIZATION_MAX_NEGATIVE_REBASE_EPOCH_SHIFT: &str = "FINALIZATION_MAX_NEGATIVE_REBASE_EPOCH_SHIFT";
    pub const SLASHING_RESERVE_WE_LEFT_SHIFT: &str = "SLASHING_RESERVE_WE_LEFT_SHIFT";
    pub const SLASHING_RESERVE_WE_RIGHT_SHIFT: &str = "SLASHING_RESERVE_WE_RIGHT_SHIFT";
    pub const PREDICTION_DURATION_IN_SLOTS: &str = "PREDICTION_DURATION_IN_SLOTS";
    pub const VALIDATOR_DELAYED_TIMEOUT_IN_SLOTS: &str = "VALIDATOR_DELAYED_TIMEOUT_IN_SLOTS";
}

pub struct OracleDaemonConfigWrapper<P: Provider<Ethereum> + Clone> {
    contract: OracleDaemonConfig::OracleDaemonConfigInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> OracleDaemonConfigWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: OracleDaemonConfig::OracleDaemonConfigInstance::new(address, provider),
            metrics,
        }
    }

    /// Values are stored as raw big-endian bytes.
    pub async fn get_u64(&self, key: &str, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let raw: Bytes = self
                .contract
                .get(key.to_owned())
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            if raw.len() > 8 {
                let value = U256::try_from_be_slice(&raw)
                    .ok_or_else(|| ContractError::ValueOutOfRange(format!("daemon config {key}")))?;
                return u256_to_u64(value);
            }
            let mut buf = [0u8; 8];
            buf[8 - raw.len()..].copy_from_slice(&raw);
            Ok(u64::from_be_bytes(buf))
        })
    }
}

pub struct StakingRouterWrapper<P: Provider<Ethereum> + Clone> {
    contract: StakingRouter::StakingRouterInstance<Arc<P>>,
    metrics: Arc<Service>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingModuleSummary {
    pub id: u64,
    pub address: Address,
    pub exited_validators_count: u64,
    pub priority_exit_share_threshold: u64,
    pub name: String,
}

impl<P: Provider<Ethereum> + Clone> StakingRouterWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: StakingRouter::StakingRouterInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_staking_modules(&self, block_hash: Hash256) -> Result<Vec<StakingModuleSummary>, ContractError> {
        instrumented!(self, {
            let modules = self
                .contract
                .getStakingModules()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            modules
                .into_iter()
                .map(|m| {
                    Ok(StakingModuleSummary {
                        id: m.id.to::<u64>(),
                        address: m.stakingModuleAddress,
                        exited_validators_count: u256_to_u64(m.exitedValidatorsCount)?,
                        priority_exit_share_threshold: m.priorityExitShareThreshold as u64,
                        name: m.name,
                    })
                })
                .collect()
        })
    }

    /// Aggregate exited/deposited counters of one module's registry.
    pub async fn get_staking_module_summary(
        &self,
        staking_module_id: u64,
        block_hash: Hash256,
    ) -> Result<(u64, u64), ContractError> {
        instrumented!(self, {
            let summary = self
                .contract
                .getStakingModuleSummary(U256::from(staking_module_id))
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok((
                u256_to_u64(summary.totalExitedValidators)?,
                u256_to_u64(summary.totalDepositedValidators)?,
            ))
        })
    }
}

pub struct VaultHubWrapper<P: Provider<Ethereum> + Clone> {
    contract: VaultHub::VaultHubInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> VaultHubWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: VaultHub::VaultHubInstance::new(address, provider),
            metrics,
        }
    }

    /// All fee-relevant vault events in `[from_block, to_block]`, sorted by
    /// `(block_number, log_index)`.
    pub async fn get_vault_events(
        &self,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<Vec<VaultEvent>, ContractError> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_EVENTS, || async {
                let mut events: Vec<VaultEvent> = Vec::new();

                macro_rules! collect {
                    ($filter:expr, $to_kind:expr) => {
                        for (event, log) in $filter.from_block(from_block).to_block(to_block).query().await? {
                            events.push(VaultEvent {
                                block_number: log.block_number.unwrap_or_default(),
                                log_index: log.log_index.unwrap_or_default(),
                                kind: $to_kind(event)?,
                            });
                        }
                    };
                }

                collect!(self.contract.MintedSharesOnVault_filter(), |e: VaultHub::MintedSharesOnVault| {
                    Ok::<_, ContractError>(VaultEventKind::MintedShares {
                        vault: e.vault,
                        amount_of_shares: e.amountOfShares,
                    })
                });
                collect!(self.contract.BurnedSharesOnVault_filter(), |e: VaultHub::BurnedSharesOnVault| {
                    Ok::<_, ContractError>(VaultEventKind::BurnedShares {
                        vault: e.vault,
                        amount_of_shares: e.amountOfShares,
                    })
                });
                collect!(self.contract.VaultFeesUpdated_filter(), |e: VaultHub::VaultFeesUpdated| {
                    Ok::<_, ContractError>(VaultEventKind::FeesUpdated {
                        vault: e.vault,
                        pre_liquidity_fee_bp: u256_to_u64(e.preLiquidityFeeBP)?,
                    })
                });
                collect!(self.contract.VaultRebalanced_filter(), |e: VaultHub::VaultRebalanced| {
                    Ok::<_, ContractError>(VaultEventKind::Rebalanced {
                        vault: e.vault,
                        shares_burned: e.sharesBurned,
                    })
                });
                collect!(self.contract.BadDebtSocialized_filter(), |e: VaultHub::BadDebtSocialized| {
                    Ok::<_, ContractError>(VaultEventKind::BadDebtSocialized {
                        vault_donor: e.vaultDonor,
                        vault_acceptor: e.vaultAcceptor,
                        bad_debt_shares: e.badDebtShares,
                    })
                });
                collect!(
                    self.contract.BadDebtWrittenOffToBeInternalized_filter(),
                    |e: VaultHub::BadDebtWrittenOffToBeInternalized| {
                        Ok::<_, ContractError>(VaultEventKind::BadDebtWrittenOff {
                            vault: e.vault,
                            bad_debt_shares: e.badDebtShares,
                        })
                    }
                );
                collect!(self.contract.VaultConnected_filter(), |e: VaultHub::VaultConnected| {
                    Ok::<_, ContractError>(VaultEventKind::Connected { vault: e.vault })
                });

                events.sort_by_key(|e| (e.block_number, e.log_index));
                Ok(events)
            })
            .await
    }
}

pub struct LazyOracleWrapper<P: Provider<Ethereum> + Clone> {
    contract: LazyOracle::LazyOracleInstance<Arc<P>>,
    metrics: Arc<Service>,
}

const VAULTS_BATCH_SIZE: u64 = 200;

impl<P: Provider<Ethereum> + Clone> LazyOracleWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: LazyOracle::LazyOracleInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_all_vaults(&self, block_hash: Hash256) -> Result<Vec<VaultInfo>, ContractError> {
        instrumented!(self, {
            let block_id = block_id_by_hash(block_hash);
            let count = u256_to_u64(self.contract.vaultsCount().block(block_id).call().await?)?;

            let mut vaults = Vec::with_capacity(count as usize);
            let mut offset = 0u64;
            while offset < count {
                let batch = self
                    .contract
                    .batchVaultsInfo(U256::from(offset), U256::from(VAULTS_BATCH_SIZE))
                    .block(block_id)
                    .call()
                    .await?;
                offset += batch.len() as u64;
                for info in batch {
                    vaults.push(info.try_into()?);
                }
            }
            Ok(vaults)
        })
    }

    pub async fn get_latest_report_data(&self, block_hash: Hash256) -> Result<OnChainVaultReportData, ContractError> {
        instrumented!(self, {
            let result = self
                .contract
                .latestReportData()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(OnChainVaultReportData {
                timestamp: u256_to_u64(result.timestamp)?,
                ref_slot: u256_to_u64(result.refSlot)?,
                tree_root: result.treeRoot,
                report_cid: Cid(result.reportCid),
            })
        })
    }
}

pub struct CsmWrapper<P: Provider<Ethereum> + Clone> {
    module: CsModule::CsModuleInstance<Arc<P>>,
    accounting: CsAccounting::CsAccountingInstance<Arc<P>>,
    fee_distributor: CsFeeDistributor::CsFeeDistributorInstance<Arc<P>>,
    parameters_registry: CsParametersRegistry::CsParametersRegistryInstance<Arc<P>>,
    strikes: CsStrikes::CsStrikesInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> CsmWrapper<P> {
    /// Accounting, fee distributor and parameters registry are discovered
    /// from the module contract; the strikes contract is deployed separately.
    pub async fn discover(
        provider: Arc<P>,
        module_address: Address,
        strikes_address: Address,
        metrics: Arc<Service>,
    ) -> Result<Self, ContractError> {
        let module = CsModule::CsModuleInstance::new(module_address, Arc::clone(&provider));
        let accounting_address = module.accounting().call().await?;
        let registry_address = module.PARAMETERS_REGISTRY().call().await?;
        let accounting = CsAccounting::CsAccountingInstance::new(accounting_address, Arc::clone(&provider));
        let fee_distributor_address = accounting.feeDistributor().call().await?;

        Ok(Self {
            module,
            accounting,
            fee_distributor: CsFeeDistributor::CsFeeDistributorInstance::new(
                fee_distributor_address,
                Arc::clone(&provider),
            ),
            parameters_registry: CsParametersRegistry::CsParametersRegistryInstance::new(
                registry_address,
                Arc::clone(&provider),
            ),
            strikes: CsStrikes::CsStrikesInstance::new(strikes_address, provider),
            metrics,
        })
    }

    pub fn module_address(&self) -> &Address {
        self.module.address()
    }

    pub async fn get_node_operators_count(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let count = self
                .module
                .getNodeOperatorsCount()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(count)
        })
    }

    /// Deposited signing keys of one operator as raw concatenated 48-byte
    /// pubkeys.
    pub async fn get_signing_keys(
        &self,
        node_operator_id: u64,
        block_hash: Hash256,
    ) -> Result<Vec<lido_oracle_shared::types::BlsPubkey>, ContractError> {
        instrumented!(self, {
            let block_id = block_id_by_hash(block_hash);
            let keys_count = self
                .module
                .getNodeOperatorTotalDepositedKeys(U256::from(node_operator_id))
                .block(block_id)
                .call()
                .await?;
            let raw: Bytes = self
                .module
                .getSigningKeys(U256::from(node_operator_id), U256::ZERO, keys_count)
                .block(block_id)
                .call()
                .await?;
            if raw.len() % 48 != 0 {
                return Err(ContractError::Rejection(format!(
                    "signing keys blob of operator {node_operator_id} has length {} not divisible by 48",
                    raw.len()
                )));
            }
            Ok(raw
                .chunks_exact(48)
                .map(lido_oracle_shared::types::BlsPubkey::from_slice)
                .collect())
        })
    }

    pub async fn shares_to_distribute(&self, block_hash: Hash256) -> Result<U256, ContractError> {
        instrumented!(
            self,
            Ok(self
                .fee_distributor
                .pendingSharesToDistribute()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?)
        )
    }

    pub async fn get_rewards_tree_root(&self, block_hash: Hash256) -> Result<Hash256, ContractError> {
        instrumented!(
            self,
            Ok(self.fee_distributor.treeRoot().block(block_id_by_hash(block_hash)).call().await?)
        )
    }

    pub async fn get_rewards_tree_cid(&self, block_hash: Hash256) -> Result<Cid, ContractError> {
        instrumented!(
            self,
            Ok(Cid(self.fee_distributor.treeCid().block(block_id_by_hash(block_hash)).call().await?))
        )
    }

    pub async fn get_strikes_tree_root(&self, block_hash: Hash256) -> Result<Hash256, ContractError> {
        instrumented!(
            self,
            Ok(self.strikes.treeRoot().block(block_id_by_hash(block_hash)).call().await?)
        )
    }

    pub async fn get_strikes_tree_cid(&self, block_hash: Hash256) -> Result<Cid, ContractError> {
        instrumented!(
            self,
            Ok(Cid(self.strikes.treeCid().block(block_id_by_hash(block_hash)).call().await?))
        )
    }

    pub async fn get_curve_params(&self, node_operator_id: u64, block_hash: Hash256) -> Result<CurveParams, ContractError> {
        instrumented!(self, {
            let block_id = block_id_by_hash(block_hash);
            let curve_id = self
                .accounting
                .getBondCurveId(U256::from(node_operator_id))
                .block(block_id)
                .call()
                .await?;

            let coeffs = self
                .parameters_registry
                .getPerformanceCoefficients(curve_id)
                .block(block_id)
                .call()
                .await?;
            let leeway = self
                .parameters_registry
                .getPerformanceLeewayData(curve_id)
                .block(block_id)
                .call()
                .await?;
            let reward_share = self
                .parameters_registry
                .getRewardShareData(curve_id)
                .block(block_id)
                .call()
                .await?;
            let strikes = self
                .parameters_registry
                .getStrikesParams(curve_id)
                .block(block_id)
                .call()
                .await?;

            Ok(CurveParams {
                perf_coeffs: lido_oracle_shared::duties::PerformanceCoefficients {
                    attestations_weight: u256_to_u64(coeffs.attestationsWeight)?,
                    blocks_weight: u256_to_u64(coeffs.blocksWeight)?,
                    sync_weight: u256_to_u64(coeffs.syncWeight)?,
                },
                perf_leeway_data: to_intervals(leeway)?,
                reward_share_data: to_intervals(reward_share)?,
                strikes_params: StrikesParams {
                    lifetime: u256_to_u64(strikes.lifetime)?,
                    threshold: u256_to_u64(strikes.threshold)?,
                },
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingProcessingState {
    pub current_frame_ref_slot: Slot,
    pub main_data_hash: Hash256,
    pub main_data_submitted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitBusProcessingState {
    pub current_frame_ref_slot: Slot,
    pub data_hash: Hash256,
    pub data_submitted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsFeeOracleProcessingState {
    pub current_frame_ref_slot: Slot,
    pub report_hash: Hash256,
    pub report_processed: bool,
}

/// The oracle surface shared by the accounting, exit-bus and fee oracles.
/// Report tuples differ per module, so data submission lives on the
/// module-specific wrappers below.
pub struct BaseOracleWrapper<P: Provider<Ethereum> + Clone> {
    contract: BaseOracle::BaseOracleInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> BaseOracleWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: BaseOracle::BaseOracleInstance::new(address, provider),
            metrics,
        }
    }

    pub fn address(&self) -> &Address {
        self.contract.address()
    }

    pub async fn get_consensus_contract(&self, block_hash: Hash256) -> Result<Address, ContractError> {
        instrumented!(
            self,
            Ok(self
                .contract
                .getConsensusContract()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?)
        )
    }

    pub async fn get_consensus_version(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let version = self
                .contract
                .getConsensusVersion()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(version)
        })
    }

    pub async fn get_consensus_version_latest(&self) -> Result<u64, ContractError> {
        instrumented!(self, {
            let version = self.contract.getConsensusVersion().call().await?;
            u256_to_u64(version)
        })
    }

    pub async fn get_contract_version(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let version = self
                .contract
                .getContractVersion()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(version)
        })
    }

    pub async fn get_contract_version_latest(&self) -> Result<u64, ContractError> {
        instrumented!(self, {
            let version = self.contract.getContractVersion().call().await?;
            u256_to_u64(version)
        })
    }

    pub async fn get_last_processing_ref_slot(&self, block_hash: Hash256) -> Result<Slot, ContractError> {
        instrumented!(self, {
            let slot = self
                .contract
                .getLastProcessingRefSlot()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(slot)
        })
    }

    pub async fn has_submit_data_role(&self, account: Address, block_hash: Hash256) -> Result<bool, ContractError> {
        instrumented!(self, {
            let role = self
                .contract
                .SUBMIT_DATA_ROLE()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(self
                .contract
                .hasRole(role, account)
                .block(block_id_by_hash(block_hash))
                .call()
                .await?)
        })
    }
}

macro_rules! submit_report_data_impl {
    ($self:expr, $report:expr, $contract_version:expr, $dry_run:expr) => {{
        let tx_builder = $self
            .contract
            .submitReportData($report, U256::from($contract_version));

        tx_builder.call().await?;
        if $dry_run {
            tracing::info!("Dry run: skipping submitReportData transaction");
            return Ok(());
        }

        $self
            .metrics
            .run_with_metrics_and_logs_async(ops::SUBMIT_TX, || async {
                let pending = tx_builder.send().await?;
                let receipt = pending.get_receipt().await?;
                if !receipt.status() {
                    return Err(ContractError::TransactionReverted(format!(
                        "submitReportData tx {:#x}",
                        receipt.transaction_hash
                    )));
                }
                tracing::info!(tx = %receipt.transaction_hash, "Submitted report data");
                Ok(())
            })
            .await
    }};
}

pub struct AccountingOracleWrapper<P: Provider<Ethereum> + Clone> {
    contract: AccountingOracle::AccountingOracleInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> AccountingOracleWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: AccountingOracle::AccountingOracleInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_processing_state(&self, block_hash: Hash256) -> Result<AccountingProcessingState, ContractError> {
        instrumented!(self, {
            let state = self
                .contract
                .getProcessingState()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(AccountingProcessingState {
                current_frame_ref_slot: u256_to_u64(state.currentFrameRefSlot)?,
                main_data_hash: state.mainDataHash,
                main_data_submitted: state.mainDataSubmitted,
            })
        })
    }

    pub async fn submit_report_data(
        &self,
        report: AccountingOracle::ReportData,
        contract_version: u64,
        dry_run: bool,
    ) -> Result<(), ContractError> {
        submit_report_data_impl!(self, report, contract_version, dry_run)
    }
}

pub struct ExitBusOracleWrapper<P: Provider<Ethereum> + Clone> {
    contract: ExitBusOracle::ExitBusOracleInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> ExitBusOracleWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: ExitBusOracle::ExitBusOracleInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_processing_state(&self, block_hash: Hash256) -> Result<ExitBusProcessingState, ContractError> {
        instrumented!(self, {
            let state = self
                .contract
                .getProcessingState()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(ExitBusProcessingState {
                current_frame_ref_slot: u256_to_u64(state.currentFrameRefSlot)?,
                data_hash: state.dataHash,
                data_submitted: state.dataSubmitted,
            })
        })
    }

    pub async fn is_paused(&self, block_hash: Hash256) -> Result<bool, ContractError> {
        instrumented!(
            self,
            Ok(self.contract.isPaused().block(block_id_by_hash(block_hash)).call().await?)
        )
    }

    pub async fn submit_report_data(
        &self,
        report: ExitBusOracle::ReportData,
        contract_version: u64,
        dry_run: bool,
    ) -> Result<(), ContractError> {
        submit_report_data_impl!(self, report, contract_version, dry_run)
    }

    /// Exit requests delivered by earlier reports, over a block range.
    pub async fn get_exit_request_events(
        &self,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> Result<Vec<ExitRequestEvent>, ContractError> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_EVENTS, || async {
                let logs = self
                    .contract
                    .ValidatorExitRequest_filter()
                    .from_block(from_block)
                    .to_block(to_block)
                    .query()
                    .await?;
                logs.into_iter()
                    .map(|(event, _)| {
                        Ok(ExitRequestEvent {
                            staking_module_id: u256_to_u64(event.stakingModuleId)?,
                            node_operator_id: u256_to_u64(event.nodeOperatorId)?,
                            validator_index: u256_to_u64(event.validatorIndex)?,
                            timestamp: u256_to_u64(event.timestamp)?,
                        })
                    })
                    .collect()
            })
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequestEvent {
    pub staking_module_id: u64,
    pub node_operator_id: u64,
    pub validator_index: u64,
    pub timestamp: u64,
}

/// Curated-style module registry: operator key blobs and summaries.
pub struct NodeOperatorRegistryWrapper<P: Provider<Ethereum> + Clone> {
    contract: NodeOperatorRegistry::NodeOperatorRegistryInstance<Arc<P>>,
    metrics: Arc<Service>,
}

const SIGNING_KEYS_BATCH: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOperatorSummary {
    pub target_limit_mode: u64,
    pub target_validators_count: u64,
    pub total_deposited_validators: u64,
    pub total_exited_validators: u64,
}

impl<P: Provider<Ethereum> + Clone> NodeOperatorRegistryWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: NodeOperatorRegistry::NodeOperatorRegistryInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_node_operators_count(&self, block_hash: Hash256) -> Result<u64, ContractError> {
        instrumented!(self, {
            let count = self
                .contract
                .getNodeOperatorsCount()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            u256_to_u64(count)
        })
    }

    pub async fn get_node_operator_summary(
        &self,
        node_operator_id: u64,
        block_hash: Hash256,
    ) -> Result<NodeOperatorSummary, ContractError> {
        instrumented!(self, {
            let summary = self
                .contract
                .getNodeOperatorSummary(U256::from(node_operator_id))
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(NodeOperatorSummary {
                target_limit_mode: u256_to_u64(summary.targetLimitMode)?,
                target_validators_count: u256_to_u64(summary.targetValidatorsCount)?,
                total_deposited_validators: u256_to_u64(summary.totalDepositedValidators)?,
                total_exited_validators: u256_to_u64(summary.totalExitedValidators)?,
            })
        })
    }

    /// Used signing keys of one operator, batched to stay under response
    /// size limits.
    pub async fn get_used_signing_keys(
        &self,
        node_operator_id: u64,
        block_hash: Hash256,
    ) -> Result<Vec<lido_oracle_shared::types::BlsPubkey>, ContractError> {
        instrumented!(self, {
            let block_id = block_id_by_hash(block_hash);
            let total = u256_to_u64(
                self.contract
                    .getTotalSigningKeyCount(U256::from(node_operator_id))
                    .block(block_id)
                    .call()
                    .await?,
            )?;

            let mut pubkeys = Vec::with_capacity(total as usize);
            let mut offset = 0u64;
            while offset < total {
                let limit = SIGNING_KEYS_BATCH.min(total - offset);
                let batch = self
                    .contract
                    .getSigningKeys(U256::from(node_operator_id), U256::from(offset), U256::from(limit))
                    .block(block_id)
                    .call()
                    .await?;
                if batch.pubkeys.len() % 48 != 0 {
                    return Err(ContractError::Rejection(format!(
                        "signing keys blob of operator {node_operator_id} has length {} not divisible by 48",
                        batch.pubkeys.len()
                    )));
                }
                for (chunk, used) in batch.pubkeys.chunks_exact(48).zip(batch.used.iter()) {
                    if *used {
                        pubkeys.push(lido_oracle_shared::types::BlsPubkey::from_slice(chunk));
                    }
                }
                offset += limit;
            }
            Ok(pubkeys)
        })
    }
}

pub struct CsFeeOracleWrapper<P: Provider<Ethereum> + Clone> {
    contract: CsFeeOracle::CsFeeOracleInstance<Arc<P>>,
    metrics: Arc<Service>,
}

impl<P: Provider<Ethereum> + Clone> CsFeeOracleWrapper<P> {
    pub fn new(provider: Arc<P>, address: Address, metrics: Arc<Service>) -> Self {
        Self {
            contract: CsFeeOracle::CsFeeOracleInstance::new(address, provider),
            metrics,
        }
    }

    pub async fn get_processing_state(&self, block_hash: Hash256) -> Result<CsFeeOracleProcessingState, ContractError> {
        instrumented!(self, {
            let state = self
                .contract
                .getProcessingState()
                .block(block_id_by_hash(block_hash))
                .call()
                .await?;
            Ok(CsFeeOracleProcessingState {
                current_frame_ref_slot: u256_to_u64(state.currentFrameRefSlot)?,
                report_hash: state.reportHash,
                report_processed: state.reportProcessed,
            })
        })
    }

    pub async fn submit_report_data(
        &self,
        report: CsFeeOracle::ReportData,
        contract_version: u64,
        dry_run: bool,
    ) -> Result<(), ContractError> {
        submit_report_data_impl!(self, report, contract_version, dry_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_event_touched_vaults() {
        let donor = Address::repeat_byte(1);
        let acceptor = Address::repeat_byte(2);
        let kind = VaultEventKind::BadDebtSocialized {
            vault_donor: donor,
            vault_acceptor: acceptor,
            bad_debt_shares: U256::from(5),
        };
        assert_eq!(kind.touched_vaults(), vec![donor, acceptor]);
    }
}
