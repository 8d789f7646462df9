pub mod accounting;
pub mod checkpoint;
pub mod collector;
pub mod consensus;
pub mod ejector;
pub mod lido_validators;
pub mod performance;
pub mod safe_border;
pub mod store;

use std::sync::Arc;

use lido_oracle_client::consensus::ConsensusClient;
use lido_oracle_client::execution::contracts::{
    AccountingOracleWrapper, BaseOracleWrapper, BurnerWrapper, CsFeeOracleWrapper, CsmWrapper,
    ExitBusOracleWrapper, LazyOracleWrapper, LidoLocatorWrapper, LidoWrapper, OracleDaemonConfigWrapper,
    SanityCheckerWrapper, StakingRouterWrapper, VaultHubWrapper, WithdrawalQueueWrapper,
};
use lido_oracle_client::execution::{DefaultProvider, ExecutionLayerClient};
use lido_oracle_client::ipfs::StorageClient;
use lido_oracle_client::prometheus_metrics::Metrics;
use lido_oracle_shared::types::{Address, Hash256};

/// Everything a module needs to talk to the outside world. Built once at
/// startup, shared by reference; no module-owned mutable state lives here.
pub struct Web3Context {
    pub cc: Arc<ConsensusClient>,
    pub provider: Arc<DefaultProvider>,
    pub el: ExecutionLayerClient<DefaultProvider>,
    pub storage: Arc<StorageClient>,
    pub metrics: Arc<Metrics>,

    pub locator: LidoLocatorWrapper<DefaultProvider>,
    pub lido: LidoWrapper<DefaultProvider>,
    pub burner: BurnerWrapper<DefaultProvider>,
    pub accounting_oracle: AccountingOracleWrapper<DefaultProvider>,
    pub accounting_oracle_base: BaseOracleWrapper<DefaultProvider>,
    pub exit_bus_oracle: ExitBusOracleWrapper<DefaultProvider>,
    pub exit_bus_oracle_base: BaseOracleWrapper<DefaultProvider>,
    pub cs_fee_oracle: CsFeeOracleWrapper<DefaultProvider>,
    pub cs_fee_oracle_base: BaseOracleWrapper<DefaultProvider>,
    pub withdrawal_queue: WithdrawalQueueWrapper<DefaultProvider>,
    pub sanity_checker: SanityCheckerWrapper<DefaultProvider>,
    pub daemon_config: OracleDaemonConfigWrapper<DefaultProvider>,
    pub staking_router: StakingRouterWrapper<DefaultProvider>,
    pub vault_hub: VaultHubWrapper<DefaultProvider>,
    pub lazy_oracle: LazyOracleWrapper<DefaultProvider>,
    pub csm: CsmWrapper<DefaultProvider>,

    /// Execution-layer addresses resolved from the locator at startup.
    pub withdrawal_vault_address: Address,
    pub el_rewards_vault_address: Address,

    /// Withdrawal credentials binding beacon-chain validators to the
    /// protocol's withdrawal vault.
    pub lido_withdrawal_credentials: Hash256,

    /// The committee member account; `None` runs the modules in dry mode.
    pub account: Option<Address>,
    pub dry_run: bool,
    pub submit_data_delay_in_slots: u64,
    pub max_concurrency: usize,
}
