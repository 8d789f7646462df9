use std::path::PathBuf;
use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use anyhow::Context as _;
use prometheus::Registry;

use lido_oracle_client::consensus::ConsensusClient;
use lido_oracle_client::execution::contracts::{
    AccountingOracleWrapper, BaseOracleWrapper, BurnerWrapper, CsFeeOracleWrapper, CsmWrapper,
    ExitBusOracleWrapper, LazyOracleWrapper, LidoLocatorWrapper, LidoWrapper, OracleDaemonConfigWrapper,
    SanityCheckerWrapper, StakingRouterWrapper, VaultHubWrapper, WithdrawalQueueWrapper,
};
use lido_oracle_client::execution::{ExecutionLayerClient, ProviderFactory};
use lido_oracle_client::ipfs::{InMemoryStorage, IpfsClient, StorageClient};
use lido_oracle_client::prometheus_metrics::{Metrics, Registar};
use lido_oracle_modules::store::DutyStore;
use lido_oracle_modules::Web3Context;
use lido_oracle_shared::types::{Address, Hash256};

use crate::env::{self, EnvVarValue};
use crate::tracing::LogFormat;

// Dry runs have no member key; transactions are preflighted with a
// throwaway signer and never sent.
const DRY_RUN_PRIV_KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

pub struct EnvVars {
    pub consensus_client_uri: EnvVarValue<Vec<String>>,
    pub execution_client_uri: EnvVarValue<String>,
    pub ipfs_api_uri: EnvVarValue<Option<String>>,
    pub ipfs_gateway_uri: EnvVarValue<Option<String>>,
    pub member_priv_key: EnvVarValue<Option<String>>,
    pub lido_locator_address: EnvVarValue<Address>,
    pub lido_withdrawal_credentials: EnvVarValue<Hash256>,
    pub csm_module_address: EnvVarValue<Address>,
    pub cs_strikes_address: EnvVarValue<Address>,
    pub cs_fee_oracle_address: EnvVarValue<Address>,
    pub submit_data_delay_in_slots: EnvVarValue<u64>,
    pub max_concurrency: EnvVarValue<usize>,
    pub cache_path: EnvVarValue<PathBuf>,
    pub log_format: EnvVarValue<LogFormat>,
    pub dry_run: EnvVarValue<bool>,
    pub prometheus_namespace: EnvVarValue<String>,
    pub metrics_bind_to_addr: EnvVarValue<String>,
}

impl EnvVars {
    pub fn read() -> Self {
        Self {
            consensus_client_uri: env::CONSENSUS_CLIENT_URI.required_list(),
            execution_client_uri: env::EXECUTION_CLIENT_URI.required(),
            ipfs_api_uri: env::IPFS_API_URI.optional(),
            ipfs_gateway_uri: env::IPFS_GATEWAY_URI.optional(),
            member_priv_key: env::MEMBER_PRIV_KEY.optional(),
            lido_locator_address: env::LIDO_LOCATOR_ADDRESS.required(),
            lido_withdrawal_credentials: env::LIDO_WITHDRAWAL_CREDENTIALS.required(),
            csm_module_address: env::CSM_MODULE_ADDRESS.required(),
            cs_strikes_address: env::CS_STRIKES_ADDRESS.required(),
            cs_fee_oracle_address: env::CS_FEE_ORACLE_ADDRESS.required(),
            submit_data_delay_in_slots: env::SUBMIT_DATA_DELAY_IN_SLOTS.default(6),
            max_concurrency: env::ORACLE_MAX_CONCURRENCY.default(2),
            cache_path: env::CACHE_PATH.default(PathBuf::from("./cache")),
            log_format: env::LOG_FORMAT.default(LogFormat::Plain),
            dry_run: env::DRY_RUN.default(false),
            prometheus_namespace: env::PROMETHEUS_NAMESPACE.default("lido_oracle".to_owned()),
            metrics_bind_to_addr: env::METRICS_BIND_TO_ADDR.default("0.0.0.0:9000".to_owned()),
        }
    }

    pub fn log_config(&self) {
        ::tracing::info!(
            consensus_client_uri = ?self.consensus_client_uri,
            execution_client_uri = ?self.execution_client_uri,
            ipfs_api_uri = ?self.ipfs_api_uri,
            member_priv_key = ?self.member_priv_key,
            lido_locator_address = ?self.lido_locator_address,
            lido_withdrawal_credentials = ?self.lido_withdrawal_credentials,
            csm_module_address = ?self.csm_module_address,
            submit_data_delay_in_slots = ?self.submit_data_delay_in_slots,
            max_concurrency = ?self.max_concurrency,
            cache_path = ?self.cache_path,
            dry_run = ?self.dry_run,
            "Configuration"
        );
    }
}

pub struct AppState {
    pub ctx: Arc<Web3Context>,
    pub store: Arc<DutyStore>,
    pub registry: Registry,
    pub cache_path: PathBuf,
}

pub async fn build_app_state(env_vars: &EnvVars, dry_flag: bool) -> anyhow::Result<AppState> {
    let dry_run = dry_flag || env_vars.dry_run.value || env_vars.member_priv_key.value.is_none();

    let metrics = Arc::new(Metrics::new(&env_vars.prometheus_namespace.value));
    let registry = Registry::new();
    metrics.register_on(&registry).context("registering metrics")?;

    let cc = Arc::new(
        ConsensusClient::new(
            &env_vars.consensus_client_uri.value,
            Arc::new(metrics.services.consensus_client.clone()),
        )
        .context("building consensus client")?,
    );

    let key = env_vars
        .member_priv_key
        .value
        .clone()
        .unwrap_or_else(|| DRY_RUN_PRIV_KEY.to_owned());
    let signer: PrivateKeySigner = key.trim().parse().context("parsing member private key")?;
    let account = env_vars.member_priv_key.value.is_some().then(|| signer.address());

    let provider = Arc::new(
        ProviderFactory::create_provider(&key, &env_vars.execution_client_uri.value)
            .context("building execution provider")?,
    );

    let el_metrics = Arc::new(metrics.services.execution_client.clone());
    let el = ExecutionLayerClient::new(Arc::clone(&provider), Arc::clone(&el_metrics));

    let storage = match (&env_vars.ipfs_api_uri.value, &env_vars.ipfs_gateway_uri.value) {
        (Some(api), Some(gateway)) => Arc::new(StorageClient::Ipfs(
            IpfsClient::new(api, gateway, Arc::new(metrics.services.ipfs.clone())).context("building IPFS client")?,
        )),
        _ => {
            ::tracing::warn!("No IPFS endpoints configured, published artifacts stay in memory");
            Arc::new(StorageClient::InMemory(InMemoryStorage::new()))
        }
    };

    let locator = LidoLocatorWrapper::new(
        Arc::clone(&provider),
        env_vars.lido_locator_address.value,
        Arc::clone(&el_metrics),
    );

    let lido_address = locator.lido().await?;
    let accounting_oracle_address = locator.accounting_oracle().await?;
    let exit_bus_oracle_address = locator.validators_exit_bus_oracle().await?;
    let withdrawal_queue_address = locator.withdrawal_queue().await?;
    let sanity_checker_address = locator.oracle_report_sanity_checker().await?;
    let daemon_config_address = locator.oracle_daemon_config().await?;
    let staking_router_address = locator.staking_router().await?;
    let vault_hub_address = locator.vault_hub().await?;
    let lazy_oracle_address = locator.lazy_oracle().await?;
    let burner_address = locator.burner().await?;
    let withdrawal_vault_address = locator.withdrawal_vault().await?;
    let el_rewards_vault_address = locator.el_rewards_vault().await?;

    let csm = CsmWrapper::discover(
        Arc::clone(&provider),
        env_vars.csm_module_address.value,
        env_vars.cs_strikes_address.value,
        Arc::clone(&el_metrics),
    )
    .await
    .context("discovering CSM contracts")?;

    let ctx = Arc::new(Web3Context {
        cc,
        el,
        storage,
        metrics: Arc::clone(&metrics),
        lido: LidoWrapper::new(Arc::clone(&provider), lido_address, Arc::clone(&el_metrics)),
        burner: BurnerWrapper::new(Arc::clone(&provider), burner_address, Arc::clone(&el_metrics)),
        accounting_oracle: AccountingOracleWrapper::new(
            Arc::clone(&provider),
            accounting_oracle_address,
            Arc::clone(&el_metrics),
        ),
        accounting_oracle_base: BaseOracleWrapper::new(
            Arc::clone(&provider),
            accounting_oracle_address,
            Arc::clone(&el_metrics),
        ),
        exit_bus_oracle: ExitBusOracleWrapper::new(
            Arc::clone(&provider),
            exit_bus_oracle_address,
            Arc::clone(&el_metrics),
        ),
        exit_bus_oracle_base: BaseOracleWrapper::new(
            Arc::clone(&provider),
            exit_bus_oracle_address,
            Arc::clone(&el_metrics),
        ),
        cs_fee_oracle: CsFeeOracleWrapper::new(
            Arc::clone(&provider),
            env_vars.cs_fee_oracle_address.value,
            Arc::clone(&el_metrics),
        ),
        cs_fee_oracle_base: BaseOracleWrapper::new(
            Arc::clone(&provider),
            env_vars.cs_fee_oracle_address.value,
            Arc::clone(&el_metrics),
        ),
        withdrawal_queue: WithdrawalQueueWrapper::new(
            Arc::clone(&provider),
            withdrawal_queue_address,
            Arc::clone(&el_metrics),
        ),
        sanity_checker: SanityCheckerWrapper::new(
            Arc::clone(&provider),
            sanity_checker_address,
            Arc::clone(&el_metrics),
        ),
        daemon_config: OracleDaemonConfigWrapper::new(
            Arc::clone(&provider),
            daemon_config_address,
            Arc::clone(&el_metrics),
        ),
        staking_router: StakingRouterWrapper::new(
            Arc::clone(&provider),
            staking_router_address,
            Arc::clone(&el_metrics),
        ),
        vault_hub: VaultHubWrapper::new(Arc::clone(&provider), vault_hub_address, Arc::clone(&el_metrics)),
        lazy_oracle: LazyOracleWrapper::new(Arc::clone(&provider), lazy_oracle_address, Arc::clone(&el_metrics)),
        csm,
        locator,
        provider,
        withdrawal_vault_address,
        el_rewards_vault_address,
        lido_withdrawal_credentials: env_vars.lido_withdrawal_credentials.value,
        account,
        dry_run,
        submit_data_delay_in_slots: env_vars.submit_data_delay_in_slots.value,
        max_concurrency: env_vars.max_concurrency.value,
    });

    let store = Arc::new(DutyStore::open(&env_vars.cache_path.value.join("duties")).context("opening duty store")?);

    Ok(AppState {
        ctx,
        store,
        registry,
        cache_path: env_vars.cache_path.value.clone(),
    })
}
