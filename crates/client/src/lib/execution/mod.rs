//! Execution-layer adapters: typed contract wrappers over alloy providers.

pub mod contracts;

use std::sync::Arc;

use alloy::eips::{BlockId, RpcBlockHash};
use alloy::network::{Ethereum, EthereumWallet};
use alloy::providers::fillers::RecommendedFillers;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use thiserror::Error;

use lido_oracle_shared::types::{Address, Hash256, Wei};

use crate::prometheus_metrics::{operations::execution_client as ops, Service};

// Revert selector of InitialEpochIsYetToArrive(), raised by hash-consensus
// before the initial frame opens. keccak("InitialEpochIsYetToArrive()")[..4].
pub const INITIAL_EPOCH_IS_YET_TO_ARRIVE_SELECTOR: [u8; 4] = [0xcd, 0x08, 0x83, 0xea];

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Contract rejected: {0}")]
    Rejection(String),

    #[error("Initial epoch is yet to arrive")]
    InitialEpochIsYetToArrive,

    #[error("Transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("Transaction error {0:#?}")]
    TransactionError(#[from] alloy::providers::PendingTransactionError),

    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("Other alloy error {0:#?}")]
    OtherAlloyError(alloy::contract::Error),

    #[error(transparent)]
    Rpc(#[from] alloy::transports::RpcError<alloy::transports::TransportErrorKind>),
}

impl From<alloy::contract::Error> for ContractError {
    fn from(error: alloy::contract::Error) -> Self {
        if let alloy::contract::Error::TransportError(alloy::transports::RpcError::ErrorResp(ref payload)) = error {
            if let Some(data) = payload.as_revert_data() {
                if data.len() >= 4 && data[..4] == INITIAL_EPOCH_IS_YET_TO_ARRIVE_SELECTOR {
                    return ContractError::InitialEpochIsYetToArrive;
                }
                return ContractError::Rejection(format!("revert data 0x{}", hex::encode(&data)));
            }
            if payload.message.contains("execution reverted") {
                return ContractError::Rejection(payload.message.to_string());
            }
        }
        ContractError::OtherAlloyError(error)
    }
}

pub fn u256_to_u64(value: alloy_primitives::U256) -> Result<u64, ContractError> {
    value
        .try_into()
        .map_err(|_| ContractError::ValueOutOfRange(format!("{value} does not fit u64")))
}

pub fn block_id_by_hash(block_hash: Hash256) -> BlockId {
    BlockId::Hash(RpcBlockHash::from_hash(block_hash, Some(false)))
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to parse private key")]
    ParsePrivateKeyError,

    #[error("Failed to parse RPC url: {0}")]
    ParseUrlError(String),
}

pub type DefaultProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::fillers::JoinFill<
            alloy::providers::Identity,
            <Ethereum as RecommendedFillers>::RecommendedFillers,
        >,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    alloy::providers::RootProvider,
>;

pub struct ProviderFactory {}

impl ProviderFactory {
    pub fn create_provider(key_str: &str, endpoint: &str) -> Result<DefaultProvider, ProviderError> {
        let signer: PrivateKeySigner = key_str
            .trim()
            .parse()
            .map_err(|_| ProviderError::ParsePrivateKeyError)?;
        let wallet = EthereumWallet::from(signer);
        let url: Url = endpoint
            .parse()
            .map_err(|_| ProviderError::ParseUrlError(endpoint.to_owned()))?;
        Ok(ProviderBuilder::new().wallet(wallet).connect_http(url))
    }
}

/// Plain execution-layer reads that go through the provider rather than a
/// contract: vault and rewards-vault balances at a pinned block.
pub struct ExecutionLayerClient<P>
where
    P: Provider<Ethereum> + Clone,
{
    provider: Arc<P>,
    metrics: Arc<Service>,
}

impl<P> ExecutionLayerClient<P>
where
    P: Provider<Ethereum> + Clone,
{
    pub fn new(provider: Arc<P>, metrics: Arc<Service>) -> Self {
        Self { provider, metrics }
    }

    pub async fn get_balance(&self, address: Address, block_hash: Hash256) -> Result<Wei, ContractError> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::CONTRACT_CALL, || async {
                let balance = self
                    .provider
                    .get_balance(address)
                    .block_id(block_id_by_hash(block_hash))
                    .await?;
                Ok(balance)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn initial_epoch_selector_matches_signature() {
        let selector = &keccak256(b"InitialEpochIsYetToArrive()")[..4];
        assert_eq!(selector, INITIAL_EPOCH_IS_YET_TO_ARRIVE_SELECTOR);
    }
}
