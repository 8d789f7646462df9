//! Read-only Beacon API adapter with a fixed-order fallback provider list.

pub mod types;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header::ACCEPT, Client, ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use lido_oracle_shared::types::{BeaconStateView, BlockStamp, Epoch, Hash256, IndexedValidator, Slot};

use crate::prometheus_metrics::{operations::consensus_client as ops, Service};
use types::*;

const CONSENSUS_CLIENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateId {
    Head,
    Finalized,
    Justified,
    Slot(Slot),
    Root(Hash256),
}

impl StateId {
    pub fn as_str(&self) -> String {
        match self {
            StateId::Head => "head".to_owned(),
            StateId::Finalized => "finalized".to_owned(),
            StateId::Justified => "justified".to_owned(),
            StateId::Slot(slot) => slot.to_string(),
            StateId::Root(root) => format!("{root:#x}"),
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Request to {url} failed: {source:#?}")]
    Http { url: String, source: reqwest::Error },

    #[error("Unsuccessful status {status} from {url}")]
    Status { url: String, status: StatusCode },

    #[error("Couldn't parse response from {url}: {source:#?}")]
    Parse { url: String, source: reqwest::Error },

    #[error("All consensus providers failed for {path}; last error: {last}")]
    AllProvidersFailed { path: String, last: Box<Error> },

    #[error("Proposer duties dependent root mismatch: expected {expected:#x}, got {got:#x}")]
    DependentRootMismatch { expected: Hash256, got: Hash256 },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

pub struct ConsensusClient {
    hosts: Vec<String>,
    client: Client,
    metrics: Arc<Service>,
}

impl ConsensusClient {
    fn normalize_url(base_url: &str) -> String {
        base_url.strip_suffix('/').unwrap_or(base_url).to_owned()
    }

    pub fn new(hosts: &[String], metrics: Arc<Service>) -> Result<Self, reqwest::Error> {
        let client = ClientBuilder::new().timeout(CONSENSUS_CLIENT_TIMEOUT).build()?;
        Ok(Self {
            hosts: hosts.iter().map(|h| Self::normalize_url(h)).collect(),
            client,
            metrics,
        })
    }

    async fn get_json_once<T: DeserializeOwned>(&self, host: &str, path: &str) -> Result<T, Error> {
        let url = format!("{host}{path}");
        tracing::debug!("Sending request to: {url}");
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| Error::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status { url, status });
        }

        response.json::<T>().await.map_err(|source| Error::Parse { url, source })
    }

    /// Providers are tried in the configured order. A 4xx is a semantic
    /// answer (e.g. missed slot) and is returned as-is; connectivity
    /// failures and 5xx fall through to the next provider.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let mut last_error: Option<Error> = None;
        for host in &self.hosts {
            match self.get_json_once::<T>(host, path).await {
                Ok(value) => return Ok(value),
                Err(err @ Error::Status { status, .. }) if status.is_client_error() => return Err(err),
                Err(err) => {
                    tracing::warn!(host, path, error = ?err, "Consensus provider failed, falling back");
                    last_error = Some(err);
                }
            }
        }
        Err(Error::AllProvidersFailed {
            path: path.to_owned(),
            last: Box::new(last_error.expect("at least one host is configured")),
        })
    }

    pub async fn get_genesis(&self) -> Result<Genesis, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_GENESIS, || async {
                let resp: ResponseEnvelope<Genesis> = self.get_json("/eth/v1/beacon/genesis").await?;
                Ok(resp.data)
            })
            .await
    }

    pub async fn get_config_spec(&self) -> Result<ConfigSpec, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_CONFIG_SPEC, || async {
                let resp: ResponseEnvelope<ConfigSpec> = self.get_json("/eth/v1/config/spec").await?;
                Ok(resp.data)
            })
            .await
    }

    pub async fn get_block_root(&self, state_id: &StateId) -> Result<Hash256, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_BLOCK_ROOT, || async {
                let resp: ResponseEnvelope<BlockRootData> = self
                    .get_json(&format!("/eth/v1/beacon/blocks/{state_id}/root"))
                    .await?;
                Ok(resp.data.root)
            })
            .await
    }

    pub async fn get_block_header(&self, state_id: &StateId) -> Result<VersionedEnvelope<BlockHeaderData>, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_BLOCK_HEADER, || async {
                self.get_json(&format!("/eth/v1/beacon/headers/{state_id}")).await
            })
            .await
    }

    pub async fn get_block_details(&self, state_id: &StateId) -> Result<BlockDetails, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_BLOCK_DETAILS, || async {
                let resp: VersionedEnvelope<BlockDetails> =
                    self.get_json(&format!("/eth/v2/beacon/blocks/{state_id}")).await?;
                Ok(resp.data)
            })
            .await
    }

    pub async fn get_block_attestations_and_sync(
        &self,
        block_root: Hash256,
    ) -> Result<(Vec<BlockAttestation>, SyncAggregate), Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_BLOCK_ATTESTATIONS_AND_SYNC, || async {
                let resp: VersionedEnvelope<BlockDetails> = self
                    .get_json(&format!("/eth/v2/beacon/blocks/{block_root:#x}"))
                    .await?;
                let body = resp.data.message.body;
                Ok((body.attestations, body.sync_aggregate))
            })
            .await
    }

    pub async fn get_attestation_committees(
        &self,
        blockstamp: &BlockStamp,
        epoch: Epoch,
    ) -> Result<Vec<Committee>, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_ATTESTATION_COMMITTEES, || async {
                let resp: VersionedEnvelope<Vec<Committee>> = self
                    .get_json(&format!(
                        "/eth/v1/beacon/states/{}/committees?epoch={epoch}",
                        blockstamp.slot_number
                    ))
                    .await?;
                Ok(resp.data)
            })
            .await
    }

    /// The dependent root pins the proposer shuffle to the canonical chain
    /// the caller observed; a mismatch means the provider is on another fork.
    pub async fn get_proposer_duties(
        &self,
        epoch: Epoch,
        dependent_root: Hash256,
    ) -> Result<Vec<ProposerDuty>, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_PROPOSER_DUTIES, || async {
                let resp: DependentEnvelope<Vec<ProposerDuty>> = self
                    .get_json(&format!("/eth/v1/validator/duties/proposer/{epoch}"))
                    .await?;
                if resp.dependent_root != dependent_root {
                    return Err(Error::DependentRootMismatch {
                        expected: dependent_root,
                        got: resp.dependent_root,
                    });
                }
                Ok(resp.data)
            })
            .await
    }

    pub async fn get_sync_committee(&self, blockstamp: &BlockStamp, epoch: Epoch) -> Result<SyncCommittee, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_SYNC_COMMITTEE, || async {
                let resp: VersionedEnvelope<SyncCommittee> = self
                    .get_json(&format!(
                        "/eth/v1/beacon/states/{}/sync_committees?epoch={epoch}",
                        blockstamp.slot_number
                    ))
                    .await?;
                Ok(resp.data)
            })
            .await
    }

    pub async fn get_state_block_roots(&self, slot: Slot) -> Result<Vec<Hash256>, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_STATE_BLOCK_ROOTS, || async {
                let resp: VersionedEnvelope<StateBlockRootsDto> = self
                    .get_json(&format!("/eth/v2/debug/beacon/states/{slot}"))
                    .await?;
                Ok(resp.data.block_roots)
            })
            .await
    }

    pub async fn get_validators(&self, blockstamp: &BlockStamp) -> Result<Vec<IndexedValidator>, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_VALIDATORS, || async {
                let resp = self
                    .get_state_scoped::<Vec<IndexedValidatorDto>>(blockstamp, "validators")
                    .await?;
                Ok(resp.into_iter().map(Into::into).collect())
            })
            .await
    }

    pub async fn get_validator_state(&self, slot: Slot, index: u64) -> Result<IndexedValidator, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_VALIDATOR_STATE, || async {
                let resp: VersionedEnvelope<IndexedValidatorDto> = self
                    .get_json(&format!("/eth/v1/beacon/states/{slot}/validators/{index}"))
                    .await?;
                Ok(resp.data.into())
            })
            .await
    }

    pub async fn get_state_view(&self, blockstamp: &BlockStamp) -> Result<BeaconStateView, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::GET_STATE_VIEW, || async {
                let state: VersionedEnvelope<BeaconStateDto> = {
                    let by_root = self
                        .get_json(&format!("/eth/v2/debug/beacon/states/{:#x}", blockstamp.state_root))
                        .await;
                    match by_root {
                        Err(err) if err.is_not_found() => {
                            // Some providers prune state-by-root lookups; the
                            // same state is still addressable by slot.
                            tracing::debug!(
                                state_root = %blockstamp.state_root,
                                slot = blockstamp.slot_number,
                                "State not found by root, retrying by slot"
                            );
                            self.get_json(&format!("/eth/v2/debug/beacon/states/{}", blockstamp.slot_number))
                                .await?
                        }
                        other => other?,
                    }
                };
                Ok(to_state_view(state.data))
            })
            .await
    }

    /// State-scoped GET by state root, transparently retried by slot number
    /// when the provider reports the state as unknown.
    async fn get_state_scoped<T: DeserializeOwned>(&self, blockstamp: &BlockStamp, suffix: &str) -> Result<T, Error> {
        let by_root = self
            .get_json::<VersionedEnvelope<T>>(&format!(
                "/eth/v1/beacon/states/{:#x}/{suffix}",
                blockstamp.state_root
            ))
            .await;
        let resp = match by_root {
            Err(err) if err.is_not_found() => {
                tracing::debug!(
                    state_root = %blockstamp.state_root,
                    slot = blockstamp.slot_number,
                    "State not found by root, retrying by slot"
                );
                self.get_json::<VersionedEnvelope<T>>(&format!(
                    "/eth/v1/beacon/states/{}/{suffix}",
                    blockstamp.slot_number
                ))
                .await?
            }
            other => other?,
        };
        Ok(resp.data)
    }
}

fn to_state_view(state: BeaconStateDto) -> BeaconStateView {
    let validators = state
        .validators
        .into_iter()
        .zip(state.balances)
        .enumerate()
        .map(|(index, (validator, balance))| IndexedValidator {
            index: index as u64,
            balance,
            validator: validator.into(),
        })
        .collect();

    BeaconStateView {
        slot: state.slot,
        validators,
        earliest_exit_epoch: state.earliest_exit_epoch,
        exit_balance_to_consume: state.exit_balance_to_consume,
        pending_deposits: state.pending_deposits.into_iter().map(Into::into).collect(),
        pending_partial_withdrawals: state.pending_partial_withdrawals.into_iter().map(Into::into).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_id_rendering() {
        assert_eq!(StateId::Head.as_str(), "head");
        assert_eq!(StateId::Slot(1234).as_str(), "1234");
        let root = Hash256::repeat_byte(0xab);
        assert!(StateId::Root(root).as_str().starts_with("0xabab"));
    }

    #[test]
    fn state_view_indexes_validators_in_order() {
        let dto = BeaconStateDto {
            slot: 64,
            validators: vec![],
            balances: vec![],
            earliest_exit_epoch: 0,
            exit_balance_to_consume: 0,
            pending_deposits: vec![],
            pending_partial_withdrawals: vec![],
        };
        let view = to_state_view(dto);
        assert_eq!(view.slot, 64);
        assert!(view.validators.is_empty());
    }
}
