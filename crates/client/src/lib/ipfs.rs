//! Content-addressed storage adapter. Reports and their Merkle trees are
//! published here; on-chain reports carry only the CID.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::keccak256;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::prometheus_metrics::{operations::ipfs as ops, Service};

const IPFS_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(pub String);

impl Cid {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IPFS request to {url} failed: {source:#?}")]
    Http { url: String, source: reqwest::Error },

    #[error("Unsuccessful status {status} from {url}")]
    Status { url: String, status: reqwest::StatusCode },

    #[error("Content for {0} not found")]
    NotFound(Cid),
}

/// Publish/fetch surface of a content-addressed store. Pinning of published
/// content is the provider's responsibility.
#[allow(async_fn_in_trait)]
pub trait ContentStorage {
    async fn publish(&self, content: &[u8], name: &str) -> Result<Cid, Error>;
    async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, Error>;
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Kubo-style HTTP API for publishing, plus a gateway for fetching.
pub struct IpfsClient {
    api_base: String,
    gateway_base: String,
    client: Client,
    metrics: Arc<Service>,
}

impl IpfsClient {
    fn normalize_url(base_url: &str) -> String {
        base_url.strip_suffix('/').unwrap_or(base_url).to_owned()
    }

    pub fn new(api_base: &str, gateway_base: &str, metrics: Arc<Service>) -> Result<Self, reqwest::Error> {
        let client = ClientBuilder::new().timeout(IPFS_CLIENT_TIMEOUT).build()?;
        Ok(Self {
            api_base: Self::normalize_url(api_base),
            gateway_base: Self::normalize_url(gateway_base),
            client,
            metrics,
        })
    }
}

impl ContentStorage for IpfsClient {
    async fn publish(&self, content: &[u8], name: &str) -> Result<Cid, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::PUBLISH, || async {
                let url = format!("{}/api/v0/add?pin=true", self.api_base);
                let part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(name.to_owned());
                let form = reqwest::multipart::Form::new().part("file", part);

                let response = self
                    .client
                    .post(&url)
                    .multipart(form)
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

                let parsed: AddResponse = response.json().await.map_err(|source| Error::Http {
                    url: url.clone(),
                    source,
                })?;
                tracing::info!(cid = %parsed.hash, name, size = content.len(), "Published content");
                Ok(Cid(parsed.hash))
            })
            .await
    }

    async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        self.metrics
            .run_with_metrics_and_logs_async(ops::FETCH, || async {
                let url = format!("{}/ipfs/{}", self.gateway_base, cid);
                let response = self.client.get(&url).send().await.map_err(|source| Error::Http {
                    url: url.clone(),
                    source,
                })?;

                let status = response.status();
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(Error::NotFound(cid.clone()));
                }
                if !status.is_success() {
                    return Err(Error::Status { url, status });
                }

                let bytes = response.bytes().await.map_err(|source| Error::Http { url, source })?;
                Ok(bytes.to_vec())
            })
            .await
    }
}

/// Keeps published blobs in memory, addressed by content hash. Used in dry
/// runs and tests where nothing should leave the process.
#[derive(Default)]
pub struct InMemoryStorage {
    blobs: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentStorage for InMemoryStorage {
    async fn publish(&self, content: &[u8], _name: &str) -> Result<Cid, Error> {
        let cid = Cid(format!("local-{:x}", keccak256(content)));
        self.blobs.lock().expect("no poisoned lock").insert(cid.clone(), content.to_vec());
        Ok(cid)
    }

    async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        self.blobs
            .lock()
            .expect("no poisoned lock")
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::NotFound(cid.clone()))
    }
}

/// The concrete storage a deployment runs with. Dry runs keep everything
/// in memory, nothing reaches the network.
pub enum StorageClient {
    Ipfs(IpfsClient),
    InMemory(InMemoryStorage),
}

impl ContentStorage for StorageClient {
    async fn publish(&self, content: &[u8], name: &str) -> Result<Cid, Error> {
        match self {
            StorageClient::Ipfs(client) => client.publish(content, name).await,
            StorageClient::InMemory(client) => client.publish(content, name).await,
        }
    }

    async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        match self {
            StorageClient::Ipfs(client) => client.fetch(cid).await,
            StorageClient::InMemory(client) => client.fetch(cid).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_roundtrip() {
        let storage = InMemoryStorage::new();
        let content = b"tree json";
        let cid = storage.publish(content, "merkle_tree.json").await.unwrap();
        let fetched = storage.fetch(&cid).await.unwrap();
        assert_eq!(fetched, content);
    }

    #[tokio::test]
    async fn fetch_of_unknown_cid_fails() {
        let storage = InMemoryStorage::new();
        let missing = Cid("local-unknown".to_owned());
        assert!(matches!(storage.fetch(&missing).await, Err(Error::NotFound(_))));
    }
}
