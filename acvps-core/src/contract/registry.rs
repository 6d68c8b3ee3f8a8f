//! Contract lookup: static configuration, the control plane, and a cached
//! wrapper around either.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{Certificate, Contract, ContractStatus};
use crate::cache::CacheLayer;
use crate::config::ContractsSection;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("contract registry unavailable: {0}")]
    Unavailable(String),

    #[error("contract '{id}' is {status}")]
    Inactive { id: String, status: ContractStatus },

    #[error("contract '{id}' has expired")]
    Expired { id: String },

    #[error("malformed registry response: {0}")]
    Malformed(String),

    #[error("failed to build registry client: {0}")]
    Client(String),
}

#[async_trait]
pub trait ContractRegistry: Send + Sync {
    async fn contract(&self, id: &str) -> Result<Contract, RegistryError>;

    async fn certificate(&self, id: &str) -> Result<Certificate, RegistryError>;

    /// A contract that may be enforced right now.
    async fn enforceable(&self, id: &str) -> Result<Contract, RegistryError> {
        let contract = self.contract(id).await?;
        if contract.status != ContractStatus::Active {
            return Err(RegistryError::Inactive {
                id: contract.contract_id,
                status: contract.status,
            });
        }
        if !contract.is_usable_at(Utc::now()) {
            return Err(RegistryError::Expired {
                id: contract.contract_id,
            });
        }
        Ok(contract)
    }
}

/// Pick the registry described by configuration.
///
/// A control plane URL wins over inline definitions, and its lookups go
/// through the decision cache.
pub fn from_config(
    config: &ContractsSection,
    cache: Arc<CacheLayer>,
) -> Result<Arc<dyn ContractRegistry>, RegistryError> {
    match &config.control_plane_url {
        Some(url) => {
            let http = HttpContractRegistry::new(url, config.api_key.clone(), config.timeout)?;
            Ok(Arc::new(CachedContractRegistry::new(
                http,
                cache,
                config.cache_ttl,
            )))
        }
        None => Ok(Arc::new(StaticContractRegistry::from_config(config))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Static
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StaticContractRegistry {
    contracts: HashMap<String, Contract>,
    certificates: HashMap<String, Certificate>,
}

impl StaticContractRegistry {
    pub fn new(
        contracts: impl IntoIterator<Item = Contract>,
        certificates: impl IntoIterator<Item = Certificate>,
    ) -> Self {
        Self {
            contracts: contracts
                .into_iter()
                .map(|c| (c.contract_id.clone(), c))
                .collect(),
            certificates: certificates
                .into_iter()
                .map(|c| (c.certificate_id.clone(), c))
                .collect(),
        }
    }

    pub fn from_config(config: &ContractsSection) -> Self {
        Self::new(config.definitions.clone(), config.certificates.clone())
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

#[async_trait]
impl ContractRegistry for StaticContractRegistry {
    async fn contract(&self, id: &str) -> Result<Contract, RegistryError> {
        self.contracts
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind: "contract",
                id: id.to_string(),
            })
    }

    async fn certificate(&self, id: &str) -> Result<Certificate, RegistryError> {
        self.certificates
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind: "certificate",
                id: id.to_string(),
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control plane
// ─────────────────────────────────────────────────────────────────────────────

/// Reads `/api/contracts/{id}` and `/api/certificates/{id}` from the
/// control plane.
pub struct HttpContractRegistry {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl HttpContractRegistry {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let base = Url::parse(base_url).map_err(|e| RegistryError::Client(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(RegistryError::Client(format!(
                "'{base_url}' cannot be used as a base URL"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base,
            api_key,
        })
    }

    fn url_for(&self, collection: &str, id: &str) -> Url {
        let mut url = self.base.clone();
        // cannot_be_a_base was rejected in new()
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", collection, id]);
        }
        url
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        collection: &str,
        id: &str,
    ) -> Result<T, RegistryError> {
        let url = self.url_for(collection, id);
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound {
                kind,
                id: id.to_string(),
            }),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| RegistryError::Malformed(e.to_string())),
            status => Err(RegistryError::Unavailable(format!(
                "control plane returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl ContractRegistry for HttpContractRegistry {
    async fn contract(&self, id: &str) -> Result<Contract, RegistryError> {
        self.fetch("contract", "contracts", id).await
    }

    async fn certificate(&self, id: &str) -> Result<Certificate, RegistryError> {
        self.fetch("certificate", "certificates", id).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cached
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps resolved contracts in the cache layer under `contract:{id}` and
/// `certificate:{id}`. Misses and cache failures fall through to `inner`.
pub struct CachedContractRegistry<R> {
    inner: R,
    cache: Arc<CacheLayer>,
    ttl: Duration,
}

impl<R: ContractRegistry> CachedContractRegistry<R> {
    pub fn new(inner: R, cache: Arc<CacheLayer>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }
}

#[async_trait]
impl<R: ContractRegistry> ContractRegistry for CachedContractRegistry<R> {
    async fn contract(&self, id: &str) -> Result<Contract, RegistryError> {
        let key = format!("contract:{id}");
        if let Some(contract) = self.cache.get_struct::<Contract>(&key).await {
            debug!(contract_id = %id, "Contract served from cache");
            return Ok(contract);
        }

        let contract = self.inner.contract(id).await.inspect_err(|e| {
            if matches!(e, RegistryError::Unavailable(_)) {
                warn!(contract_id = %id, error = %e, "Contract lookup failed");
            }
        })?;
        self.cache.set_struct(&key, &contract, self.ttl).await;
        Ok(contract)
    }

    async fn certificate(&self, id: &str) -> Result<Certificate, RegistryError> {
        let key = format!("certificate:{id}");
        if let Some(certificate) = self.cache.get_struct::<Certificate>(&key).await {
            return Ok(certificate);
        }

        let certificate = self.inner.certificate(id).await?;
        self.cache.set_struct(&key, &certificate, self.ttl).await;
        Ok(certificate)
    }
}
