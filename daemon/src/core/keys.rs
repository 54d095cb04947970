use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use alloy_primitives::Address;
use async_trait::async_trait;
use futures::future::try_join_all;
use guardian_common::{
    api::keys::{ElBlockSnapshot, KeysResponse, ModulesResponse, RegistryKey, StakingModuleDto},
    crypto::BlsPublicKey,
};
use thiserror::Error;

use super::error::ErrorKind;
use crate::config::{KeysApiConfig, KEYS_API_TIMEOUT_SECS};

#[derive(Debug, Error)]
pub enum KeysError {
    #[error("keys api http error: {0}")]
    Http(String),
    #[error("keys api request timed out after {0:?}")]
    Timeout(Duration),
    #[error("keys api returned inconsistent data: {0}")]
    Inconsistent(String),
}

impl KeysError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeysError::Http(_) | KeysError::Timeout(_) => ErrorKind::Transient,
            KeysError::Inconsistent(_) => ErrorKind::Inconsistent,
        }
    }
}

/// Full registry inventory at one EL block: every unused key grouped by the
/// staking module that registered it
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub block: ElBlockSnapshot,
    pub modules: Vec<StakingModuleDto>,
    unused: HashMap<Address, HashSet<BlsPublicKey>>,
    pub total_unused: usize,
}

impl KeySnapshot {
    pub fn new(
        block: ElBlockSnapshot,
        modules: Vec<StakingModuleDto>,
        unused: HashMap<Address, HashSet<BlsPublicKey>>,
    ) -> Self {
        let total_unused = unused.values().map(HashSet::len).sum();
        Self {
            block,
            modules,
            unused,
            total_unused,
        }
    }

    pub fn unused_for(&self, module_address: &Address) -> Option<&HashSet<BlsPublicKey>> {
        self.unused.get(module_address)
    }

    pub fn module_address(&self, id: u32) -> Option<Address> {
        self.modules
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.staking_module_address)
    }
}

#[async_trait]
pub trait KeysRegistry: Send + Sync + 'static {
    async fn snapshot(&self) -> Result<KeySnapshot, KeysError>;
}

/// HTTP client for the external Keys API
pub struct KeysApiClient {
    http: reqwest::Client,
    base_url: String,
    batch_size: usize,
    concurrency: usize,
}

impl KeysApiClient {
    pub fn new(config: &KeysApiConfig) -> Result<Self, KeysError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(KEYS_API_TIMEOUT_SECS))
            .build()
            .map_err(|e| KeysError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url(),
            batch_size: config.registry_keys_query_batch_size.max(1),
            concurrency: config.registry_keys_query_concurrency.max(1),
        })
    }

    async fn fetch_modules(&self) -> Result<ModulesResponse, KeysError> {
        let url = format!("{}/v1/modules", self.base_url);
        self.get_json(&url).await
    }

    async fn fetch_keys_page(&self, offset: usize) -> Result<KeysResponse, KeysError> {
        let url = format!(
            "{}/v1/keys?used=false&limit={}&offset={}",
            self.base_url, self.batch_size, offset
        );
        self.get_json(&url).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, KeysError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?
            .error_for_status()
            .map_err(map_reqwest_error)?;
        response.json().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> KeysError {
    if e.is_timeout() {
        KeysError::Timeout(Duration::from_secs(KEYS_API_TIMEOUT_SECS))
    } else {
        KeysError::Http(e.to_string())
    }
}

#[async_trait]
impl KeysRegistry for KeysApiClient {
    async fn snapshot(&self) -> Result<KeySnapshot, KeysError> {
        let modules = self.fetch_modules().await?;

        // Key pages are pulled in waves of `concurrency` requests until one
        // page comes back short
        let mut pages: Vec<KeysResponse> = Vec::new();
        let mut offset = 0usize;
        'outer: loop {
            let wave: Vec<_> = (0..self.concurrency)
                .map(|i| self.fetch_keys_page(offset + i * self.batch_size))
                .collect();
            let results = try_join_all(wave).await?;
            offset += self.concurrency * self.batch_size;
            for page in results {
                let full = page.data.len() >= self.batch_size;
                pages.push(page);
                if !full {
                    break 'outer;
                }
            }
        }

        assemble_snapshot(modules, pages)
    }
}

// Pure assembly so the consistency rules are testable without HTTP.
// Every page must describe the same EL snapshot, and a pubkey may appear at
// most once across the whole inventory.
fn assemble_snapshot(
    modules: ModulesResponse,
    pages: Vec<KeysResponse>,
) -> Result<KeySnapshot, KeysError> {
    let block = modules.meta.el_block_snapshot;

    let mut unused: HashMap<Address, HashSet<BlsPublicKey>> = HashMap::new();
    let mut seen: HashSet<BlsPublicKey> = HashSet::new();

    for page in &pages {
        if page.meta.el_block_snapshot != block {
            return Err(KeysError::Inconsistent(format!(
                "snapshot moved mid-read: block {} vs {}",
                page.meta.el_block_snapshot.block_number, block.block_number
            )));
        }
        for RegistryKey {
            key,
            used,
            module_address,
            ..
        } in &page.data
        {
            if !seen.insert(*key) {
                return Err(KeysError::Inconsistent(format!(
                    "duplicate pubkey {} in snapshot",
                    key
                )));
            }
            if *used {
                continue;
            }
            unused.entry(*module_address).or_default().insert(*key);
        }
    }

    Ok(KeySnapshot::new(block, modules.data, unused))
}
