use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::crypto::BlsPublicKey;

// DTOs for the external Keys API. The service may add fields at any time;
// deserialization ignores anything unknown.

/// EL block the Keys API snapshot was taken at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElBlockSnapshot {
    pub block_number: u64,
    pub block_hash: B256,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysApiMeta {
    pub el_block_snapshot: ElBlockSnapshot,
}

/// One registered signing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryKey {
    pub key: BlsPublicKey,
    pub used: bool,
    pub module_address: Address,
    #[serde(default)]
    pub operator_index: Option<u64>,
    #[serde(default)]
    pub index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub data: Vec<RegistryKey>,
    pub meta: KeysApiMeta,
}

/// Staking module description as reported by the Keys API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakingModuleDto {
    pub id: u32,
    pub staking_module_address: Address,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nonce: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesResponse {
    pub data: Vec<StakingModuleDto>,
    pub meta: KeysApiMeta,
}
