use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::config::VERSION;

/// Compact recoverable secp256k1 signature as consumed by the on-chain
/// verifier: `r` plus the EIP-2098 `vs` word (s with the parity bit folded
/// into the top bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    pub r: B256,
    pub vs: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub version: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            version: VERSION.to_string(),
        }
    }
}

/// Attestation authorizing the next deposit batch for a staking module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositMessage {
    pub guardian_address: Address,
    pub guardian_index: i32,
    pub block_number: u64,
    pub block_hash: B256,
    pub deposit_root: B256,
    pub nonce: u64,
    pub staking_module_id: u32,
    pub signature: SignatureData,
    pub app: AppInfo,
}

/// Request to halt deposits on a staking module after a key conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseMessage {
    pub guardian_address: Address,
    pub guardian_index: i32,
    pub block_number: u64,
    pub staking_module_id: u32,
    pub signature: SignatureData,
    pub app: AppInfo,
}

/// Liveness beacon published periodically so operators can tell a silent
/// guardian from a dead one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub guardian_address: Address,
    pub guardian_index: i32,
    pub block_number: u64,
    pub app: AppInfo,
}

/// Envelope published to the message bus. Consumers dedupe on
/// `(guardianAddress, blockNumber, stakingModuleId, type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardianMessage {
    Deposit(DepositMessage),
    Pause(PauseMessage),
    Ping(PingMessage),
}

impl GuardianMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GuardianMessage::Deposit(_) => "deposit",
            GuardianMessage::Pause(_) => "pause",
            GuardianMessage::Ping(_) => "ping",
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            GuardianMessage::Deposit(m) => m.block_number,
            GuardianMessage::Pause(m) => m.block_number,
            GuardianMessage::Ping(m) => m.block_number,
        }
    }
}
