use alloy::signers::{local::PrivateKeySigner, SignerSync};
use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::SolValue;
use guardian_common::{api::message::SignatureData, tokio::sync::OnceCell};
use thiserror::Error;

use super::{
    chain::{ChainClient, ChainError},
    error::ErrorKind,
};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid wallet private key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl SignerError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// Fields covered by an attestation signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestPayload {
    pub block_number: u64,
    pub block_hash: B256,
    pub deposit_root: B256,
    pub nonce: u64,
    pub staking_module_id: u32,
}

/// Recoverable secp256k1 signature in every representation consumers need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardianSignature {
    pub r: B256,
    pub s: B256,
    pub v: u8,
    /// EIP-2098 compact s-with-parity word
    pub vs: B256,
}

impl GuardianSignature {
    pub fn data(&self) -> SignatureData {
        SignatureData {
            r: self.r,
            vs: self.vs,
        }
    }
}

/// Holds the guardian key and produces the double-keccak message signatures
/// the security module verifies on-chain.
///
/// The message prefixes are contract constants; they are read once and kept
/// for the process lifetime. The private key never leaves this struct — the
/// only thing exposed is the derived address.
pub struct GuardianSigner {
    signer: PrivateKeySigner,
    address: Address,
    attest_prefix: OnceCell<B256>,
    pause_prefix: OnceCell<B256>,
}

impl GuardianSigner {
    pub fn new(private_key_hex: &str) -> Result<Self, SignerError> {
        let stripped = private_key_hex.strip_prefix("0x").unwrap_or(private_key_hex);
        let signer: PrivateKeySigner = stripped
            .parse()
            .map_err(|e| SignerError::InvalidKey(format!("{e}")))?;
        let address = signer.address();
        Ok(Self {
            signer,
            address,
            attest_prefix: OnceCell::new(),
            pause_prefix: OnceCell::new(),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn attest_prefix<C: ChainClient>(&self, chain: &C) -> Result<B256, ChainError> {
        self.attest_prefix
            .get_or_try_init(|| chain.attest_message_prefix())
            .await
            .copied()
    }

    pub async fn pause_prefix<C: ChainClient>(&self, chain: &C) -> Result<B256, ChainError> {
        self.pause_prefix
            .get_or_try_init(|| chain.pause_message_prefix())
            .await
            .copied()
    }

    /// `keccak256(prefix ‖ keccak256(depositRoot ‖ nonce ‖ blockNumber ‖
    /// blockHash ‖ moduleId))`, every scalar a 32-byte big-endian word
    pub fn sign_attest(
        &self,
        prefix: B256,
        payload: &AttestPayload,
    ) -> Result<GuardianSignature, SignerError> {
        let encoded = (
            payload.deposit_root,
            U256::from(payload.nonce),
            U256::from(payload.block_number),
            payload.block_hash,
            U256::from(payload.staking_module_id),
        )
            .abi_encode();
        self.sign_digest(prefixed_hash(prefix, keccak256(&encoded)))
    }

    /// `keccak256(prefix ‖ keccak256(blockNumber ‖ moduleId))`
    pub fn sign_pause(
        &self,
        prefix: B256,
        block_number: u64,
        staking_module_id: u32,
    ) -> Result<GuardianSignature, SignerError> {
        let encoded = (U256::from(block_number), U256::from(staking_module_id)).abi_encode();
        self.sign_digest(prefixed_hash(prefix, keccak256(&encoded)))
    }

    fn sign_digest(&self, digest: B256) -> Result<GuardianSignature, SignerError> {
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        let r = B256::from(signature.r());
        let s = B256::from(signature.s());
        let parity = signature.v();
        let mut vs = s;
        if parity {
            vs.0[0] |= 0x80;
        }
        Ok(GuardianSignature {
            r,
            s,
            v: 27 + parity as u8,
            vs,
        })
    }
}

fn prefixed_hash(prefix: B256, inner: B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(prefix.as_slice());
    buf[32..].copy_from_slice(inner.as_slice());
    keccak256(buf)
}
