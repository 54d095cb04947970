use std::{future::IntoFuture, time::Duration};

use alloy::{
    network::EthereumWallet,
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::Filter,
    signers::local::PrivateKeySigner,
    transports::{RpcError, TransportErrorKind},
};
use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use guardian_common::{
    api::message::SignatureData, block::BlockRef, deposit::DepositEvent,
    tokio::time::timeout,
};
use thiserror::Error;

use super::{
    contracts::{
        decode_deposit_log, IDepositContract, IDepositSecurityModule, IStakingRouter,
        LogDecodeError, PauseSignature,
    },
    error::ErrorKind,
};
use crate::config::{PAUSE_CONFIRMATIONS, RPC_CALL_TIMEOUT_SECS};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),
    #[error("log query range too large")]
    RangeTooLarge,
    #[error("block {0} not found on provider")]
    MissingBlock(u64),
    #[error("malformed deposit log: {0}")]
    MalformedLog(#[from] LogDecodeError),
    #[error("pause transaction failed: {0}")]
    PauseFailed(String),
    #[error("provider reports chain id {actual}, configured {expected}")]
    WrongChain { expected: u64, actual: u64 },
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Transport(_)
            | ChainError::Timeout(_)
            | ChainError::RangeTooLarge
            | ChainError::MissingBlock(_)
            | ChainError::PauseFailed(_) => ErrorKind::Transient,
            ChainError::MalformedLog(_) => ErrorKind::Inconsistent,
            ChainError::WrongChain { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    // Providers disagree on how a rejected log range is reported, so the
    // classification is by message shape
    fn classify(message: String) -> Self {
        let lower = message.to_lowercase();
        let too_large = lower.contains("too large")
            || lower.contains("more than")
            || lower.contains("block range")
            || lower.contains("limit exceeded")
            || lower.contains("-32005");
        if too_large {
            ChainError::RangeTooLarge
        } else {
            ChainError::Transport(message)
        }
    }
}

impl From<RpcError<TransportErrorKind>> for ChainError {
    fn from(e: RpcError<TransportErrorKind>) -> Self {
        ChainError::classify(e.to_string())
    }
}

impl From<alloy::contract::Error> for ChainError {
    fn from(e: alloy::contract::Error) -> Self {
        ChainError::classify(e.to_string())
    }
}

/// On-chain state of one staking module at a probed block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingModuleState {
    pub id: u32,
    pub is_active: bool,
    /// keysOpIndex; invalidates stale attestations
    pub nonce: u64,
    pub last_deposit_block: u64,
}

/// Result of an on-chain pause submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseOutcome {
    Submitted { tx_hash: B256 },
    /// The module was paused before our transaction landed. Success
    AlreadyPaused,
}

/// Everything the pipeline needs from the execution layer.
/// Tests substitute a fake; production uses [`RpcChainClient`].
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn head_block_number(&self) -> Result<u64, ChainError>;

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockRef>, ChainError>;

    /// Deposit contract logs in the inclusive block range `[from, to]`,
    /// sorted by `(block_number, log_index)`
    async fn deposit_events(&self, from: u64, to: u64) -> Result<Vec<DepositEvent>, ChainError>;

    async fn deposit_root(&self, block: u64) -> Result<B256, ChainError>;

    async fn attest_message_prefix(&self) -> Result<B256, ChainError>;

    async fn pause_message_prefix(&self) -> Result<B256, ChainError>;

    async fn guardians(&self, block: u64) -> Result<Vec<Address>, ChainError>;

    async fn staking_modules(&self, block: u64) -> Result<Vec<StakingModuleState>, ChainError>;

    async fn withdrawal_credentials(&self, block: u64) -> Result<B256, ChainError>;

    async fn submit_pause(
        &self,
        block_number: u64,
        module_id: u32,
        signature: SignatureData,
    ) -> Result<PauseOutcome, ChainError>;
}

/// alloy-backed client. The provider carries the guardian wallet so the
/// pause transaction is signed locally and submitted as raw
pub struct RpcChainClient {
    provider: DynProvider,
    deposit_contract: Address,
    security_module: Address,
    staking_router: Address,
    call_timeout: Duration,
}

impl RpcChainClient {
    pub async fn connect(
        rpc_url: &str,
        signer: PrivateKeySigner,
        deposit_contract: Address,
        security_module: Address,
        staking_router: Address,
    ) -> Result<Self, ChainError> {
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect(rpc_url)
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?
            .erased();

        Ok(Self {
            provider,
            deposit_contract,
            security_module,
            staking_router,
            call_timeout: Duration::from_secs(RPC_CALL_TIMEOUT_SECS),
        })
    }

    /// Refuse to run against a provider serving a different chain
    pub async fn ensure_chain(&self, expected: u64) -> Result<(), ChainError> {
        let actual = self.chain_id().await?;
        if actual != expected {
            return Err(ChainError::WrongChain { expected, actual });
        }
        Ok(())
    }

    async fn rpc<T, E, F>(&self, fut: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: Into<ChainError>,
    {
        match timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ChainError::Timeout(self.call_timeout)),
        }
    }

    fn security_module(&self) -> IDepositSecurityModule::IDepositSecurityModuleInstance<DynProvider> {
        IDepositSecurityModule::new(self.security_module, self.provider.clone())
    }

    fn staking_router(&self) -> IStakingRouter::IStakingRouterInstance<DynProvider> {
        IStakingRouter::new(self.staking_router, self.provider.clone())
    }

    fn deposit(&self) -> IDepositContract::IDepositContractInstance<DynProvider> {
        IDepositContract::new(self.deposit_contract, self.provider.clone())
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.rpc(self.provider.get_chain_id()).await
    }

    async fn head_block_number(&self) -> Result<u64, ChainError> {
        self.rpc(self.provider.get_block_number()).await
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockRef>, ChainError> {
        let block = self
            .rpc(self.provider.get_block_by_number(number.into()))
            .await?;
        Ok(block.map(|b| BlockRef::new(b.header.number, b.header.hash, b.header.timestamp)))
    }

    async fn deposit_events(&self, from: u64, to: u64) -> Result<Vec<DepositEvent>, ChainError> {
        let filter = Filter::new()
            .address(self.deposit_contract)
            .event_signature(IDepositContract::DepositEvent::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);
        let logs = self.rpc(self.provider.get_logs(&filter)).await?;

        let mut events = logs
            .iter()
            .filter(|log| !log.removed)
            .map(decode_deposit_log)
            .collect::<Result<Vec<_>, _>>()?;
        events.sort();
        Ok(events)
    }

    async fn deposit_root(&self, block: u64) -> Result<B256, ChainError> {
        self.rpc(self.deposit().get_deposit_root().block(block.into()).call())
            .await
    }

    async fn attest_message_prefix(&self) -> Result<B256, ChainError> {
        self.rpc(self.security_module().ATTEST_MESSAGE_PREFIX().call())
            .await
    }

    async fn pause_message_prefix(&self) -> Result<B256, ChainError> {
        self.rpc(self.security_module().PAUSE_MESSAGE_PREFIX().call())
            .await
    }

    async fn guardians(&self, block: u64) -> Result<Vec<Address>, ChainError> {
        self.rpc(self.security_module().getGuardians().block(block.into()).call())
            .await
    }

    async fn staking_modules(&self, block: u64) -> Result<Vec<StakingModuleState>, ChainError> {
        let router = self.staking_router();
        let ids = self
            .rpc(router.getStakingModuleIds().block(block.into()).call())
            .await?;

        let mut modules = Vec::with_capacity(ids.len());
        for id in ids {
            let is_active = self
                .rpc(router.getStakingModuleIsActive(id).block(block.into()).call())
                .await?;
            let nonce = self
                .rpc(router.getStakingModuleNonce(id).block(block.into()).call())
                .await?;
            let last_deposit_block = self
                .rpc(
                    router
                        .getStakingModuleLastDepositBlock(id)
                        .block(block.into())
                        .call(),
                )
                .await?;
            modules.push(StakingModuleState {
                id: id.to::<u32>(),
                is_active,
                nonce: nonce.to::<u64>(),
                last_deposit_block: last_deposit_block.to::<u64>(),
            });
        }
        modules.sort_by_key(|m| m.id);
        Ok(modules)
    }

    async fn withdrawal_credentials(&self, block: u64) -> Result<B256, ChainError> {
        self.rpc(
            self.staking_router()
                .getWithdrawalCredentials()
                .block(block.into())
                .call(),
        )
        .await
    }

    async fn submit_pause(
        &self,
        block_number: u64,
        module_id: u32,
        signature: SignatureData,
    ) -> Result<PauseOutcome, ChainError> {
        let security_module = self.security_module();
        let call = security_module.pauseDeposits(
            U256::from(block_number),
            U256::from(module_id),
            PauseSignature {
                r: signature.r,
                vs: signature.vs,
            },
        );

        let pending = match call.send().await {
            Ok(pending) => pending,
            Err(e) => {
                let message = e.to_string();
                // A revert because someone else already paused the module is
                // success from the daemon's point of view
                if message.to_lowercase().contains("paused") {
                    return Ok(PauseOutcome::AlreadyPaused);
                }
                return Err(ChainError::PauseFailed(message));
            }
        };

        let receipt = pending
            .with_required_confirmations(PAUSE_CONFIRMATIONS)
            .get_receipt()
            .await
            .map_err(|e| ChainError::PauseFailed(e.to_string()))?;

        if !receipt.status() {
            return Err(ChainError::PauseFailed(format!(
                "transaction {} reverted",
                receipt.transaction_hash
            )));
        }

        Ok(PauseOutcome::Submitted {
            tx_hash: receipt.transaction_hash,
        })
    }
}
