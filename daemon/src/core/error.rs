use thiserror::Error;

use super::{
    broker::BrokerError, cache::CacheError, chain::ChainError, keys::KeysError,
    signer::SignerError,
};

/// How an error propagates through the pipeline:
/// retried, skipped, rolled back, or process-terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O fault against an external collaborator; retry with backoff
    Transient,
    /// Snapshot too old or taken on a different fork; skip this block
    Stale,
    /// Data that contradicts itself; rollback when unsealed, fatal when sealed
    Inconsistent,
    /// Bad operator-provided configuration
    ConfigInvalid,
    /// Wallet is not in the guardian set. A state, not a failure
    Unauthorized,
    /// Chain identity or sealed history is broken; terminate
    Fatal,
}

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Keys(#[from] KeysError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("service is already running")]
    AlreadyRunning,
}

impl GuardianError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardianError::Chain(e) => e.kind(),
            GuardianError::Cache(e) => e.kind(),
            GuardianError::Keys(e) => e.kind(),
            GuardianError::Broker(BrokerError::Config(_)) => ErrorKind::ConfigInvalid,
            GuardianError::Broker(_) => ErrorKind::Transient,
            GuardianError::Signer(e) => e.kind(),
            GuardianError::Config(_) => ErrorKind::ConfigInvalid,
            GuardianError::AlreadyRunning => ErrorKind::ConfigInvalid,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
