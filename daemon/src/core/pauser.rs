use std::{collections::HashMap, sync::Arc};

use guardian_common::{api::message::SignatureData, tokio::sync::Mutex};
use metrics::counter;

use super::chain::{ChainClient, ChainError, PauseOutcome};
use crate::config::{METRIC_PAUSE_ATTEMPTS, METRIC_PAUSE_FAILURES};

/// Lifecycle of a pause for one staking module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Idle,
    Signing,
    Broadcasting,
    OnChainPending,
    Failed { attempts: u32 },
}

impl PauseState {
    fn attempts(&self) -> u32 {
        match self {
            PauseState::Failed { attempts } => *attempts,
            _ => 0,
        }
    }
}

/// Serializes every on-chain pause submission behind one process-wide lock.
///
/// Two pause transactions in flight would race on the guardian wallet
/// nonce; the lock makes that impossible regardless of how many modules
/// are in trouble at once.
pub struct PauseSubmitter<C: ChainClient> {
    chain: Arc<C>,
    submit_guard: Mutex<()>,
    states: Mutex<HashMap<u32, PauseState>>,
}

impl<C: ChainClient> PauseSubmitter<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self {
            chain,
            submit_guard: Mutex::new(()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn state(&self, module_id: u32) -> PauseState {
        self.states
            .lock()
            .await
            .get(&module_id)
            .copied()
            .unwrap_or(PauseState::Idle)
    }

    pub async fn transition(&self, module_id: u32, state: PauseState) {
        debug!("pause state for module {}: {:?}", module_id, state);
        self.states.lock().await.insert(module_id, state);
    }

    /// A submission already in flight for this module must finish before
    /// another one starts
    pub async fn is_pending(&self, module_id: u32) -> bool {
        matches!(self.state(module_id).await, PauseState::OnChainPending)
    }

    /// Record a failed signing or broadcast attempt so the next block
    /// retries with the attempt count intact
    pub async fn mark_failed(&self, module_id: u32) {
        let attempts = self.state(module_id).await.attempts() + 1;
        self.transition(module_id, PauseState::Failed { attempts })
            .await;
    }

    /// The module got paused without us (or our earlier attempt landed);
    /// nothing left to submit
    pub async fn mark_resolved(&self, module_id: u32) {
        let mut states = self.states.lock().await;
        if states.get(&module_id).is_some_and(|s| *s != PauseState::Idle) {
            info!("module {} pause resolved", module_id);
            states.insert(module_id, PauseState::Idle);
        }
    }

    pub async fn submit(
        &self,
        module_id: u32,
        block_number: u64,
        signature: SignatureData,
    ) -> Result<PauseOutcome, ChainError> {
        // Process-wide: at most one pause transaction in flight
        let _guard = self.submit_guard.lock().await;
        let attempts = self.state(module_id).await.attempts();
        self.transition(module_id, PauseState::OnChainPending).await;
        counter!(METRIC_PAUSE_ATTEMPTS).increment(1);

        match self.chain.submit_pause(block_number, module_id, signature).await {
            Ok(outcome) => {
                match &outcome {
                    PauseOutcome::Submitted { tx_hash } => {
                        warn!(
                            "pauseDeposits({}, {}) confirmed in tx {}",
                            block_number, module_id, tx_hash
                        );
                    }
                    PauseOutcome::AlreadyPaused => {
                        info!("module {} was already paused", module_id);
                    }
                }
                self.transition(module_id, PauseState::Idle).await;
                Ok(outcome)
            }
            Err(e) => {
                counter!(METRIC_PAUSE_FAILURES).increment(1);
                error!(
                    "pause submission for module {} failed (attempt {}): {}",
                    module_id,
                    attempts + 1,
                    e
                );
                self.transition(
                    module_id,
                    PauseState::Failed {
                        attempts: attempts + 1,
                    },
                )
                .await;
                Err(e)
            }
        }
    }
}
