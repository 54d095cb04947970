use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use alloy_primitives::B256;
use guardian_common::{
    api::message::{AppInfo, DepositMessage, GuardianMessage, PauseMessage, PingMessage},
    block::BlockRef,
    tokio::{
        select, spawn_task,
        sync::{watch, Mutex},
        task::JoinHandle,
        time::interval,
    },
};
use metrics::{counter, gauge};

use super::{
    backoff::{retry, Backoff},
    broker::{publish_with_retry, MessageBroker},
    cache::DepositEventCache,
    chain::{ChainClient, ChainError, StakingModuleState},
    detector,
    error::{ErrorKind, GuardianError},
    keys::{KeySnapshot, KeysRegistry},
    pauser::{PauseState, PauseSubmitter},
    signer::{AttestPayload, GuardianSigner},
    status::StatusTracker,
};
use crate::config::{
    BLOCK_POLL_INTERVAL_MILLIS, CONFIRMATION_DEPTH, MAX_SNAPSHOT_LAG, METRIC_BLOCKS_PROCESSED,
    METRIC_CACHE_EVENTS, METRIC_CACHE_WATERMARK, METRIC_DECISIONS, METRIC_STALE_SNAPSHOTS,
    PING_INTERVAL_BLOCKS,
};

/// Why a module got no signed message for a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    StaleSnapshot,
    InconsistentSnapshot,
    NotGuardian,
    ModuleInactive,
    PausePending,
    RpcError(String),
    KeysApiError(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::StaleSnapshot => write!(f, "stale_snapshot"),
            SkipReason::InconsistentSnapshot => write!(f, "inconsistent_snapshot"),
            SkipReason::NotGuardian => write!(f, "not_guardian"),
            SkipReason::ModuleInactive => write!(f, "module_inactive"),
            SkipReason::PausePending => write!(f, "pause_pending"),
            SkipReason::RpcError(e) => write!(f, "rpc_error({})", e),
            SkipReason::KeysApiError(e) => write!(f, "keys_api_error({})", e),
        }
    }
}

/// Outcome of the pipeline for one `(block, module)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Attest,
    Pause { conflicts: usize },
    Skip(SkipReason),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Attest => "attest",
            Decision::Pause { .. } => "pause",
            Decision::Skip(_) => "skip",
        }
    }
}

/// One processed block and the decision taken for every module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBlock {
    pub number: u64,
    pub decisions: Vec<(u32, Decision)>,
}

struct LoopState {
    last_processed: Option<u64>,
    last_ping: u64,
    guardian_index: Option<i32>,
}

/// Drives the security pipeline once per new finalized-enough block.
///
/// One logical loop: new-block notifications coalesce (only the latest
/// unprocessed block is taken), modules are handled in ascending id order,
/// and shutdown waits for the in-flight block before flushing the cache.
pub struct GuardianService<C, K, M>
where
    C: ChainClient,
    K: KeysRegistry,
    M: MessageBroker + ?Sized,
{
    chain: Arc<C>,
    cache: Arc<DepositEventCache<C>>,
    keys: Arc<K>,
    broker: Arc<M>,
    signer: Arc<GuardianSigner>,
    pauser: Arc<PauseSubmitter<C>>,
    status: Arc<StatusTracker>,
    state: Mutex<LoopState>,
    task: Mutex<Option<JoinHandle<Result<(), GuardianError>>>>,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl<C, K, M> GuardianService<C, K, M>
where
    C: ChainClient,
    K: KeysRegistry,
    M: MessageBroker + ?Sized,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<C>,
        cache: Arc<DepositEventCache<C>>,
        keys: Arc<K>,
        broker: Arc<M>,
        signer: Arc<GuardianSigner>,
        pauser: Arc<PauseSubmitter<C>>,
        status: Arc<StatusTracker>,
    ) -> Self {
        Self {
            chain,
            cache,
            keys,
            broker,
            signer,
            pauser,
            status,
            state: Mutex::new(LoopState {
                last_processed: None,
                last_ping: 0,
                guardian_index: None,
            }),
            task: Mutex::new(None),
            shutdown: watch::channel(false).0,
            done: watch::channel(false).0,
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), GuardianError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(GuardianError::AlreadyRunning);
        }

        info!("starting guardian service as {}", self.signer.address());
        let zelf = Arc::clone(self);
        *task = Some(spawn_task("block-loop", async move {
            let result = zelf.run_loop().await;
            if let Err(e) = &result {
                error!("guardian service terminated: {}", e);
            }
            let _ = zelf.done.send(true);
            result
        }));
        Ok(())
    }

    /// Wait until the service loop has exited on its own (fatal error)
    pub async fn join(&self) {
        let mut done = self.done.subscribe();
        if *done.borrow() {
            return;
        }
        let _ = done.changed().await;
    }

    /// Stop accepting blocks, wait for the in-flight block, flush the cache
    pub async fn stop(&self) -> Result<(), GuardianError> {
        info!("stopping guardian service");
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            match handle.await {
                Ok(result) => result?,
                Err(e) => error!("block loop task failed: {}", e),
            }
        }
        Ok(())
    }

    async fn run_loop(self: &Arc<Self>) -> Result<(), GuardianError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(Duration::from_millis(BLOCK_POLL_INTERVAL_MILLIS));

        loop {
            select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.process_next_block().await {
                Ok(Some(processed)) => {
                    counter!(METRIC_BLOCKS_PROCESSED).increment(1);
                    trace!("finished block {}", processed.number);
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    let _ = self.cache.flush().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("block skipped: {}", e);
                }
            }
        }

        self.cache.flush().await?;
        info!("guardian service stopped cleanly");
        Ok(())
    }

    /// Resolve `head - CONFIRMATION_DEPTH` and run the pipeline on it if it
    /// has not been processed yet
    pub async fn process_next_block(&self) -> Result<Option<ProcessedBlock>, GuardianError> {
        let head = self.transient_retry(|| self.chain.head_block_number()).await?;
        let target = head.saturating_sub(CONFIRMATION_DEPTH);

        if self
            .state
            .lock()
            .await
            .last_processed
            .is_some_and(|last| target <= last)
        {
            return Ok(None);
        }

        let block = self
            .transient_retry(|| self.chain.block_by_number(target))
            .await?
            .ok_or(ChainError::MissingBlock(target))?;

        let decisions = self.process_block(&block, head).await?;
        for (module_id, decision) in &decisions {
            info!(
                "block {} module {}: {:?}",
                block.number, module_id, decision
            );
            counter!(METRIC_DECISIONS, "kind" => decision.label()).increment(1);
        }

        self.state.lock().await.last_processed = Some(target);
        self.status.record_block(target);
        Ok(Some(ProcessedBlock {
            number: target,
            decisions,
        }))
    }

    async fn process_block(
        &self,
        block: &BlockRef,
        head: u64,
    ) -> Result<Vec<(u32, Decision)>, GuardianError> {
        debug!("processing block {} (head {})", block, head);

        // Guardian context at the processed block
        let guardians = self
            .transient_retry(|| self.chain.guardians(block.number))
            .await?;
        let guardian_index = guardians
            .iter()
            .position(|a| *a == self.signer.address())
            .map(|i| i as i32)
            .unwrap_or(-1);
        self.note_guardian_index(guardian_index).await;

        let modules = self
            .transient_retry(|| self.chain.staking_modules(block.number))
            .await?;
        let withdrawal_credentials = self
            .transient_retry(|| self.chain.withdrawal_credentials(block.number))
            .await?;

        // Deposit history must cover the processed block before any decision
        self.cache.advance_to(block, head).await?;
        self.status.record_watermark(self.cache.watermark().await);
        gauge!(METRIC_CACHE_WATERMARK).set(self.cache.watermark().await as f64);
        gauge!(METRIC_CACHE_EVENTS).set(self.cache.total_events().await as f64);

        // Registry inventory, validated for freshness against the provider
        let snapshot = match self.keys.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("keys api snapshot unavailable: {}", e);
                let reason = match e.kind() {
                    ErrorKind::Inconsistent => SkipReason::InconsistentSnapshot,
                    _ => SkipReason::KeysApiError(e.to_string()),
                };
                return Ok(skip_all(&modules, reason));
            }
        };
        if let Some(reason) = self.snapshot_staleness(&snapshot, block).await? {
            counter!(METRIC_STALE_SNAPSHOTS).increment(1);
            warn!(
                "keys api snapshot at block {} unusable for block {}: {}",
                snapshot.block.block_number, block.number, reason
            );
            return Ok(skip_all(&modules, reason));
        }

        let mut decisions = Vec::with_capacity(modules.len());
        for module in &modules {
            let decision = self
                .process_module(block, module, &snapshot, withdrawal_credentials, guardian_index)
                .await?;
            decisions.push((module.id, decision));
        }

        self.maybe_ping(block, guardian_index).await;
        Ok(decisions)
    }

    async fn process_module(
        &self,
        block: &BlockRef,
        module: &StakingModuleState,
        snapshot: &KeySnapshot,
        withdrawal_credentials: B256,
        guardian_index: i32,
    ) -> Result<Decision, GuardianError> {
        if !module.is_active {
            // Either our earlier pause landed or someone else halted it
            self.pauser.mark_resolved(module.id).await;
            return Ok(Decision::Skip(SkipReason::ModuleInactive));
        }

        let Some(module_address) = snapshot.module_address(module.id) else {
            return Ok(Decision::Skip(SkipReason::KeysApiError(format!(
                "module {} missing from registry",
                module.id
            ))));
        };
        let empty = HashSet::new();
        let unused = snapshot.unused_for(&module_address).unwrap_or(&empty);

        let conflicts = detector::scan(
            &self.cache,
            unused,
            withdrawal_credentials,
            snapshot.block.block_number,
        )
        .await;

        if conflicts.is_empty() {
            if guardian_index < 0 {
                return Ok(Decision::Skip(SkipReason::NotGuardian));
            }
            match self.attest(block, module, guardian_index).await {
                Ok(()) => Ok(Decision::Attest),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => Ok(Decision::Skip(SkipReason::RpcError(e.to_string()))),
            }
        } else {
            error!(
                "KEY CONFLICT on module {}: {} unused registry keys already deposited, first {} at block {}",
                module.id,
                conflicts.len(),
                conflicts[0].pubkey,
                conflicts[0].block_number
            );
            self.pause(block, module, snapshot, withdrawal_credentials, guardian_index)
                .await
        }
    }

    async fn attest(
        &self,
        block: &BlockRef,
        module: &StakingModuleState,
        guardian_index: i32,
    ) -> Result<(), GuardianError> {
        let deposit_root = self
            .transient_retry(|| self.chain.deposit_root(block.number))
            .await?;
        let prefix = self.signer.attest_prefix(self.chain.as_ref()).await?;
        let signature = self.signer.sign_attest(
            prefix,
            &AttestPayload {
                block_number: block.number,
                block_hash: block.hash,
                deposit_root,
                nonce: module.nonce,
                staking_module_id: module.id,
            },
        )?;

        let message = GuardianMessage::Deposit(DepositMessage {
            guardian_address: self.signer.address(),
            guardian_index,
            block_number: block.number,
            block_hash: block.hash,
            deposit_root,
            nonce: module.nonce,
            staking_module_id: module.id,
            signature: signature.data(),
            app: AppInfo::default(),
        });
        publish_with_retry(self.broker.as_ref(), &message).await?;
        debug!(
            "attested deposits for module {} at block {}",
            module.id, block.number
        );
        Ok(())
    }

    async fn pause(
        &self,
        block: &BlockRef,
        module: &StakingModuleState,
        snapshot: &KeySnapshot,
        withdrawal_credentials: B256,
        guardian_index: i32,
    ) -> Result<Decision, GuardianError> {
        // Re-evaluate at the watermark current right now; the evidence must
        // hold at the moment of signing, not at the start of the block
        let module_address = snapshot
            .module_address(module.id)
            .expect("checked by caller");
        let empty = HashSet::new();
        let unused = snapshot.unused_for(&module_address).unwrap_or(&empty);
        let conflicts = detector::scan(
            &self.cache,
            unused,
            withdrawal_credentials,
            snapshot.block.block_number,
        )
        .await;
        if conflicts.is_empty() {
            info!(
                "conflict on module {} no longer present at signing time",
                module.id
            );
            if guardian_index < 0 {
                return Ok(Decision::Skip(SkipReason::NotGuardian));
            }
            return match self.attest(block, module, guardian_index).await {
                Ok(()) => Ok(Decision::Attest),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => Ok(Decision::Skip(SkipReason::RpcError(e.to_string()))),
            };
        }

        if guardian_index < 0 {
            // The contract would reject both our signature and our
            // transaction; all we can do is shout
            error!(
                "conflict detected on module {} but this wallet is not a guardian",
                module.id
            );
            return Ok(Decision::Skip(SkipReason::NotGuardian));
        }

        if self.pauser.is_pending(module.id).await {
            return Ok(Decision::Skip(SkipReason::PausePending));
        }

        self.pauser.transition(module.id, PauseState::Signing).await;
        let prefix = match self.signer.pause_prefix(self.chain.as_ref()).await {
            Ok(prefix) => prefix,
            Err(e) => {
                self.pauser.mark_failed(module.id).await;
                return Ok(Decision::Skip(SkipReason::RpcError(e.to_string())));
            }
        };
        let signature = self.signer.sign_pause(prefix, block.number, module.id)?;

        let message = GuardianMessage::Pause(PauseMessage {
            guardian_address: self.signer.address(),
            guardian_index,
            block_number: block.number,
            staking_module_id: module.id,
            signature: signature.data(),
            app: AppInfo::default(),
        });
        self.pauser
            .transition(module.id, PauseState::Broadcasting)
            .await;
        if let Err(e) = publish_with_retry(self.broker.as_ref(), &message).await {
            // Still worth submitting on-chain; the bus side is retried when
            // the next block re-detects the conflict
            error!(
                "failed to broadcast pause for module {}: {}",
                module.id, e
            );
            self.pauser.mark_failed(module.id).await;
        }

        // Errors are recorded by the submitter and retried on the next
        // block; the pause path is never silently dropped
        let _ = self
            .pauser
            .submit(module.id, block.number, signature.data())
            .await;

        Ok(Decision::Pause {
            conflicts: conflicts.len(),
        })
    }

    async fn snapshot_staleness(
        &self,
        snapshot: &KeySnapshot,
        block: &BlockRef,
    ) -> Result<Option<SkipReason>, GuardianError> {
        let snap = &snapshot.block;
        if block.number.abs_diff(snap.block_number) > MAX_SNAPSHOT_LAG {
            return Ok(Some(SkipReason::StaleSnapshot));
        }
        // The snapshot must describe the canonical chain, not an orphaned fork
        let canonical = self
            .transient_retry(|| self.chain.block_by_number(snap.block_number))
            .await?;
        match canonical {
            Some(canonical) if canonical.hash == snap.block_hash => Ok(None),
            _ => Ok(Some(SkipReason::StaleSnapshot)),
        }
    }

    async fn note_guardian_index(&self, index: i32) {
        let mut state = self.state.lock().await;
        if state.guardian_index != Some(index) {
            if index < 0 {
                warn!(
                    "wallet {} is not in the guardian set; the daemon will only watch",
                    self.signer.address()
                );
            } else {
                info!(
                    "wallet {} is guardian #{}",
                    self.signer.address(),
                    index
                );
            }
            state.guardian_index = Some(index);
        }
        drop(state);
        self.status.record_guardian_index(index);
    }

    async fn maybe_ping(&self, block: &BlockRef, guardian_index: i32) {
        let due = {
            let mut state = self.state.lock().await;
            if block.number.saturating_sub(state.last_ping) >= PING_INTERVAL_BLOCKS {
                state.last_ping = block.number;
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }
        let message = GuardianMessage::Ping(PingMessage {
            guardian_address: self.signer.address(),
            guardian_index,
            block_number: block.number,
            app: AppInfo::default(),
        });
        if let Err(e) = publish_with_retry(self.broker.as_ref(), &message).await {
            warn!("failed to publish ping: {}", e);
        }
    }

    async fn transient_retry<T, F, Fut>(&self, operation: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ChainError>>,
    {
        retry(Backoff::default(), ChainError::is_transient, operation).await
    }
}

fn skip_all(modules: &[StakingModuleState], reason: SkipReason) -> Vec<(u32, Decision)> {
    modules
        .iter()
        .map(|m| (m.id, Decision::Skip(reason.clone())))
        .collect()
}
