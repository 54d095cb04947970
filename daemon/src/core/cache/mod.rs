pub mod disk;
pub mod segment;

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::B256;
use guardian_common::{
    block::BlockRef,
    crypto::BlsPublicKey,
    deposit::DepositEvent,
    tokio::sync::{Mutex, RwLock},
};
use thiserror::Error;

use self::{
    disk::{CacheStore, HeadState, LoadedCache},
    segment::EventSegment,
};
use super::{
    chain::{ChainClient, ChainError},
    error::ErrorKind,
};
use crate::config::{FETCH_WINDOW, FINALIZATION_DEPTH, MIN_FETCH_WINDOW};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt cache file {path}: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("cache was collected on chain {cached}, daemon configured for {configured}")]
    ChainMismatch { cached: u64, configured: u64 },
    #[error("canonical chain diverges from sealed history at block {block}")]
    SealedReorg { block: u64 },
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Io(_)
            | CacheError::Json(_)
            | CacheError::Corrupt { .. }
            | CacheError::ChainMismatch { .. }
            | CacheError::SealedReorg { .. } => ErrorKind::Fatal,
            CacheError::Chain(e) => e.kind(),
        }
    }
}

/// Where a pubkey was seen on the deposit contract. Enough to verify a
/// conflict exactly without rescanning segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositLocator {
    pub block_number: u64,
    pub log_index: u32,
    pub wc: B256,
    pub amount: u64,
}

struct CacheState {
    sealed: Vec<EventSegment>,
    unsealed: Vec<EventSegment>,
    /// Exclusive upper bound of indexed history
    watermark: u64,
    index: HashMap<BlsPublicKey, Vec<DepositLocator>>,
    total_events: u64,
}

impl CacheState {
    fn tail_ref(&self) -> Option<BlockRef> {
        self.unsealed
            .last()
            .or_else(|| self.sealed.last())
            .map(|s| s.tail)
    }

    fn index_segment(&mut self, segment: &EventSegment) {
        for event in &segment.events {
            self.index.entry(event.pubkey).or_default().push(DepositLocator {
                block_number: event.block.number,
                log_index: event.log_index,
                wc: event.wc,
                amount: event.amount,
            });
        }
        self.total_events += segment.events.len() as u64;
    }

    // Drop index entries above the new watermark after a rollback
    fn truncate_index(&mut self, watermark: u64) {
        let mut total = 0u64;
        self.index.retain(|_, locators| {
            locators.retain(|l| l.block_number < watermark);
            total += locators.len() as u64;
            !locators.is_empty()
        });
        self.total_events = total;
    }

    fn head_state(&self) -> HeadState {
        HeadState {
            watermark: self.watermark,
            segments: self.unsealed.clone(),
        }
    }
}

/// Range-indexed store of historical deposit events.
///
/// Writers are serialized through an internal guard; readers observe a
/// monotonically advancing committed watermark. Everything below
/// `head - FINALIZATION_DEPTH` is sealed to disk and treated as immutable.
pub struct DepositEventCache<C: ChainClient> {
    chain: Arc<C>,
    store: CacheStore,
    start_block: u64,
    state: RwLock<CacheState>,
    advance_guard: Mutex<()>,
}

impl<C: ChainClient> DepositEventCache<C> {
    /// Load persisted segments and rebuild the in-memory index.
    /// `start_block` is the deposit contract deploy block; history before it
    /// is never fetched.
    pub fn load(chain: Arc<C>, store: CacheStore, start_block: u64) -> Result<Self, CacheError> {
        let LoadedCache { sealed, head } = store.open()?;

        // Unsealed segments must stack directly on the sealed history;
        // anything that does not is stale leftovers and refetches cheaply
        let mut expected = sealed.last().map(|s| s.to).unwrap_or(start_block);
        let mut unsealed = Vec::new();
        for segment in head.segments {
            if segment.from == expected {
                expected = segment.to;
                unsealed.push(segment);
            } else {
                warn!(
                    "discarding unsealed segment [{}, {}): does not extend cache tail {}",
                    segment.from, segment.to, expected
                );
                break;
            }
        }

        let mut state = CacheState {
            watermark: expected,
            sealed,
            unsealed,
            index: HashMap::new(),
            total_events: 0,
        };
        let segments: Vec<EventSegment> = state
            .sealed
            .iter()
            .chain(state.unsealed.iter())
            .cloned()
            .collect();
        for segment in &segments {
            state.index_segment(segment);
        }

        info!(
            "deposit event cache loaded: {} sealed + {} unsealed segments, {} events, synced to block {}",
            state.sealed.len(),
            state.unsealed.len(),
            state.total_events,
            state.watermark
        );

        Ok(Self {
            chain,
            store,
            start_block,
            state: RwLock::new(state),
            advance_guard: Mutex::new(()),
        })
    }

    pub async fn watermark(&self) -> u64 {
        self.state.read().await.watermark
    }

    pub async fn total_events(&self) -> u64 {
        self.state.read().await.total_events
    }

    /// All cached deposit locations of one pubkey
    pub async fn deposits_of(&self, pubkey: &BlsPublicKey) -> Vec<DepositLocator> {
        self.state
            .read()
            .await
            .index
            .get(pubkey)
            .cloned()
            .unwrap_or_default()
    }

    /// Events with block number in `[from, to)`, clamped to the committed
    /// watermark, in `(block_number, log_index)` order
    pub async fn query(&self, from: u64, to: u64) -> Vec<DepositEvent> {
        let state = self.state.read().await;
        let to = to.min(state.watermark);
        if from >= to {
            return Vec::new();
        }
        let mut events = Vec::new();
        for segment in state.sealed.iter().chain(state.unsealed.iter()) {
            if segment.to <= from {
                continue;
            }
            if segment.from >= to {
                break;
            }
            events.extend(
                segment
                    .events
                    .iter()
                    .filter(|e| e.block.number >= from && e.block.number < to)
                    .cloned(),
            );
        }
        events
    }

    /// Bring the cache up to date so every event at or below `target` is
    /// indexed. Idempotent; at most one fetch in flight process-wide.
    pub async fn advance_to(&self, target: &BlockRef, head: u64) -> Result<(), CacheError> {
        let _guard = self.advance_guard.lock().await;

        let to_exclusive = target.number + 1;
        if self.state.read().await.watermark >= to_exclusive {
            return Ok(());
        }

        self.reconcile_tail().await?;

        let mut from = self.state.read().await.watermark;
        while from < to_exclusive {
            let window_end = (from + FETCH_WINDOW).min(to_exclusive);
            let events = self.fetch_window(from, window_end).await?;
            let tail = self
                .chain
                .block_by_number(window_end - 1)
                .await?
                .ok_or(ChainError::MissingBlock(window_end - 1))?;
            let segment = EventSegment::new(from, window_end, tail, events);

            let mut state = self.state.write().await;
            debug!(
                "indexed blocks [{}, {}): {} deposit events",
                segment.from,
                segment.to,
                segment.events.len()
            );
            state.index_segment(&segment);
            state.unsealed.push(segment);
            state.watermark = window_end;
            self.seal_ready(&mut state, head)?;
            self.store.write_head(&state.head_state())?;
            drop(state);

            from = window_end;
        }
        Ok(())
    }

    /// Persist the unsealed tail; called on shutdown
    pub async fn flush(&self) -> Result<(), CacheError> {
        let state = self.state.read().await;
        self.store.write_head(&state.head_state())
    }

    // Verify the recorded tail still sits on the canonical chain; if not,
    // roll unsealed segments back to the fork point. Sealed disagreement is
    // fatal by contract.
    async fn reconcile_tail(&self) -> Result<(), CacheError> {
        let Some(tail) = self.state.read().await.tail_ref() else {
            return Ok(());
        };
        let canonical = self
            .chain
            .block_by_number(tail.number)
            .await?
            .ok_or(ChainError::MissingBlock(tail.number))?;
        if canonical == tail {
            return Ok(());
        }

        warn!(
            "reorg detected: cached tail {} no longer canonical (now {})",
            tail, canonical
        );

        // Find the newest unsealed segment whose tail is still canonical
        let unsealed_tails: Vec<BlockRef> = {
            let state = self.state.read().await;
            state.unsealed.iter().map(|s| s.tail).collect()
        };
        let mut keep = 0;
        for (i, seg_tail) in unsealed_tails.iter().enumerate().rev() {
            let canonical = self
                .chain
                .block_by_number(seg_tail.number)
                .await?
                .ok_or(ChainError::MissingBlock(seg_tail.number))?;
            if canonical == *seg_tail {
                keep = i + 1;
                break;
            }
        }

        if keep == 0 {
            // Every unsealed segment is off-chain; the sealed history must
            // still hold or the operator has to intervene
            let sealed_tail = self.state.read().await.sealed.last().map(|s| s.tail);
            if let Some(sealed_tail) = sealed_tail {
                let canonical = self
                    .chain
                    .block_by_number(sealed_tail.number)
                    .await?
                    .ok_or(ChainError::MissingBlock(sealed_tail.number))?;
                if canonical != sealed_tail {
                    error!(
                        "sealed segment tail {} disagrees with canonical chain {}",
                        sealed_tail, canonical
                    );
                    return Err(CacheError::SealedReorg {
                        block: sealed_tail.number,
                    });
                }
            }
        }

        let mut state = self.state.write().await;
        state.unsealed.truncate(keep);
        state.watermark = state
            .unsealed
            .last()
            .map(|s| s.to)
            .or_else(|| state.sealed.last().map(|s| s.to))
            .unwrap_or(self.start_block);
        let watermark = state.watermark;
        state.truncate_index(watermark);
        self.store.write_head(&state.head_state())?;
        info!("rolled back unsealed history to block {}", watermark);
        Ok(())
    }

    // Fetch `[from, to_exclusive)`, halving any window the provider rejects
    // as too large, down to single blocks
    async fn fetch_window(
        &self,
        from: u64,
        to_exclusive: u64,
    ) -> Result<Vec<DepositEvent>, CacheError> {
        let mut pending = vec![(from, to_exclusive)];
        let mut events = Vec::new();
        while let Some((a, b)) = pending.pop() {
            match self.chain.deposit_events(a, b - 1).await {
                Ok(mut chunk) => events.append(&mut chunk),
                Err(ChainError::RangeTooLarge) if b - a > MIN_FETCH_WINDOW => {
                    let mid = a + (b - a) / 2;
                    debug!(
                        "provider rejected log range [{}, {}), splitting at {}",
                        a, b, mid
                    );
                    pending.push((mid, b));
                    pending.push((a, mid));
                }
                Err(e) => return Err(e.into()),
            }
        }
        events.sort();
        Ok(events)
    }

    fn seal_ready(&self, state: &mut CacheState, head: u64) -> Result<(), CacheError> {
        while state
            .unsealed
            .first()
            .is_some_and(|s| s.is_sealed_at(head, FINALIZATION_DEPTH))
        {
            let segment = state.unsealed.remove(0);
            debug!("sealing segment [{}, {})", segment.from, segment.to);
            state.sealed.push(segment);
            let segment = state.sealed.last().expect("just pushed");
            self.store.write_sealed_segment(segment, &state.sealed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};
    use async_trait::async_trait;
    use guardian_common::{
        api::message::SignatureData,
        crypto::BlsSignature,
    };
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempdir::TempDir;

    use crate::core::chain::{PauseOutcome, StakingModuleState};

    // Canonical chain simulator: block hash is a function of number and the
    // current fork tag, so rewriting history is one store
    struct FakeChain {
        fork_from: Mutex<(u64, u64)>, // (fork_tag, first_forked_block)
        deposits: Mutex<HashMap<u64, Vec<DepositEvent>>>,
        max_range: Option<u64>,
        log_queries: AtomicU64,
    }

    impl FakeChain {
        fn new() -> Self {
            Self {
                fork_from: Mutex::new((0, u64::MAX)),
                deposits: Mutex::new(HashMap::new()),
                max_range: None,
                log_queries: AtomicU64::new(0),
            }
        }

        fn with_max_range(max_range: u64) -> Self {
            Self {
                max_range: Some(max_range),
                ..Self::new()
            }
        }

        async fn hash_of(&self, number: u64) -> B256 {
            let (tag, first) = *self.fork_from.lock().await;
            let tag = if number >= first { tag } else { 0 };
            B256::from(U256::from(number * 1_000 + tag + 1))
        }

        async fn reorg(&self, first_forked_block: u64, tag: u64) {
            *self.fork_from.lock().await = (tag, first_forked_block);
        }

        async fn add_deposit(&self, block_number: u64, log_index: u32, key_byte: u8) {
            let mut key = [0u8; 48];
            key[0] = key_byte;
            let block =
                BlockRef::new(block_number, self.hash_of(block_number).await, block_number);
            self.deposits
                .lock()
                .await
                .entry(block_number)
                .or_default()
                .push(DepositEvent {
                    pubkey: BlsPublicKey::new(key),
                    wc: B256::with_last_byte(1),
                    amount: 32_000_000_000,
                    signature: BlsSignature::zero(),
                    block,
                    log_index,
                    tx_hash: B256::ZERO,
                });
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn chain_id(&self) -> Result<u64, ChainError> {
            Ok(1)
        }

        async fn head_block_number(&self) -> Result<u64, ChainError> {
            unreachable!("cache never asks for the head")
        }

        async fn block_by_number(&self, number: u64) -> Result<Option<BlockRef>, ChainError> {
            Ok(Some(BlockRef::new(number, self.hash_of(number).await, number)))
        }

        async fn deposit_events(&self, from: u64, to: u64) -> Result<Vec<DepositEvent>, ChainError> {
            self.log_queries.fetch_add(1, Ordering::SeqCst);
            if let Some(max) = self.max_range {
                if to - from + 1 > max {
                    return Err(ChainError::RangeTooLarge);
                }
            }
            let deposits = self.deposits.lock().await;
            let mut events = Vec::new();
            for number in from..=to {
                let Some(block_events) = deposits.get(&number) else {
                    continue;
                };
                // An event belongs to the canonical chain only while the
                // block hash it was created under is still current
                let current = self.hash_of(number).await;
                events.extend(
                    block_events
                        .iter()
                        .filter(|e| e.block.hash == current)
                        .cloned(),
                );
            }
            events.sort();
            Ok(events)
        }

        async fn deposit_root(&self, _block: u64) -> Result<B256, ChainError> {
            unreachable!()
        }

        async fn attest_message_prefix(&self) -> Result<B256, ChainError> {
            unreachable!()
        }

        async fn pause_message_prefix(&self) -> Result<B256, ChainError> {
            unreachable!()
        }

        async fn guardians(&self, _block: u64) -> Result<Vec<Address>, ChainError> {
            unreachable!()
        }

        async fn staking_modules(&self, _block: u64) -> Result<Vec<StakingModuleState>, ChainError> {
            unreachable!()
        }

        async fn withdrawal_credentials(&self, _block: u64) -> Result<B256, ChainError> {
            unreachable!()
        }

        async fn submit_pause(
            &self,
            _block_number: u64,
            _module_id: u32,
            _signature: SignatureData,
        ) -> Result<PauseOutcome, ChainError> {
            unreachable!()
        }
    }

    async fn target(chain: &FakeChain, number: u64) -> BlockRef {
        chain.block_by_number(number).await.unwrap().unwrap()
    }

    fn cache_in(
        tmp: &TempDir,
        chain: Arc<FakeChain>,
    ) -> DepositEventCache<FakeChain> {
        DepositEventCache::load(chain, CacheStore::new(tmp.path(), 1), 0).unwrap()
    }

    #[tokio::test]
    async fn advance_then_query_in_order() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        chain.add_deposit(5, 1, 0xaa).await;
        chain.add_deposit(5, 0, 0xbb).await;
        chain.add_deposit(120, 2, 0xcc).await;

        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 200).await, 210).await.unwrap();

        assert_eq!(cache.watermark().await, 201);
        let events = cache.query(0, 201).await;
        assert_eq!(
            events.iter().map(|e| (e.block.number, e.log_index)).collect::<Vec<_>>(),
            vec![(5, 0), (5, 1), (120, 2)]
        );
    }

    #[tokio::test]
    async fn advance_is_idempotent() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        chain.add_deposit(3, 0, 0x01).await;
        let cache = cache_in(&tmp, chain.clone());

        let block = target(&chain, 50).await;
        cache.advance_to(&block, 60).await.unwrap();
        let queries = chain.log_queries.load(Ordering::SeqCst);
        cache.advance_to(&block, 60).await.unwrap();
        assert_eq!(chain.log_queries.load(Ordering::SeqCst), queries);
    }

    #[tokio::test]
    async fn rejected_ranges_are_split() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::with_max_range(100));
        chain.add_deposit(10, 0, 0x01).await;
        chain.add_deposit(950, 0, 0x02).await;

        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 999).await, 1_100).await.unwrap();

        let events = cache.query(0, 1_000).await;
        assert_eq!(events.len(), 2);
        assert!(chain.log_queries.load(Ordering::SeqCst) > 10);
    }

    #[tokio::test]
    async fn query_clamps_to_watermark() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        chain.add_deposit(10, 0, 0x01).await;
        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 20).await, 30).await.unwrap();

        // Everything beyond block 20 is not committed yet
        assert_eq!(cache.query(0, 1_000_000).await.len(), 1);
        assert_eq!(cache.query(21, 1_000_000).await.len(), 0);
    }

    #[tokio::test]
    async fn shallow_reorg_rolls_back_and_refetches() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        chain.add_deposit(90, 0, 0x01).await;
        chain.add_deposit(98, 0, 0x02).await;

        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 99).await, 100).await.unwrap();
        assert_eq!(cache.query(0, 100).await.len(), 2);

        // Rewrite the last two blocks; the deposit at 98 vanishes and a new
        // one appears at 99
        chain.reorg(98, 7).await;
        chain.add_deposit(99, 0, 0x03).await;

        cache.advance_to(&target(&chain, 105).await, 106).await.unwrap();

        let events = cache.query(0, 106).await;
        let keys: Vec<u8> = events.iter().map(|e| e.pubkey.as_bytes()[0]).collect();
        assert_eq!(keys, vec![0x01, 0x03]);
        // No duplicates after rollback + refetch
        let mut ids: Vec<_> = events.iter().map(|e| e.id()).collect();
        ids.dedup();
        assert_eq!(ids.len(), events.len());
    }

    #[tokio::test]
    async fn reorg_past_sealed_history_is_fatal() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        let cache = cache_in(&tmp, chain.clone());

        // Head far enough that blocks below 100 seal (FINALIZATION_DEPTH = 64)
        cache.advance_to(&target(&chain, 99).await, 200).await.unwrap();

        // Now rewrite sealed history
        chain.reorg(50, 9).await;
        let err = cache
            .advance_to(&target(&chain, 150).await, 210)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SealedReorg { .. }));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn empty_history_is_a_valid_cache() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 500).await, 510).await.unwrap();
        assert_eq!(cache.watermark().await, 501);
        assert!(cache.query(0, 501).await.is_empty());
    }

    #[tokio::test]
    async fn single_event_at_block_zero() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        chain.add_deposit(0, 0, 0x01).await;
        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 10).await, 20).await.unwrap();
        let events = cache.query(0, 11).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block.number, 0);
    }

    // With FINALIZATION_DEPTH = 64 and head 163, a segment ending at block
    // 100 is still unsealed; a reorg into it must roll back, not kill the
    // process. One block later it would be sealed and the same reorg fatal.
    #[tokio::test]
    async fn reorg_just_inside_finalization_depth_rolls_back() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 99).await, 163).await.unwrap();

        chain.reorg(99, 4).await;
        cache.advance_to(&target(&chain, 120).await, 163).await.unwrap();
        assert_eq!(cache.watermark().await, 121);
    }

    #[tokio::test]
    async fn reorg_just_past_finalization_depth_is_fatal() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 99).await, 164).await.unwrap();

        chain.reorg(99, 4).await;
        let err = cache
            .advance_to(&target(&chain, 120).await, 164)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SealedReorg { .. }));
    }

    #[tokio::test]
    async fn persisted_cache_reloads_identically() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        chain.add_deposit(5, 0, 0x01).await;
        chain.add_deposit(80, 1, 0x02).await;

        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 99).await, 200).await.unwrap();
        let before = cache.query(0, 100).await;
        cache.flush().await.unwrap();
        drop(cache);

        let reloaded = cache_in(&tmp, chain.clone());
        assert_eq!(reloaded.watermark().await, 100);
        assert_eq!(reloaded.query(0, 100).await, before);
    }

    #[tokio::test]
    async fn index_tracks_rollbacks() {
        let tmp = TempDir::new("cache").unwrap();
        let chain = Arc::new(FakeChain::new());
        chain.add_deposit(95, 0, 0x42).await;
        let cache = cache_in(&tmp, chain.clone());
        cache.advance_to(&target(&chain, 99).await, 100).await.unwrap();

        let mut key = [0u8; 48];
        key[0] = 0x42;
        let key = BlsPublicKey::new(key);
        assert_eq!(cache.deposits_of(&key).await.len(), 1);

        chain.reorg(95, 3).await;
        cache.advance_to(&target(&chain, 100).await, 101).await.unwrap();
        assert!(cache.deposits_of(&key).await.is_empty());
    }
}
