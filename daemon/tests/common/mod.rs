// Shared fakes for the pipeline integration tests. Everything the daemon
// talks to — chain, keys api, bus — is replaced behind its trait.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tempdir::TempDir;

use guardian_common::{
    api::{
        keys::{ElBlockSnapshot, StakingModuleDto},
        message::{GuardianMessage, SignatureData},
    },
    block::BlockRef,
    crypto::{BlsPublicKey, BlsSignature},
    deposit::DepositEvent,
};
use guardian_daemon::core::{
    broker::{BrokerError, MessageBroker},
    cache::{disk::CacheStore, DepositEventCache},
    chain::{ChainClient, ChainError, PauseOutcome, StakingModuleState},
    keys::{KeySnapshot, KeysError, KeysRegistry},
    orchestrator::GuardianService,
    pauser::PauseSubmitter,
    signer::GuardianSigner,
    status::StatusTracker,
};

// Anvil development key; derives 0xf39f...2266
pub const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn wc() -> B256 {
    B256::with_last_byte(1)
}

pub fn pubkey(byte: u8) -> BlsPublicKey {
    let mut bytes = [0u8; 48];
    bytes[0] = byte;
    BlsPublicKey::new(bytes)
}

pub fn module_address(id: u32) -> Address {
    Address::with_last_byte(id as u8)
}

pub struct FakeChain {
    pub head: AtomicU64,
    fork: Mutex<(u64, u64)>, // (tag, first forked block)
    deposits: Mutex<Vec<DepositEvent>>,
    pub guardians: Mutex<Vec<Address>>,
    pub modules: Mutex<Vec<StakingModuleState>>,
    pub deposit_root: Mutex<B256>,
    pub pause_calls: Mutex<Vec<(u64, u32, SignatureData)>>,
    pub fail_pause: AtomicBool,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            fork: Mutex::new((0, u64::MAX)),
            deposits: Mutex::new(Vec::new()),
            guardians: Mutex::new(Vec::new()),
            modules: Mutex::new(vec![StakingModuleState {
                id: 1,
                is_active: true,
                nonce: 7,
                last_deposit_block: 0,
            }]),
            deposit_root: Mutex::new(B256::repeat_byte(0x77)),
            pause_calls: Mutex::new(Vec::new()),
            fail_pause: AtomicBool::new(false),
        }
    }

    pub fn hash_of(&self, number: u64) -> B256 {
        let (tag, first) = *self.fork.lock().unwrap();
        let tag = if number >= first { tag } else { 0 };
        B256::from(U256::from(number * 1_000 + tag + 1))
    }

    pub fn block_ref(&self, number: u64) -> BlockRef {
        BlockRef::new(number, self.hash_of(number), number)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn reorg(&self, first_forked_block: u64, tag: u64) {
        *self.fork.lock().unwrap() = (tag, first_forked_block);
    }

    pub fn add_deposit(&self, block_number: u64, log_index: u32, key: BlsPublicKey) {
        let block = self.block_ref(block_number);
        self.deposits.lock().unwrap().push(DepositEvent {
            pubkey: key,
            wc: wc(),
            amount: 32_000_000_000,
            signature: BlsSignature::zero(),
            block,
            log_index,
            tx_hash: B256::ZERO,
        });
    }

    pub fn set_module_active(&self, id: u32, is_active: bool) {
        for module in self.modules.lock().unwrap().iter_mut() {
            if module.id == id {
                module.is_active = is_active;
            }
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(1)
    }

    async fn head_block_number(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockRef>, ChainError> {
        Ok(Some(self.block_ref(number)))
    }

    async fn deposit_events(&self, from: u64, to: u64) -> Result<Vec<DepositEvent>, ChainError> {
        let deposits = self.deposits.lock().unwrap();
        let mut events: Vec<DepositEvent> = deposits
            .iter()
            .filter(|e| {
                e.block.number >= from
                    && e.block.number <= to
                    && e.block.hash == self.hash_of(e.block.number)
            })
            .cloned()
            .collect();
        events.sort();
        Ok(events)
    }

    async fn deposit_root(&self, _block: u64) -> Result<B256, ChainError> {
        Ok(*self.deposit_root.lock().unwrap())
    }

    async fn attest_message_prefix(&self) -> Result<B256, ChainError> {
        Ok(B256::repeat_byte(0xaa))
    }

    async fn pause_message_prefix(&self) -> Result<B256, ChainError> {
        Ok(B256::repeat_byte(0xbb))
    }

    async fn guardians(&self, _block: u64) -> Result<Vec<Address>, ChainError> {
        Ok(self.guardians.lock().unwrap().clone())
    }

    async fn staking_modules(&self, _block: u64) -> Result<Vec<StakingModuleState>, ChainError> {
        Ok(self.modules.lock().unwrap().clone())
    }

    async fn withdrawal_credentials(&self, _block: u64) -> Result<B256, ChainError> {
        Ok(wc())
    }

    async fn submit_pause(
        &self,
        block_number: u64,
        module_id: u32,
        signature: SignatureData,
    ) -> Result<PauseOutcome, ChainError> {
        self.pause_calls
            .lock()
            .unwrap()
            .push((block_number, module_id, signature));
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(ChainError::Transport("nonce too low".into()));
        }
        let active = self
            .modules
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == module_id)
            .map(|m| m.is_active)
            .unwrap_or(false);
        if !active {
            return Ok(PauseOutcome::AlreadyPaused);
        }
        Ok(PauseOutcome::Submitted {
            tx_hash: B256::repeat_byte(0x99),
        })
    }
}

pub struct FakeKeys {
    pub snapshot: Mutex<Option<KeySnapshot>>,
    pub fail_inconsistent: AtomicBool,
    pub fail_transport: AtomicBool,
}

impl FakeKeys {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(None),
            fail_inconsistent: AtomicBool::new(false),
            fail_transport: AtomicBool::new(false),
        }
    }

    /// Snapshot taken at `block_number` on the fake chain's canonical fork,
    /// listing the given unused keys for module 1
    pub fn set_snapshot(&self, chain: &FakeChain, block_number: u64, unused: &[BlsPublicKey]) {
        self.set_snapshot_for_modules(chain, block_number, &[(1, unused.to_vec())]);
    }

    pub fn set_snapshot_for_modules(
        &self,
        chain: &FakeChain,
        block_number: u64,
        unused_by_module: &[(u32, Vec<BlsPublicKey>)],
    ) {
        let mut unused: HashMap<Address, HashSet<BlsPublicKey>> = HashMap::new();
        let mut modules = Vec::new();
        for (id, keys) in unused_by_module {
            modules.push(StakingModuleDto {
                id: *id,
                staking_module_address: module_address(*id),
                name: None,
                nonce: None,
            });
            unused.insert(module_address(*id), keys.iter().copied().collect());
        }
        let snapshot = KeySnapshot::new(
            ElBlockSnapshot {
                block_number,
                block_hash: chain.hash_of(block_number),
                timestamp: 0,
            },
            modules,
            unused,
        );
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    /// Force a snapshot whose block hash matches no canonical block
    pub fn corrupt_snapshot_hash(&self) {
        let mut guard = self.snapshot.lock().unwrap();
        if let Some(snapshot) = guard.take() {
            let mut block = snapshot.block;
            block.block_hash = B256::repeat_byte(0x66);
            *guard = Some(KeySnapshot::new(
                block,
                snapshot.modules.clone(),
                HashMap::new(),
            ));
        }
    }
}

#[async_trait]
impl KeysRegistry for FakeKeys {
    async fn snapshot(&self) -> Result<KeySnapshot, KeysError> {
        if self.fail_inconsistent.load(Ordering::SeqCst) {
            return Err(KeysError::Inconsistent("duplicate pubkey".into()));
        }
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(KeysError::Http("connection refused".into()));
        }
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| KeysError::Http("no snapshot configured".into()))
    }
}

pub struct FakeBroker {
    pub messages: Mutex<Vec<GuardianMessage>>,
    pub fail_next: AtomicU64,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail_next: AtomicU64::new(0),
        }
    }

    pub fn of_kind(&self, kind: &str) -> Vec<GuardianMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBroker for FakeBroker {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn publish(&self, message: &GuardianMessage) -> Result<(), BrokerError> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::Publish("broker unavailable".into()));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub keys: Arc<FakeKeys>,
    pub broker: Arc<FakeBroker>,
    pub service: Arc<GuardianService<FakeChain, FakeKeys, FakeBroker>>,
    pub pauser: Arc<PauseSubmitter<FakeChain>>,
    _tmp: TempDir,
}

pub fn harness() -> Harness {
    let tmp = TempDir::new("guardian-test").unwrap();
    let chain = Arc::new(FakeChain::new());
    let keys = Arc::new(FakeKeys::new());
    let broker = Arc::new(FakeBroker::new());
    let signer = Arc::new(GuardianSigner::new(TEST_KEY).unwrap());
    let wallet = signer.address();

    let cache = Arc::new(
        DepositEventCache::load(chain.clone(), CacheStore::new(tmp.path(), 1), 0).unwrap(),
    );
    let pauser = Arc::new(PauseSubmitter::new(chain.clone()));
    let service = Arc::new(GuardianService::new(
        chain.clone(),
        cache,
        keys.clone(),
        broker.clone(),
        signer,
        pauser.clone(),
        Arc::new(StatusTracker::new()),
    ));

    // By default the wallet is guardian #0
    chain.guardians.lock().unwrap().push(wallet);

    Harness {
        chain,
        keys,
        broker,
        service,
        pauser,
        _tmp: tmp,
    }
}
