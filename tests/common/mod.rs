//! Shared fixtures for the integration tests: an in-memory chain that the
//! transaction manager talks to, and a signer with a well-known dev key.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::rlp::Rlp;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use op_txmgr::chain::{
    Backend, BackendError, BackendResult, BlockHeader, BlockTag, BroadcastOutcome, CallRequest,
    TxReceipt,
};
use op_txmgr::tx::{SignedTx, TxCandidate, TxManager, WalletSigner};
use op_txmgr::TxMgrConfig;

pub const CHAIN_ID: u64 = 901;

/// First anvil/hardhat dev account
pub const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("op_txmgr=debug")
        .with_test_writer()
        .try_init();
}

/// Short intervals so tests finish quickly under paused time
pub fn test_config() -> TxMgrConfig {
    TxMgrConfig {
        resubmission_timeout_ms: 10_000,
        receipt_query_interval_ms: 1_000,
        network_timeout_ms: 5_000,
        not_in_mempool_timeout_ms: 30_000,
        num_confirmations: 1,
        craft_max_attempts: 3,
        craft_retry_delay_ms: 100,
        ..TxMgrConfig::default()
    }
}

pub fn test_signer() -> WalletSigner {
    WalletSigner::new(TEST_KEY.parse::<LocalWallet>().unwrap())
}

pub fn manager(chain: &Arc<FakeChain>, config: TxMgrConfig) -> Arc<TxManager> {
    Arc::new(
        TxManager::with_chain_id(config, chain.clone(), Arc::new(test_signer()), CHAIN_ID)
            .unwrap(),
    )
}

pub fn candidate() -> TxCandidate {
    TxCandidate::new(Some(Address::repeat_byte(0x42)), Bytes::from(vec![0xdeu8, 0xad]))
}

/// One transaction as it reached the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub hash: H256,
    pub nonce: u64,
    pub tip: U256,
    pub fee_cap: U256,
}

#[derive(Debug)]
struct ChainState {
    height: u64,
    base_fee: U256,
    tip: U256,
    account_nonce: u64,
    broadcasts: Vec<Broadcast>,
    replies: VecDeque<BroadcastOutcome>,
    receipts: HashMap<H256, TxReceipt>,
    auto_mine: bool,
    reverting: bool,
    receipt_delay: Duration,
    failing_receipts: usize,
    failing_headers: usize,
    failing_tips: usize,
}

/// In-memory chain with scripted mempool answers.
///
/// Broadcasts are accepted unless a reply was queued with `reply_with`.
/// Nothing is mined unless `auto_mine` is on or a test calls `mine`.
#[derive(Debug)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                height: 100,
                base_fee: gwei(10),
                tip: gwei(1),
                account_nonce: 0,
                broadcasts: Vec::new(),
                replies: VecDeque::new(),
                receipts: HashMap::new(),
                auto_mine: false,
                reverting: false,
                receipt_delay: Duration::ZERO,
                failing_receipts: 0,
                failing_headers: 0,
                failing_tips: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    /// Include every accepted broadcast in a fresh block right away
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state().auto_mine = auto_mine;
    }

    /// Receipts of transactions mined from now on report a revert
    pub fn set_reverting(&self, reverting: bool) {
        self.state().reverting = reverting;
    }

    /// Every receipt lookup takes `delay` before answering
    pub fn set_receipt_delay(&self, delay: Duration) {
        self.state().receipt_delay = delay;
    }

    /// The next `count` receipt lookups fail with a transient error
    pub fn fail_receipts(&self, count: usize) {
        self.state().failing_receipts = count;
    }

    /// The next `count` header lookups fail with a transient error
    pub fn fail_headers(&self, count: usize) {
        self.state().failing_headers = count;
    }

    /// The next `count` tip suggestions fail with a transient error
    pub fn fail_tips(&self, count: usize) {
        self.state().failing_tips = count;
    }

    /// Answer the next broadcasts with `replies`, in order
    pub fn reply_with(&self, replies: impl IntoIterator<Item = BroadcastOutcome>) {
        self.state().replies.extend(replies);
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.state().broadcasts.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.state().broadcasts.len()
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    /// Include `hash` in a new block
    pub fn mine(&self, hash: H256) {
        let mut state = self.state();
        mine_locked(&mut state, hash);
    }

    /// Include the most recent broadcast in a new block
    pub fn mine_latest(&self) {
        let mut state = self.state();
        if let Some(hash) = state.broadcasts.last().map(|b| b.hash) {
            mine_locked(&mut state, hash);
        }
    }

    /// Build empty blocks on top of the tip
    pub fn advance(&self, blocks: u64) {
        self.state().height += blocks;
    }

    /// Drop `hash` from the canonical chain
    pub fn reorg_out(&self, hash: H256) {
        self.state().receipts.remove(&hash);
    }
}

fn mine_locked(state: &mut ChainState, hash: H256) {
    state.height += 1;
    let receipt = TxReceipt {
        tx_hash: hash,
        block_number: state.height,
        status: !state.reverting,
        gas_used: U256::from(21_000),
        effective_gas_price: Some(state.base_fee + state.tip),
    };
    state.receipts.insert(hash, receipt);
}

/// Consume one scripted failure from `counter`
fn take_failure(counter: &mut usize, call: &str) -> BackendResult<()> {
    if *counter == 0 {
        return Ok(());
    }
    *counter -= 1;
    Err(BackendError::Transient(format!("{}: connection reset", call)))
}

fn decode_fees(raw: &Bytes) -> Option<(U256, U256)> {
    let (tx, _) = TypedTransaction::decode_signed(&Rlp::new(raw)).ok()?;
    match tx {
        TypedTransaction::Eip1559(req) => Some((
            req.max_priority_fee_per_gas.unwrap_or_default(),
            req.max_fee_per_gas.unwrap_or_default(),
        )),
        _ => None,
    }
}

#[async_trait]
impl Backend for FakeChain {
    async fn send_raw_transaction(&self, tx: &SignedTx) -> BroadcastOutcome {
        let Some((tip, fee_cap)) = decode_fees(&tx.raw) else {
            return BroadcastOutcome::Rejected("undecodable transaction".to_string());
        };

        let mut state = self.state();
        state.broadcasts.push(Broadcast {
            hash: tx.hash,
            nonce: tx.nonce,
            tip,
            fee_cap,
        });

        let outcome = state
            .replies
            .pop_front()
            .unwrap_or(BroadcastOutcome::Accepted);
        if outcome == BroadcastOutcome::Accepted && state.auto_mine {
            mine_locked(&mut state, tx.hash);
        }
        outcome
    }

    async fn transaction_receipt(&self, hash: H256) -> BackendResult<Option<TxReceipt>> {
        let delay = self.state().receipt_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        take_failure(&mut state.failing_receipts, "transaction_receipt")?;
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn block_number(&self) -> BackendResult<u64> {
        Ok(self.state().height)
    }

    async fn header_by_number(&self, block: BlockTag) -> BackendResult<BlockHeader> {
        let mut state = self.state();
        take_failure(&mut state.failing_headers, "header_by_number")?;
        let number = match block {
            BlockTag::Latest => state.height,
            BlockTag::Number(n) if n <= state.height => n,
            BlockTag::Number(n) => {
                return Err(BackendError::Transient(format!("block {} not found", n)))
            }
        };
        Ok(BlockHeader {
            number,
            base_fee: state.base_fee,
            excess_blob_gas: None,
        })
    }

    async fn suggest_gas_tip_cap(&self) -> BackendResult<U256> {
        let mut state = self.state();
        take_failure(&mut state.failing_tips, "suggest_gas_tip_cap")?;
        Ok(state.tip)
    }

    async fn nonce_at(&self, _account: Address, _block: BlockTag) -> BackendResult<u64> {
        Ok(self.state().account_nonce)
    }

    async fn estimate_gas(&self, call: &CallRequest) -> BackendResult<u64> {
        Ok(21_000 + 16 * call.data.len() as u64)
    }

    async fn chain_id(&self) -> BackendResult<u64> {
        Ok(CHAIN_ID)
    }
}

/// Sleep in small steps until the chain has seen `count` broadcasts
pub async fn wait_for_broadcasts(chain: &FakeChain, count: usize) {
    while chain.broadcast_count() < count {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
