//! The RPC surface the transaction manager consumes

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use thiserror::Error;

use crate::tx::SignedTx;

/// Block selector for header and nonce queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

/// The subset of a block header needed for fee decisions and confirmation depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub base_fee: U256,
    /// Present once EIP-4844 is active on the chain
    pub excess_blob_gas: Option<u64>,
}

/// Receipt of an included transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    /// false if execution reverted
    pub status: bool,
    pub gas_used: U256,
    pub effective_gas_price: Option<U256>,
}

/// Call message used for gas estimation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub tip: U256,
    pub fee_cap: U256,
    pub blob_fee_cap: Option<U256>,
    pub blob_hashes: Vec<H256>,
}

/// Result of a single `eth_sendRawTransaction`, classified at the RPC boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Accepted,
    /// The mempool already holds this exact transaction
    AlreadyKnown,
    NonceTooLow,
    Underpriced,
    ReplacementUnderpriced,
    /// A transaction of an incompatible type holds this nonce in the mempool
    AlreadyReserved,
    /// Any other failure, including transport errors and timeouts
    Rejected(String),
}

impl BroadcastOutcome {
    /// The transaction is known to be in some mempool after this call
    pub fn is_success(&self) -> bool {
        matches!(self, BroadcastOutcome::Accepted | BroadcastOutcome::AlreadyKnown)
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            BroadcastOutcome::Accepted => "",
            BroadcastOutcome::AlreadyKnown => "tx_already_known",
            BroadcastOutcome::NonceTooLow => "nonce_too_low",
            BroadcastOutcome::Underpriced => "tx_underpriced",
            BroadcastOutcome::ReplacementUnderpriced => "tx_replacement_underpriced",
            BroadcastOutcome::AlreadyReserved => "pending_tx_of_incompatible_type",
            BroadcastOutcome::Rejected(_) => "unknown_error",
        }
    }
}

/// Failures surfaced by backend queries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("method not supported by backend: {0}")]
    Unsupported(String),

    #[error("execution reverted: {0}")]
    Reverted(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Execution-layer RPC capabilities. Implementations must tolerate concurrent calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Broadcast a signed transaction
    async fn send_raw_transaction(&self, tx: &SignedTx) -> BroadcastOutcome;

    /// `None` if the transaction is not (or no longer) included
    async fn transaction_receipt(&self, hash: H256) -> BackendResult<Option<TxReceipt>>;

    async fn block_number(&self) -> BackendResult<u64>;

    async fn header_by_number(&self, block: BlockTag) -> BackendResult<BlockHeader>;

    /// Suggested priority fee. `BackendError::Unsupported` if the node lacks the method.
    async fn suggest_gas_tip_cap(&self) -> BackendResult<U256>;

    async fn nonce_at(&self, account: Address, block: BlockTag) -> BackendResult<u64>;

    async fn estimate_gas(&self, call: &CallRequest) -> BackendResult<u64>;

    async fn chain_id(&self) -> BackendResult<u64>;
}
