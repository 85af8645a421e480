//! JSON-RPC backend over an ethers HTTP provider
//!
//! Node error strings are interpreted here and nowhere else: broadcast failures
//! become a `BroadcastOutcome`, query failures a `BackendError`.

use crate::chain::backend::{
    Backend, BackendError, BackendResult, BlockHeader, BlockTag, BroadcastOutcome, CallRequest,
    TxReceipt,
};
use crate::tx::SignedTx;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockId, BlockNumber, H256, U256};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace};

/// `Backend` implementation backed by a single HTTP endpoint
#[derive(Debug, Clone)]
pub struct EthersBackend {
    provider: Provider<Http>,
}

impl EthersBackend {
    /// Create a backend for the given RPC url
    pub fn connect(url: &str) -> BackendResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| BackendError::Transient(format!("invalid RPC url {}: {}", url, e)))?
            .interval(Duration::from_millis(100));
        debug!("Created HTTP provider for {}", url);
        Ok(Self { provider })
    }

    /// Wrap an existing provider
    pub fn new(provider: Provider<Http>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }
}

fn transient(e: impl std::fmt::Display) -> BackendError {
    BackendError::Transient(e.to_string())
}

fn block_tag_param(block: BlockTag) -> String {
    match block {
        BlockTag::Latest => "latest".to_string(),
        BlockTag::Number(n) => format!("{:#x}", n),
    }
}

fn parse_quantity(value: &Value, field: &str) -> BackendResult<Option<U256>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => U256::from_str_radix(s.trim_start_matches("0x"), 16)
            .map(Some)
            .map_err(|e| BackendError::Transient(format!("malformed {}: {}", field, e))),
        Some(other) => Err(BackendError::Transient(format!(
            "unexpected {} value: {}",
            field, other
        ))),
    }
}

/// Narrow an RPC quantity to u64, rejecting values that do not fit
fn u64_quantity(value: U256, field: &str) -> BackendResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(BackendError::Transient(format!(
            "{} out of range: {}",
            field, value
        )));
    }
    Ok(value.low_u64())
}

/// Map an `eth_sendRawTransaction` error message onto a broadcast outcome
pub fn classify_send_error(message: &str) -> BroadcastOutcome {
    let lower = message.to_lowercase();
    if lower.contains("nonce too low") {
        BroadcastOutcome::NonceTooLow
    } else if lower.contains("already known") {
        BroadcastOutcome::AlreadyKnown
    } else if lower.contains("replacement transaction underpriced") {
        BroadcastOutcome::ReplacementUnderpriced
    } else if lower.contains("transaction underpriced") {
        BroadcastOutcome::Underpriced
    } else if lower.contains("address already reserved") {
        BroadcastOutcome::AlreadyReserved
    } else {
        BroadcastOutcome::Rejected(message.to_string())
    }
}

fn is_method_unsupported(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("-32601")
        || lower.contains("method not found")
        || lower.contains("does not exist")
        || lower.contains("not supported")
}

fn is_revert(message: &str) -> bool {
    message.to_lowercase().contains("revert")
}

fn call_request_json(call: &CallRequest) -> Value {
    let mut msg = json!({
        "from": call.from,
        "data": call.data,
        "value": call.value,
        "maxPriorityFeePerGas": call.tip,
        "maxFeePerGas": call.fee_cap,
    });
    if let Some(to) = call.to {
        msg["to"] = json!(to);
    }
    if !call.blob_hashes.is_empty() {
        msg["blobVersionedHashes"] = json!(call.blob_hashes);
        if let Some(blob_fee_cap) = call.blob_fee_cap {
            msg["maxFeePerBlobGas"] = json!(blob_fee_cap);
        }
    }
    msg
}

#[async_trait]
impl Backend for EthersBackend {
    async fn send_raw_transaction(&self, tx: &SignedTx) -> BroadcastOutcome {
        match self.provider.send_raw_transaction(tx.raw.clone()).await {
            Ok(_) => BroadcastOutcome::Accepted,
            Err(e) => classify_send_error(&e.to_string()),
        }
    }

    async fn transaction_receipt(&self, hash: H256) -> BackendResult<Option<TxReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(transient)?;

        // A receipt without a block number belongs to a pending block
        Ok(receipt.and_then(|r| {
            let block_number = r.block_number?.as_u64();
            Some(TxReceipt {
                tx_hash: r.transaction_hash,
                block_number,
                status: r.status == Some(1u64.into()),
                gas_used: r.gas_used.unwrap_or_default(),
                effective_gas_price: r.effective_gas_price,
            })
        }))
    }

    async fn block_number(&self) -> BackendResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(transient)
    }

    async fn header_by_number(&self, block: BlockTag) -> BackendResult<BlockHeader> {
        // Fetched as raw JSON so that post-Cancun header fields are visible
        let value: Option<Value> = self
            .provider
            .request("eth_getBlockByNumber", (block_tag_param(block), false))
            .await
            .map_err(transient)?;
        let value = value.ok_or_else(|| transient(format!("block {:?} not found", block)))?;

        let number = parse_quantity(&value, "number")?
            .ok_or_else(|| transient("header without number"))?;
        let base_fee = parse_quantity(&value, "baseFeePerGas")?
            .ok_or_else(|| transient("header without base fee"))?;
        let excess_blob_gas = parse_quantity(&value, "excessBlobGas")?;

        trace!(number = %number, base_fee = %base_fee, "Fetched header");
        Ok(BlockHeader {
            number: u64_quantity(number, "number")?,
            base_fee,
            excess_blob_gas: excess_blob_gas
                .map(|g| u64_quantity(g, "excessBlobGas"))
                .transpose()?,
        })
    }

    async fn suggest_gas_tip_cap(&self) -> BackendResult<U256> {
        self.provider
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e| {
                let message = e.to_string();
                if is_method_unsupported(&message) {
                    BackendError::Unsupported(message)
                } else {
                    BackendError::Transient(message)
                }
            })
    }

    async fn nonce_at(&self, account: Address, block: BlockTag) -> BackendResult<u64> {
        let block_id = match block {
            BlockTag::Latest => BlockId::Number(BlockNumber::Latest),
            BlockTag::Number(n) => BlockId::Number(BlockNumber::Number(n.into())),
        };
        let nonce = self
            .provider
            .get_transaction_count(account, Some(block_id))
            .await
            .map_err(transient)?;
        u64_quantity(nonce, "nonce")
    }

    async fn estimate_gas(&self, call: &CallRequest) -> BackendResult<u64> {
        let gas = self
            .provider
            .request::<_, U256>("eth_estimateGas", [call_request_json(call)])
            .await
            .map_err(|e| {
                let message = e.to_string();
                if is_revert(&message) {
                    BackendError::Reverted(message)
                } else {
                    BackendError::Transient(message)
                }
            })?;
        u64_quantity(gas, "gas estimate")
    }

    async fn chain_id(&self) -> BackendResult<u64> {
        let chain_id = self.provider.get_chainid().await.map_err(transient)?;
        u64_quantity(chain_id, "chain id")
    }
}
