//! Transaction signing
//!
//! `WalletSigner` signs with a local private key. EIP-1559 transactions go
//! through ethers' typed transaction encoding; EIP-4844 transactions are RLP
//! encoded here since ethers has no blob transaction type.

use super::blob::BlobSidecar;
use super::gas::FeeSet;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, Signature, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::RlpStream;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// EIP-2718 type byte of blob transactions
pub const BLOB_TX_TYPE: u8 = 0x03;

/// A fully specified transaction awaiting a signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub fees: FeeSet,
    pub blob_hashes: Vec<H256>,
    pub sidecar: Option<Arc<BlobSidecar>>,
}

impl UnsignedTx {
    pub fn is_blob_tx(&self) -> bool {
        self.sidecar.is_some()
    }
}

/// A signed transaction in its network encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: H256,
    pub nonce: u64,
    pub raw: Bytes,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("cannot sign transaction: {0}")]
    InvalidTransaction(String),
}

/// Signs transactions for a single sender. Signing must not mutate any state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Sender address
    fn address(&self) -> Address;

    async fn sign(&self, tx: &UnsignedTx) -> Result<SignedTx, SignerError>;
}

/// Local private key signer
#[derive(Debug, Clone)]
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load the hex private key held in environment variable `var`
    pub fn from_env(var: &str) -> Result<Self, SignerError> {
        let key = std::env::var(var).map_err(|_| {
            SignerError::Wallet(format!("No wallet configured. Set {}", var))
        })?;
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| SignerError::Wallet(format!("Invalid private key: {}", e)))?;

        info!("Loaded wallet {:?}", wallet.address());
        Ok(Self { wallet })
    }

    fn sign_dynamic_fee(&self, tx: &UnsignedTx) -> Result<SignedTx, SignerError> {
        let mut request = Eip1559TransactionRequest::new()
            .chain_id(tx.chain_id)
            .nonce(tx.nonce)
            .gas(tx.gas_limit)
            .max_priority_fee_per_gas(tx.fees.tip)
            .max_fee_per_gas(tx.fees.fee_cap)
            .value(tx.value)
            .data(tx.data.clone());
        if let Some(to) = tx.to {
            request = request.to(to);
        }

        let typed = TypedTransaction::Eip1559(request);
        let signature = self
            .wallet
            .sign_transaction_sync(&typed)
            .map_err(|e| SignerError::Wallet(e.to_string()))?;
        let raw = typed.rlp_signed(&signature);

        Ok(SignedTx {
            hash: H256::from(keccak256(&raw)),
            nonce: tx.nonce,
            raw,
        })
    }

    fn sign_blob(&self, tx: &UnsignedTx, sidecar: &BlobSidecar) -> Result<SignedTx, SignerError> {
        let to = tx.to.ok_or_else(|| {
            SignerError::InvalidTransaction("blob transactions require a recipient".to_string())
        })?;
        let blob_fee_cap = tx.fees.blob_fee_cap.ok_or_else(|| {
            SignerError::InvalidTransaction("blob transaction without blob fee cap".to_string())
        })?;

        let signature = self
            .wallet
            .sign_hash(blob_tx_sighash(tx, to, blob_fee_cap))
            .map_err(|e| SignerError::Wallet(e.to_string()))?;

        let body = signed_blob_tx_body(tx, to, blob_fee_cap, &signature);
        let hash = H256::from(keccak256(prefixed(&body)));

        // Network form: type || rlp([signed body, blobs, commitments, proofs])
        let mut wrapper = RlpStream::new_list(4);
        wrapper.append_raw(&body, 1);
        wrapper.begin_list(sidecar.len());
        for blob in sidecar.blobs() {
            wrapper.append(&blob.as_bytes().to_vec());
        }
        wrapper.begin_list(sidecar.len());
        for commitment in sidecar.commitments() {
            wrapper.append(&commitment.to_vec());
        }
        wrapper.begin_list(sidecar.len());
        for proof in sidecar.proofs() {
            wrapper.append(&proof.to_vec());
        }

        Ok(SignedTx {
            hash,
            nonce: tx.nonce,
            raw: Bytes::from(prefixed(&wrapper.out())),
        })
    }
}

#[async_trait]
impl TxSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, tx: &UnsignedTx) -> Result<SignedTx, SignerError> {
        match &tx.sidecar {
            Some(sidecar) => self.sign_blob(tx, sidecar),
            None => self.sign_dynamic_fee(tx),
        }
    }
}

fn prefixed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(BLOB_TX_TYPE);
    out.extend_from_slice(payload);
    out
}

fn append_blob_tx_fields(stream: &mut RlpStream, tx: &UnsignedTx, to: Address, blob_fee_cap: U256) {
    stream.append(&tx.chain_id);
    stream.append(&tx.nonce);
    stream.append(&tx.fees.tip);
    stream.append(&tx.fees.fee_cap);
    stream.append(&tx.gas_limit);
    stream.append(&to);
    stream.append(&tx.value);
    stream.append(&tx.data.to_vec());
    // empty access list
    stream.begin_list(0);
    stream.append(&blob_fee_cap);
    stream.append_list::<H256, H256>(&tx.blob_hashes);
}

/// Hash signed over for an EIP-4844 transaction
pub fn blob_tx_sighash(tx: &UnsignedTx, to: Address, blob_fee_cap: U256) -> H256 {
    let mut stream = RlpStream::new_list(11);
    append_blob_tx_fields(&mut stream, tx, to, blob_fee_cap);
    H256::from(keccak256(prefixed(&stream.out())))
}

fn signed_blob_tx_body(
    tx: &UnsignedTx,
    to: Address,
    blob_fee_cap: U256,
    signature: &Signature,
) -> Vec<u8> {
    // sign_hash yields a legacy v of 27 or 28
    let y_parity = signature.v.saturating_sub(27);

    let mut stream = RlpStream::new_list(14);
    append_blob_tx_fields(&mut stream, tx, to, blob_fee_cap);
    stream.append(&y_parity);
    stream.append(&signature.r);
    stream.append(&signature.s);
    stream.out().to_vec()
}
