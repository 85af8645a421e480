//! Caller-facing transaction request

use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

use super::blob::BlobSidecar;
use crate::error::{TxMgrError, TxMgrResult};

/// One logical transaction to get on-chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxCandidate {
    /// `None` creates a contract
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub blobs: Option<Arc<BlobSidecar>>,
    /// Zero means estimate
    pub gas_limit: u64,
}

impl TxCandidate {
    pub fn new(to: Option<Address>, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_blobs(mut self, sidecar: BlobSidecar) -> Self {
        self.blobs = Some(Arc::new(sidecar));
        self
    }

    pub fn is_blob_tx(&self) -> bool {
        self.blobs.is_some()
    }

    /// Reject candidates that can never be crafted
    pub fn validate(&self) -> TxMgrResult<()> {
        if self.is_blob_tx() && self.to.is_none() {
            return Err(TxMgrError::InvalidCandidate(
                "blob transactions cannot create contracts".to_string(),
            ));
        }
        Ok(())
    }
}
