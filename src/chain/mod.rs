//! Chain module - the execution-layer RPC surface
//!
//! This module provides:
//! - The `Backend` trait the transaction manager is written against
//! - `EthersBackend`, the production implementation over an HTTP JSON-RPC provider

pub mod backend;
pub mod provider;

pub use backend::{
    Backend, BackendError, BackendResult, BlockHeader, BlockTag, BroadcastOutcome, CallRequest,
    TxReceipt,
};
pub use provider::EthersBackend;

#[cfg(test)]
pub use backend::MockBackend;
