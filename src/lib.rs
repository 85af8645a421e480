//! op-txmgr - reliable transaction submission for EVM chains
//!
//! A `TxManager` drives one logical transaction at a time to a confirmed
//! receipt, bumping fees and surviving flaky RPC endpoints along the way. A
//! `Queue` runs many such sends concurrently under an in-flight bound.

pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tx;

pub use chain::{Backend, BroadcastOutcome, EthersBackend, TxReceipt};
pub use config::{Settings, TxMgrConfig};
pub use error::{AbortReason, TxMgrError, TxMgrResult};
pub use tx::{Admission, Queue, TxCandidate, TxManager, TxResult};
