//! Error types for the transaction manager

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a submission was given up on without a receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The mempool kept reporting that our nonce was already used.
    NonceTooLow { count: u64 },
    /// No broadcast was ever accepted by the backend.
    NotInMempool { timeout: Duration },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NonceTooLow { count } => {
                write!(f, "nonce too low observed {} times with nothing mined", count)
            }
            AbortReason::NotInMempool { timeout } => {
                write!(f, "transaction not accepted into mempool within {:?}", timeout)
            }
        }
    }
}

/// Main error type for the transaction manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxMgrError {
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Invalid transaction candidate: {0}")]
    InvalidCandidate(String),

    #[error("RPC error during {operation}: {message}")]
    Rpc {
        operation: &'static str,
        message: String,
    },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Fee limit reached: {0}")]
    FeeLimit(String),

    #[error("Submission abandoned: {reason}")]
    Abandoned { reason: AbortReason },

    #[error("Submission cancelled")]
    Cancelled,

    #[error("Timed out waiting for transaction confirmation")]
    SendTimeout,

    #[error("Transaction manager is closed")]
    Closed,
}

impl TxMgrError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxMgrError::Rpc { .. } | TxMgrError::FeeLimit(_))
    }

    /// Check if the error is a terminal verdict on the submission itself,
    /// as opposed to the caller or the manager going away.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, TxMgrError::Abandoned { .. })
    }
}

/// Result type for transaction manager operations
pub type TxMgrResult<T> = Result<T, TxMgrError>;
