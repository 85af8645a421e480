//! Broadcast accounting for one logical transaction
//!
//! Tracks which of the published hashes currently appear mined and how the
//! mempool has answered our broadcasts, and decides when a submission cannot
//! make progress any more.

use ethers::types::H256;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chain::BroadcastOutcome;
use crate::error::{AbortReason, TxMgrError, TxMgrResult};

/// Per-submission state machine. Owned by exactly one publisher task.
#[derive(Debug)]
pub struct SendState {
    mined: HashSet<H256>,
    nonce_too_low_count: u64,
    successful_publishes: u64,
    bump_count: u64,
    not_in_mempool_deadline: Instant,

    safe_abort_nonce_too_low_count: u64,
    not_in_mempool_timeout: Duration,
}

impl SendState {
    pub fn new(
        safe_abort_nonce_too_low_count: u64,
        not_in_mempool_timeout: Duration,
    ) -> TxMgrResult<Self> {
        Self::new_at(
            safe_abort_nonce_too_low_count,
            not_in_mempool_timeout,
            Instant::now(),
        )
    }

    /// Construct with an explicit creation time
    pub fn new_at(
        safe_abort_nonce_too_low_count: u64,
        not_in_mempool_timeout: Duration,
        now: Instant,
    ) -> TxMgrResult<Self> {
        if safe_abort_nonce_too_low_count == 0 {
            return Err(TxMgrError::InvalidConfig(
                "safe_abort_nonce_too_low_count must be positive".to_string(),
            ));
        }
        Ok(Self {
            mined: HashSet::new(),
            nonce_too_low_count: 0,
            successful_publishes: 0,
            bump_count: 0,
            not_in_mempool_deadline: now + not_in_mempool_timeout,
            safe_abort_nonce_too_low_count,
            not_in_mempool_timeout,
        })
    }

    /// Fold the outcome of one broadcast into the counters
    pub fn record_publish(&mut self, outcome: &BroadcastOutcome) {
        match outcome {
            BroadcastOutcome::Accepted | BroadcastOutcome::AlreadyKnown => {
                self.successful_publishes += 1;
            }
            BroadcastOutcome::NonceTooLow => {
                self.nonce_too_low_count += 1;
            }
            _ => {}
        }
    }

    pub fn record_mined(&mut self, hash: H256) {
        if self.mined.insert(hash) {
            debug!(tx = ?hash, "Transaction mined");
        }
    }

    /// A previously mined hash is gone, e.g. after a reorg
    pub fn record_unmined(&mut self, hash: H256) {
        if !self.mined.remove(&hash) {
            return;
        }
        info!(tx = ?hash, "Transaction unmined, possible reorg");
        if self.mined.is_empty() {
            self.nonce_too_low_count = 0;
        }
    }

    pub fn record_bump(&mut self) {
        self.bump_count += 1;
    }

    /// Some published hash currently appears mined
    pub fn awaiting_confirmation(&self) -> bool {
        !self.mined.is_empty()
    }

    pub fn should_abort(&self, now: Instant) -> bool {
        self.abort_reason(now).is_some()
    }

    /// Cause behind `should_abort`
    pub fn abort_reason(&self, now: Instant) -> Option<AbortReason> {
        if self.awaiting_confirmation() {
            return None;
        }
        if self.nonce_too_low_count >= self.safe_abort_nonce_too_low_count {
            return Some(AbortReason::NonceTooLow {
                count: self.nonce_too_low_count,
            });
        }
        if self.successful_publishes == 0 && now > self.not_in_mempool_deadline {
            return Some(AbortReason::NotInMempool {
                timeout: self.not_in_mempool_timeout,
            });
        }
        None
    }

    pub fn bump_count(&self) -> u64 {
        self.bump_count
    }

    pub fn nonce_too_low_count(&self) -> u64 {
        self.nonce_too_low_count
    }

    pub fn successful_publishes(&self) -> u64 {
        self.successful_publishes
    }
}
