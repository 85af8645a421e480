//! Nonce management for a single sender
//!
//! The nonce is fetched once with `nonce_at(latest)` and then handed out
//! locally, one per crafted transaction. Any failed send resets the cache so
//! the next crafting re-reads the chain.

use ethers::types::Address;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Per-sender nonce cache
pub struct NonceManager {
    /// Wallet address
    address: Address,
    /// Last nonce handed out; `None` until the chain has been queried
    last_used: Mutex<Option<u64>>,
}

impl NonceManager {
    /// Create a new nonce manager
    pub fn new(address: Address) -> Self {
        Self {
            address,
            last_used: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Lock the cache for one crafting attempt.
    ///
    /// Concurrent crafters queue here, so two transactions never receive the
    /// same nonce. Dropping the slot without `commit` leaves the cache untouched.
    pub async fn slot(&self) -> NonceSlot<'_> {
        NonceSlot {
            guard: self.last_used.lock().await,
        }
    }

    /// Forget the cached nonce
    pub async fn reset(&self) {
        let mut last_used = self.last_used.lock().await;
        if last_used.take().is_some() {
            debug!(address = ?self.address, "Reset nonce cache");
        }
    }

    /// Last nonce handed out, if any
    pub async fn last_used(&self) -> Option<u64> {
        *self.last_used.lock().await
    }
}

/// Exclusive access to the nonce cache
pub struct NonceSlot<'a> {
    guard: MutexGuard<'a, Option<u64>>,
}

impl NonceSlot<'_> {
    /// Next nonce from the cache; `None` means the chain must be queried
    pub fn next_cached(&self) -> Option<u64> {
        (*self.guard).map(|n| n + 1)
    }

    /// Record `nonce` as used by a successfully signed transaction
    pub fn commit(mut self, nonce: u64) {
        *self.guard = Some(nonce);
        crate::metrics::record_nonce(nonce);
    }
}
