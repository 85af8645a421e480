//! Publisher: drives one logical transaction to a confirmed receipt
//!
//! `TxManager::send` crafts and signs the transaction, broadcasts it, and then
//! alternates between polling receipts and republishing with bumped fees until
//! the transaction has enough confirmations, the submission is abandoned, or
//! the caller cancels.

use super::blob::BlobSidecar;
use super::candidate::TxCandidate;
use super::gas::{calc_blob_base_fee, FeePolicy, GasPriceCaps};
use super::nonce::NonceManager;
use super::send_state::SendState;
use super::signer::{SignedTx, TxSigner, UnsignedTx};
use crate::chain::{
    Backend, BackendError, BackendResult, BlockTag, BroadcastOutcome, CallRequest, TxReceipt,
};
use crate::config::TxMgrConfig;
use crate::error::{TxMgrError, TxMgrResult};
use crate::metrics;

use ethers::types::{Address, H256};
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A signed instance of the candidate at one fee level
#[derive(Debug, Clone)]
struct PendingTx {
    unsigned: UnsignedTx,
    signed: SignedTx,
}

impl PendingTx {
    fn hash(&self) -> H256 {
        self.signed.hash
    }
}

/// Everything one `send` call tracks between loop iterations
struct Submission {
    current: PendingTx,
    /// Every hash broadcast so far, oldest first
    broadcast_hashes: Vec<H256>,
    /// Gas limit came from estimation and may be re-estimated on bumps
    gas_estimated: bool,
    first_broadcast: Option<Instant>,
    state: SendState,
}

/// Decrements the pending-send gauge when a send ends, however it ends
struct PendingGuard<'a>(&'a AtomicI64);

impl<'a> PendingGuard<'a> {
    fn enter(pending: &'a AtomicI64) -> Self {
        metrics::record_pending_txs(pending.fetch_add(1, Ordering::SeqCst) + 1);
        Self(pending)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        metrics::record_pending_txs(self.0.fetch_sub(1, Ordering::SeqCst) - 1);
    }
}

/// Reliable transaction submission for a single sender
pub struct TxManager {
    config: TxMgrConfig,
    fees: FeePolicy,
    backend: Arc<dyn Backend>,
    signer: Arc<dyn TxSigner>,
    nonces: NonceManager,
    chain_id: u64,
    closed: AtomicBool,
    pending: AtomicI64,
}

impl TxManager {
    /// Create a manager, reading the chain id from the backend
    pub async fn new(
        config: TxMgrConfig,
        backend: Arc<dyn Backend>,
        signer: Arc<dyn TxSigner>,
    ) -> TxMgrResult<Self> {
        config.validate()?;
        let chain_id = tokio::time::timeout(config.network_timeout(), backend.chain_id())
            .await
            .map_err(|_| TxMgrError::Rpc {
                operation: "chain_id",
                message: "timed out".to_string(),
            })?
            .map_err(|e| rpc_error("chain_id", e))?;

        Self::with_chain_id(config, backend, signer, chain_id)
    }

    /// Create a manager for a known chain id
    pub fn with_chain_id(
        config: TxMgrConfig,
        backend: Arc<dyn Backend>,
        signer: Arc<dyn TxSigner>,
        chain_id: u64,
    ) -> TxMgrResult<Self> {
        config.validate()?;
        let from = signer.address();
        info!(
            "Transaction manager initialized for {:?} on chain {}",
            from, chain_id
        );

        Ok(Self {
            fees: FeePolicy::from_config(&config),
            config,
            backend,
            signer,
            nonces: NonceManager::new(from),
            chain_id,
            closed: AtomicBool::new(false),
            pending: AtomicI64::new(0),
        })
    }

    /// Sender address
    pub fn from(&self) -> Address {
        self.nonces.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn config(&self) -> &TxMgrConfig {
        &self.config
    }

    /// Refuse new sends and abandon in-flight sends that are not awaiting confirmation
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Transaction manager closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Latest block height
    pub async fn block_number(&self, ctx: &CancellationToken) -> TxMgrResult<u64> {
        self.call(ctx, "block_number", self.backend.block_number())
            .await
    }

    /// Current tip, base fee and (once EIP-4844 is active) blob base fee,
    /// with the configured floors applied
    pub async fn suggest_gas_price_caps(
        &self,
        ctx: &CancellationToken,
    ) -> TxMgrResult<GasPriceCaps> {
        let tip = match self
            .call_raw(ctx, "suggest_gas_tip_cap", self.backend.suggest_gas_tip_cap())
            .await?
        {
            Ok(tip) => tip,
            Err(BackendError::Unsupported(message)) => {
                let fallback = self.config.fallback_tip();
                debug!(%fallback, %message, "Backend cannot suggest a tip, using fallback");
                fallback
            }
            Err(e) => return Err(rpc_error("suggest_gas_tip_cap", e)),
        };

        let header = self
            .call(
                ctx,
                "header_by_number",
                self.backend.header_by_number(BlockTag::Latest),
            )
            .await?;
        let blob_base_fee = header.excess_blob_gas.map(calc_blob_base_fee);

        metrics::record_tip_cap(tip);
        metrics::record_base_fee(header.base_fee);
        if let Some(blob_base_fee) = blob_base_fee {
            metrics::record_blob_base_fee(blob_base_fee);
        }

        Ok(self.fees.clamp(GasPriceCaps {
            tip,
            base_fee: header.base_fee,
            blob_base_fee,
        }))
    }

    /// Publish `candidate` with increasing fees until it confirms.
    ///
    /// Returns the receipt once `num_confirmations` blocks have been built on
    /// the including block. A reverted transaction is still a receipt. The
    /// nonce is fixed for the whole call.
    pub async fn send(
        &self,
        ctx: &CancellationToken,
        candidate: TxCandidate,
    ) -> TxMgrResult<TxReceipt> {
        if self.is_closed() {
            return Err(TxMgrError::Closed);
        }
        let _pending = PendingGuard::enter(&self.pending);

        let result = match self.config.tx_send_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.send_inner(ctx, &candidate))
                .await
                .unwrap_or(Err(TxMgrError::SendTimeout)),
            None => self.send_inner(ctx, &candidate).await,
        };

        if let Err(e) = &result {
            // the cached nonce may be stale or skipped; re-read it next time
            self.nonces.reset().await;
            metrics::record_tx_abandoned(error_cause(e));
        }
        result
    }

    async fn send_inner(
        &self,
        ctx: &CancellationToken,
        candidate: &TxCandidate,
    ) -> TxMgrResult<TxReceipt> {
        let current = self.prepare(ctx, candidate).await?;
        let state = SendState::new(
            self.config.safe_abort_nonce_too_low_count,
            self.config.not_in_mempool_timeout(),
        )?;

        let mut submission = Submission {
            current,
            broadcast_hashes: Vec::new(),
            gas_estimated: candidate.gas_limit == 0,
            first_broadcast: None,
            state,
        };
        self.send_tx(ctx, &mut submission).await
    }

    /// Craft the first transaction, retrying transient failures
    async fn prepare(
        &self,
        ctx: &CancellationToken,
        candidate: &TxCandidate,
    ) -> TxMgrResult<PendingTx> {
        let max_attempts = self.config.craft_max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.is_closed() {
                return Err(TxMgrError::Closed);
            }

            match self.craft_tx(ctx, candidate).await {
                Ok(tx) => return Ok(tx),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "Failed to create a transaction (attempt {}/{}), will retry: {}",
                        attempt, max_attempts, e
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(TxMgrError::Cancelled),
                        _ = tokio::time::sleep(self.config.craft_retry_delay()) => {}
                    }
                }
                Err(e) => {
                    error!("Failed to create the transaction: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Query fees, gas and nonce, and sign. Never publishes.
    async fn craft_tx(
        &self,
        ctx: &CancellationToken,
        candidate: &TxCandidate,
    ) -> TxMgrResult<PendingTx> {
        debug!(
            blobs = candidate.blobs.as_ref().map_or(0, |s| s.len()),
            calldata_size = candidate.data.len(),
            "Crafting transaction"
        );
        candidate.validate()?;

        let caps = self.suggest_gas_price_caps(ctx).await?;
        let fees = self.fees.initial_fees(&caps, candidate.is_blob_tx())?;
        let blob_hashes = candidate
            .blobs
            .as_deref()
            .map(BlobSidecar::versioned_hashes)
            .unwrap_or_default();

        let mut unsigned = UnsignedTx {
            chain_id: self.chain_id,
            nonce: 0,
            to: candidate.to,
            value: candidate.value,
            data: candidate.data.clone(),
            gas_limit: candidate.gas_limit,
            fees,
            blob_hashes,
            sidecar: candidate.blobs.clone(),
        };
        if unsigned.gas_limit == 0 {
            unsigned.gas_limit = self.estimate_gas(ctx, &unsigned).await?;
        }

        let signed = self.sign_with_next_nonce(ctx, &mut unsigned).await?;
        Ok(PendingTx { unsigned, signed })
    }

    /// Assign the next nonce and sign. The nonce is only consumed if signing succeeds.
    async fn sign_with_next_nonce(
        &self,
        ctx: &CancellationToken,
        unsigned: &mut UnsignedTx,
    ) -> TxMgrResult<SignedTx> {
        let slot = tokio::select! {
            _ = ctx.cancelled() => return Err(TxMgrError::Cancelled),
            slot = self.nonces.slot() => slot,
        };

        let nonce = match slot.next_cached() {
            Some(nonce) => nonce,
            None => {
                self.call(
                    ctx,
                    "nonce_at",
                    self.backend.nonce_at(self.from(), BlockTag::Latest),
                )
                .await?
            }
        };

        unsigned.nonce = nonce;
        let signed = self.sign(ctx, unsigned).await?;
        slot.commit(nonce);
        Ok(signed)
    }

    async fn sign(&self, ctx: &CancellationToken, unsigned: &UnsignedTx) -> TxMgrResult<SignedTx> {
        let limit = self.config.network_timeout();
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(TxMgrError::Cancelled),
            res = tokio::time::timeout(limit, self.signer.sign(unsigned)) => match res {
                Ok(Ok(signed)) => Ok(signed),
                Ok(Err(e)) => Err(TxMgrError::Signer(e.to_string())),
                Err(_) => Err(TxMgrError::Signer(format!("signing timed out after {:?}", limit))),
            },
        }
    }

    async fn estimate_gas(&self, ctx: &CancellationToken, unsigned: &UnsignedTx) -> TxMgrResult<u64> {
        let call = CallRequest {
            from: self.from(),
            to: unsigned.to,
            data: unsigned.data.clone(),
            value: unsigned.value,
            tip: unsigned.fees.tip,
            fee_cap: unsigned.fees.fee_cap,
            blob_fee_cap: unsigned.fees.blob_fee_cap,
            blob_hashes: unsigned.blob_hashes.clone(),
        };
        self.call(ctx, "estimate_gas", self.backend.estimate_gas(&call))
            .await
    }

    /// Broadcast, then wait for confirmation while republishing on every
    /// resubmission tick
    async fn send_tx(
        &self,
        ctx: &CancellationToken,
        sub: &mut Submission,
    ) -> TxMgrResult<TxReceipt> {
        self.publish(ctx, sub, false).await?;
        self.check_abort(sub)?;

        let now = Instant::now();
        let resubmission = self.config.resubmission_timeout();
        let poll_interval = self.config.receipt_query_interval();
        let mut resubmit = interval_at(now + resubmission, resubmission);
        let mut poll = interval_at(now + poll_interval, poll_interval);
        resubmit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!(tx = ?sub.current.hash(), "Transaction send cancelled");
                    return Err(TxMgrError::Cancelled);
                }
                // ahead of polling: a poll pass slower than the poll interval
                // must not starve fee bumps
                _ = resubmit.tick() => {
                    if !sub.state.awaiting_confirmation() {
                        if self.is_closed() {
                            warn!(tx = ?sub.current.hash(), "Transaction manager closed, aborting transaction submission");
                            return Err(TxMgrError::Closed);
                        }
                        self.publish(ctx, sub, true).await?;
                    }
                }
                _ = poll.tick() => {
                    if let Some(receipt) = self.poll_receipts(ctx, sub).await? {
                        let latency = sub
                            .first_broadcast
                            .map(|t| t.elapsed().as_secs_f64())
                            .unwrap_or_default();
                        metrics::record_tx_confirmed(receipt.status, sub.state.bump_count(), latency);
                        return Ok(receipt);
                    }
                }
            }
            self.check_abort(sub)?;
        }
    }

    fn check_abort(&self, sub: &Submission) -> TxMgrResult<()> {
        match sub.state.abort_reason(Instant::now()) {
            Some(reason) => {
                warn!(
                    tx = ?sub.current.hash(),
                    nonce = sub.current.unsigned.nonce,
                    %reason,
                    "Aborting transaction submission"
                );
                Err(TxMgrError::Abandoned { reason })
            }
            None => Ok(()),
        }
    }

    /// Broadcast the current transaction, bumping fees first when `bump` is set.
    ///
    /// An underpriced answer to an unbumped broadcast triggers one immediate
    /// bump. Failures to bump skip the broadcast; only cancellation is an error.
    async fn publish(
        &self,
        ctx: &CancellationToken,
        sub: &mut Submission,
        mut bump: bool,
    ) -> TxMgrResult<()> {
        loop {
            if bump {
                let bumped = self
                    .increase_gas_price(ctx, &sub.current, sub.gas_estimated)
                    .await;
                match bumped {
                    Ok(next) => {
                        sub.state.record_bump();
                        sub.current = next;
                    }
                    Err(TxMgrError::Cancelled) => return Err(TxMgrError::Cancelled),
                    Err(e) => {
                        warn!(tx = ?sub.current.hash(), "Unable to bump fees, skipping rebroadcast: {}", e);
                        metrics::record_tx_published("bump_failed");
                        return Ok(());
                    }
                }
            }

            let tx = &sub.current;
            info!(
                tx = ?tx.hash(),
                nonce = tx.unsigned.nonce,
                tip = %tx.unsigned.fees.tip,
                fee_cap = %tx.unsigned.fees.fee_cap,
                gas_limit = tx.unsigned.gas_limit,
                "Publishing transaction"
            );
            let outcome = self.broadcast(ctx, &tx.signed).await?;

            let hash = tx.hash();
            if !sub.broadcast_hashes.contains(&hash) {
                sub.broadcast_hashes.push(hash);
            }
            sub.first_broadcast.get_or_insert_with(Instant::now);
            sub.state.record_publish(&outcome);
            metrics::record_tx_published(outcome.label());

            match &outcome {
                BroadcastOutcome::Accepted => {
                    info!(tx = ?hash, "Transaction successfully published");
                }
                BroadcastOutcome::AlreadyKnown => {
                    warn!(tx = ?hash, "Resubmitted already known transaction");
                }
                BroadcastOutcome::NonceTooLow => {
                    warn!(tx = ?hash, "Nonce too low");
                }
                BroadcastOutcome::AlreadyReserved => {
                    warn!(tx = ?hash, "Txpool contains pending tx of incompatible type");
                }
                BroadcastOutcome::Underpriced | BroadcastOutcome::ReplacementUnderpriced => {
                    warn!(tx = ?hash, reason = outcome.label(), "Transaction is underpriced");
                    if !bump {
                        bump = true;
                        continue;
                    }
                }
                BroadcastOutcome::Rejected(message) => {
                    metrics::record_rpc_error();
                    error!(tx = ?hash, "Unable to publish transaction: {}", message);
                }
            }
            return Ok(());
        }
    }

    /// Replacement for `current` with fees that satisfy the mempool's
    /// replacement rule. The gas limit is never lowered.
    async fn increase_gas_price(
        &self,
        ctx: &CancellationToken,
        current: &PendingTx,
        reestimate_gas: bool,
    ) -> TxMgrResult<PendingTx> {
        info!(tx = ?current.hash(), "Bumping gas price for transaction");
        let caps = self.suggest_gas_price_caps(ctx).await?;
        let fees = self.fees.bump(&current.unsigned.fees, &caps)?;

        let mut unsigned = current.unsigned.clone();
        unsigned.fees = fees;

        if reestimate_gas {
            let gas = self.estimate_gas(ctx, &unsigned).await?;
            if gas != unsigned.gas_limit {
                debug!(
                    tx = ?current.hash(),
                    old_gas = unsigned.gas_limit,
                    new_gas = gas,
                    "Re-estimated gas differs"
                );
            }
            unsigned.gas_limit = unsigned.gas_limit.max(gas);
        }

        let signed = self.sign(ctx, &unsigned).await?;
        debug!(
            old_tx = ?current.hash(),
            new_tx = ?signed.hash,
            tip = %unsigned.fees.tip,
            fee_cap = %unsigned.fees.fee_cap,
            blob_fee_cap = ?unsigned.fees.blob_fee_cap,
            "Fees bumped"
        );
        Ok(PendingTx { unsigned, signed })
    }

    /// Check every broadcast hash for a receipt, newest first. Returns the
    /// first receipt that has enough confirmations.
    ///
    /// Receipts are fetched concurrently, so one pass takes at most two
    /// network timeouts however many replacements were broadcast.
    async fn poll_receipts(
        &self,
        ctx: &CancellationToken,
        sub: &mut Submission,
    ) -> TxMgrResult<Option<TxReceipt>> {
        let lookups = sub.broadcast_hashes.iter().rev().map(|&hash| async move {
            let receipt = self
                .call_raw(ctx, "transaction_receipt", self.backend.transaction_receipt(hash))
                .await;
            (hash, receipt)
        });
        let lookups = join_all(lookups).await;

        let mut tip_height = None;
        for (hash, receipt) in lookups {
            let receipt = match receipt? {
                Ok(Some(receipt)) => receipt,
                Ok(None) => {
                    trace!(tx = ?hash, "Transaction not yet mined");
                    sub.state.record_unmined(hash);
                    continue;
                }
                Err(e) => {
                    info!(tx = ?hash, "Receipt retrieval failed: {}", e);
                    continue;
                }
            };

            sub.state.record_mined(hash);

            let tip = match tip_height {
                Some(tip) => tip,
                None => match self
                    .call_raw(ctx, "header_by_number", self.backend.header_by_number(BlockTag::Latest))
                    .await?
                {
                    Ok(header) => {
                        metrics::record_base_fee(header.base_fee);
                        if let Some(excess) = header.excess_blob_gas {
                            metrics::record_blob_base_fee(calc_blob_base_fee(excess));
                        }
                        *tip_height.insert(header.number)
                    }
                    Err(e) => {
                        error!("Unable to fetch tip: {}", e);
                        return Ok(None);
                    }
                },
            };

            let confirmations = self.config.num_confirmations;
            debug!(
                tx = ?hash,
                block = receipt.block_number,
                tip,
                confirmations,
                "Transaction mined, checking confirmations"
            );

            if receipt.block_number + confirmations <= tip + 1 {
                info!(
                    tx = ?hash,
                    block = receipt.block_number,
                    status = receipt.status,
                    effective_gas_price = ?receipt.effective_gas_price,
                    "Transaction confirmed"
                );
                return Ok(Some(receipt));
            }

            let confs_remaining = (receipt.block_number + confirmations) - (tip + 1);
            debug!(tx = ?hash, confs_remaining, "Transaction not yet confirmed");
        }

        Ok(None)
    }

    async fn broadcast(&self, ctx: &CancellationToken, tx: &SignedTx) -> TxMgrResult<BroadcastOutcome> {
        let limit = self.config.network_timeout();
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(TxMgrError::Cancelled),
            res = tokio::time::timeout(limit, self.backend.send_raw_transaction(tx)) => {
                Ok(res.unwrap_or_else(|_| {
                    BroadcastOutcome::Rejected(format!("send_raw_transaction timed out after {:?}", limit))
                }))
            }
        }
    }

    /// Run one backend call under the network timeout, racing cancellation.
    /// The backend's own error is returned as the inner result.
    async fn call_raw<T, F>(
        &self,
        ctx: &CancellationToken,
        operation: &'static str,
        fut: F,
    ) -> TxMgrResult<BackendResult<T>>
    where
        F: Future<Output = BackendResult<T>>,
    {
        let limit = self.config.network_timeout();
        let res = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(TxMgrError::Cancelled),
            res = tokio::time::timeout(limit, fut) => res,
        };

        let res = res.unwrap_or_else(|_| {
            Err(BackendError::Transient(format!(
                "{} timed out after {:?}",
                operation, limit
            )))
        });
        if matches!(res, Err(BackendError::Transient(_))) {
            metrics::record_rpc_error();
        }
        Ok(res)
    }

    /// `call_raw` with backend errors converted
    async fn call<T, F>(&self, ctx: &CancellationToken, operation: &'static str, fut: F) -> TxMgrResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        self.call_raw(ctx, operation, fut)
            .await?
            .map_err(|e| rpc_error(operation, e))
    }
}

fn rpc_error(operation: &'static str, e: BackendError) -> TxMgrError {
    match e {
        BackendError::Reverted(message) => TxMgrError::GasEstimation(message),
        BackendError::Transient(message) | BackendError::Unsupported(message) => {
            TxMgrError::Rpc { operation, message }
        }
    }
}

/// Metric label for a failed send
fn error_cause(e: &TxMgrError) -> &'static str {
    match e {
        TxMgrError::InvalidConfig(_) | TxMgrError::InvalidCandidate(_) => "invalid",
        TxMgrError::Rpc { .. } => "rpc",
        TxMgrError::GasEstimation(_) => "gas_estimation",
        TxMgrError::Signer(_) => "signer",
        TxMgrError::FeeLimit(_) => "fee_limit",
        TxMgrError::Abandoned { .. } => "abandoned",
        TxMgrError::Cancelled => "cancelled",
        TxMgrError::SendTimeout => "send_timeout",
        TxMgrError::Closed => "closed",
    }
}
