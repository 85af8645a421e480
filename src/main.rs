//! op-txmgr - submit transactions reliably from the command line
//!
//! Reads one JSON transaction candidate per line from stdin, pushes each
//! through the submission queue, and logs every receipt or failure.

use anyhow::{Context, Result};
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use op_txmgr::config::Settings;
use op_txmgr::tx::{Admission, Queue, TxCandidate, TxManager, TxResult, WalletSigner};
use op_txmgr::EthersBackend;

/// One stdin line
#[derive(Debug, Deserialize)]
struct CandidateLine {
    to: Option<Address>,
    #[serde(default)]
    data: Bytes,
    #[serde(default)]
    value: U256,
    #[serde(default)]
    gas_limit: u64,
}

impl From<CandidateLine> for TxCandidate {
    fn from(line: CandidateLine) -> Self {
        TxCandidate::new(line.to, line.data)
            .with_value(line.value)
            .with_gas_limit(line.gas_limit)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting op-txmgr v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;

    let backend = Arc::new(EthersBackend::connect(&settings.rpc_url)?);
    let signer = Arc::new(WalletSigner::from_env(&settings.wallet.private_key_env)?);
    let manager = Arc::new(TxManager::new(settings.txmgr.clone(), backend, signer).await?);
    info!(
        "Submitting from {:?} on chain {} (max in flight: {})",
        manager.from(),
        manager.chain_id(),
        settings.txmgr.max_in_flight
    );

    let ctx = CancellationToken::new();
    let queue = Queue::new(ctx.clone(), manager.clone(), settings.txmgr.max_in_flight)
        .with_observer(|in_flight| debug!(in_flight, "Queue in-flight count changed"));

    // Stop accepting work and abort in-flight sends on shutdown
    let shutdown_handle = tokio::spawn({
        let ctx = ctx.clone();
        let manager = manager.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping...");
            manager.close();
            ctx.cancel();
        }
    });

    let (results_tx, mut results_rx) = mpsc::channel::<TxResult<usize>>(64);
    let results_handle = tokio::spawn(async move {
        let mut failed = 0usize;
        while let Some(TxResult { tag: line, result }) = results_rx.recv().await {
            match result {
                Ok(receipt) if receipt.status => info!(
                    line,
                    tx = ?receipt.tx_hash,
                    block = receipt.block_number,
                    gas_used = %receipt.gas_used,
                    "Transaction confirmed"
                ),
                Ok(receipt) => {
                    failed += 1;
                    warn!(line, tx = ?receipt.tx_hash, block = receipt.block_number, "Transaction reverted");
                }
                Err(e) => {
                    failed += 1;
                    error!(line, "Transaction failed: {}", e);
                }
            }
        }
        failed
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0usize;
    loop {
        let line = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let candidate: CandidateLine = match serde_json::from_str(&line) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(line = line_number, "Skipping malformed candidate: {}", e);
                continue;
            }
        };

        if queue
            .submit(line_number, candidate.into(), results_tx.clone())
            .await
            == Admission::Rejected
        {
            warn!(line = line_number, "Queue rejected candidate, stopping");
            break;
        }
    }

    queue.wait().await;
    drop(results_tx);
    let failed = results_handle.await?;
    shutdown_handle.abort();

    match op_txmgr::metrics::encode_text() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to encode metrics: {}", e),
    }

    info!("op-txmgr stopped");
    if failed > 0 {
        anyhow::bail!("{} transaction(s) did not succeed", failed);
    }
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,op_txmgr=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
