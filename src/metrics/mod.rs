//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Pending and queued submissions
//! - Publish outcomes and RPC errors
//! - Confirmations, fee bumps and latency
//! - Fee market observations
//!
//! Collectors live in the default registry; serving them is left to the
//! embedding process.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_int_counter,
    register_int_gauge, CounterVec, Encoder, Gauge, Histogram, IntCounter, IntGauge, TextEncoder,
};

use ethers::types::U256;

lazy_static! {
    // Submission metrics
    pub static ref PENDING_TXS: IntGauge = register_int_gauge!(
        "txmgr_pending_txs",
        "Number of sends currently in progress"
    ).unwrap();

    pub static ref QUEUE_IN_FLIGHT: IntGauge = register_int_gauge!(
        "txmgr_queue_in_flight",
        "Number of queued submissions currently admitted"
    ).unwrap();

    pub static ref TX_PUBLISHED: CounterVec = register_counter_vec!(
        "txmgr_tx_published_total",
        "Broadcast attempts by outcome (empty reason means accepted)",
        &["reason"]
    ).unwrap();

    pub static ref RPC_ERRORS: IntCounter = register_int_counter!(
        "txmgr_rpc_errors_total",
        "Failed backend calls"
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txmgr_tx_confirmed_total",
        "Confirmed transactions by execution status",
        &["status"]
    ).unwrap();

    pub static ref TX_ABANDONED: CounterVec = register_counter_vec!(
        "txmgr_tx_abandoned_total",
        "Sends that ended without a receipt, by cause",
        &["cause"]
    ).unwrap();

    pub static ref GAS_BUMP_COUNT: Histogram = register_histogram!(
        "txmgr_gas_bump_count",
        "Fee bumps needed before confirmation",
        vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]
    ).unwrap();

    pub static ref TX_CONFIRMATION_LATENCY: Histogram = register_histogram!(
        "txmgr_tx_confirmation_latency_seconds",
        "Time from first broadcast to confirmation",
        vec![1.0, 5.0, 12.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    // Wallet metrics
    pub static ref CURRENT_NONCE: IntGauge = register_int_gauge!(
        "txmgr_current_nonce",
        "Last nonce assigned to a signed transaction"
    ).unwrap();

    // Fee market metrics
    pub static ref TIP_CAP_GWEI: Gauge = register_gauge!(
        "txmgr_tip_cap_gwei",
        "Last suggested priority fee"
    ).unwrap();

    pub static ref BASE_FEE_GWEI: Gauge = register_gauge!(
        "txmgr_base_fee_gwei",
        "Last observed base fee"
    ).unwrap();

    pub static ref BLOB_BASE_FEE_GWEI: Gauge = register_gauge!(
        "txmgr_blob_base_fee_gwei",
        "Last observed blob base fee"
    ).unwrap();
}

fn to_gwei(wei: U256) -> f64 {
    let capped = wei.min(U256::from(u128::MAX)).as_u128();
    capped as f64 / 1e9
}

/// Render the default registry in the text exposition format
pub fn encode_text() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// Helper functions to record metrics

pub fn record_pending_txs(pending: i64) {
    PENDING_TXS.set(pending);
}

pub fn record_queue_in_flight(in_flight: usize) {
    QUEUE_IN_FLIGHT.set(in_flight as i64);
}

pub fn record_tx_published(reason: &str) {
    TX_PUBLISHED.with_label_values(&[reason]).inc();
}

pub fn record_rpc_error() {
    RPC_ERRORS.inc();
}

pub fn record_tx_confirmed(success: bool, bump_count: u64, latency_secs: f64) {
    TX_CONFIRMED
        .with_label_values(&[if success { "success" } else { "reverted" }])
        .inc();
    GAS_BUMP_COUNT.observe(bump_count as f64);
    TX_CONFIRMATION_LATENCY.observe(latency_secs);
}

pub fn record_tx_abandoned(cause: &str) {
    TX_ABANDONED.with_label_values(&[cause]).inc();
}

pub fn record_nonce(nonce: u64) {
    CURRENT_NONCE.set(nonce as i64);
}

pub fn record_tip_cap(tip: U256) {
    TIP_CAP_GWEI.set(to_gwei(tip));
}

pub fn record_base_fee(base_fee: U256) {
    BASE_FEE_GWEI.set(to_gwei(base_fee));
}

pub fn record_blob_base_fee(blob_base_fee: U256) {
    BLOB_BASE_FEE_GWEI.set(to_gwei(blob_base_fee));
}
