//! Configuration management for the transaction manager
//!
//! Loads configuration from TOML files with environment variable substitution.
//! `TxMgrConfig` is the part handed to each `TxManager`; `Settings` is the
//! binary's root document.

use anyhow::{Context, Result};
use ethers::types::U256;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{TxMgrError, TxMgrResult};

const WEI_PER_GWEI: f64 = 1_000_000_000.0;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub rpc_url: String,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub txmgr: TxMgrConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hex private key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

fn default_private_key_env() -> String {
    "TXMGR_PRIVATE_KEY".to_string()
}

/// Tunables for publishing, fee bumping and admission
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TxMgrConfig {
    /// Interval between fee-bump attempts
    pub resubmission_timeout_ms: u64,
    /// Poll cadence for receipts inside the wait loop
    pub receipt_query_interval_ms: u64,
    /// Per-RPC-call timeout
    pub network_timeout_ms: u64,
    /// Overall bound on a single send; 0 disables it
    pub tx_send_timeout_ms: u64,
    /// Deadline for the first successful publish
    pub not_in_mempool_timeout_ms: u64,
    /// Blocks after inclusion before a receipt is returned
    pub num_confirmations: u64,
    /// Nonce-too-low observations tolerated before giving up
    pub safe_abort_nonce_too_low_count: u64,
    pub fee_bump_percent: u64,
    pub blob_fee_bump_percent: u64,
    /// Bumped fees may not exceed this multiple of the current suggestion
    pub fee_limit_multiplier: u64,
    /// Below this value the multiplier limit is not enforced
    pub fee_limit_threshold_gwei: f64,
    pub min_base_fee_gwei: f64,
    pub min_tip_gwei: f64,
    pub min_blob_fee_gwei: f64,
    /// Used when the backend does not implement eth_maxPriorityFeePerGas
    pub fallback_tip_gwei: f64,
    pub craft_max_attempts: u32,
    pub craft_retry_delay_ms: u64,
    /// Queue admission bound; 0 means unbounded
    pub max_in_flight: usize,
}

impl Default for TxMgrConfig {
    fn default() -> Self {
        Self::batcher()
    }
}

impl TxMgrConfig {
    /// Defaults tuned for batch submission
    pub fn batcher() -> Self {
        Self {
            resubmission_timeout_ms: 48_000,
            receipt_query_interval_ms: 12_000,
            network_timeout_ms: 10_000,
            tx_send_timeout_ms: 0,
            not_in_mempool_timeout_ms: 120_000,
            num_confirmations: 10,
            safe_abort_nonce_too_low_count: 3,
            fee_bump_percent: 10,
            blob_fee_bump_percent: 100,
            fee_limit_multiplier: 5,
            fee_limit_threshold_gwei: 100.0,
            min_base_fee_gwei: 0.0,
            min_tip_gwei: 0.0,
            min_blob_fee_gwei: 1.0,
            fallback_tip_gwei: 1.5,
            craft_max_attempts: 30,
            craft_retry_delay_ms: 2_000,
            max_in_flight: 0,
        }
    }

    /// Defaults tuned for dispute game moves, which must land quickly
    pub fn challenger() -> Self {
        Self {
            resubmission_timeout_ms: 24_000,
            tx_send_timeout_ms: 120_000,
            not_in_mempool_timeout_ms: 60_000,
            num_confirmations: 3,
            ..Self::batcher()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> TxMgrResult<()> {
        let invalid = |msg: &str| Err(TxMgrError::InvalidConfig(msg.to_string()));

        if self.num_confirmations == 0 {
            return invalid("num_confirmations must not be 0");
        }
        if self.safe_abort_nonce_too_low_count == 0 {
            return invalid("safe_abort_nonce_too_low_count must not be 0");
        }
        if self.network_timeout_ms == 0 {
            return invalid("must provide network_timeout_ms");
        }
        if self.resubmission_timeout_ms == 0 {
            return invalid("must provide resubmission_timeout_ms");
        }
        if self.receipt_query_interval_ms == 0 {
            return invalid("must provide receipt_query_interval_ms");
        }
        if self.not_in_mempool_timeout_ms == 0 {
            return invalid("must provide not_in_mempool_timeout_ms");
        }
        if self.fee_limit_multiplier == 0 {
            return invalid("must provide fee_limit_multiplier");
        }
        if self.fee_bump_percent == 0 || self.blob_fee_bump_percent == 0 {
            return invalid("fee bump percentages must be positive");
        }
        if self.craft_max_attempts == 0 {
            return invalid("craft_max_attempts must not be 0");
        }

        for (name, value) in [
            ("fee_limit_threshold_gwei", self.fee_limit_threshold_gwei),
            ("min_base_fee_gwei", self.min_base_fee_gwei),
            ("min_tip_gwei", self.min_tip_gwei),
            ("min_blob_fee_gwei", self.min_blob_fee_gwei),
            ("fallback_tip_gwei", self.fallback_tip_gwei),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TxMgrError::InvalidConfig(format!(
                    "{} must be a finite, non-negative gwei amount (got {})",
                    name, value
                )));
            }
        }

        Ok(())
    }

    pub fn resubmission_timeout(&self) -> Duration {
        Duration::from_millis(self.resubmission_timeout_ms)
    }

    pub fn receipt_query_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_query_interval_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn tx_send_timeout(&self) -> Option<Duration> {
        (self.tx_send_timeout_ms > 0).then(|| Duration::from_millis(self.tx_send_timeout_ms))
    }

    pub fn not_in_mempool_timeout(&self) -> Duration {
        Duration::from_millis(self.not_in_mempool_timeout_ms)
    }

    pub fn craft_retry_delay(&self) -> Duration {
        Duration::from_millis(self.craft_retry_delay_ms)
    }

    pub fn fee_limit_threshold(&self) -> U256 {
        gwei_to_wei(self.fee_limit_threshold_gwei)
    }

    pub fn min_base_fee(&self) -> U256 {
        gwei_to_wei(self.min_base_fee_gwei)
    }

    pub fn min_tip(&self) -> U256 {
        gwei_to_wei(self.min_tip_gwei)
    }

    pub fn min_blob_fee(&self) -> U256 {
        gwei_to_wei(self.min_blob_fee_gwei)
    }

    pub fn fallback_tip(&self) -> U256 {
        gwei_to_wei(self.fallback_tip_gwei)
    }
}

/// Convert a (validated) gwei amount to wei
pub fn gwei_to_wei(gwei: f64) -> U256 {
    U256::from((gwei * WEI_PER_GWEI).round() as u128)
}

impl Settings {
    /// Load settings from the file named by `OP_TXMGR_CONFIG`, or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("OP_TXMGR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            anyhow::bail!("must provide an RPC url");
        }
        if self.wallet.private_key_env.is_empty() {
            anyhow::bail!("wallet.private_key_env must name an environment variable");
        }
        self.txmgr.validate()?;
        Ok(())
    }
}

lazy_static::lazy_static! {
    static ref ENV_VAR_PATTERN: regex::Regex =
        regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
