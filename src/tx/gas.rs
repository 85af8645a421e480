//! Fee suggestion and fee bumping for EIP-1559 and EIP-4844 transactions

use crate::config::TxMgrConfig;
use crate::error::{TxMgrError, TxMgrResult};

use ethers::types::U256;
use tracing::debug;

/// EIP-4844 `MIN_BASE_FEE_PER_BLOB_GAS`
pub const MIN_BLOB_BASE_FEE: u64 = 1;
/// EIP-4844 `BLOB_BASE_FEE_UPDATE_FRACTION`
pub const BLOB_BASE_FEE_UPDATE_FRACTION: u64 = 3_338_477;

/// Fee parameters of one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSet {
    pub tip: U256,
    pub fee_cap: U256,
    /// Only set for blob transactions
    pub blob_fee_cap: Option<U256>,
}

/// Current fee market as seen by the backend, after floors are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceCaps {
    pub tip: U256,
    pub base_fee: U256,
    /// `None` until EIP-4844 is active
    pub blob_base_fee: Option<U256>,
}

/// `tip + 2 * base_fee`
pub fn calc_gas_fee_cap(base_fee: U256, tip: U256) -> U256 {
    tip.saturating_add(base_fee.saturating_mul(U256::from(2)))
}

/// Smallest value a replacement must reach: `ceil(x * (100 + bump) / 100)`,
/// and always at least `x + 1`.
pub fn calc_threshold_value(x: U256, bump_percent: u64) -> U256 {
    let bumped = x
        .saturating_mul(U256::from(100 + bump_percent))
        .saturating_add(U256::from(99))
        / U256::from(100);
    bumped.max(x.saturating_add(U256::one()))
}

/// Pick a replacement tip and fee cap that satisfy the mempool replacement rule
/// and are no lower than what the current market suggests.
pub fn update_fees(
    old_tip: U256,
    old_fee_cap: U256,
    new_tip: U256,
    new_base_fee: U256,
    bump_percent: u64,
) -> (U256, U256) {
    let new_fee_cap = calc_gas_fee_cap(new_base_fee, new_tip);
    let threshold_tip = calc_threshold_value(old_tip, bump_percent);
    let threshold_fee_cap = calc_threshold_value(old_fee_cap, bump_percent);

    let tip_ok = new_tip >= threshold_tip;
    let fee_cap_ok = new_fee_cap >= threshold_fee_cap;

    match (tip_ok, fee_cap_ok) {
        (true, true) => {
            debug!(tip = %new_tip, fee_cap = %new_fee_cap, "Using new tip and fee cap");
            (new_tip, new_fee_cap)
        }
        (true, false) => {
            // tip went up, base fee flat or down
            debug!(tip = %new_tip, fee_cap = %threshold_fee_cap, "Using new tip and threshold fee cap");
            (new_tip, threshold_fee_cap)
        }
        (false, true) => {
            // base fee went up; leave room for it above the threshold tip
            let fee_cap = calc_gas_fee_cap(new_base_fee, threshold_tip);
            debug!(tip = %threshold_tip, fee_cap = %fee_cap, "Using threshold tip and recalculated fee cap");
            (threshold_tip, fee_cap)
        }
        (false, false) => {
            debug!(tip = %threshold_tip, fee_cap = %threshold_fee_cap, "Using threshold tip and threshold fee cap");
            (threshold_tip, threshold_fee_cap)
        }
    }
}

/// Approximates `factor * e ** (numerator / denominator)` using Taylor expansion
pub fn fake_exponential(factor: U256, numerator: U256, denominator: U256) -> U256 {
    if denominator.is_zero() {
        return U256::MAX;
    }
    let mut i = U256::one();
    let mut output = U256::zero();
    let mut accum = match factor.checked_mul(denominator) {
        Some(v) => v,
        None => return U256::MAX,
    };
    while !accum.is_zero() {
        output = output.saturating_add(accum);
        accum = match accum.checked_mul(numerator) {
            Some(v) => v / (denominator * i),
            None => return U256::MAX,
        };
        i += U256::one();
    }
    output / denominator
}

/// Blob base fee implied by a header's excess blob gas
pub fn calc_blob_base_fee(excess_blob_gas: u64) -> U256 {
    fake_exponential(
        U256::from(MIN_BLOB_BASE_FEE),
        U256::from(excess_blob_gas),
        U256::from(BLOB_BASE_FEE_UPDATE_FRACTION),
    )
}

/// Fee floors, bump percentages and runaway limits for one manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeePolicy {
    pub bump_percent: u64,
    pub blob_bump_percent: u64,
    pub fee_limit_multiplier: u64,
    pub fee_limit_threshold: U256,
    pub min_tip: U256,
    pub min_base_fee: U256,
    pub min_blob_fee: U256,
}

impl FeePolicy {
    pub fn from_config(config: &TxMgrConfig) -> Self {
        Self {
            bump_percent: config.fee_bump_percent,
            blob_bump_percent: config.blob_fee_bump_percent,
            fee_limit_multiplier: config.fee_limit_multiplier,
            fee_limit_threshold: config.fee_limit_threshold(),
            min_tip: config.min_tip(),
            min_base_fee: config.min_base_fee(),
            min_blob_fee: config.min_blob_fee(),
        }
    }

    /// Raise suggested values to the configured floors
    pub fn clamp(&self, mut caps: GasPriceCaps) -> GasPriceCaps {
        if caps.tip < self.min_tip {
            debug!(min_tip = %self.min_tip, orig_tip = %caps.tip, "Enforcing min tip");
            caps.tip = self.min_tip;
        }
        if caps.base_fee < self.min_base_fee {
            debug!(min_base_fee = %self.min_base_fee, orig_base_fee = %caps.base_fee, "Enforcing min base fee");
            caps.base_fee = self.min_base_fee;
        }
        caps
    }

    /// `max(2 * blob_base_fee, min_blob_fee)`
    pub fn calc_blob_fee_cap(&self, blob_base_fee: U256) -> U256 {
        blob_base_fee
            .saturating_mul(U256::from(2))
            .max(self.min_blob_fee)
    }

    /// Fees for the first broadcast of a candidate
    pub fn initial_fees(&self, caps: &GasPriceCaps, is_blob_tx: bool) -> TxMgrResult<FeeSet> {
        let blob_fee_cap = if is_blob_tx {
            let blob_base_fee = caps.blob_base_fee.ok_or_else(blob_fee_unavailable)?;
            Some(self.calc_blob_fee_cap(blob_base_fee))
        } else {
            None
        };

        Ok(FeeSet {
            tip: caps.tip,
            fee_cap: calc_gas_fee_cap(caps.base_fee, caps.tip),
            blob_fee_cap,
        })
    }

    /// Fees for a replacement of `prev` under the current market `caps`.
    ///
    /// Fails with `FeeLimit` when the replacement would exceed the configured
    /// multiple of the suggestion.
    pub fn bump(&self, prev: &FeeSet, caps: &GasPriceCaps) -> TxMgrResult<FeeSet> {
        let bump_percent = if prev.blob_fee_cap.is_some() {
            self.blob_bump_percent
        } else {
            self.bump_percent
        };

        let (tip, fee_cap) =
            update_fees(prev.tip, prev.fee_cap, caps.tip, caps.base_fee, bump_percent);
        self.check_limits(caps.tip, caps.base_fee, tip, fee_cap)?;

        let blob_fee_cap = match prev.blob_fee_cap {
            Some(prev_blob_fee_cap) => {
                let blob_base_fee = caps.blob_base_fee.ok_or_else(blob_fee_unavailable)?;
                let bumped = calc_threshold_value(prev_blob_fee_cap, bump_percent).max(blob_base_fee);
                self.check_blob_fee_limits(blob_base_fee, bumped)?;
                Some(bumped)
            }
            None => None,
        };

        Ok(FeeSet {
            tip,
            fee_cap,
            blob_fee_cap,
        })
    }

    /// Values under the threshold are always allowed
    fn check_limits(
        &self,
        tip: U256,
        base_fee: U256,
        bumped_tip: U256,
        bumped_fee_cap: U256,
    ) -> TxMgrResult<()> {
        let limit = U256::from(self.fee_limit_multiplier);
        let max_tip = tip.saturating_mul(limit);
        let max_fee_cap = calc_gas_fee_cap(base_fee.saturating_mul(limit), max_tip);

        let mut errors = Vec::new();
        for (name, value, max) in [
            ("tip", bumped_tip, max_tip),
            ("fee", bumped_fee_cap, max_fee_cap),
        ] {
            if self.fee_limit_threshold > value {
                continue;
            }
            if value > max {
                errors.push(format!(
                    "bumped {} cap {} is over {}x multiple of the suggested value",
                    name, value, self.fee_limit_multiplier
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TxMgrError::FeeLimit(errors.join("; ")))
        }
    }

    fn check_blob_fee_limits(&self, blob_base_fee: U256, bumped_blob_fee: U256) -> TxMgrResult<()> {
        if self.fee_limit_threshold > bumped_blob_fee {
            return Ok(());
        }
        let max_blob_fee = self
            .calc_blob_fee_cap(blob_base_fee)
            .saturating_mul(U256::from(self.fee_limit_multiplier));
        if bumped_blob_fee > max_blob_fee {
            return Err(TxMgrError::FeeLimit(format!(
                "bumped blob fee {} is over {}x multiple of the suggested value",
                bumped_blob_fee, self.fee_limit_multiplier
            )));
        }
        Ok(())
    }
}

fn blob_fee_unavailable() -> TxMgrError {
    TxMgrError::Rpc {
        operation: "header_by_number",
        message: "blob base fee unavailable: header has no excess blob gas".to_string(),
    }
}
