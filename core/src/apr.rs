//! Network and per-validator APR formulas.
//!
//! Two formulas are in use for the network-wide rate:
//!
//! - **Reward ratio**: annual inflation rewards (`total_supply * inflation_rate`)
//!   divided by the active stake
//! - **Credits delta**: vote credits earned in the latest epoch, annualized at
//!   [`EPOCHS_PER_YEAR`] and divided by the active stake
//!
//! Stake and supply arrive in lamports and are converted to whole tokens with
//! [`LAMPORTS_PER_SOL`]. Every function returns `0.0` instead of NaN or infinity.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use solana_sdk::native_token::LAMPORTS_PER_SOL;

/// Epochs last 12 hours on this network.
pub const EPOCHS_PER_YEAR: u64 = (365 * 24) / 12;

/// Which network APR formula the engine should use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AprStrategy {
    /// Reward ratio when supply and inflation rate are known, credits delta otherwise
    #[default]
    Auto,
    RewardRatio,
    CreditsDelta,
}

impl FromStr for AprStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AprStrategy::Auto),
            "reward-ratio" => Ok(AprStrategy::RewardRatio),
            "credits-delta" => Ok(AprStrategy::CreditsDelta),
            other => Err(format!(
                "unknown APR strategy `{other}`, expected auto, reward-ratio or credits-delta"
            )),
        }
    }
}

impl fmt::Display for AprStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AprStrategy::Auto => "auto",
            AprStrategy::RewardRatio => "reward-ratio",
            AprStrategy::CreditsDelta => "credits-delta",
        })
    }
}

/// The formula that actually produced a snapshot's network APR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AprMethod {
    RewardRatio,
    #[default]
    CreditsDelta,
}

/// Converts lamports to whole tokens.
pub fn lamports_to_tokens(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Annual inflation rewards in whole tokens.
pub fn total_rewards(total_supply: u64, inflation_rate: f64) -> f64 {
    finite_or_zero(total_supply as f64 * inflation_rate / LAMPORTS_PER_SOL as f64)
}

/// Network APR as the ratio of annual inflation rewards to active stake, in percent.
pub fn reward_ratio_apr(total_supply: u64, inflation_rate: f64, total_active_stake: u64) -> f64 {
    let stake = lamports_to_tokens(total_active_stake);
    if stake <= 0.0 {
        return 0.0;
    }
    finite_or_zero(total_rewards(total_supply, inflation_rate) / stake * 100.0)
}

/// Network APR from the credits earned by current validators in the latest epoch,
/// annualized over [`EPOCHS_PER_YEAR`] and rounded to two decimals.
pub fn credits_delta_apr(total_epoch_credits: i64, total_active_stake: u64) -> f64 {
    let stake = lamports_to_tokens(total_active_stake);
    if stake <= 0.0 {
        return 0.0;
    }
    let annual = total_epoch_credits as f64 * EPOCHS_PER_YEAR as f64;
    round2(finite_or_zero(annual / stake * 100.0))
}

/// De-rates the network APR by the validator's commission.
pub fn validator_apr(network_apr: f64, commission: u8) -> f64 {
    finite_or_zero(network_apr - network_apr * (f64::from(commission) / 100.0))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
