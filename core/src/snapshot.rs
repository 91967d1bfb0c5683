//! Serialized shapes served by the read API and persisted by the snapshot store.
//!
//! Field names are camelCase to match what dashboard clients already consume.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::clock::{Epoch, Slot, DEFAULT_MS_PER_SLOT, DEFAULT_SLOTS_PER_EPOCH};

use crate::{apr::AprMethod, validator::EpochCredits};

/// Geographic position of a validator's gossip IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub city: String,
    pub country: String,
}

/// Per-validator metrics derived from one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorMetrics {
    pub identity_pubkey: String,
    pub vote_account_pubkey: String,
    pub commission: u8,
    pub last_vote: Slot,
    pub root_slot: Slot,
    pub credits: u64,
    pub epoch_credits: Vec<EpochCredits>,
    pub activated_stake: u64,
    pub version: String,
    /// Percent of assigned leader slots that produced no block
    pub skip_rate: f64,
    /// Credits earned in the latest epoch; negative only if the history is inconsistent
    pub credits_growth: i64,
    pub location: Option<Location>,
    pub delinquent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apr: Option<f64>,
    /// Inflation reward paid to the vote account for the last completed epoch, in lamports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_epoch_reward: Option<u64>,
}

/// Rollup of validators running one software version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStats {
    pub current_validators: usize,
    pub delinquent_validators: usize,
    pub current_active_stake: u64,
    pub delinquent_active_stake: u64,
    pub average_skip_rate: f64,
    pub average_credits_growth: f64,
    /// Averaged over validators of this version that have an APR
    pub average_apr: f64,
}

/// Network-wide aggregates plus every validator's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    /// Stake of current (non-delinquent) validators
    pub total_active_stake: u64,
    /// Stake of current and delinquent validators together
    pub total_current_stake: u64,
    pub total_delinquent_stake: u64,
    pub validators: Vec<ValidatorMetrics>,
    pub average_skip_rate: f64,
    pub network_apr: f64,
    pub apr_method: AprMethod,
    pub inflation_rate: Option<f64>,
    pub total_validators: usize,
    pub active_validators: usize,
    pub delinquent_validators: usize,
    pub stake_by_version: BTreeMap<String, VersionStats>,
}

/// Where the cluster is inside the current epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochProgress {
    pub current_epoch: Epoch,
    pub absolute_slot: Slot,
    pub slot_index: u64,
    pub slots_in_epoch: u64,
    /// Percent of the epoch elapsed, clamped to 0..=100
    pub epoch_progress: f64,
    /// Estimated seconds until the epoch ends
    pub time_left_in_epoch: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots_per_epoch: Option<u64>,
}

impl EpochProgress {
    pub fn new(
        current_epoch: Epoch,
        absolute_slot: Slot,
        slot_index: u64,
        slots_in_epoch: u64,
        slots_per_epoch: Option<u64>,
    ) -> Self {
        let slots_in_epoch = if slots_in_epoch == 0 {
            slots_per_epoch.unwrap_or(DEFAULT_SLOTS_PER_EPOCH)
        } else {
            slots_in_epoch
        };
        let progress = if slots_in_epoch > 0 {
            slot_index as f64 / slots_in_epoch as f64 * 100.0
        } else {
            0.0
        };
        let slot_secs = DEFAULT_MS_PER_SLOT as f64 / 1_000.0;
        let slots_left = slots_in_epoch.saturating_sub(slot_index);

        EpochProgress {
            current_epoch,
            absolute_slot,
            slot_index,
            slots_in_epoch,
            epoch_progress: progress.clamp(0.0, 100.0),
            time_left_in_epoch: slots_left as f64 * slot_secs,
            slots_per_epoch,
        }
    }
}

/// Everything served by `GET /api/nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(flatten)]
    pub stats: NetworkStats,
    #[serde(rename = "koiiPrice")]
    pub price: Option<f64>,
    pub epoch_info: Option<EpochProgress>,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        stats: NetworkStats,
        price: Option<f64>,
        epoch_info: Option<EpochProgress>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Snapshot {
            stats,
            price,
            epoch_info,
            captured_at,
        }
    }
}
