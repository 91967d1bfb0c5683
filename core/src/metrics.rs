//! The metrics engine.
//!
//! [`compute`] turns one pipeline run's raw inputs into [`NetworkStats`]. It performs
//! no I/O and reads no clock: locations and cluster-reported versions are resolved by
//! the caller beforehand and passed in as plain maps, so running it twice on the same
//! inputs yields identical output.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::{
    apr::{self, AprMethod, AprStrategy},
    snapshot::{Location, NetworkStats, ValidatorMetrics, VersionStats},
    validator::{BlockProductionTable, EpochCredits, ValidatorRecord},
};

/// Reported when neither the record nor the cluster topology knows a validator's version.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Everything the engine needs for one computation.
#[derive(Debug, Clone, Default)]
pub struct MetricsInputs {
    pub current: Vec<ValidatorRecord>,
    pub delinquent: Vec<ValidatorRecord>,
    pub block_production: BlockProductionTable,
    /// Total token supply in lamports, when `getSupply` succeeded
    pub total_supply: Option<u64>,
    /// Annual inflation rate as a fraction, when `getInflationRate` succeeded
    pub inflation_rate: Option<f64>,
    /// Last completed epoch's inflation reward in lamports, keyed by vote pubkey
    pub rewards: HashMap<String, u64>,
    /// Resolved locations keyed by identity pubkey
    pub locations: HashMap<String, Location>,
    /// Cluster-reported software versions keyed by identity pubkey
    pub versions: HashMap<String, String>,
}

/// Percent of assigned leader slots that produced no block.
///
/// Identities missing from the table, or with zero assigned slots, have a skip rate
/// of 0. The result is clamped to 0..=100 in case the node reports more blocks than slots.
pub fn skip_rate(identity: &str, block_production: &BlockProductionTable) -> f64 {
    match block_production.get(identity) {
        Some((assigned, produced)) if assigned > 0 => {
            let missed = assigned as f64 - produced as f64;
            (missed / assigned as f64 * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

/// Credits earned between the two most recent epoch-credit entries.
pub fn credits_growth(epoch_credits: &[EpochCredits]) -> i64 {
    match epoch_credits {
        [.., (_, previous, _), (_, latest, _)] => *latest as i64 - *previous as i64,
        _ => 0,
    }
}

/// Computes per-validator metrics and network aggregates.
///
/// # Arguments
/// * `inputs` - Raw records and side tables gathered by the pipeline
/// * `strategy` - Which network APR formula to use
///
/// # Returns
/// Network statistics with current validators first, then delinquent ones, each list
/// in the order the RPC node returned it
pub fn compute(inputs: &MetricsInputs, strategy: AprStrategy) -> NetworkStats {
    let mut validators: Vec<ValidatorMetrics> = inputs
        .current
        .iter()
        .map(|record| validator_metrics(record, false, inputs))
        .chain(
            inputs
                .delinquent
                .iter()
                .map(|record| validator_metrics(record, true, inputs)),
        )
        .collect();

    let mut total_active_stake = 0u64;
    let mut total_delinquent_stake = 0u64;
    let mut total_epoch_credits = 0i64;
    for v in &validators {
        if v.delinquent {
            total_delinquent_stake = total_delinquent_stake.saturating_add(v.activated_stake);
        } else {
            total_active_stake = total_active_stake.saturating_add(v.activated_stake);
            total_epoch_credits = total_epoch_credits.saturating_add(v.credits_growth);
        }
    }

    let (network_apr, apr_method) =
        network_apr(strategy, inputs, total_active_stake, total_epoch_credits);
    debug!(
        "network apr {network_apr}% via {apr_method:?}: active_stake={total_active_stake}, \
         epoch_credits={total_epoch_credits}, supply={:?}, inflation={:?}",
        inputs.total_supply, inputs.inflation_rate
    );

    for v in validators.iter_mut() {
        if let Some(reward) = inputs.rewards.get(&v.vote_account_pubkey) {
            v.apr = Some(apr::validator_apr(network_apr, v.commission));
            v.last_epoch_reward = Some(*reward);
        }
    }

    let total_validators = validators.len();
    let delinquent_validators = validators.iter().filter(|v| v.delinquent).count();
    let average_skip_rate = if total_validators > 0 {
        validators.iter().map(|v| v.skip_rate).sum::<f64>() / total_validators as f64
    } else {
        0.0
    };

    NetworkStats {
        total_active_stake,
        total_current_stake: total_active_stake.saturating_add(total_delinquent_stake),
        total_delinquent_stake,
        average_skip_rate,
        network_apr,
        apr_method,
        inflation_rate: inputs.inflation_rate,
        total_validators,
        active_validators: total_validators - delinquent_validators,
        delinquent_validators,
        stake_by_version: version_rollup(&validators),
        validators,
    }
}

fn validator_metrics(
    record: &ValidatorRecord,
    delinquent: bool,
    inputs: &MetricsInputs,
) -> ValidatorMetrics {
    let version = record
        .version
        .clone()
        .or_else(|| inputs.versions.get(&record.identity_pubkey).cloned())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string());

    ValidatorMetrics {
        identity_pubkey: record.identity_pubkey.clone(),
        vote_account_pubkey: record.vote_pubkey.clone(),
        commission: record.commission,
        last_vote: record.last_vote,
        root_slot: record.root_slot,
        credits: record.credits,
        epoch_credits: record.epoch_credits.clone(),
        activated_stake: record.activated_stake,
        version,
        skip_rate: skip_rate(&record.identity_pubkey, &inputs.block_production),
        credits_growth: credits_growth(&record.epoch_credits),
        location: inputs.locations.get(&record.identity_pubkey).cloned(),
        delinquent,
        apr: None,
        last_epoch_reward: None,
    }
}

fn network_apr(
    strategy: AprStrategy,
    inputs: &MetricsInputs,
    total_active_stake: u64,
    total_epoch_credits: i64,
) -> (f64, AprMethod) {
    let inflation = inputs.total_supply.zip(inputs.inflation_rate);
    match (strategy, inflation) {
        (AprStrategy::Auto | AprStrategy::RewardRatio, Some((supply, rate))) => (
            apr::reward_ratio_apr(supply, rate, total_active_stake),
            AprMethod::RewardRatio,
        ),
        (strategy, _) => {
            if strategy == AprStrategy::RewardRatio {
                warn!("reward-ratio APR requested without supply/inflation data, using credits delta");
            }
            (
                apr::credits_delta_apr(total_epoch_credits, total_active_stake),
                AprMethod::CreditsDelta,
            )
        }
    }
}

/// Accumulates per-version sums, then divides each average by its own denominator:
/// all validators of the version for skip rate and credits growth, validators with an
/// APR for the APR average.
fn version_rollup(validators: &[ValidatorMetrics]) -> BTreeMap<String, VersionStats> {
    let mut rollup: BTreeMap<String, (VersionStats, usize)> = BTreeMap::new();

    for v in validators {
        let (stats, with_apr) = rollup.entry(v.version.clone()).or_default();
        if v.delinquent {
            stats.delinquent_validators += 1;
            stats.delinquent_active_stake = stats.delinquent_active_stake.saturating_add(v.activated_stake);
        } else {
            stats.current_validators += 1;
            stats.current_active_stake = stats.current_active_stake.saturating_add(v.activated_stake);
        }
        stats.average_skip_rate += v.skip_rate;
        stats.average_credits_growth += v.credits_growth as f64;
        if let Some(apr) = v.apr {
            stats.average_apr += apr;
            *with_apr += 1;
        }
    }

    rollup
        .into_iter()
        .map(|(version, (mut stats, with_apr))| {
            let count = stats.current_validators + stats.delinquent_validators;
            if count > 0 {
                stats.average_skip_rate /= count as f64;
                stats.average_credits_growth /= count as f64;
            }
            stats.average_apr = if with_apr > 0 {
                stats.average_apr / with_apr as f64
            } else {
                0.0
            };
            (version, stats)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use solana_sdk::{native_token::LAMPORTS_PER_SOL, pubkey::Pubkey};

    use super::*;

    fn record(stake: u64, commission: u8, version: Option<&str>) -> ValidatorRecord {
        ValidatorRecord {
            identity_pubkey: Pubkey::new_unique().to_string(),
            vote_pubkey: Pubkey::new_unique().to_string(),
            commission,
            last_vote: 100,
            root_slot: 68,
            credits: 180,
            epoch_credits: vec![(10, 100, 50), (11, 180, 100)],
            activated_stake: stake,
            version: version.map(str::to_string),
            delinquent: false,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_skip_rate() {
        let table: BlockProductionTable = [
            ("a".to_string(), (4, 3)),
            ("idle".to_string(), (0, 0)),
            ("over".to_string(), (2, 5)),
        ]
        .into_iter()
        .collect();

        assert_close(skip_rate("a", &table), 25.0);
        assert_eq!(skip_rate("idle", &table), 0.0);
        assert_eq!(skip_rate("missing", &table), 0.0);
        assert_eq!(skip_rate("over", &table), 0.0);
    }

    #[test]
    fn test_credits_growth() {
        assert_eq!(credits_growth(&[(10, 100, 50), (11, 180, 100)]), 80);
        assert_eq!(credits_growth(&[(9, 10, 0), (10, 100, 50), (11, 180, 100)]), 80);
        assert_eq!(credits_growth(&[(11, 180, 100)]), 0);
        assert_eq!(credits_growth(&[]), 0);
        // inconsistent history goes negative rather than failing
        assert_eq!(credits_growth(&[(10, 200, 50), (11, 180, 100)]), -20);
    }

    #[test]
    fn test_compute_totals_and_reward_ratio_apr() {
        let current = vec![
            record(300 * LAMPORTS_PER_SOL, 10, Some("1.16.0")),
            record(200 * LAMPORTS_PER_SOL, 0, Some("1.17.0")),
        ];
        let mut delinquent = vec![record(50 * LAMPORTS_PER_SOL, 5, Some("1.16.0"))];
        delinquent[0].delinquent = true;

        let block_production = [(current[0].identity_pubkey.clone(), (10, 8))]
            .into_iter()
            .collect();
        let rewards = current
            .iter()
            .map(|r| (r.vote_pubkey.clone(), 1_000))
            .collect();

        let inputs = MetricsInputs {
            current,
            delinquent,
            block_production,
            total_supply: Some(1_000_000_000_000),
            inflation_rate: Some(0.05),
            rewards,
            ..MetricsInputs::default()
        };
        let stats = compute(&inputs, AprStrategy::Auto);

        assert_eq!(stats.total_active_stake, 500 * LAMPORTS_PER_SOL);
        assert_eq!(stats.total_delinquent_stake, 50 * LAMPORTS_PER_SOL);
        assert_eq!(stats.total_current_stake, 550 * LAMPORTS_PER_SOL);
        assert_eq!(stats.total_validators, 3);
        assert_eq!(stats.active_validators, 2);
        assert_eq!(stats.delinquent_validators, 1);
        assert_eq!(stats.apr_method, AprMethod::RewardRatio);
        assert_close(stats.network_apr, 10.0);
        assert_eq!(stats.inflation_rate, Some(0.05));

        // current first, then delinquent
        assert!(!stats.validators[0].delinquent);
        assert!(stats.validators[2].delinquent);
        assert_close(stats.validators[0].skip_rate, 20.0);
        assert_close(stats.average_skip_rate, 20.0 / 3.0);

        assert_close(stats.validators[0].apr.unwrap(), 9.0);
        assert_close(stats.validators[1].apr.unwrap(), 10.0);
        assert_eq!(stats.validators[0].last_epoch_reward, Some(1_000));
        // no reward data for the delinquent vote account
        assert_eq!(stats.validators[2].apr, None);

        let v116 = &stats.stake_by_version["1.16.0"];
        assert_eq!(v116.current_validators, 1);
        assert_eq!(v116.delinquent_validators, 1);
        assert_eq!(v116.current_active_stake, 300 * LAMPORTS_PER_SOL);
        assert_eq!(v116.delinquent_active_stake, 50 * LAMPORTS_PER_SOL);
        assert_close(v116.average_skip_rate, 10.0);
        assert_close(v116.average_credits_growth, 80.0);
        // only one of the two 1.16.0 validators has an APR
        assert_close(v116.average_apr, 9.0);
    }

    #[test]
    fn test_version_stake_partitions_totals() {
        let mut delinquent = vec![record(7, 0, None), record(11, 0, Some("1.14.0"))];
        delinquent.iter_mut().for_each(|r| r.delinquent = true);
        let inputs = MetricsInputs {
            current: vec![
                record(1, 0, Some("1.14.0")),
                record(2, 0, Some("1.16.0")),
                record(3, 0, None),
            ],
            delinquent,
            ..MetricsInputs::default()
        };
        let stats = compute(&inputs, AprStrategy::Auto);

        let current: u64 = stats
            .stake_by_version
            .values()
            .map(|s| s.current_active_stake)
            .sum();
        let delinquent: u64 = stats
            .stake_by_version
            .values()
            .map(|s| s.delinquent_active_stake)
            .sum();
        assert_eq!(current, stats.total_active_stake);
        assert_eq!(delinquent, stats.total_delinquent_stake);
        assert!(stats.stake_by_version.contains_key(UNKNOWN_VERSION));
    }

    #[test]
    fn test_credits_delta_fallback_and_zero_stake() {
        let inputs = MetricsInputs {
            current: vec![record(1_000 * LAMPORTS_PER_SOL, 0, None)],
            ..MetricsInputs::default()
        };
        let stats = compute(&inputs, AprStrategy::Auto);
        assert_eq!(stats.apr_method, AprMethod::CreditsDelta);
        assert_close(stats.network_apr, 5840.0);

        // forcing reward ratio without inflation data still falls back
        let stats = compute(&inputs, AprStrategy::RewardRatio);
        assert_eq!(stats.apr_method, AprMethod::CreditsDelta);

        let empty = compute(&MetricsInputs::default(), AprStrategy::Auto);
        assert_eq!(empty.network_apr, 0.0);
        assert_eq!(empty.average_skip_rate, 0.0);
        assert!(empty.stake_by_version.is_empty());

        let zero_stake = MetricsInputs {
            current: vec![record(0, 0, None)],
            total_supply: Some(1_000),
            inflation_rate: Some(0.05),
            ..MetricsInputs::default()
        };
        let stats = compute(&zero_stake, AprStrategy::Auto);
        assert_eq!(stats.network_apr, 0.0);
        assert!(stats.network_apr.is_finite());
    }

    #[test]
    fn test_forced_credits_delta_ignores_inflation() {
        let inputs = MetricsInputs {
            current: vec![record(1_000 * LAMPORTS_PER_SOL, 0, None)],
            total_supply: Some(1_000_000_000_000),
            inflation_rate: Some(0.05),
            ..MetricsInputs::default()
        };
        let stats = compute(&inputs, AprStrategy::CreditsDelta);
        assert_eq!(stats.apr_method, AprMethod::CreditsDelta);
        assert_close(stats.network_apr, 5840.0);
    }

    #[test]
    fn test_location_and_version_enrichment() {
        let plain = record(1, 0, None);
        let location = Location {
            latitude: 52.37,
            longitude: 4.89,
            city: "Amsterdam".to_string(),
            country: "Netherlands".to_string(),
        };
        let inputs = MetricsInputs {
            locations: HashMap::from([(plain.identity_pubkey.clone(), location.clone())]),
            versions: HashMap::from([(plain.identity_pubkey.clone(), "1.18.2".to_string())]),
            current: vec![plain, record(1, 0, Some("1.17.0"))],
            ..MetricsInputs::default()
        };
        let stats = compute(&inputs, AprStrategy::Auto);

        assert_eq!(stats.validators[0].location, Some(location));
        assert_eq!(stats.validators[0].version, "1.18.2");
        assert_eq!(stats.validators[1].location, None);
        assert_eq!(stats.validators[1].version, "1.17.0");
    }

    #[test]
    fn test_compute_is_deterministic() {
        let inputs = MetricsInputs {
            current: (1..20).map(|i| record(i * 1_000, (i % 10) as u8, Some("1.16.0"))).collect(),
            total_supply: Some(10_000_000),
            inflation_rate: Some(0.07),
            ..MetricsInputs::default()
        };
        let first = compute(&inputs, AprStrategy::Auto);
        let second = compute(&inputs, AprStrategy::Auto);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }
}
