use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{debug, info, warn};
use telemetry_core::{
    apr::AprStrategy,
    metrics::{self, MetricsInputs},
    snapshot::{EpochProgress, NetworkStats, Snapshot},
    validator::{BlockProductionTable, ValidatorRecord},
};
use telemetry_rpc::rpc_client::{self, RpcClient};

use crate::{
    cluster_cache::ClusterTopologyCache, error::PipelineError, geolocation::GeolocationResolver,
    price_fetcher::PriceFetcher, ttl_cache::TtlCell,
};

/// Result of one metrics run, before the price is attached.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub stats: NetworkStats,
    pub epoch: EpochProgress,
}

/// Gathers everything the metrics engine needs from upstream services and runs it.
///
/// Vote accounts, block production and epoch info are required; if any of them fails
/// the run is aborted. Every other input degrades to "absent" with a warning.
pub struct Pipeline {
    rpc: Arc<RpcClient>,
    topology: Arc<ClusterTopologyCache>,
    geolocation: Arc<GeolocationResolver>,
    price: Arc<PriceFetcher>,
    block_production: TtlCell<BlockProductionTable>,
    strategy: AprStrategy,
}

impl Pipeline {
    pub const BLOCK_PRODUCTION_TTL: Duration = Duration::from_secs(30);

    pub fn new(
        rpc: Arc<RpcClient>,
        topology: Arc<ClusterTopologyCache>,
        geolocation: Arc<GeolocationResolver>,
        price: Arc<PriceFetcher>,
        strategy: AprStrategy,
    ) -> Self {
        Pipeline {
            rpc,
            topology,
            geolocation,
            price,
            block_production: TtlCell::new(Self::BLOCK_PRODUCTION_TTL),
            strategy,
        }
    }

    pub fn price(&self) -> &PriceFetcher {
        &self.price
    }

    /// Runs the pipeline and stamps the result with the current price and time.
    pub async fn build_snapshot(&self) -> Result<Snapshot, PipelineError> {
        let output = self.compute_network_stats().await?;
        let price = self.price.get_price().await;
        Ok(Snapshot::new(
            output.stats,
            price,
            Some(output.epoch),
            Utc::now(),
        ))
    }

    /// Fetches all inputs in order and computes network statistics.
    ///
    /// # Process
    /// 1. Vote accounts, block production and epoch info (required)
    /// 2. Epoch schedule, inflation rate, supply and last epoch's rewards (optional)
    /// 3. One cluster topology snapshot, then a location per validator IP
    /// 4. The pure metrics computation
    pub async fn compute_network_stats(&self) -> Result<PipelineOutput, PipelineError> {
        let started = Instant::now();

        let vote_accounts = required("getVoteAccounts", self.rpc.get_vote_accounts()).await?;
        let current = ValidatorRecord::parse_list(&vote_accounts.current, false);
        let delinquent = ValidatorRecord::parse_list(&vote_accounts.delinquent, true);
        let skipped = vote_accounts.current.len() + vote_accounts.delinquent.len()
            - current.len()
            - delinquent.len();
        if skipped > 0 {
            warn!("skipped {skipped} malformed vote account records");
        }

        let block_production = self.block_production().await?;
        let epoch_info = required("getEpochInfo", self.rpc.get_epoch_info()).await?;

        let slots_per_epoch = optional("getEpochSchedule", self.rpc.get_epoch_schedule())
            .await
            .map(|schedule| schedule.slots_per_epoch);
        let inflation_rate = optional("getInflationRate", self.rpc.get_inflation_rate())
            .await
            .map(|rate| rate.total);
        let total_supply = optional("getSupply", self.rpc.get_supply()).await;

        let rewards = match epoch_info.epoch.checked_sub(1) {
            Some(previous_epoch) => {
                self.previous_epoch_rewards(
                    &current,
                    &delinquent,
                    previous_epoch,
                    epoch_info.absolute_slot,
                )
                .await
            }
            None => HashMap::new(),
        };

        let topology = self.topology.snapshot().await;
        let mut locations = HashMap::new();
        let mut versions = HashMap::new();
        for record in current.iter().chain(delinquent.iter()) {
            let identity = &record.identity_pubkey;
            if let Some(version) = topology.version(identity) {
                versions.insert(identity.clone(), version.to_string());
            }
            if locations.contains_key(identity) {
                continue;
            }
            if let Some(ip) = topology.ip(identity) {
                if let Some(location) = self.geolocation.resolve(ip).await {
                    locations.insert(identity.clone(), location);
                }
            }
        }

        let inputs = MetricsInputs {
            current,
            delinquent,
            block_production: (*block_production).clone(),
            total_supply,
            inflation_rate,
            rewards,
            locations,
            versions,
        };
        let stats = metrics::compute(&inputs, self.strategy);
        let epoch = EpochProgress::new(
            epoch_info.epoch,
            epoch_info.absolute_slot,
            epoch_info.slot_index,
            epoch_info.slots_in_epoch,
            slots_per_epoch,
        );

        info!(
            "computed metrics for {} validators ({} delinquent) in epoch {} in {}ms",
            stats.total_validators,
            stats.delinquent_validators,
            epoch.current_epoch,
            started.elapsed().as_millis()
        );
        Ok(PipelineOutput { stats, epoch })
    }

    async fn block_production(&self) -> Result<Arc<BlockProductionTable>, PipelineError> {
        self.block_production_at(Instant::now()).await
    }

    async fn block_production_at(
        &self,
        now: Instant,
    ) -> Result<Arc<BlockProductionTable>, PipelineError> {
        if let Some(table) = self.block_production.get_at(now) {
            return Ok(table);
        }
        let table = required("getBlockProduction", self.rpc.get_block_production()).await?;
        debug!("block production covers {} identities", table.len());
        Ok(self.block_production.set_at(table, now))
    }

    /// Inflation reward amounts of `previous_epoch` keyed by vote pubkey.
    async fn previous_epoch_rewards(
        &self,
        current: &[ValidatorRecord],
        delinquent: &[ValidatorRecord],
        previous_epoch: u64,
        min_context_slot: u64,
    ) -> HashMap<String, u64> {
        let vote_pubkeys: Vec<String> = current
            .iter()
            .chain(delinquent.iter())
            .map(|record| record.vote_pubkey.clone())
            .collect();
        if vote_pubkeys.is_empty() {
            return HashMap::new();
        }

        let rewards = optional(
            "getInflationReward",
            self.rpc
                .get_inflation_reward(&vote_pubkeys, previous_epoch, Some(min_context_slot)),
        )
        .await
        .unwrap_or_default();

        vote_pubkeys
            .into_iter()
            .zip(rewards)
            .filter_map(|(vote_pubkey, reward)| Some((vote_pubkey, reward?.amount)))
            .collect()
    }
}

async fn required<T>(
    method: &'static str,
    call: impl Future<Output = rpc_client::Result<T>>,
) -> Result<T, PipelineError> {
    call.await
        .map_err(|source| PipelineError { method, source })
}

async fn optional<T>(
    method: &'static str,
    call: impl Future<Output = rpc_client::Result<T>>,
) -> Option<T> {
    match call.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{method} unavailable ({}), continuing without it: {e}", e.kind());
            None
        }
    }
}
