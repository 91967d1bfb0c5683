use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use solana_metrics::datapoint_error;
use telemetry_aggregator::{
    cluster_cache::ClusterTopologyCache,
    error::FetchError,
    geolocation::GeolocationResolver,
    health_manager::HealthManager,
    pipeline::Pipeline,
    price_fetcher::{PriceFetcher, PriceFetcherConfig},
    refresh_service::{RefreshConfig, RefreshService},
    snapshot_cache::SnapshotCache,
    snapshot_service::SnapshotService,
    snapshot_store::{SnapshotStore, SqliteSnapshotStore},
};
use telemetry_core::apr::AprStrategy;
use telemetry_rpc::rpc_client::{RpcClient, RpcError};
use telemetry_web::{start_telemetry_web_server, TelemetryState};
use thiserror::Error;
use tikv_jemallocator::Jemalloc;
use tokio::{runtime::Builder, signal};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Command-line arguments for the validator telemetry service.
/// Every flag can also be set through the environment variable shown in `--help`.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON-RPC endpoint of the chain node to poll
    #[arg(long, env = "KOII_RPC_URL", default_value = "http://127.0.0.1:8899")]
    rpc_url: String,

    /// Per-request timeout for JSON-RPC calls (seconds)
    #[arg(long, env, default_value_t = 10)]
    rpc_timeout_secs: u64,

    /// Market-data endpoint returning `{ data: { price } }`.
    /// Without it (or without an API key) the price is reported as null.
    #[arg(long, env = "CRYPTORANK_API_URL")]
    price_api_url: Option<String>,

    /// API key sent as `X-Api-Key` to the price endpoint
    #[arg(long, env = "CRYPTORANK_API_KEY")]
    price_api_key: Option<String>,

    /// How long a fetched price is reused before asking again (seconds)
    #[arg(long, env = "PRICE_CACHE_TTL", default_value_t = 600)]
    price_cache_ttl_secs: u64,

    /// Base URL of the ip-api compatible geolocation service
    #[arg(long, env, default_value = GeolocationResolver::DEFAULT_BASE_URL)]
    geolocation_url: String,

    /// Snapshot store location. If it cannot be opened the service runs cache-only.
    #[arg(long, env, default_value = "sqlite://validator-telemetry.db?mode=rwc")]
    database_url: String,

    /// Address the read API listens on
    #[arg(long, env, default_value = "0.0.0.0:5000")]
    webserver_bind_addr: SocketAddr,

    /// Delay between successful refresh cycles (seconds)
    #[arg(long, env, default_value_t = 30)]
    refresh_interval_secs: u64,

    /// Delay before retrying a failed refresh cycle (seconds)
    #[arg(long, env, default_value_t = 5)]
    backoff_secs: u64,

    /// How long a snapshot is served from memory before falling back to the store (seconds)
    #[arg(long, env, default_value_t = 30)]
    snapshot_cache_ttl_secs: u64,

    /// How long the gossip IP and version map is reused (seconds)
    #[arg(long, env, default_value_t = 300)]
    cluster_cache_ttl_secs: u64,

    /// Network APR formula: auto, reward-ratio or credits-delta.
    /// `auto` uses reward-ratio when supply and inflation rate are available.
    #[arg(long, env, default_value_t = AprStrategy::Auto)]
    apr_strategy: AprStrategy,

    /// Health turns degraded when no snapshot was produced for this long (seconds)
    #[arg(long, env, default_value_t = 120)]
    unhealthy_threshold_secs: u64,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("couldn't build RPC client: {0}")]
    Rpc(#[from] RpcError),

    #[error("couldn't build HTTP client: {0}")]
    Http(#[from] FetchError),

    #[error("web server failed: {0}")]
    WebServer(String),
}

fn main() {
    // Rate limiting configuration for the read API
    const MAX_BUFFERED_REQUESTS: usize = 10;
    const REQUESTS_PER_SECOND: u64 = 5;

    env_logger::Builder::from_env(Env::new().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Args = Args::parse();
    info!(
        "args: {:?}",
        Args {
            price_api_key: args.price_api_key.as_ref().map(|_| "<redacted>".to_string()),
            ..args.clone()
        }
    );

    let exit = Arc::new(AtomicBool::new(false));

    let rt = match Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("couldn't start tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = rt.block_on(run(
        args,
        exit.clone(),
        MAX_BUFFERED_REQUESTS,
        REQUESTS_PER_SECOND,
    ));
    exit.store(true, Ordering::Relaxed);

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(
    args: Args,
    exit: Arc<AtomicBool>,
    max_buffered_requests: usize,
    requests_per_second: u64,
) -> Result<(), StartupError> {
    let rpc = Arc::new(RpcClient::new_with_timeout(
        args.rpc_url.clone(),
        Duration::from_secs(args.rpc_timeout_secs),
    )?);
    let topology = Arc::new(ClusterTopologyCache::new(
        rpc.clone(),
        Duration::from_secs(args.cluster_cache_ttl_secs),
    ));
    let geolocation = Arc::new(GeolocationResolver::new(args.geolocation_url.clone())?);

    if args.price_api_url.is_none() || args.price_api_key.is_none() {
        warn!("price API url or key not set, koiiPrice will be null");
    }
    let price = Arc::new(PriceFetcher::new(PriceFetcherConfig {
        url: args.price_api_url.clone(),
        api_key: args.price_api_key.clone(),
        ttl: Duration::from_secs(args.price_cache_ttl_secs),
    })?);

    let pipeline = Arc::new(Pipeline::new(
        rpc,
        topology,
        geolocation,
        price,
        args.apr_strategy,
    ));

    let store: Option<Arc<dyn SnapshotStore>> =
        match SqliteSnapshotStore::connect(&args.database_url).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                error!(
                    "couldn't open snapshot store at {}, running cache-only: {e}",
                    args.database_url
                );
                datapoint_error!(
                    "snapshot_store-open_error",
                    ("error", e.to_string(), String),
                );
                None
            }
        };

    let cache = Arc::new(SnapshotCache::new(Duration::from_secs(
        args.snapshot_cache_ttl_secs,
    )));
    let snapshots = Arc::new(SnapshotService::new(pipeline, cache.clone(), store));
    let health = Arc::new(HealthManager::new(
        cache,
        Duration::from_secs(args.unhealthy_threshold_secs),
    ));

    let refresh = RefreshService::new(
        snapshots.clone(),
        health.clone(),
        RefreshConfig {
            interval: Duration::from_secs(args.refresh_interval_secs),
            backoff: Duration::from_secs(args.backoff_secs),
        },
        exit.clone(),
    );

    let state = Arc::new(TelemetryState::new(
        snapshots,
        health,
        Some(refresh.handle()),
    ));
    let served = start_telemetry_web_server(
        state,
        args.webserver_bind_addr,
        max_buffered_requests,
        requests_per_second,
        shutdown_signal(exit.clone()),
    )
    .await;

    exit.store(true, Ordering::Relaxed);
    if let Err(e) = refresh.join().await {
        error!("refresh loop did not shut down cleanly: {e}");
    }

    served.map_err(|e| StartupError::WebServer(e.to_string()))
}

pub async fn shutdown_signal(exit: Arc<AtomicBool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
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
    exit.store(true, Ordering::Relaxed);
    warn!("signal received, starting graceful shutdown");
}
