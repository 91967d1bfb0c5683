//! Read API over the latest validator telemetry snapshot.
//!
//! - `GET /api/nodes`: the latest snapshot with an up-to-date token price
//! - `GET /api/health`: service health and snapshot cache status
//!
//! Requests are buffered and rate limited per route.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    error_handling::HandleErrorLayer,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    BoxError, Json, Router,
};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use telemetry_aggregator::{
    health_manager::HealthManager,
    refresh_service::{RefreshStatus, RefreshStatusHandle},
    snapshot_service::SnapshotService,
};
use tower::ServiceBuilder;

/// Shared state behind every handler.
pub struct TelemetryState {
    snapshots: Arc<SnapshotService>,
    health: Arc<HealthManager>,
    refresh: Option<RefreshStatusHandle>,
}

impl TelemetryState {
    /// # Arguments
    /// * `snapshots` - Source of snapshots for `/api/nodes`
    /// * `health` - Health evaluation for `/api/health`
    /// * `refresh` - Status of the background loop, if one is running
    pub fn new(
        snapshots: Arc<SnapshotService>,
        health: Arc<HealthManager>,
        refresh: Option<RefreshStatusHandle>,
    ) -> Self {
        TelemetryState {
            snapshots,
            health,
            refresh,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
}

#[derive(Serialize)]
struct CacheStatus {
    last_update: Option<DateTime<Utc>>,
    /// seconds
    ttl: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    cache_status: CacheStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh: Option<RefreshStatus>,
}

async fn get_nodes(State(state): State<Arc<TelemetryState>>) -> Response {
    match state.snapshots.current().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to fetch data",
            }),
        )
            .into_response(),
    }
}

async fn get_health(State(state): State<Arc<TelemetryState>>) -> Json<HealthResponse> {
    let cache = state.snapshots.cache();
    Json(HealthResponse {
        status: state.health.state().as_str(),
        timestamp: Utc::now(),
        cache_status: CacheStatus {
            last_update: cache.last_update(),
            ttl: cache.ttl().as_secs(),
        },
        refresh: state.refresh.as_ref().map(RefreshStatusHandle::status),
    })
}

async fn handle_middleware_error(err: BoxError) -> (StatusCode, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("request could not be served: {err}"),
    )
}

/// Builds the API router. Must be called from within a tokio runtime.
pub fn build_router(
    state: Arc<TelemetryState>,
    max_buffered_requests: usize,
    requests_per_second: u64,
) -> Router {
    Router::new()
        .route("/api/nodes", get(get_nodes))
        .route("/api/health", get(get_health))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .buffer(max_buffered_requests)
                .rate_limit(requests_per_second, Duration::from_secs(1))
                .into_inner(),
        )
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` resolves.
pub async fn start_telemetry_web_server(
    state: Arc<TelemetryState>,
    addr: SocketAddr,
    max_buffered_requests: usize,
    requests_per_second: u64,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let app = build_router(state, max_buffered_requests, requests_per_second);
    let server = axum::Server::try_bind(&addr)?;
    info!("serving telemetry api at {addr}");
    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use httpmock::prelude::*;
    use serde_json::Value;
    use telemetry_aggregator::{
        cluster_cache::ClusterTopologyCache,
        geolocation::GeolocationResolver,
        pipeline::Pipeline,
        price_fetcher::{PriceFetcher, PriceFetcherConfig},
        snapshot_cache::SnapshotCache,
    };
    use telemetry_core::{
        apr::AprStrategy,
        snapshot::{NetworkStats, Snapshot},
    };
    use telemetry_rpc::rpc_client::RpcClient;
    use tower::ServiceExt;

    use super::*;

    /// State whose upstream RPC node is down, so nothing can be recomputed.
    fn state(rpc: &MockServer) -> (Arc<TelemetryState>, Arc<SnapshotCache>) {
        rpc.mock(|when, then| {
            when.method(POST);
            then.status(503);
        });
        let client = Arc::new(RpcClient::new(rpc.url("/")).unwrap());
        let pipeline = Pipeline::new(
            client.clone(),
            Arc::new(ClusterTopologyCache::new(client, ClusterTopologyCache::DEFAULT_TTL)),
            Arc::new(GeolocationResolver::new(rpc.base_url()).unwrap()),
            Arc::new(PriceFetcher::new(PriceFetcherConfig::default()).unwrap()),
            AprStrategy::Auto,
        );
        let cache = Arc::new(SnapshotCache::default());
        let snapshots = Arc::new(SnapshotService::new(Arc::new(pipeline), cache.clone(), None));
        let health = Arc::new(HealthManager::new(
            cache.clone(),
            HealthManager::DEFAULT_UNHEALTHY_THRESHOLD,
        ));
        (Arc::new(TelemetryState::new(snapshots, health, None)), cache)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_nodes_without_any_snapshot() {
        let rpc = MockServer::start();
        let (state, _cache) = state(&rpc);

        let (status, body) = get_json(build_router(state, 10, 5), "/api/nodes").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch data");
    }

    #[tokio::test]
    async fn test_nodes_serves_cached_snapshot() {
        let rpc = MockServer::start();
        let (state, cache) = state(&rpc);
        let stats = NetworkStats {
            total_active_stake: 42,
            total_validators: 3,
            ..NetworkStats::default()
        };
        cache.set(Snapshot::new(stats, Some(0.012), None, Utc::now()));

        let (status, body) = get_json(build_router(state, 10, 5), "/api/nodes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalActiveStake"], 42);
        assert_eq!(body["totalValidators"], 3);
        assert_eq!(body["koiiPrice"], 0.012);
        assert!(body["validators"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let rpc = MockServer::start();
        let (state, cache) = state(&rpc);
        let router = build_router(state, 10, 5);

        let (status, body) = get_json(router.clone(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["cache_status"]["last_update"], Value::Null);
        assert_eq!(body["cache_status"]["ttl"], 30);
        assert!(body.get("refresh").is_none());

        cache.set(Snapshot::new(NetworkStats::default(), None, None, Utc::now()));
        let (_, body) = get_json(router, "/api/health").await;
        assert_eq!(body["status"], "healthy");
        assert!(body["cache_status"]["last_update"].is_string());
    }
}
