use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use log::{debug, error, warn};
use solana_metrics::{datapoint_error, datapoint_info};
use telemetry_rpc::{
    rpc_client::{self, RpcClient},
    rpc_types::RpcClusterNode,
};
use tokio::sync::Mutex;

/// What the cluster reports about one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterNode {
    pub ip: Option<IpAddr>,
    pub version: Option<String>,
}

/// Identity pubkey to gossip IP and software version, as of one `getClusterNodes` call.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    nodes: HashMap<String, ClusterNode>,
}

impl ClusterTopology {
    /// Builds the topology from a `getClusterNodes` result.
    ///
    /// Nodes whose gossip address is missing, unparseable or `0.0.0.0` keep their
    /// version but have no IP. Nodes with neither are dropped.
    pub fn from_nodes(nodes: Vec<RpcClusterNode>) -> Self {
        let nodes = nodes
            .into_iter()
            .filter_map(|node| {
                let entry = ClusterNode {
                    ip: node.gossip_ip(),
                    version: node.version.filter(|v| !v.is_empty()),
                };
                (entry.ip.is_some() || entry.version.is_some()).then_some((node.pubkey, entry))
            })
            .collect();
        ClusterTopology { nodes }
    }

    pub fn ip(&self, identity: &str) -> Option<IpAddr> {
        self.nodes.get(identity).and_then(|node| node.ip)
    }

    pub fn version(&self, identity: &str) -> Option<&str> {
        self.nodes
            .get(identity)
            .and_then(|node| node.version.as_deref())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn nodes_with_ip(&self) -> usize {
        self.nodes.values().filter(|node| node.ip.is_some()).count()
    }
}

struct Loaded {
    topology: Arc<ClusterTopology>,
    refreshed_at: Option<Instant>,
}

/// Lazily refreshed view of the cluster's gossip table.
///
/// Callers take one [`ClusterTopology`] snapshot per pipeline run, so every validator
/// in a run is resolved against the same map. The map is rebuilt from scratch once it
/// is older than the TTL (or was never loaded) and replaced as a whole; a failed
/// rebuild keeps serving the previous map.
pub struct ClusterTopologyCache {
    rpc: Arc<RpcClient>,
    ttl: Duration,
    loaded: RwLock<Loaded>,

    /// Serializes refreshes so concurrent callers trigger one `getClusterNodes`.
    refresh_lock: Mutex<()>,
}

impl ClusterTopologyCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(rpc: Arc<RpcClient>, ttl: Duration) -> Self {
        ClusterTopologyCache {
            rpc,
            ttl,
            loaded: RwLock::new(Loaded {
                topology: Arc::new(ClusterTopology::default()),
                refreshed_at: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns the current topology, refreshing it first when stale.
    pub async fn snapshot(&self) -> Arc<ClusterTopology> {
        if let Some(topology) = self.fresh(Instant::now()) {
            return topology;
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if let Some(topology) = self.fresh(Instant::now()) {
            return topology;
        }

        match self.update_topology().await {
            Ok(topology) => topology,
            Err(e) => {
                error!("couldn't refresh cluster topology, keeping previous map: {e}");
                datapoint_error!(
                    "cluster_topology-refresh_error",
                    ("error", e.to_string(), String),
                    ("kind", e.kind().as_str(), String),
                );
                self.loaded.read().unwrap().topology.clone()
            }
        }
    }

    /// Gossip IP of `identity` according to the current topology.
    pub async fn resolve(&self, identity: &str) -> Option<IpAddr> {
        self.snapshot().await.ip(identity)
    }

    fn fresh(&self, now: Instant) -> Option<Arc<ClusterTopology>> {
        let loaded = self.loaded.read().unwrap();
        loaded
            .refreshed_at
            .filter(|at| now.saturating_duration_since(*at) < self.ttl)
            .map(|_| loaded.topology.clone())
    }

    /// Fetches cluster nodes and replaces the cached topology.
    ///
    /// # Returns
    /// The new topology, or the RPC error that prevented the rebuild
    async fn update_topology(&self) -> rpc_client::Result<Arc<ClusterTopology>> {
        let started = Instant::now();
        let nodes = self.rpc.get_cluster_nodes().await?;
        let reported = nodes.len();

        let topology = Arc::new(ClusterTopology::from_nodes(nodes));
        debug!(
            "read {} cluster nodes, {} usable",
            reported,
            topology.len()
        );
        if topology.is_empty() {
            warn!("cluster reported no usable nodes, versions and locations will be unknown");
        }

        datapoint_info!(
            "cluster_topology-refresh",
            ("nodes_reported", reported, i64),
            ("nodes_kept", topology.len(), i64),
            ("nodes_with_ip", topology.nodes_with_ip(), i64),
            ("elapsed_us", started.elapsed().as_micros(), i64),
        );

        *self.loaded.write().unwrap() = Loaded {
            topology: topology.clone(),
            refreshed_at: Some(Instant::now()),
        };
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn node(pubkey: &str, gossip: Option<&str>, version: Option<&str>) -> RpcClusterNode {
        RpcClusterNode {
            pubkey: pubkey.to_string(),
            gossip: gossip.map(str::to_string),
            version: version.map(str::to_string),
        }
    }

    #[test]
    fn test_topology_from_nodes() {
        let topology = ClusterTopology::from_nodes(vec![
            node("a", Some("10.0.0.1:8001"), Some("1.16.0")),
            node("b", Some("0.0.0.0:8001"), Some("1.17.0")),
            node("c", Some("bogus"), None),
            node("d", None, Some("")),
        ]);

        assert_eq!(topology.len(), 2);
        assert!(!topology.is_empty());
        assert!(ClusterTopology::from_nodes(vec![node("d", None, None)]).is_empty());
        assert_eq!(topology.ip("a"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(topology.version("a"), Some("1.16.0"));
        assert_eq!(topology.ip("b"), None);
        assert_eq!(topology.version("b"), Some("1.17.0"));
        assert_eq!(topology.ip("c"), None);
        assert_eq!(topology.ip("missing"), None);
    }

    #[tokio::test]
    async fn test_snapshot_fetches_once_within_ttl() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).body_contains("getClusterNodes");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": [{ "pubkey": "a", "gossip": "10.0.0.1:8001", "version": "1.16.0" }]
                }));
        });

        let rpc = Arc::new(RpcClient::new(server.url("/")).unwrap());
        let cache = ClusterTopologyCache::new(rpc, ClusterTopologyCache::DEFAULT_TTL);

        assert_eq!(cache.resolve("a").await, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(cache.resolve("unknown").await, None);
        assert_eq!(cache.snapshot().await.len(), 1);
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_map() {
        let server = MockServer::start();
        let mut ok = server.mock(|when, then| {
            when.method(POST).body_contains("getClusterNodes");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": [{ "pubkey": "a", "gossip": "10.0.0.1:8001" }]
                }));
        });

        let rpc = Arc::new(RpcClient::new(server.url("/")).unwrap());
        // zero TTL forces a refresh attempt on every call
        let cache = ClusterTopologyCache::new(rpc, Duration::ZERO);
        assert_eq!(cache.snapshot().await.len(), 1);

        ok.delete();
        let failing = server.mock(|when, then| {
            when.method(POST).body_contains("getClusterNodes");
            then.status(503).body("unavailable");
        });

        assert_eq!(cache.resolve("a").await, Some("10.0.0.1".parse().unwrap()));
        failing.assert_hits(1);
    }
}
