//! Typed views of the JSON-RPC results the aggregator consumes.

use std::net::{IpAddr, SocketAddr};

use serde::Deserialize;
use serde_json::Value;

/// `{ context, value }` envelope used by several RPC methods.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse<T> {
    #[serde(default)]
    pub context: Value,
    pub value: T,
}

/// Result of `getVoteAccounts`.
///
/// Records stay as raw JSON so each one can be validated on its own; see
/// `telemetry_core::validator::ValidatorRecord::parse_list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcVoteAccounts {
    #[serde(default)]
    pub current: Vec<Value>,
    #[serde(default)]
    pub delinquent: Vec<Value>,
}

/// One entry of `getClusterNodes`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcClusterNode {
    pub pubkey: String,
    #[serde(default)]
    pub gossip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl RpcClusterNode {
    /// The routable IP of the node's `ip:port` gossip address.
    ///
    /// Returns `None` when gossip is missing, unparseable or the unspecified address.
    pub fn gossip_ip(&self) -> Option<IpAddr> {
        let gossip = self.gossip.as_deref()?.trim();
        let ip = match gossip.parse::<SocketAddr>() {
            Ok(addr) => addr.ip(),
            Err(_) => gossip.split(':').next()?.parse::<IpAddr>().ok()?,
        };
        (!ip.is_unspecified()).then_some(ip)
    }
}

/// Result of `getEpochInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEpochInfo {
    pub epoch: u64,
    pub slot_index: u64,
    pub slots_in_epoch: u64,
    pub absolute_slot: u64,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub transaction_count: Option<u64>,
}

/// Result of `getEpochSchedule`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEpochSchedule {
    pub slots_per_epoch: u64,
    #[serde(default)]
    pub leader_schedule_slot_offset: u64,
    #[serde(default)]
    pub warmup: bool,
    #[serde(default)]
    pub first_normal_epoch: u64,
    #[serde(default)]
    pub first_normal_slot: u64,
}

/// Result of `getInflationRate`. Rates are annual fractions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcInflationRate {
    pub total: f64,
    pub validator: f64,
    pub foundation: f64,
    pub epoch: u64,
}

/// `value` of `getSupply`, in lamports.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcSupply {
    pub total: u64,
    #[serde(default)]
    pub circulating: u64,
    #[serde(default)]
    pub non_circulating: u64,
}

/// One entry of `getInflationReward`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcInflationReward {
    pub epoch: u64,
    pub effective_slot: u64,
    pub amount: u64,
    pub post_balance: u64,
    #[serde(default)]
    pub commission: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(gossip: Option<&str>) -> RpcClusterNode {
        RpcClusterNode {
            pubkey: "node".to_string(),
            gossip: gossip.map(str::to_string),
            version: None,
        }
    }

    #[test]
    fn test_gossip_ip() {
        assert_eq!(
            node(Some("145.40.93.84:8001")).gossip_ip(),
            Some("145.40.93.84".parse().unwrap())
        );
        assert_eq!(
            node(Some("[2001:db8::1]:8001")).gossip_ip(),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(node(Some("0.0.0.0:8001")).gossip_ip(), None);
        assert_eq!(node(Some("garbage")).gossip_ip(), None);
        assert_eq!(node(None).gossip_ip(), None);
    }
}
