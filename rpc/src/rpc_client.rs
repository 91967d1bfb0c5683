use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::{debug, error};
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use telemetry_core::{validator::BlockProductionTable, ErrorKind};
use thiserror::Error;

use crate::rpc_types::{
    RpcClusterNode, RpcEpochInfo, RpcEpochSchedule, RpcInflationRate, RpcInflationReward,
    RpcResponse, RpcSupply, RpcVoteAccounts,
};

/// Failures of a single JSON-RPC request.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("unexpected content type `{content_type}`: {body}")]
    UnexpectedContentType { content_type: String, body: String },

    #[error("response is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
        body: String,
    },

    #[error("remote error {code:?}: {message}")]
    Remote { code: Option<i64>, message: String },

    #[error("malformed `{method}` response: {reason}")]
    MalformedResponse { method: String, reason: String },
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Timeout | RpcError::Transport(_) | RpcError::HttpStatus { .. } => {
                ErrorKind::UpstreamUnavailable
            }
            RpcError::UnexpectedContentType { .. }
            | RpcError::InvalidJson { .. }
            | RpcError::MalformedResponse { .. } => ErrorKind::UpstreamMalformed,
            RpcError::Remote { .. } => ErrorKind::UpstreamRemoteError,
        }
    }

    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RpcError::Timeout
        } else {
            RpcError::Transport(e)
        }
    }

    fn malformed(method: &str, reason: impl ToString) -> Self {
        RpcError::MalformedResponse {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// JSON-RPC 2.0 client for the chain node.
///
/// Every response is checked for an HTTP 200 status, a JSON content type, a parseable
/// body, the absence of an `error` object and the presence of `result`. Failures are
/// returned as [`RpcError`]; nothing is retried here, the refresh loop owns retry policy.
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Per-request timeout applied when none is given.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Block production window requested from the node.
    pub const BLOCK_PRODUCTION_LIMIT: u64 = 150;

    /// `getInflationReward` accepts a bounded address list; larger sets are split.
    pub const MAX_INFLATION_REWARD_ADDRESSES: usize = 100;

    /// How much of an unexpected body is kept for error messages.
    const BODY_PREVIEW_LEN: usize = 200;

    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::new_with_timeout(url, Self::DEFAULT_TIMEOUT)
    }

    pub fn new_with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RpcError::Transport)?;
        Ok(RpcClient {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Sends one JSON-RPC request and returns its `result`.
    ///
    /// # Arguments
    /// * `method` - JSON-RPC method name, e.g. `getVoteAccounts`
    /// * `params` - Positional parameters array
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!("rpc request {method} (id {id}) to {}", self.url);

        let response = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(RpcError::from_transport)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(RpcError::from_transport)?;

        if status != StatusCode::OK {
            error!("rpc {method} returned status {status}");
            return Err(RpcError::HttpStatus {
                status: status.as_u16(),
                body: preview(&body),
            });
        }

        if !content_type.to_ascii_lowercase().contains("json") {
            error!("rpc {method} returned content type `{content_type}`");
            return Err(RpcError::UnexpectedContentType {
                content_type,
                body: preview(&body),
            });
        }

        let mut payload: Value =
            serde_json::from_slice(&body).map_err(|source| RpcError::InvalidJson {
                source,
                body: preview(&body),
            })?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            error!("rpc {method} failed remotely: {message}");
            return Err(RpcError::Remote { code, message });
        }

        payload
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| RpcError::malformed(method, "missing `result`"))
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| RpcError::malformed(method, e))
    }

    pub async fn get_vote_accounts(&self) -> Result<RpcVoteAccounts> {
        self.call_typed("getVoteAccounts", json!([{ "commitment": "confirmed" }]))
            .await
    }

    /// Leader slots and produced blocks per identity over the recent window.
    pub async fn get_block_production(&self) -> Result<BlockProductionTable> {
        const METHOD: &str = "getBlockProduction";
        let result = self
            .call(
                METHOD,
                json!([{ "startSlot": 0, "limit": Self::BLOCK_PRODUCTION_LIMIT }]),
            )
            .await?;
        let by_identity = result
            .pointer("/value/byIdentity")
            .ok_or_else(|| RpcError::malformed(METHOD, "missing `value.byIdentity`"))?;
        Ok(BlockProductionTable::from_by_identity(by_identity))
    }

    pub async fn get_cluster_nodes(&self) -> Result<Vec<RpcClusterNode>> {
        self.call_typed("getClusterNodes", json!([])).await
    }

    pub async fn get_epoch_info(&self) -> Result<RpcEpochInfo> {
        self.call_typed("getEpochInfo", json!([])).await
    }

    pub async fn get_epoch_schedule(&self) -> Result<RpcEpochSchedule> {
        self.call_typed("getEpochSchedule", json!([])).await
    }

    pub async fn get_inflation_rate(&self) -> Result<RpcInflationRate> {
        self.call_typed("getInflationRate", json!([])).await
    }

    /// Total supply in lamports at finalized commitment.
    pub async fn get_supply(&self) -> Result<u64> {
        let response: RpcResponse<RpcSupply> = self
            .call_typed("getSupply", json!([{ "commitment": "finalized" }]))
            .await?;
        Ok(response.value.total)
    }

    /// Inflation rewards credited to each address for `epoch`.
    ///
    /// The returned vector is aligned with `addresses`; addresses that earned nothing
    /// are `None`. Requests are split into batches of
    /// [`Self::MAX_INFLATION_REWARD_ADDRESSES`] and sent one after another.
    pub async fn get_inflation_reward(
        &self,
        addresses: &[String],
        epoch: u64,
        min_context_slot: Option<u64>,
    ) -> Result<Vec<Option<RpcInflationReward>>> {
        let mut config = json!({ "epoch": epoch, "commitment": "finalized" });
        if let Some(slot) = min_context_slot {
            config["minContextSlot"] = json!(slot);
        }

        let mut rewards = Vec::with_capacity(addresses.len());
        for batch in addresses.chunks(Self::MAX_INFLATION_REWARD_ADDRESSES) {
            let batch_rewards: Vec<Option<RpcInflationReward>> = self
                .call_typed("getInflationReward", json!([batch, config]))
                .await?;
            if batch_rewards.len() != batch.len() {
                return Err(RpcError::malformed(
                    "getInflationReward",
                    format!(
                        "expected {} entries, got {}",
                        batch.len(),
                        batch_rewards.len()
                    ),
                ));
            }
            rewards.extend(batch_rewards);
        }
        Ok(rewards)
    }

    /// Submits a base64-encoded, already signed transaction and returns its signature.
    pub async fn send_transaction(&self, encoded_transaction: &str) -> Result<String> {
        self.call_typed(
            "sendTransaction",
            json!([encoded_transaction, { "encoding": "base64" }]),
        )
        .await
    }
}

fn preview(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(RpcClient::BODY_PREVIEW_LEN)
        .collect()
}
