//! Core data model and metrics engine for the validator telemetry service.
//!
//! This crate holds everything that does not touch the network:
//!
//! - **validator**: raw vote-account records and the block-production table,
//!   parsed from JSON-RPC payloads with per-record failure isolation
//! - **apr**: the two network APR formulas and the per-validator commission de-rating
//! - **metrics**: the pure engine that turns raw records into [`snapshot::NetworkStats`]
//! - **snapshot**: the serialized shapes served to API clients and persisted to disk
//!
//! The engine is deterministic: identical inputs always produce identical output,
//! so the aggregator can recompute freely and tests can compare results directly.

use std::fmt;

pub mod apr;
pub mod metrics;
pub mod snapshot;
pub mod validator;

/// Failure taxonomy shared by every crate in the workspace.
///
/// Concrete error enums (`RpcError`, `RecordError`, `StoreError`, ...) map onto one
/// of these kinds so that logs and metrics can group failures consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network failure or timeout talking to an upstream service
    UpstreamUnavailable,
    /// Upstream answered, but with the wrong content type, bad JSON or an unexpected shape
    UpstreamMalformed,
    /// The RPC node returned a JSON-RPC `error` object
    UpstreamRemoteError,
    /// A single validator record was excluded from the result set
    ComputeSkip,
    /// Reading or writing the durable snapshot store failed
    PersistenceError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::UpstreamMalformed => "upstream_malformed",
            ErrorKind::UpstreamRemoteError => "upstream_remote_error",
            ErrorKind::ComputeSkip => "compute_skip",
            ErrorKind::PersistenceError => "persistence_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
