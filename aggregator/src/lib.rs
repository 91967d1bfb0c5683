//! Everything between the chain node and the read API.
//!
//! A refresh cycle flows through these pieces:
//! - **pipeline**: fetches vote accounts, block production, epoch and inflation data
//!   over JSON-RPC, enriches validators with topology and geolocation, then runs the
//!   metrics engine from `telemetry_core`
//! - **cluster_cache** / **geolocation** / **price_fetcher**: upstream lookups with their
//!   own caching and failure policies
//! - **snapshot_cache** / **snapshot_store**: the in-process and durable homes of the
//!   latest snapshot
//! - **snapshot_service**: cache, then store, then recompute, shared by the API and the loop
//! - **refresh_service**: the background loop with Running and Backoff states
//! - **health_manager**: healthy or degraded, from the age of the last snapshot
//!
//! All caches are explicit objects shared through `Arc`; whole values are swapped under
//! a lock so readers never observe a partially updated map.

pub mod cluster_cache;
pub mod error;
pub mod geolocation;
pub mod health_manager;
pub mod pipeline;
pub mod price_fetcher;
pub mod refresh_service;
pub mod snapshot_cache;
pub mod snapshot_service;
pub mod snapshot_store;
pub mod ttl_cache;
