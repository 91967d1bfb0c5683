use std::sync::Arc;

use log::{error, warn};
use solana_metrics::datapoint_error;
use telemetry_core::snapshot::Snapshot;
use tokio::sync::Mutex;

use crate::{
    error::PipelineError, pipeline::Pipeline, snapshot_cache::SnapshotCache,
    snapshot_store::SnapshotStore,
};

/// Owns the path from "a snapshot is needed" to a snapshot.
///
/// Shared by the background refresh loop and the read API; the two coordinate only
/// through the cache and store held here.
pub struct SnapshotService {
    pipeline: Arc<Pipeline>,
    cache: Arc<SnapshotCache>,
    store: Option<Arc<dyn SnapshotStore>>,

    /// Coalesces on-demand recomputes from concurrent requests.
    recompute_lock: Mutex<()>,
}

impl SnapshotService {
    /// # Arguments
    /// * `pipeline` - Produces fresh snapshots from upstream services
    /// * `cache` - In-process snapshot cache
    /// * `store` - Durable store, or `None` to run cache-only
    pub fn new(
        pipeline: Arc<Pipeline>,
        cache: Arc<SnapshotCache>,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        SnapshotService {
            pipeline,
            cache,
            store,
            recompute_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Builds a new snapshot, persists it and makes it the cached one.
    ///
    /// A store failure is logged and does not fail the refresh.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, PipelineError> {
        let snapshot = self.pipeline.build_snapshot().await?;
        if let Some(store) = &self.store {
            if let Err(e) = store.store_latest(&snapshot).await {
                error!("couldn't persist snapshot ({}): {e}", e.kind());
                datapoint_error!(
                    "snapshot_store-write_error",
                    ("error", e.to_string(), String),
                );
            }
        }
        Ok(self.cache.set(snapshot))
    }

    /// The best snapshot available: fresh cache, then the persisted one, then a new run.
    pub async fn latest(&self) -> Option<Arc<Snapshot>> {
        if let Some(snapshot) = self.cache.get() {
            return Some(snapshot);
        }
        if let Some(snapshot) = self.stored().await {
            return Some(Arc::new(snapshot));
        }

        let _guard = self.recompute_lock.lock().await;
        if let Some(snapshot) = self.cache.get() {
            return Some(snapshot);
        }
        match self.refresh().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!("on-demand snapshot failed ({}): {e}", e.kind());
                None
            }
        }
    }

    /// [`SnapshotService::latest`] with the token price brought up to date.
    ///
    /// The snapshot's own price is kept when the price service has nothing.
    pub async fn current(&self) -> Option<Snapshot> {
        let mut snapshot = (*self.latest().await?).clone();
        if let Some(price) = self.pipeline.price().get_price().await {
            snapshot.price = Some(price);
        }
        Some(snapshot)
    }

    async fn stored(&self) -> Option<Snapshot> {
        let store = self.store.as_ref()?;
        match store.get_latest().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("couldn't read persisted snapshot ({}): {e}", e.kind());
                None
            }
        }
    }
}
