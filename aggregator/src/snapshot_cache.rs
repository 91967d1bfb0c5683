use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use telemetry_core::snapshot::Snapshot;

use crate::ttl_cache::TtlCell;

/// The most recent snapshot, served without recomputation while it is fresh.
pub struct SnapshotCache {
    cell: TtlCell<Snapshot>,
}

impl SnapshotCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    pub fn new(ttl: Duration) -> Self {
        SnapshotCache {
            cell: TtlCell::new(ttl),
        }
    }

    /// The cached snapshot if it is younger than the TTL.
    pub fn get(&self) -> Option<Arc<Snapshot>> {
        self.cell.get()
    }

    /// Caches `snapshot` unless a snapshot captured later is already cached.
    ///
    /// Returns whichever snapshot is cached afterwards. This matches the store, which
    /// also keeps the latest `captured_at` when refreshes finish out of order.
    pub fn set(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let captured_at = snapshot.captured_at;
        self.cell
            .set_if(snapshot, |current| current.captured_at <= captured_at)
    }

    /// When the cache was last written, fresh or not.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.cell.stored_at_utc()
    }

    pub fn ttl(&self) -> Duration {
        self.cell.ttl()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}
