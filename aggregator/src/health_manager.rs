//! Service health derived from how recently a snapshot was produced.
//!
//! ## Health States
//! - **Healthy**: a snapshot was cached within the unhealthy threshold
//! - **Degraded**: the last snapshot is older than the threshold, or there never was one
//!
//! Degraded does not stop request serving; the read API keeps answering with the
//! last good snapshot and reports the state on `/api/health`.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use solana_metrics::datapoint_info;

use crate::snapshot_cache::SnapshotCache;

/// The numeric values are what gets reported to metrics.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HealthState {
    Degraded = 0,
    Healthy = 1,
}

impl HealthState {
    /// Health as of `now` given the time of the last successful refresh.
    pub fn evaluate(
        last_update: Option<DateTime<Utc>>,
        unhealthy_threshold: Duration,
        now: DateTime<Utc>,
    ) -> HealthState {
        let Some(last_update) = last_update else {
            return HealthState::Degraded;
        };
        // a last update in the future (clock step) counts as fresh
        let fresh = (now - last_update)
            .to_std()
            .map_or(true, |age| age <= unhealthy_threshold);
        if fresh {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Degraded => "degraded",
            HealthState::Healthy => "healthy",
        }
    }
}

pub struct HealthManager {
    cache: Arc<SnapshotCache>,
    unhealthy_threshold: Duration,
}

impl HealthManager {
    pub const DEFAULT_UNHEALTHY_THRESHOLD: Duration = Duration::from_secs(120);

    pub fn new(cache: Arc<SnapshotCache>, unhealthy_threshold: Duration) -> Self {
        HealthManager {
            cache,
            unhealthy_threshold,
        }
    }

    pub fn state(&self) -> HealthState {
        HealthState::evaluate(self.cache.last_update(), self.unhealthy_threshold, Utc::now())
    }

    /// Evaluates health and reports it to metrics.
    pub fn report(&self) -> HealthState {
        let state = self.state();
        datapoint_info!("telemetry-health-state", ("health_state", state, i64));
        state
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use telemetry_core::snapshot::{NetworkStats, Snapshot};

    use super::*;

    #[test]
    fn test_evaluate() {
        let now = Utc::now();
        let threshold = Duration::from_secs(120);

        assert_eq!(HealthState::evaluate(None, threshold, now), HealthState::Degraded);
        assert_eq!(
            HealthState::evaluate(Some(now - ChronoDuration::seconds(119)), threshold, now),
            HealthState::Healthy
        );
        assert_eq!(
            HealthState::evaluate(Some(now - ChronoDuration::seconds(121)), threshold, now),
            HealthState::Degraded
        );
        assert_eq!(
            HealthState::evaluate(Some(now + ChronoDuration::seconds(5)), threshold, now),
            HealthState::Healthy
        );
    }

    #[test]
    fn test_state_follows_cache() {
        let cache = Arc::new(SnapshotCache::default());
        let health = HealthManager::new(cache.clone(), HealthManager::DEFAULT_UNHEALTHY_THRESHOLD);
        assert_eq!(health.report(), HealthState::Degraded);

        cache.set(Snapshot::new(NetworkStats::default(), None, None, Utc::now()));
        assert_eq!(health.state(), HealthState::Healthy);
        assert_eq!(health.state().as_str(), "healthy");
    }
}
