//! Background loop that keeps the snapshot cache and store warm.
//!
//! The loop alternates between two states:
//! - **Running**: the last cycle succeeded; wait the refresh interval (30s by default)
//! - **Backoff**: the last cycle failed or panicked; retry after the backoff (5s by default)
//!
//! Each cycle runs on its own task so that a panic inside the pipeline is contained
//! to that cycle. The loop itself only stops when the shared exit flag is set.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use solana_metrics::{datapoint_error, datapoint_info};
use telemetry_core::{snapshot::Snapshot, ErrorKind};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

use crate::{
    error::PipelineError, health_manager::HealthManager, snapshot_service::SnapshotService,
};

/// Granularity at which sleeping loops notice the exit flag.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    pub interval: Duration,
    pub backoff: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            interval: Duration::from_secs(30),
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Running,
    Backoff,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("refresh cycle panicked: {0}")]
    Panicked(String),
}

impl RefreshError {
    /// `None` for panics, which have no upstream cause to classify.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RefreshError::Pipeline(e) => Some(e.kind()),
            RefreshError::Panicked(_) => None,
        }
    }
}

impl From<JoinError> for RefreshError {
    fn from(e: JoinError) -> Self {
        RefreshError::Panicked(e.to_string())
    }
}

/// Outcome history of the refresh loop.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshStatus {
    pub state: RefreshState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u64,
    pub cycles: u64,
}

impl Default for RefreshStatus {
    fn default() -> Self {
        RefreshStatus {
            state: RefreshState::Running,
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
            cycles: 0,
        }
    }
}

impl RefreshStatus {
    fn record(&mut self, outcome: &Result<Arc<Snapshot>, RefreshError>) {
        self.cycles += 1;
        match outcome {
            Ok(snapshot) => {
                self.state = RefreshState::Running;
                self.last_success = Some(snapshot.captured_at);
                self.last_error = None;
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.state = RefreshState::Backoff;
                self.last_error = Some(e.to_string());
                self.consecutive_failures += 1;
            }
        }
    }
}

/// Read access to the status of a running [`RefreshService`].
#[derive(Clone)]
pub struct RefreshStatusHandle {
    status: Arc<RwLock<RefreshStatus>>,
}

impl RefreshStatusHandle {
    pub fn status(&self) -> RefreshStatus {
        self.status.read().unwrap().clone()
    }
}

pub struct RefreshService {
    status: Arc<RwLock<RefreshStatus>>,
    task: JoinHandle<()>,
}

impl RefreshService {
    /// Starts the refresh loop on the current tokio runtime.
    ///
    /// # Arguments
    /// * `service` - Produces, caches and persists snapshots
    /// * `health` - Reported after every cycle
    /// * `config` - Interval and backoff delays
    /// * `exit` - Shared shutdown signal
    pub fn new(
        service: Arc<SnapshotService>,
        health: Arc<HealthManager>,
        config: RefreshConfig,
        exit: Arc<AtomicBool>,
    ) -> Self {
        let status = Arc::new(RwLock::new(RefreshStatus::default()));
        let task = tokio::spawn(Self::run(service, health, config, status.clone(), exit));
        RefreshService { status, task }
    }

    pub fn handle(&self) -> RefreshStatusHandle {
        RefreshStatusHandle {
            status: self.status.clone(),
        }
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }

    /// Runs one refresh on a separate task, turning a panic into an error.
    pub async fn run_cycle(service: &Arc<SnapshotService>) -> Result<Arc<Snapshot>, RefreshError> {
        let service = service.clone();
        let snapshot = tokio::spawn(async move { service.refresh().await }).await??;
        Ok(snapshot)
    }

    async fn run(
        service: Arc<SnapshotService>,
        health: Arc<HealthManager>,
        config: RefreshConfig,
        status: Arc<RwLock<RefreshStatus>>,
        exit: Arc<AtomicBool>,
    ) {
        info!(
            "refresh loop started: interval {:?}, backoff {:?}",
            config.interval, config.backoff
        );

        while !exit.load(Ordering::Relaxed) {
            let started = Instant::now();
            let outcome = Self::run_cycle(&service).await;

            let state = {
                let mut status = status.write().unwrap();
                status.record(&outcome);
                status.state
            };

            match &outcome {
                Ok(snapshot) => {
                    datapoint_info!(
                        "telemetry-refresh",
                        ("validators", snapshot.stats.total_validators, i64),
                        ("delinquent", snapshot.stats.delinquent_validators, i64),
                        ("network_apr", snapshot.stats.network_apr, f64),
                        ("elapsed_ms", started.elapsed().as_millis(), i64),
                    );
                }
                Err(e) => {
                    let consecutive_failures = status.read().unwrap().consecutive_failures;
                    error!(
                        "refresh cycle failed ({} in a row), backing off: {e}",
                        consecutive_failures
                    );
                    datapoint_error!(
                        "telemetry-refresh_error",
                        ("error", e.to_string(), String),
                        ("kind", e.kind().map_or("panic", |kind| kind.as_str()), String),
                        ("consecutive_failures", consecutive_failures, i64),
                    );
                }
            }
            health.report();

            let delay = match state {
                RefreshState::Running => config.interval,
                RefreshState::Backoff => config.backoff,
            };
            sleep_unless_exit(delay, &exit).await;
        }

        info!("refresh loop exiting");
    }
}

async fn sleep_unless_exit(duration: Duration, exit: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !exit.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(remaining.min(EXIT_CHECK_INTERVAL)).await;
    }
}
