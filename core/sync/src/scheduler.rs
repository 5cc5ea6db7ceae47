//! Sync scheduling - manual and periodic modes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use tenantsync_common::{DataType, Error, Result};

use crate::connectivity::ConnectivityMonitor;

/// Default period between automatic cycles.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync only on explicit request.
    Manual,
    /// Sync at regular intervals while online, and immediately on reconnect.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Periodic {
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    /// Every data type.
    Full,
    /// Only the listed data types.
    Types(Vec<DataType>),
    /// Stop the scheduler.
    Shutdown,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub types_synced: usize,
    pub types_failed: usize,
    /// Types left waiting (offline, tenant unconfirmed).
    pub types_pending: usize,
    pub conflicts_found: usize,
    pub duration: Duration,
    /// The call was a no-op because a cycle was already running.
    pub skipped: bool,
}

impl SyncResult {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

type Request = (SyncRequest, oneshot::Sender<Result<SyncResult>>);

/// Front end for requesting syncs from the scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Request>,
}

impl SyncScheduler {
    pub fn new(mode: SyncMode, connectivity: ConnectivityMonitor) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            connectivity,
        };
        (scheduler, handle)
    }

    /// Request a full sync and wait for its result.
    pub async fn request_sync(&self) -> Result<SyncResult> {
        self.request(SyncRequest::Full).await
    }

    pub async fn request_types_sync(&self, types: Vec<DataType>) -> Result<SyncResult> {
        self.request(SyncRequest::Types(types)).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Failed to receive sync result".to_string()))?
    }

    /// Change the sync mode. Takes effect after the next loop iteration.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Request>,
    connectivity: ConnectivityMonitor,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown or until every
    /// [`SyncScheduler`] is dropped. Meant to be spawned.
    ///
    /// `sync_fn` is called for explicit requests, for periodic ticks while
    /// online, and once on every offline to online transition. Calls are
    /// serialized.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncResult>> + Send,
    {
        let mut online_rx = self.connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();
        let mut current_interval = self.mode.read().await.interval();
        let mut ticker = Self::create_interval(current_interval);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                received = self.request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All scheduler front ends dropped");
                        break;
                    };
                    if matches!(request, SyncRequest::Shutdown) {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let _ = response_tx.send(sync_fn(request).await);
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    if self.connectivity.is_online() {
                        debug!("Triggering periodic sync");
                        Self::report("Periodic", sync_fn(SyncRequest::Full).await);
                    } else {
                        debug!("Periodic sync skipped while offline");
                    }
                }

                // The handle owns a monitor clone, so the sender outlives this loop.
                Ok(()) = online_rx.changed() => {
                    let online = *online_rx.borrow_and_update();
                    let reconnected = online && !was_online;
                    was_online = online;
                    if reconnected && current_interval.is_some() {
                        info!("Back online, syncing immediately");
                        Self::report("Reconnect", sync_fn(SyncRequest::Full).await);
                    }
                }
            }

            let expected = self.mode.read().await.interval();
            if expected != current_interval {
                debug!("Sync interval changed to {:?}", expected);
                current_interval = expected;
                ticker = Self::create_interval(current_interval);
            }
        }
    }

    fn create_interval(period: Option<Duration>) -> Option<Interval> {
        period.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        })
    }

    async fn wait_for_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    fn report(trigger: &str, result: Result<SyncResult>) {
        match result {
            Ok(result) if result.skipped => debug!("{} sync skipped: cycle in flight", trigger),
            Ok(result) => info!(
                "{} sync completed: {} synced, {} failed, {} pending, {} conflicts",
                trigger,
                result.types_synced,
                result.types_failed,
                result.types_pending,
                result.conflicts_found
            ),
            Err(e) => error!("{} sync failed: {}", trigger, e),
        }
    }
}
