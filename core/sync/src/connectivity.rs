//! Online/offline tracking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::RemoteBackend;

/// Shared online flag. Clones observe and update the same flag.
///
/// Platform adapters feed it from native online/offline signals through
/// [`ConnectivityMonitor::set_online`]; targets without such signals can use
/// [`ConnectivityMonitor::spawn_probe`].
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record an online/offline signal.
    ///
    /// # Returns
    /// `true` if the flag changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Observe flag transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Drive the flag from periodic reachability probes.
    ///
    /// Each probe is bounded by `timeout`; a timeout counts as offline.
    pub fn spawn_probe(
        &self,
        backend: Arc<dyn RemoteBackend>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reachable = matches!(
                    tokio::time::timeout(timeout, backend.ping()).await,
                    Ok(Ok(()))
                );
                debug!("Connectivity probe: reachable={}", reachable);
                monitor.set_online(reachable);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
