//! Cross-tab change signalling.
//!
//! A [`ChangeNotifier`] carries "key changed" signals between handles that
//! share one profile store. Signals never loop back to the handle that
//! published them; the writer notifies its own subscribers directly.

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Default capacity of the broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// A raw key change as seen by the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Effective (possibly tenant-scoped) key.
    pub key: String,
    /// Serialized new value, `None` on removal.
    pub new_value: Option<String>,
    /// Handle that performed the write.
    pub origin: Uuid,
}

/// Pluggable transport for cross-tab change signals.
pub trait ChangeNotifier: Send + Sync {
    /// Announce a change to every other listener.
    fn publish(&self, change: StorageChange);

    /// Receive changes published after this call.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// In-process notifier backed by a tokio broadcast channel.
///
/// Models several tabs living in one process; clones share the channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<StorageChange>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier for BroadcastNotifier {
    fn publish(&self, change: StorageChange) {
        if self.tx.send(change).is_err() {
            debug!("No cross-tab listeners for change");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();

        let change = StorageChange {
            key: "tenant:t1:settings".to_string(),
            new_value: Some("{}".to_string()),
            origin: Uuid::new_v4(),
        };
        notifier.publish(change.clone());

        assert_eq!(rx.recv().await.unwrap(), change);
    }

    #[test]
    fn test_publish_without_listeners() {
        let notifier = BroadcastNotifier::new();
        notifier.publish(StorageChange {
            key: "k".to_string(),
            new_value: None,
            origin: Uuid::new_v4(),
        });
    }
}
