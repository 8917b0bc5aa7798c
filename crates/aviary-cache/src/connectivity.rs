//! Network connectivity status
//!
//! The platform reports connectivity; the cache only reads the current value
//! and, for automatic repair, subscribes to changes.

use std::sync::Arc;
use tokio::sync::watch;

/// Source of connectivity status
pub trait Connectivity: Send + Sync {
    /// Whether the network is currently reported as available
    fn is_connected(&self) -> bool;

    /// Receiver that observes every status change
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity status holder fed by the platform layer
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    sender: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Create a monitor with an initial status
    pub fn new(connected: bool) -> Self {
        let (sender, _) = watch::channel(connected);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Monitor that starts online
    pub fn online() -> Self {
        Self::new(true)
    }

    /// Monitor that starts offline
    pub fn offline() -> Self {
        Self::new(false)
    }

    /// Record a status report; subscribers are only woken on actual changes
    pub fn set_connected(&self, connected: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            tracing::info!(
                "Connectivity changed: {}",
                if connected { "online" } else { "offline" }
            );
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::online()
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_connected(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_changes_only() {
        let monitor = ConnectivityMonitor::offline();
        let mut rx = monitor.subscribe();
        assert!(!monitor.is_connected());

        monitor.set_connected(false);
        assert!(!rx.has_changed().expect("Operation should succeed"));

        monitor.set_connected(true);
        rx.changed().await.expect("Operation should succeed");
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_connected());
    }

    #[test]
    fn test_clones_share_status() {
        let monitor = ConnectivityMonitor::online();
        let clone = monitor.clone();
        clone.set_connected(false);
        assert!(!monitor.is_connected());
    }
}
