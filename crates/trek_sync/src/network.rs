//! Connectivity signal

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Single online/offline signal fanned out to every dependent.
///
/// The platform integration calls [`NetworkMonitor::set_online`] on each
/// connectivity callback; dependents await changes through
/// [`NetworkMonitor::subscribe`]. Nothing polls.
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
    /// Bumped on every online -> offline transition
    offline_epoch: AtomicU64,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self {
            tx,
            offline_epoch: AtomicU64::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Feed a connectivity reading. Subscribers are only woken on transitions.
    /// Returns true if the state changed.
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
            if online {
                tracing::info!("Connectivity restored");
            } else {
                self.offline_epoch.fetch_add(1, Ordering::SeqCst);
                tracing::info!("Connectivity lost");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Token taken before a remote call. If the device went offline while the
    /// call was in flight, [`NetworkMonitor::still_connected`] reports false
    /// and the result must be discarded.
    pub fn epoch(&self) -> u64 {
        self.offline_epoch.load(Ordering::SeqCst)
    }

    pub fn still_connected(&self, epoch: u64) -> bool {
        self.is_online() && self.epoch() == epoch
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only() {
        let monitor = NetworkMonitor::new(true);
        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.is_online());
        assert!(monitor.set_online(true));
    }

    #[test]
    fn test_epoch_detects_drop_during_request() {
        let monitor = NetworkMonitor::new(true);
        let epoch = monitor.epoch();
        assert!(monitor.still_connected(epoch));

        monitor.set_online(false);
        monitor.set_online(true);
        assert!(monitor.is_online());
        assert!(!monitor.still_connected(epoch));
    }

    #[tokio::test]
    async fn test_subscribers_see_reconnect() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
