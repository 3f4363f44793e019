use tokio::sync::watch;
use tracing::{Level, event};

/// Tracks whether the remote store is believed reachable and broadcasts
/// each report to subscribers such as the command cache.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor {
    pub fn new(connected: bool) -> Self {
        let (tx, _rx) = watch::channel(connected);
        Self { tx }
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publishes a state. Every call wakes subscribers, including one that
    /// repeats the current value, so a consumer that went offline on its own
    /// still hears the next "connected" report.
    pub fn set_connected(&self, connected: bool) {
        let previous = self.tx.send_replace(connected);
        if previous != connected {
            event!(Level::INFO, connected, "connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
