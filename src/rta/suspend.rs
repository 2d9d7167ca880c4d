//! Host suspend/resume awareness.
//!
//! Reconnect attempts are deferred while the host process is suspended. Hosts
//! without a suspend lifecycle use [`SuspendSignal::never_suspended`].

use tokio::sync::watch;

/// Capability reporting whether the host process is currently suspended.
pub trait SuspendMonitor: Send + Sync + 'static {
    /// Returns a receiver whose value is `true` while suspended.
    fn watch_suspended(&self) -> watch::Receiver<bool>;
}

/// Settable suspend flag, driven by the embedding application's lifecycle
/// callbacks.
#[derive(Debug)]
pub struct SuspendSignal {
    tx: watch::Sender<bool>,
}

impl SuspendSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Signal for hosts that never suspend.
    pub fn never_suspended() -> Self {
        Self::new()
    }

    pub fn suspend(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_suspended(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for SuspendSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendMonitor for SuspendSignal {
    fn watch_suspended(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Waits until the monitor reports the host as awake.
pub(crate) async fn wait_until_resumed(monitor: &dyn SuspendMonitor) {
    let mut suspended = monitor.watch_suspended();
    // A dropped sender means nobody can suspend us anymore.
    let _ = suspended.wait_for(|is_suspended| !*is_suspended).await;
}
