//! Display invalidation signal.
//!
//! Fire-and-forget: the rendering layer re-reads the store and re-runs the
//! classifier when it hears this.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

/// Sink for "displayed state is out of date" notifications.
pub trait ReloadSignal: Send + Sync {
    fn notify_display_invalidated(&self);
}

/// Forwards each notification onto an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelReloadSignal {
    tx: mpsc::UnboundedSender<()>,
}

impl ChannelReloadSignal {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReloadSignal for ChannelReloadSignal {
    fn notify_display_invalidated(&self) {
        // Receiver gone means nobody renders; nothing to do.
        let _ = self.tx.send(());
    }
}

/// Counts notifications and lets tests wait for a given count.
#[derive(Debug, Clone)]
pub struct CountingReloadSignal {
    count: Arc<AtomicU64>,
    tx: Arc<watch::Sender<u64>>,
}

impl Default for CountingReloadSignal {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: Arc::new(AtomicU64::new(0)),
            tx: Arc::new(tx),
        }
    }
}

impl CountingReloadSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once at least `n` notifications have arrived.
    pub async fn wait_for(&self, n: u64) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

impl ReloadSignal for CountingReloadSignal {
    fn notify_display_invalidated(&self) {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send_replace(n);
    }
}
