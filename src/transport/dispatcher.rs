//! Producer-side channel selection.
//!
//! Every snapshot goes out on the durable and context channels; the immediate
//! channel is tried only while the consumer is live. A failed send is logged
//! and recorded, never retried here: the redundancy across channels is what
//! gets the snapshot through.

use crate::error::SyncError;
use crate::snapshot::Snapshot;
use crate::transport::loopback::ProducerEndpoints;
use crate::transport::traits::{ChannelReachability, DeliveryChannel};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened on one channel.
#[derive(Debug)]
pub enum ChannelStatus {
    /// Transport accepted the payload.
    Sent,
    /// Transport refused the payload.
    Failed(SyncError),
    /// Channel was not attempted.
    Skipped,
}

impl ChannelStatus {
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Per-channel result of one dispatch.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub durable: ChannelStatus,
    pub context: ChannelStatus,
    pub immediate: ChannelStatus,
}

impl DispatchOutcome {
    /// Returns `true` when at least one channel accepted the payload.
    #[must_use]
    pub fn delivered_any(&self) -> bool {
        self.durable.is_sent() || self.context.is_sent() || self.immediate.is_sent()
    }
}

/// Sends snapshots over the three channels.
#[derive(Clone)]
pub struct TransportDispatcher {
    durable: Arc<dyn DeliveryChannel>,
    context: Arc<dyn DeliveryChannel>,
    immediate: Arc<dyn DeliveryChannel>,
}

impl TransportDispatcher {
    #[must_use]
    pub fn new(
        durable: Arc<dyn DeliveryChannel>,
        context: Arc<dyn DeliveryChannel>,
        immediate: Arc<dyn DeliveryChannel>,
    ) -> Self {
        Self {
            durable,
            context,
            immediate,
        }
    }

    /// Dispatcher over a loopback link's producer endpoints.
    #[must_use]
    pub fn from_endpoints(endpoints: &ProducerEndpoints) -> Self {
        Self::new(
            Arc::clone(&endpoints.durable),
            Arc::clone(&endpoints.context),
            Arc::clone(&endpoints.immediate),
        )
    }

    /// Send `snapshot` on every applicable channel.
    pub async fn dispatch(
        &self,
        snapshot: &Snapshot,
        reachability: ChannelReachability,
    ) -> DispatchOutcome {
        let payload = match snapshot.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("cannot encode snapshot for dispatch: {e}");
                let failed = || ChannelStatus::Failed(SyncError::Transport(e.to_string()));
                return DispatchOutcome {
                    durable: failed(),
                    context: failed(),
                    immediate: failed(),
                };
            }
        };

        let durable = send_logged(self.durable.as_ref(), payload.clone()).await;
        let context = send_logged(self.context.as_ref(), payload.clone()).await;
        let immediate = if reachability.consumer_live {
            send_logged(self.immediate.as_ref(), payload).await
        } else {
            ChannelStatus::Skipped
        };

        debug!(
            reading_time = %snapshot.reading_time(),
            urgent = snapshot.urgent(),
            ?durable,
            ?context,
            ?immediate,
            "snapshot dispatched"
        );

        DispatchOutcome {
            durable,
            context,
            immediate,
        }
    }
}

async fn send_logged(channel: &dyn DeliveryChannel, payload: bytes::Bytes) -> ChannelStatus {
    match channel.send(payload).await {
        Ok(()) => ChannelStatus::Sent,
        Err(e) => {
            warn!(channel = channel.id(), "channel send failed: {e:#}");
            ChannelStatus::Failed(SyncError::Transport(format!("{}: {e}", channel.id())))
        }
    }
}
