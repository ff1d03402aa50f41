//! In-process implementations of the three delivery channels.
//!
//! Used by the simulator binary and tests, and as the reference for what
//! each guarantee shape means:
//! - [`QueuedChannel`]: unbounded outbox pumped into the consumer inbox, so a
//!   send never blocks and nothing is dropped while the consumer is busy.
//! - [`ContextChannel`]: a `watch` slot; later sends overwrite earlier ones.
//! - [`ImmediateChannel`]: `try_send` into a small queue, failing when the
//!   consumer is not live or not keeping up.

use crate::config::TransportConfig;
use crate::transport::traits::{
    ChannelReachability, DeliveryChannel, DeliveryGuarantee, IncomingPayload,
};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Shared flag telling the producer whether the consumer is running.
#[derive(Debug, Clone, Default)]
pub struct ConsumerPresence {
    live: Arc<AtomicBool>,
}

impl ConsumerPresence {
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reachability(&self) -> ChannelReachability {
        ChannelReachability {
            consumer_live: self.is_live(),
        }
    }
}

/// Store-and-forward channel.
pub struct QueuedChannel {
    outbox: mpsc::UnboundedSender<Bytes>,
}

impl QueuedChannel {
    /// Create the channel and spawn its pump. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(inbox: mpsc::Sender<IncomingPayload>) -> Self {
        let (outbox, mut pending) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(payload) = pending.recv().await {
                let incoming = IncomingPayload {
                    guarantee: DeliveryGuarantee::DurableQueued,
                    payload,
                    received_at: Utc::now(),
                };
                if inbox.send(incoming).await.is_err() {
                    debug!("consumer inbox closed, stopping durable queue pump");
                    break;
                }
            }
        });
        Self { outbox }
    }
}

#[async_trait]
impl DeliveryChannel for QueuedChannel {
    fn id(&self) -> &'static str {
        "durable"
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::DurableQueued
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        self.outbox
            .send(payload)
            .map_err(|_| anyhow!("durable queue is closed"))
    }
}

/// Last-value-wins channel.
pub struct ContextChannel {
    slot: watch::Sender<Option<Bytes>>,
}

#[async_trait]
impl DeliveryChannel for ContextChannel {
    fn id(&self) -> &'static str {
        "context"
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::PersistentContext
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        // send_replace succeeds with no receivers: the value persists until read.
        self.slot.send_replace(Some(payload));
        Ok(())
    }
}

/// Consumer half of the context channel.
#[derive(Debug, Clone)]
pub struct ContextReceiver {
    slot: watch::Receiver<Option<Bytes>>,
    seen_initial: bool,
}

impl ContextReceiver {
    /// Take the latest context value if it has not been read yet.
    ///
    /// The first call after startup returns whatever the slot holds, covering
    /// a cold start after the consumer missed the queued deliveries.
    pub fn take_latest(&mut self) -> Option<IncomingPayload> {
        let first = !self.seen_initial;
        self.seen_initial = true;
        let changed = self.slot.has_changed().unwrap_or(false);
        if !first && !changed {
            return None;
        }
        let payload = self.slot.borrow_and_update().clone()?;
        Some(IncomingPayload {
            guarantee: DeliveryGuarantee::PersistentContext,
            payload,
            received_at: Utc::now(),
        })
    }
}

/// Best-effort channel to a live consumer.
pub struct ImmediateChannel {
    tx: mpsc::Sender<IncomingPayload>,
    presence: ConsumerPresence,
}

#[async_trait]
impl DeliveryChannel for ImmediateChannel {
    fn id(&self) -> &'static str {
        "immediate"
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::ImmediateBestEffort
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        if !self.presence.is_live() {
            return Err(anyhow!("consumer is not reachable"));
        }
        let incoming = IncomingPayload {
            guarantee: DeliveryGuarantee::ImmediateBestEffort,
            payload,
            received_at: Utc::now(),
        };
        self.tx.try_send(incoming).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("immediate queue is full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("consumer session closed"),
        })
    }
}

/// Consumer inbox merging durable and immediate deliveries.
#[derive(Debug)]
pub struct Inbox {
    queued: mpsc::Receiver<IncomingPayload>,
    immediate: mpsc::Receiver<IncomingPayload>,
    queued_open: bool,
    immediate_open: bool,
}

impl Inbox {
    /// Wrap already-created receivers.
    #[must_use]
    pub fn new(
        queued: mpsc::Receiver<IncomingPayload>,
        immediate: mpsc::Receiver<IncomingPayload>,
    ) -> Self {
        Self {
            queued,
            immediate,
            queued_open: true,
            immediate_open: true,
        }
    }

    /// Next delivery from either channel; `None` once both are closed.
    pub async fn recv(&mut self) -> Option<IncomingPayload> {
        loop {
            tokio::select! {
                biased;
                msg = self.immediate.recv(), if self.immediate_open => match msg {
                    Some(incoming) => return Some(incoming),
                    None => self.immediate_open = false,
                },
                msg = self.queued.recv(), if self.queued_open => match msg {
                    Some(incoming) => return Some(incoming),
                    None => self.queued_open = false,
                },
                else => return None,
            }
        }
    }
}

/// Producer side of a loopback link.
#[derive(Clone)]
pub struct ProducerEndpoints {
    pub durable: Arc<dyn DeliveryChannel>,
    pub context: Arc<dyn DeliveryChannel>,
    pub immediate: Arc<dyn DeliveryChannel>,
    pub presence: ConsumerPresence,
}

/// Consumer side of a loopback link.
pub struct ConsumerEndpoints {
    pub inbox: Inbox,
    pub context: ContextReceiver,
    pub presence: ConsumerPresence,
}

/// Build all three channels between a producer and a consumer in this process.
///
/// Must be called inside a tokio runtime (the durable queue spawns a pump).
#[must_use]
pub fn loopback_link(config: &TransportConfig) -> (ProducerEndpoints, ConsumerEndpoints) {
    let (queued_tx, queued_rx) = mpsc::channel(config.inbox_capacity.max(1));
    let (immediate_tx, immediate_rx) = mpsc::channel(config.immediate_capacity.max(1));
    let (slot, slot_rx) = watch::channel(None);
    let presence = ConsumerPresence::default();

    if config.inbox_capacity == 0 || config.immediate_capacity == 0 {
        warn!("zero transport capacity configured, using 1");
    }

    let producer = ProducerEndpoints {
        durable: Arc::new(QueuedChannel::new(queued_tx)),
        context: Arc::new(ContextChannel { slot }),
        immediate: Arc::new(ImmediateChannel {
            tx: immediate_tx,
            presence: presence.clone(),
        }),
        presence: presence.clone(),
    };
    let consumer = ConsumerEndpoints {
        inbox: Inbox::new(queued_rx, immediate_rx),
        context: ContextReceiver {
            slot: slot_rx,
            seen_initial: false,
        },
        presence,
    };
    (producer, consumer)
}
