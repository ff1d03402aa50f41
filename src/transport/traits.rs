use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Delivery guarantee a channel offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryGuarantee {
    /// Store-and-forward; delivered even if the consumer is not running.
    DurableQueued,
    /// Last-value-wins; read by the consumer on its next activation.
    PersistentContext,
    /// Best effort; requires both ends to be active right now.
    ImmediateBestEffort,
}

impl DeliveryGuarantee {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::DurableQueued => "durable",
            Self::PersistentContext => "context",
            Self::ImmediateBestEffort => "immediate",
        }
    }
}

/// Encoded snapshot as it arrives on the consumer side.
#[derive(Debug, Clone)]
pub struct IncomingPayload {
    pub guarantee: DeliveryGuarantee,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// Whether the consumer is currently live and reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelReachability {
    pub consumer_live: bool,
}

/// Delivery channel contract. Transports only need to implement this trait.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Stable channel identifier (e.g. `durable`, `context`).
    fn id(&self) -> &'static str;

    /// Guarantee shape this channel provides.
    fn guarantee(&self) -> DeliveryGuarantee;

    /// Hand a payload to the transport. Returns once the transport has
    /// accepted it; never waits for the consumer to acknowledge.
    async fn send(&self, payload: Bytes) -> anyhow::Result<()>;
}
