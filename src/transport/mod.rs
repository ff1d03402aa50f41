//! Producer-to-consumer delivery channels.
//!
//! Design goal: transports are pluggable. The core only assumes the three
//! guarantee shapes in [`traits::DeliveryGuarantee`]; the dispatcher owns the
//! policy of which channels to use for a snapshot.

pub mod dispatcher;
pub mod loopback;
pub mod traits;

pub use dispatcher::{ChannelStatus, DispatchOutcome, TransportDispatcher};
pub use loopback::{
    ConsumerEndpoints, ConsumerPresence, ContextReceiver, Inbox, ProducerEndpoints, loopback_link,
};
pub use traits::{ChannelReachability, DeliveryChannel, DeliveryGuarantee, IncomingPayload};
