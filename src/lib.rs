//! glance-sync: staleness-aware snapshot sync between a producer and a
//! glanceable consumer.
//!
//! # Architecture
//!
//! - **Producer**: builds a [`Snapshot`] per reading and fans it out over
//!   three delivery channels with different guarantees.
//! - **Merger**: applies incoming snapshots to the shared store only when they
//!   are strictly newer, then signals the display to reload.
//! - **Classifier**: maps the age of the latest reading to a freshness tier.
//! - **Planner / scheduler**: plan re-evaluation instants with an adaptive
//!   cadence and spend the background wake budget along that plan.
//!
//! Every time-dependent decision takes `now` explicitly; the runtime loops
//! read it from a [`Clock`].

pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod freshness;
pub mod merger;
pub mod planner;
pub mod producer;
pub mod reload;
pub mod scheduler;
pub mod snapshot;
pub mod store;
/// Test doubles for this crate's unit and integration tests. Not part of the
/// supported API.
#[doc(hidden)]
pub mod test_utils;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use consumer::{ConsumerDeps, ConsumerHandle, ConsumerRuntime, ConsumerStatus};
pub use error::{Result, SyncError};
pub use freshness::{FreshnessThresholds, FreshnessTier, classify};
pub use merger::{MergeEvent, MergeOutcome, RejectReason, UpdateMerger};
pub use planner::{RefreshPlan, TimelinePlanner};
pub use producer::{Reading, SnapshotProducer};
pub use reload::ReloadSignal;
pub use scheduler::{ArmOutcome, RefreshScheduler, TokioWakeFacility, WakeFacility};
pub use snapshot::{GlucoseUnit, Snapshot, Trend};
pub use store::{FileStore, MemoryStore, SharedStore};
pub use transport::{TransportDispatcher, loopback_link};
