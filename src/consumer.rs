//! Consumer runtime.
//!
//! Wires the merger and refresh scheduler onto a consumer's transport
//! endpoints and runs both loops until shut down.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::freshness::FreshnessTier;
use crate::merger::{MergeStats, UpdateMerger};
use crate::planner::{RefreshPlan, TimelinePlanner};
use crate::reload::ReloadSignal;
use crate::scheduler::runner::{RefreshScheduler, WakeReport};
use crate::scheduler::wake::{WakeEvent, WakeFacility};
use crate::snapshot::Snapshot;
use crate::store::{SharedStore, load_snapshot};
use crate::transport::loopback::{ConsumerEndpoints, ConsumerPresence};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the consumer would display right now.
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    pub tier: FreshnessTier,
    pub snapshot: Option<Snapshot>,
    pub plan: RefreshPlan,
}

/// Collaborators a consumer runs against.
pub struct ConsumerDeps {
    pub store: Arc<dyn SharedStore>,
    pub facility: Arc<dyn WakeFacility>,
    pub wakes: mpsc::UnboundedReceiver<WakeEvent>,
    pub reload: Arc<dyn ReloadSignal>,
    pub clock: Arc<dyn Clock>,
}

pub struct ConsumerRuntime;

impl ConsumerRuntime {
    /// Cold-start the consumer and spawn its loops.
    ///
    /// The persistent-context value is applied and the first wake armed before
    /// this returns; the consumer is then marked live for immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] when `config` fails validation.
    pub async fn start(
        config: &SyncConfig,
        endpoints: ConsumerEndpoints,
        deps: ConsumerDeps,
    ) -> Result<ConsumerHandle> {
        config.validate()?;
        let ConsumerEndpoints {
            inbox,
            context,
            presence,
        } = endpoints;

        let (merge_tx, merge_rx) = mpsc::unbounded_channel();
        let merger = Arc::new(
            UpdateMerger::new(Arc::clone(&deps.store), Arc::clone(&deps.reload))
                .with_events(merge_tx),
        );
        let mut scheduler = RefreshScheduler::new(
            config,
            Arc::clone(&merger),
            deps.facility,
            deps.reload,
            Arc::clone(&deps.clock),
        )
        .with_context(context);

        let cold_start = scheduler.cold_start(deps.clock.now()).await;
        info!(tier = %cold_start.tier, armed = ?cold_start.armed, "consumer cold start complete");

        let cancel = CancellationToken::new();
        let merger_task = Arc::clone(&merger).run(inbox, cancel.child_token());
        let scheduler_task = scheduler.run(deps.wakes, merge_rx, cancel.child_token());
        presence.set_live(true);

        Ok(ConsumerHandle {
            store: deps.store,
            clock: deps.clock,
            planner: TimelinePlanner::new(config),
            presence,
            cancel,
            cold_start,
            merger_task,
            scheduler_task,
        })
    }
}

/// Handle to a running consumer.
pub struct ConsumerHandle {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    planner: TimelinePlanner,
    presence: ConsumerPresence,
    cancel: CancellationToken,
    cold_start: WakeReport,
    merger_task: JoinHandle<MergeStats>,
    scheduler_task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Report produced by the cold start.
    pub fn cold_start(&self) -> &WakeReport {
        &self.cold_start
    }

    /// Classify the stored snapshot at the current time.
    pub async fn status(&self) -> ConsumerStatus {
        let now = self.clock.now();
        let snapshot = match load_snapshot(self.store.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("store unavailable, freshness unknown: {e}");
                None
            }
        };
        let plan = self.planner.plan(now, snapshot.as_ref());
        ConsumerStatus {
            tier: plan.tier_at(now),
            snapshot,
            plan,
        }
    }

    /// Stop both loops and wait for them.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Channel`] if either loop panicked.
    pub async fn shutdown(self) -> Result<MergeStats> {
        self.presence.set_live(false);
        self.cancel.cancel();
        self.scheduler_task
            .await
            .map_err(|e| SyncError::Channel(format!("scheduler task failed: {e}")))?;
        let stats = self
            .merger_task
            .await
            .map_err(|e| SyncError::Channel(format!("merger task failed: {e}")))?;
        info!(applied = stats.applied, "consumer stopped");
        Ok(stats)
    }
}
