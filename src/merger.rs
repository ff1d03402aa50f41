//! Consumer-side update merger.
//!
//! Applies incoming snapshots to the shared store under a single rule: a
//! snapshot is applied only if its `reading_time` is strictly later than the
//! stored one. That rule alone makes duplicate, reordered and multi-channel
//! delivery safe. Downstream components are told about an applied snapshot
//! only after the store confirms the write is flushed.

use crate::reload::ReloadSignal;
use crate::snapshot::Snapshot;
use crate::store::{SNAPSHOT_KEY, SharedStore, load_snapshot};
use crate::transport::loopback::Inbox;
use crate::transport::traits::{DeliveryGuarantee, IncomingPayload};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a snapshot was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Reading time is equal to or earlier than the stored snapshot's.
    NotNewer,
    /// Payload did not decode.
    Malformed,
    /// Store could not be read or written; prior state retained.
    StoreUnavailable,
}

/// Result of merging one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Rejected(RejectReason),
}

impl MergeOutcome {
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Notification sent after an applied snapshot is durable.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeEvent {
    Applied {
        snapshot: Snapshot,
        source: Option<DeliveryGuarantee>,
    },
}

/// Running merge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: u64,
    pub rejected_not_newer: u64,
    pub rejected_malformed: u64,
    pub rejected_store: u64,
}

/// The monotonicity rule, without side effects.
#[must_use]
pub fn merge_rule(incoming: &Snapshot, current: Option<&Snapshot>) -> MergeOutcome {
    match current {
        None => MergeOutcome::Applied,
        Some(current) if incoming.is_newer_than(current) => MergeOutcome::Applied,
        Some(_) => MergeOutcome::Rejected(RejectReason::NotNewer),
    }
}

/// Sole writer of the latest snapshot in the shared store.
pub struct UpdateMerger {
    store: Arc<dyn SharedStore>,
    reload: Arc<dyn ReloadSignal>,
    events: Option<mpsc::UnboundedSender<MergeEvent>>,
    write_lock: tokio::sync::Mutex<()>,
    stats: Mutex<MergeStats>,
}

impl UpdateMerger {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, reload: Arc<dyn ReloadSignal>) -> Self {
        Self {
            store,
            reload,
            events: None,
            write_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(MergeStats::default()),
        }
    }

    /// Also publish [`MergeEvent`]s, e.g. to the refresh scheduler.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<MergeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Store this merger writes to.
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> MergeStats {
        match self.stats.lock() {
            Ok(stats) => *stats,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn record(&self, outcome: MergeOutcome) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        match outcome {
            MergeOutcome::Applied => stats.applied += 1,
            MergeOutcome::Rejected(RejectReason::NotNewer) => stats.rejected_not_newer += 1,
            MergeOutcome::Rejected(RejectReason::Malformed) => stats.rejected_malformed += 1,
            MergeOutcome::Rejected(RejectReason::StoreUnavailable) => stats.rejected_store += 1,
        }
    }

    /// Merge an already-decoded snapshot.
    pub async fn merge(&self, incoming: Snapshot) -> MergeOutcome {
        self.merge_from(incoming, None).await
    }

    /// Decode and merge a delivered payload.
    pub async fn merge_payload(&self, incoming: &IncomingPayload) -> MergeOutcome {
        match Snapshot::decode(&incoming.payload) {
            Ok(snapshot) => self.merge_from(snapshot, Some(incoming.guarantee)).await,
            Err(e) => {
                warn!(
                    channel = incoming.guarantee.label(),
                    "rejecting malformed payload: {e}"
                );
                let outcome = MergeOutcome::Rejected(RejectReason::Malformed);
                self.record(outcome);
                outcome
            }
        }
    }

    async fn merge_from(
        &self,
        incoming: Snapshot,
        source: Option<DeliveryGuarantee>,
    ) -> MergeOutcome {
        // Held through notification so downstream sees applies in order.
        let _guard = self.write_lock.lock().await;
        let outcome = self.apply(&incoming).await;
        self.record(outcome);

        if outcome.is_applied() {
            debug!(
                reading_time = %incoming.reading_time(),
                urgent = incoming.urgent(),
                channel = source.map(DeliveryGuarantee::label),
                "snapshot applied"
            );
            self.reload.notify_display_invalidated();
            if let Some(events) = &self.events
                && events
                    .send(MergeEvent::Applied {
                        snapshot: incoming,
                        source,
                    })
                    .is_err()
            {
                debug!("merge event receiver closed");
            }
        }
        outcome
    }

    /// Read-decide-write; caller holds the write lock. Returns only after the
    /// write, if any, is flushed.
    async fn apply(&self, incoming: &Snapshot) -> MergeOutcome {
        let current = match load_snapshot(self.store.as_ref()).await {
            Ok(current) => current,
            Err(e) => {
                warn!("cannot read current snapshot, rejecting: {e}");
                return MergeOutcome::Rejected(RejectReason::StoreUnavailable);
            }
        };

        let outcome = merge_rule(incoming, current.as_ref());
        if !outcome.is_applied() {
            debug!(
                incoming = %incoming.reading_time(),
                current = ?current.as_ref().map(Snapshot::reading_time),
                "ordering rejection"
            );
            return outcome;
        }

        let payload = match incoming.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("cannot encode snapshot for store: {e}");
                return MergeOutcome::Rejected(RejectReason::Malformed);
            }
        };

        let handle = match self.store.set(SNAPSHOT_KEY, payload).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("snapshot write failed: {e}");
                return MergeOutcome::Rejected(RejectReason::StoreUnavailable);
            }
        };
        if let Err(e) = self.store.await_flush(handle).await {
            warn!("snapshot flush failed: {e}");
            return MergeOutcome::Rejected(RejectReason::StoreUnavailable);
        }

        MergeOutcome::Applied
    }

    /// Consume deliveries one at a time until the inbox closes or `cancel` fires.
    pub fn run(
        self: Arc<Self>,
        mut inbox: Inbox,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<MergeStats> {
        tokio::spawn(async move {
            info!("update merger started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    incoming = inbox.recv() => {
                        let Some(incoming) = incoming else {
                            debug!("inbox closed, stopping merger");
                            break;
                        };
                        self.merge_payload(&incoming).await;
                    }
                }
            }
            let stats = self.stats();
            info!(
                applied = stats.applied,
                rejected_not_newer = stats.rejected_not_newer,
                rejected_malformed = stats.rejected_malformed,
                rejected_store = stats.rejected_store,
                "update merger stopped"
            );
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::reload::CountingReloadSignal;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use chrono::{DateTime, TimeDelta, Utc};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn snap(offset_mins: i64) -> Snapshot {
        Snapshot::builder(120.0, t0() + TimeDelta::minutes(offset_mins)).build()
    }

    fn make_merger() -> (Arc<UpdateMerger>, MemoryStore, CountingReloadSignal) {
        let store = MemoryStore::new();
        let reload = CountingReloadSignal::new();
        let merger = UpdateMerger::new(Arc::new(store.clone()), Arc::new(reload.clone()));
        (Arc::new(merger), store, reload)
    }

    async fn stored(store: &MemoryStore) -> Option<Snapshot> {
        load_snapshot(store).await.unwrap()
    }

    #[test]
    fn rule_applies_only_strictly_newer() {
        assert_eq!(merge_rule(&snap(0), None), MergeOutcome::Applied);
        assert_eq!(merge_rule(&snap(1), Some(&snap(0))), MergeOutcome::Applied);
        assert_eq!(
            merge_rule(&snap(0), Some(&snap(0))),
            MergeOutcome::Rejected(RejectReason::NotNewer)
        );
        assert_eq!(
            merge_rule(&snap(-5), Some(&snap(0))),
            MergeOutcome::Rejected(RejectReason::NotNewer)
        );
    }

    #[tokio::test]
    async fn duplicate_merge_is_rejected_without_state_change() {
        let (merger, store, reload) = make_merger();

        assert_eq!(merger.merge(snap(0)).await, MergeOutcome::Applied);
        let after_first = store.get(SNAPSHOT_KEY).await.unwrap();

        assert_eq!(
            merger.merge(snap(0)).await,
            MergeOutcome::Rejected(RejectReason::NotNewer)
        );
        assert_eq!(store.get(SNAPSHOT_KEY).await.unwrap(), after_first);
        assert_eq!(reload.count(), 1);
    }

    #[tokio::test]
    async fn older_snapshot_never_regresses_store() {
        let (merger, store, _reload) = make_merger();
        merger.merge(snap(10)).await;
        merger.merge(snap(3)).await;
        assert_eq!(stored(&store).await, Some(snap(10)));
        assert_eq!(merger.stats().rejected_not_newer, 1);
    }

    #[tokio::test]
    async fn malformed_payload_keeps_previous_snapshot() {
        let (merger, store, reload) = make_merger();
        merger.merge(snap(0)).await;

        let incoming = IncomingPayload {
            guarantee: DeliveryGuarantee::DurableQueued,
            payload: Bytes::from_static(b"{\"value\": 1}"),
            received_at: t0(),
        };
        assert_eq!(
            merger.merge_payload(&incoming).await,
            MergeOutcome::Rejected(RejectReason::Malformed)
        );
        assert_eq!(stored(&store).await, Some(snap(0)));
        assert_eq!(reload.count(), 1);
        assert_eq!(merger.stats().rejected_malformed, 1);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_and_retains_state() {
        let (merger, store, reload) = make_merger();
        merger.merge(snap(0)).await;

        store.set_unavailable(true);
        assert_eq!(
            merger.merge(snap(5)).await,
            MergeOutcome::Rejected(RejectReason::StoreUnavailable)
        );
        store.set_unavailable(false);

        assert_eq!(stored(&store).await, Some(snap(0)));
        assert_eq!(reload.count(), 1);
        assert_eq!(merger.merge(snap(5)).await, MergeOutcome::Applied);
    }

    #[tokio::test]
    async fn downstream_sees_flushed_value() {
        struct ReadBack {
            store: MemoryStore,
            seen: std::sync::Mutex<Vec<Option<Bytes>>>,
        }
        impl ReloadSignal for ReadBack {
            fn notify_display_invalidated(&self) {
                // The write must already be visible when the signal fires.
                self.seen.lock().unwrap().push(self.store.peek(SNAPSHOT_KEY));
            }
        }

        let store = MemoryStore::new().with_flush_delay(Duration::from_millis(30));
        let reload = Arc::new(ReadBack {
            store: store.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let merger = UpdateMerger::new(Arc::new(store.clone()), reload.clone());

        let snapshot = snap(0);
        merger.merge(snapshot.clone()).await;

        let seen = reload.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        let value = seen[0].clone().expect("write visible at reload time");
        assert_eq!(Snapshot::decode(&value).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn events_follow_applied_merges_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MemoryStore::new();
        let merger = UpdateMerger::new(Arc::new(store), Arc::new(CountingReloadSignal::new()))
            .with_events(tx);

        merger.merge(snap(1)).await;
        merger.merge(snap(0)).await;

        let MergeEvent::Applied { snapshot, source } = rx.try_recv().unwrap();
        assert_eq!(snapshot, snap(1));
        assert_eq!(source, None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_merges_keep_the_newest() {
        let (merger, store, _reload) = make_merger();
        let mut handles = Vec::new();
        for offset in [3, 9, 1, 7, 5, 9, 2] {
            let merger = Arc::clone(&merger);
            handles.push(tokio::spawn(async move { merger.merge(snap(offset)).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(stored(&store).await, Some(snap(9)));
    }
}
