//! Refresh scheduler loop.
//!
//! Keeps the consumer's freshness classification from drifting by spending
//! the OS wake budget along the current [`RefreshPlan`]. Every wake re-arms
//! the next one before returning; a missed re-arm would stop wakes for good.
//! Denied requests are logged and retried with backoff, never escalated.

use crate::clock::Clock;
use crate::config::{MAX_WAKE_DELAY_SECS, SyncConfig, WakeConfig};
use crate::freshness::FreshnessTier;
use crate::merger::{MergeEvent, MergeOutcome, UpdateMerger};
use crate::planner::{RefreshPlan, TimelinePlanner};
use crate::reload::ReloadSignal;
use crate::scheduler::wake::{WakeEvent, WakeFacility, WakeKind, WakeTicket};
use crate::snapshot::Snapshot;
use crate::store::load_snapshot;
use crate::transport::loopback::ContextReceiver;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one attempt to arm the next wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// A new request was granted.
    Armed(WakeTicket),
    /// The outstanding request already fires early enough.
    AlreadyArmed(WakeTicket),
    /// The facility refused; the scheduler retries at `retry_at`.
    Denied { retry_at: DateTime<Utc> },
}

/// What one wake (or cold start) did.
#[derive(Debug, Clone)]
pub struct WakeReport {
    pub woke_at: DateTime<Utc>,
    /// Outcome of merging the persistent-context value, if one was waiting.
    pub recovered: Option<MergeOutcome>,
    pub tier: FreshnessTier,
    pub plan: RefreshPlan,
    pub armed: ArmOutcome,
}

/// Plans refreshes and keeps the next wake armed.
pub struct RefreshScheduler {
    wake_config: WakeConfig,
    planner: TimelinePlanner,
    merger: Arc<UpdateMerger>,
    facility: Arc<dyn WakeFacility>,
    reload: Arc<dyn ReloadSignal>,
    clock: Arc<dyn Clock>,
    context: Option<ContextReceiver>,
    plan: Option<RefreshPlan>,
    armed: Option<WakeTicket>,
    last_wake: Option<DateTime<Utc>>,
    denied_streak: u32,
    retry_at: Option<DateTime<Utc>>,
}

impl RefreshScheduler {
    #[must_use]
    pub fn new(
        config: &SyncConfig,
        merger: Arc<UpdateMerger>,
        facility: Arc<dyn WakeFacility>,
        reload: Arc<dyn ReloadSignal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            wake_config: config.wake.clone(),
            planner: TimelinePlanner::new(config),
            merger,
            facility,
            reload,
            clock,
            context: None,
            plan: None,
            armed: None,
            last_wake: None,
            denied_streak: 0,
            retry_at: None,
        }
    }

    /// Read the persistent context channel on cold start and every wake.
    #[must_use]
    pub fn with_context(mut self, context: ContextReceiver) -> Self {
        self.context = Some(context);
        self
    }

    /// Plan currently in force.
    pub fn current_plan(&self) -> Option<&RefreshPlan> {
        self.plan.as_ref()
    }

    /// Outstanding wake request, if any.
    pub fn armed(&self) -> Option<WakeTicket> {
        self.armed
    }

    /// Consecutive denied requests.
    pub fn denied_streak(&self) -> u32 {
        self.denied_streak
    }

    /// When the next re-arm attempt happens after a denial.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at
    }

    /// Delay before re-requesting after `streak` consecutive denials.
    ///
    /// Each term is clamped to [`MAX_WAKE_DELAY_SECS`] so an unvalidated
    /// config cannot overflow the timestamp arithmetic.
    fn denied_backoff(&self, streak: u32) -> TimeDelta {
        let base = self.wake_config.denied_backoff_base_secs;
        let shift = streak.saturating_sub(1).min(16);
        let secs = base
            .saturating_mul(1u64 << shift)
            .min(self.wake_config.denied_backoff_max_secs)
            .min(MAX_WAKE_DELAY_SECS);
        let jitter_max = self.wake_config.jitter_secs.min(MAX_WAKE_DELAY_SECS);
        let jitter = if jitter_max > 0 {
            rand::thread_rng().gen_range(0..=jitter_max)
        } else {
            0
        };
        TimeDelta::seconds(i64::try_from(secs + jitter).unwrap_or(i64::from(u32::MAX)))
    }

    /// Ask the facility for the next wake, no earlier than `preferred`.
    ///
    /// The request is pushed out to at least one cadence after the last wake:
    /// the facility grants no more than one wake per cadence interval.
    pub fn schedule_next(&mut self, now: DateTime<Utc>, preferred: DateTime<Utc>) -> ArmOutcome {
        let cadence = self
            .plan
            .as_ref()
            .map_or_else(|| self.planner.plan(now, None).cadence(), RefreshPlan::cadence);
        let mut at = preferred.max(now);
        if let Some(last) = self.last_wake {
            at = at.max(last + cadence);
        }

        if let Some(armed) = self.armed
            && armed.at > now
            && armed.at <= at
        {
            return ArmOutcome::AlreadyArmed(armed);
        }

        match self.facility.request_wake(at) {
            Ok(ticket) => {
                if let Some(previous) = self.armed.replace(ticket)
                    && self.facility.allows_multiple_outstanding()
                {
                    self.facility.cancel(&previous);
                }
                if self.denied_streak > 0 {
                    info!(streak = self.denied_streak, "wake granted after denials");
                }
                self.denied_streak = 0;
                self.retry_at = None;
                debug!(at = %ticket.at, "next wake armed");
                ArmOutcome::Armed(ticket)
            }
            Err(e) => self.back_off(now, &e.to_string()),
        }
    }

    fn back_off(&mut self, now: DateTime<Utc>, reason: &str) -> ArmOutcome {
        self.denied_streak = self.denied_streak.saturating_add(1);
        let retry_at = now + self.denied_backoff(self.denied_streak);
        self.retry_at = Some(retry_at);
        warn!(
            streak = self.denied_streak,
            retry_at = %retry_at,
            "wake not granted, freshness updates degrade until retry: {reason}"
        );
        ArmOutcome::Denied { retry_at }
    }

    fn next_boundary(plan: &RefreshPlan, now: DateTime<Utc>) -> DateTime<Utc> {
        plan.next_after(now).unwrap_or(now + plan.cadence())
    }

    /// Re-read the store, re-plan, invalidate the display and re-arm.
    async fn refresh(&mut self, now: DateTime<Utc>) -> WakeReport {
        let recovered = match self.context.as_mut().and_then(ContextReceiver::take_latest) {
            Some(incoming) => {
                debug!("applying persistent context value");
                Some(self.merger.merge_payload(&incoming).await)
            }
            None => None,
        };

        let snapshot = self.stored_snapshot().await;
        let plan = self.planner.plan(now, snapshot.as_ref());
        let tier = plan.tier_at(now);
        self.reload.notify_display_invalidated();
        let armed = self.schedule_next(now, Self::next_boundary(&plan, now));
        self.plan = Some(plan.clone());

        WakeReport {
            woke_at: now,
            recovered,
            tier,
            plan,
            armed,
        }
    }

    /// Latest stored snapshot; an unavailable store reads as no data.
    async fn stored_snapshot(&self) -> Option<Snapshot> {
        match load_snapshot(self.merger.store().as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("store unavailable, freshness unknown: {e}");
                None
            }
        }
    }

    /// First activation: pick up any context value and arm the first wake.
    pub async fn cold_start(&mut self, now: DateTime<Utc>) -> WakeReport {
        info!("refresh scheduler cold start");
        self.refresh(now).await
    }

    /// Handle a fired wake. Always re-arms before returning.
    pub async fn on_wake(&mut self, now: DateTime<Utc>) -> WakeReport {
        self.last_wake = Some(now);
        self.armed = None;
        let report = self.refresh(now).await;
        debug!(tier = %report.tier, armed = ?report.armed, "wake handled");
        report
    }

    /// The facility withdrew the armed grant when it came due. No wake
    /// happened, so this is handled like a denied request.
    pub fn on_wake_suppressed(&mut self, now: DateTime<Utc>) -> ArmOutcome {
        self.armed = None;
        self.back_off(now, "grant suppressed when due")
    }

    /// A newer snapshot was merged: plan for it, then arm.
    pub fn on_merge_applied(&mut self, now: DateTime<Utc>, snapshot: &Snapshot) -> ArmOutcome {
        let plan = self.planner.plan(now, Some(snapshot));
        let preferred = Self::next_boundary(&plan, now);
        self.plan = Some(plan);
        self.schedule_next(now, preferred)
    }

    /// Retry after a denial. An expired or missing plan is renewed from the
    /// stored snapshot first, keeping its urgency.
    pub async fn retry_arm(&mut self, now: DateTime<Utc>) -> ArmOutcome {
        self.retry_at = None;
        if self.plan.as_ref().is_none_or(|plan| plan.is_expired(now)) {
            let snapshot = self.stored_snapshot().await;
            let plan = self.planner.plan(now, snapshot.as_ref());
            debug!(urgent = plan.is_urgent(), "plan renewed on retry");
            self.plan = Some(plan);
        }
        let preferred = self
            .plan
            .as_ref()
            .map_or(now, |plan| Self::next_boundary(plan, now));
        self.schedule_next(now, preferred)
    }

    /// Run until `cancel` fires. Wakes, merges and retries are handled one at
    /// a time, so planning and arming never overlap.
    pub fn run(
        mut self,
        mut wakes: mpsc::UnboundedReceiver<WakeEvent>,
        mut merges: mpsc::UnboundedReceiver<MergeEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("refresh scheduler started");
            let mut merges_open = true;
            loop {
                let retry_delay = self
                    .retry_at
                    .map(|at| (at - self.clock.now()).to_std().unwrap_or_default());

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    wake = wakes.recv() => {
                        let Some(wake) = wake else {
                            warn!("wake facility closed, scheduler stopping");
                            break;
                        };
                        if self.armed.is_some_and(|armed| armed.id != wake.ticket.id) {
                            debug!(ticket = %wake.ticket.id, "ignoring superseded wake");
                            continue;
                        }
                        match wake.kind {
                            WakeKind::Fired => {
                                self.on_wake(self.clock.now()).await;
                            }
                            WakeKind::Suppressed if self.armed.is_some() => {
                                self.on_wake_suppressed(self.clock.now());
                            }
                            WakeKind::Suppressed => {
                                debug!(ticket = %wake.ticket.id, "ignoring suppression of unarmed wake");
                            }
                        }
                    }
                    event = merges.recv(), if merges_open => match event {
                        Some(MergeEvent::Applied { snapshot, .. }) => {
                            self.on_merge_applied(self.clock.now(), &snapshot);
                        }
                        None => merges_open = false,
                    },
                    _ = sleep_or_pending(retry_delay) => {
                        self.retry_arm(self.clock.now()).await;
                    }
                }
            }
            if let Some(ticket) = self.armed.take() {
                self.facility.cancel(&ticket);
            }
            info!("refresh scheduler stopped");
        })
    }
}

async fn sleep_or_pending(delay: Option<std::time::Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::reload::CountingReloadSignal;
    use crate::store::MemoryStore;
    use crate::test_utils::ManualWakeFacility;
    use crate::transport::{DeliveryChannel, loopback_link};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn mins(n: i64) -> TimeDelta {
        TimeDelta::minutes(n)
    }

    struct Harness {
        scheduler: RefreshScheduler,
        merger: Arc<UpdateMerger>,
        facility: Arc<ManualWakeFacility>,
        wakes: mpsc::UnboundedReceiver<WakeEvent>,
        reload: CountingReloadSignal,
        store: MemoryStore,
    }

    fn harness() -> Harness {
        harness_with(ManualWakeFacility::new())
    }

    fn harness_with(
        (facility, wakes): (ManualWakeFacility, mpsc::UnboundedReceiver<WakeEvent>),
    ) -> Harness {
        let mut config = SyncConfig::default();
        config.wake.jitter_secs = 0;
        let store = MemoryStore::new();
        let reload = CountingReloadSignal::new();
        let merger = Arc::new(UpdateMerger::new(
            Arc::new(store.clone()),
            Arc::new(reload.clone()),
        ));
        let facility = Arc::new(facility);
        let scheduler = RefreshScheduler::new(
            &config,
            Arc::clone(&merger),
            facility.clone(),
            Arc::new(reload.clone()),
            Arc::new(crate::clock::ManualClock::new(t0())),
        );
        Harness {
            scheduler,
            merger,
            facility,
            wakes,
            reload,
            store,
        }
    }

    /// Poll `check` on paused time until it holds.
    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            while !check() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn cold_start_without_data_plans_normal_and_arms() {
        let mut h = harness();
        let report = h.scheduler.cold_start(t0()).await;

        assert_eq!(report.tier, FreshnessTier::Unknown);
        assert_eq!(report.plan.cadence(), mins(15));
        assert!(matches!(report.armed, ArmOutcome::Armed(t) if t.at == t0() + mins(15)));
        assert_eq!(h.facility.requests(), vec![t0() + mins(15)]);
        assert_eq!(h.reload.count(), 1);
    }

    #[tokio::test]
    async fn wake_rearms_before_returning() {
        let mut h = harness();
        h.merger
            .merge(Snapshot::builder(110.0, t0()).build())
            .await;
        h.scheduler.cold_start(t0()).await;

        let report = h.scheduler.on_wake(t0() + mins(15)).await;
        assert_eq!(report.tier, FreshnessTier::Stale);
        assert!(matches!(report.armed, ArmOutcome::Armed(t) if t.at == t0() + mins(30)));
        assert_eq!(h.scheduler.armed().map(|t| t.at), Some(t0() + mins(30)));
    }

    #[tokio::test]
    async fn urgent_merge_pulls_next_wake_earlier() {
        let mut h = harness();
        h.scheduler.cold_start(t0()).await;
        assert_eq!(h.scheduler.armed().map(|t| t.at), Some(t0() + mins(15)));

        let urgent = Snapshot::builder(260.0, t0() + mins(1)).urgent(true).build();
        let armed = h.scheduler.on_merge_applied(t0() + mins(1), &urgent);

        assert!(matches!(armed, ArmOutcome::Armed(t) if t.at == t0() + mins(6)));
        assert_eq!(h.scheduler.current_plan().unwrap().cadence(), mins(5));
        // This facility replaces requests itself; nothing to withdraw.
        assert!(h.facility.cancelled().is_empty());
    }

    #[tokio::test]
    async fn superseded_ticket_is_cancelled_when_requests_accumulate() {
        let mut h = harness_with(ManualWakeFacility::with_multiple_outstanding());
        h.scheduler.cold_start(t0()).await;
        let first = h.scheduler.armed().unwrap();

        let urgent = Snapshot::builder(260.0, t0() + mins(1)).urgent(true).build();
        let armed = h.scheduler.on_merge_applied(t0() + mins(1), &urgent);

        let ArmOutcome::Armed(second) = armed else {
            panic!("expected a new grant, got {armed:?}");
        };
        assert_eq!(second.at, t0() + mins(6));
        assert_eq!(h.facility.cancelled(), vec![first]);
        assert_eq!(h.facility.outstanding(), Some(second));
    }

    #[tokio::test]
    async fn in_range_merge_keeps_earlier_wake() {
        let mut h = harness();
        let urgent = Snapshot::builder(260.0, t0()).urgent(true).build();
        h.scheduler.on_merge_applied(t0(), &urgent);

        let calm = Snapshot::builder(120.0, t0() + mins(1)).build();
        let armed = h.scheduler.on_merge_applied(t0() + mins(1), &calm);
        assert!(matches!(armed, ArmOutcome::AlreadyArmed(t) if t.at == t0() + mins(5)));
        assert_eq!(h.facility.requests().len(), 1);
    }

    #[tokio::test]
    async fn wakes_are_spaced_at_least_one_cadence_apart() {
        let mut h = harness();
        h.scheduler.cold_start(t0()).await;
        h.scheduler.on_wake(t0() + mins(15)).await;

        // A merge right after the wake must not request a wake sooner than the cadence allows.
        let urgent = Snapshot::builder(260.0, t0() + mins(15)).urgent(true).build();
        let armed = h.scheduler.on_merge_applied(t0() + mins(15), &urgent);
        assert!(matches!(armed, ArmOutcome::Armed(t) if t.at >= t0() + mins(20)));
    }

    #[tokio::test]
    async fn denial_backs_off_and_recovers() {
        let mut h = harness();
        h.facility.deny_next(2);

        let report = h.scheduler.cold_start(t0()).await;
        let ArmOutcome::Denied { retry_at } = report.armed else {
            panic!("expected denial, got {:?}", report.armed);
        };
        assert_eq!(retry_at, t0() + TimeDelta::seconds(60));
        assert_eq!(h.scheduler.denied_streak(), 1);

        let second = h.scheduler.retry_arm(retry_at).await;
        assert!(
            matches!(second, ArmOutcome::Denied { retry_at } if retry_at == t0() + TimeDelta::seconds(60 + 120))
        );
        assert_eq!(h.scheduler.denied_streak(), 2);

        let third = h.scheduler.retry_arm(t0() + mins(3)).await;
        assert!(matches!(third, ArmOutcome::Armed(_)));
        assert_eq!(h.scheduler.denied_streak(), 0);
        assert!(h.scheduler.retry_at().is_none());
    }

    #[tokio::test]
    async fn retry_after_expiry_replans_from_stored_snapshot() {
        let mut h = harness();
        let urgent = Snapshot::builder(260.0, t0()).urgent(true).build();
        h.merger.merge(urgent.clone()).await;

        h.facility.deny_all(true);
        let armed = h.scheduler.on_merge_applied(t0(), &urgent);
        assert!(matches!(armed, ArmOutcome::Denied { .. }));

        // Denials outlast the 30 minute urgent lease.
        let late = t0() + mins(31);
        assert!(matches!(
            h.scheduler.retry_arm(late).await,
            ArmOutcome::Denied { .. }
        ));
        let renewed = h.scheduler.current_plan().unwrap();
        assert!(renewed.is_urgent());
        assert_eq!(renewed.cadence(), mins(5));
        assert_eq!(renewed.planned_at(), Some(late));
        assert!(!renewed.is_expired(late));

        h.facility.deny_all(false);
        let armed = h.scheduler.retry_arm(late + mins(1)).await;
        assert!(matches!(armed, ArmOutcome::Armed(t) if t.at == t0() + mins(36)));
        assert_eq!(h.facility.requests(), vec![t0() + mins(36)]);
    }

    #[tokio::test]
    async fn suppressed_grant_is_retried_with_backoff() {
        let mut h = harness();
        h.scheduler.cold_start(t0()).await;
        assert!(h.scheduler.armed().is_some());

        let outcome = h.scheduler.on_wake_suppressed(t0() + mins(15));
        assert_eq!(
            outcome,
            ArmOutcome::Denied {
                retry_at: t0() + mins(16)
            }
        );
        assert!(h.scheduler.armed().is_none());
        assert_eq!(h.scheduler.denied_streak(), 1);
        assert_eq!(h.reload.count(), 1, "no refresh without a wake");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_rearms_after_denial_backoff() {
        let mut h = harness();
        h.facility.deny_all(true);
        let report = h.scheduler.cold_start(t0()).await;
        assert!(matches!(report.armed, ArmOutcome::Denied { .. }));

        let (_merges_tx, merges) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = h.scheduler.run(h.wakes, merges, cancel.clone());

        // First retry fires after the 60s base backoff and is denied again.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(h.facility.requests().is_empty());

        h.facility.deny_all(false);
        let facility = Arc::clone(&h.facility);
        wait_for(|| facility.outstanding().is_some()).await;
        assert_eq!(h.facility.requests(), vec![t0() + mins(15)]);

        cancel.cancel();
        task.await.unwrap();
        assert!(h.facility.outstanding().is_none(), "armed wake withdrawn on stop");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_recovers_from_suppressed_wake() {
        let mut h = harness();
        h.scheduler.cold_start(t0()).await;

        let (_merges_tx, merges) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = h.scheduler.run(h.wakes, merges, cancel.clone());

        assert!(h.facility.suppress(t0() + mins(15)));
        let facility = Arc::clone(&h.facility);
        wait_for(|| facility.requests().len() == 2).await;
        assert!(h.facility.outstanding().is_some());
        assert_eq!(h.reload.count(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn backoff_is_capped() {
        let h = harness();
        assert_eq!(h.scheduler.denied_backoff(1), TimeDelta::seconds(60));
        assert_eq!(h.scheduler.denied_backoff(3), TimeDelta::seconds(240));
        assert_eq!(h.scheduler.denied_backoff(30), TimeDelta::seconds(900));
    }

    #[tokio::test]
    async fn oversized_backoff_settings_are_clamped() {
        let mut config = SyncConfig::default();
        config.wake.denied_backoff_base_secs = u64::MAX;
        config.wake.denied_backoff_max_secs = u64::MAX;
        config.wake.jitter_secs = u64::MAX;
        let h = harness();
        let scheduler = RefreshScheduler::new(
            &config,
            h.merger,
            h.facility,
            Arc::new(h.reload),
            Arc::new(crate::clock::ManualClock::new(t0())),
        );

        let max = TimeDelta::seconds(2 * 86_400);
        for streak in [1, 5, u32::MAX] {
            let delay = scheduler.denied_backoff(streak);
            assert!(delay >= TimeDelta::seconds(86_400) && delay <= max, "got {delay}");
        }
    }

    #[tokio::test]
    async fn wake_recovers_value_from_persistent_context() {
        let mut h = harness();
        let (producer, consumer) = loopback_link(&crate::config::TransportConfig::default());
        h.scheduler = h.scheduler.with_context(consumer.context);

        let missed = Snapshot::builder(140.0, t0()).build();
        producer.context.send(missed.encode().unwrap()).await.unwrap();

        let report = h.scheduler.on_wake(t0() + mins(2)).await;
        assert_eq!(report.recovered, Some(MergeOutcome::Applied));
        assert_eq!(report.tier, FreshnessTier::Fresh);
        assert_eq!(load_snapshot(&h.store).await.unwrap(), Some(missed));

        // Nothing new in the context slot on the next wake.
        let report = h.scheduler.on_wake(t0() + mins(17)).await;
        assert_eq!(report.recovered, None);
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_unknown() {
        let mut h = harness();
        h.merger
            .merge(Snapshot::builder(110.0, t0()).build())
            .await;
        h.store.set_unavailable(true);

        let report = h.scheduler.on_wake(t0() + mins(1)).await;
        assert_eq!(report.tier, FreshnessTier::Unknown);
        assert!(matches!(report.armed, ArmOutcome::Armed(_)));
    }
}
