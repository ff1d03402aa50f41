//! OS wake facility boundary.
//!
//! A facility accepts "wake me no earlier than `at`" requests and later
//! delivers a [`WakeEvent`] on the channel it was built with. It may delay or
//! coalesce, and it may refuse outright when its hourly cap is spent.

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::scheduler::budget::WakeBudget;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one granted wake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeTicket {
    pub id: Uuid,
    /// Requested earliest wake instant.
    pub at: DateTime<Utc>,
}

impl WakeTicket {
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at,
        }
    }
}

/// How a granted request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeKind {
    /// The wake happened; the consumer gets to refresh.
    Fired,
    /// The facility withdrew the grant when it came due. The ticket is dead
    /// and the holder must request again.
    Suppressed,
}

/// Delivered when a granted request comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeEvent {
    pub ticket: WakeTicket,
    pub fired_at: DateTime<Utc>,
    pub kind: WakeKind,
}

/// Background wake facility contract.
pub trait WakeFacility: Send + Sync {
    /// Ask for a wake at or after `at`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::WakeDenied`] when the facility will not grant it.
    fn request_wake(&self, at: DateTime<Utc>) -> Result<WakeTicket>;

    /// Withdraw an outstanding request. Unknown tickets are ignored.
    fn cancel(&self, ticket: &WakeTicket);

    /// `false` when a new request implicitly replaces the outstanding one.
    fn allows_multiple_outstanding(&self) -> bool {
        false
    }
}

/// Tokio-timer facility with an hourly wake cap.
///
/// Holds at most one outstanding request; a new request aborts the previous
/// timer. The budget is checked at request time and consumed when the wake
/// fires, so superseded requests cost nothing. If the budget is spent by the
/// time a timer fires, the ticket is reported as [`WakeKind::Suppressed`].
pub struct TokioWakeFacility {
    events: mpsc::UnboundedSender<WakeEvent>,
    budget: Arc<Mutex<WakeBudget>>,
    pending: Mutex<Option<(WakeTicket, JoinHandle<()>)>>,
    clock: Arc<dyn Clock>,
}

impl TokioWakeFacility {
    #[must_use]
    pub fn new(
        max_wakes_per_hour: u32,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                budget: Arc::new(Mutex::new(WakeBudget::new(max_wakes_per_hour))),
                pending: Mutex::new(None),
                clock,
            },
            rx,
        )
    }

    /// Wakes still available at `now`.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> u32 {
        self.budget
            .lock()
            .map(|mut budget| budget.remaining_at(now))
            .unwrap_or(0)
    }
}

impl WakeFacility for TokioWakeFacility {
    fn request_wake(&self, at: DateTime<Utc>) -> Result<WakeTicket> {
        let now = self.clock.now();
        let fire_at = at.max(now);
        {
            let mut budget = self
                .budget
                .lock()
                .map_err(|_| SyncError::WakeDenied("wake budget lock poisoned".to_owned()))?;
            budget
                .check_at(fire_at)
                .map_err(|e| SyncError::WakeDenied(e.to_string()))?;
        }

        let ticket = WakeTicket::new(at);
        let delay = (fire_at - now).to_std().unwrap_or_default();
        let events = self.events.clone();
        let budget = Arc::clone(&self.budget);
        let clock = Arc::clone(&self.clock);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired_at = clock.now();
            let kind = match budget.lock() {
                Ok(mut budget) => match budget.try_acquire_at(fired_at) {
                    Ok(()) => WakeKind::Fired,
                    Err(e) => {
                        warn!("wake suppressed at fire time: {e}");
                        WakeKind::Suppressed
                    }
                },
                Err(_) => {
                    warn!("wake budget lock poisoned, suppressing wake");
                    WakeKind::Suppressed
                }
            };
            let event = WakeEvent {
                ticket,
                fired_at,
                kind,
            };
            if events.send(event).is_err() {
                debug!("wake receiver closed");
            }
        });

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| SyncError::WakeDenied("wake slot lock poisoned".to_owned()))?;
        if let Some((previous, timer)) = pending.replace((ticket, handle)) {
            debug!(previous = %previous.at, "superseding outstanding wake");
            timer.abort();
        }
        Ok(ticket)
    }

    fn cancel(&self, ticket: &WakeTicket) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if pending.as_ref().is_some_and(|(current, _)| current.id == ticket.id)
            && let Some((_, timer)) = pending.take()
        {
            timer.abort();
        }
    }
}

impl Drop for TokioWakeFacility {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock()
            && let Some((_, timer)) = pending.take()
        {
            timer.abort();
        }
    }
}
