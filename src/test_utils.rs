//! Test doubles shared by unit and integration tests.

use crate::error::{Result, SyncError};
use crate::scheduler::wake::{WakeEvent, WakeFacility, WakeKind, WakeTicket};
use crate::transport::traits::{DeliveryChannel, DeliveryGuarantee};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Channel that keeps every payload it is handed.
pub struct RecordingChannel {
    guarantee: DeliveryGuarantee,
    sent: Mutex<Vec<Bytes>>,
}

impl RecordingChannel {
    pub fn new(guarantee: DeliveryGuarantee) -> Self {
        Self {
            guarantee,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Payloads sent so far, oldest first.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn id(&self) -> &'static str {
        self.guarantee.label()
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        self.guarantee
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("recording lock poisoned"))?
            .push(payload);
        Ok(())
    }
}

/// Channel whose transport always refuses.
pub struct FailingChannel {
    guarantee: DeliveryGuarantee,
}

impl FailingChannel {
    pub fn new(guarantee: DeliveryGuarantee) -> Self {
        Self { guarantee }
    }
}

#[async_trait]
impl DeliveryChannel for FailingChannel {
    fn id(&self) -> &'static str {
        self.guarantee.label()
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        self.guarantee
    }

    async fn send(&self, _payload: Bytes) -> anyhow::Result<()> {
        anyhow::bail!("transport unavailable")
    }
}

#[derive(Default)]
struct ManualWakeState {
    requests: Vec<DateTime<Utc>>,
    outstanding: Option<WakeTicket>,
    cancelled: Vec<WakeTicket>,
    deny_remaining: u32,
    deny_all: bool,
}

/// Wake facility driven by the test: requests are recorded and only fire
/// when [`ManualWakeFacility::fire`] is called.
pub struct ManualWakeFacility {
    state: Mutex<ManualWakeState>,
    events: mpsc::UnboundedSender<WakeEvent>,
    multiple_outstanding: bool,
}

impl ManualWakeFacility {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        Self::build(false)
    }

    /// Facility whose requests do not replace each other, so the holder has
    /// to cancel superseded tickets itself.
    pub fn with_multiple_outstanding() -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        Self::build(true)
    }

    fn build(multiple_outstanding: bool) -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(ManualWakeState::default()),
                events,
                multiple_outstanding,
            },
            rx,
        )
    }

    /// Deny the next `n` requests.
    pub fn deny_next(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.deny_remaining = n;
        }
    }

    /// Deny every request until switched off again.
    pub fn deny_all(&self, deny: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.deny_all = deny;
        }
    }

    /// Instants of every granted request, in order.
    pub fn requests(&self) -> Vec<DateTime<Utc>> {
        self.state
            .lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }

    /// Most recently granted request that has not fired or been cancelled.
    pub fn outstanding(&self) -> Option<WakeTicket> {
        self.state.lock().ok().and_then(|state| state.outstanding)
    }

    /// Tickets the holder withdrew, in order.
    pub fn cancelled(&self) -> Vec<WakeTicket> {
        self.state
            .lock()
            .map(|state| state.cancelled.clone())
            .unwrap_or_default()
    }

    /// Fire the outstanding request at `now`. Returns `false` if none was armed.
    pub fn fire(&self, now: DateTime<Utc>) -> bool {
        self.complete(now, WakeKind::Fired)
    }

    /// Withdraw the outstanding grant at `now` as if the OS budget ran out.
    pub fn suppress(&self, now: DateTime<Utc>) -> bool {
        self.complete(now, WakeKind::Suppressed)
    }

    fn complete(&self, now: DateTime<Utc>, kind: WakeKind) -> bool {
        let ticket = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.outstanding.take());
        match ticket {
            Some(ticket) => self
                .events
                .send(WakeEvent {
                    ticket,
                    fired_at: now,
                    kind,
                })
                .is_ok(),
            None => false,
        }
    }
}

impl WakeFacility for ManualWakeFacility {
    fn request_wake(&self, at: DateTime<Utc>) -> Result<WakeTicket> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SyncError::WakeDenied("manual facility lock poisoned".to_owned()))?;
        if state.deny_all {
            return Err(SyncError::WakeDenied("denied by test".to_owned()));
        }
        if state.deny_remaining > 0 {
            state.deny_remaining -= 1;
            return Err(SyncError::WakeDenied("denied by test".to_owned()));
        }
        let ticket = WakeTicket::new(at);
        state.requests.push(at);
        state.outstanding = Some(ticket);
        Ok(ticket)
    }

    fn cancel(&self, ticket: &WakeTicket) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.cancelled.push(*ticket);
        if state.outstanding.is_some_and(|t| t.id == ticket.id) {
            state.outstanding = None;
        }
    }

    fn allows_multiple_outstanding(&self) -> bool {
        self.multiple_outstanding
    }
}
