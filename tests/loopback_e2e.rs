//! End-to-end producer → loopback transport → consumer runtime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, TimeDelta, Utc};
use glance_sync::clock::ManualClock;
use glance_sync::config::SyncConfig;
use glance_sync::consumer::{ConsumerDeps, ConsumerHandle, ConsumerRuntime};
use glance_sync::freshness::FreshnessTier;
use glance_sync::producer::{Reading, SnapshotProducer};
use glance_sync::reload::CountingReloadSignal;
use glance_sync::store::MemoryStore;
use glance_sync::test_utils::ManualWakeFacility;
use glance_sync::transport::{TransportDispatcher, loopback_link};
use std::sync::Arc;
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn stored_value(handle: &ConsumerHandle) -> Option<f64> {
    handle.status().await.snapshot.map(|s| s.value())
}

#[tokio::test]
async fn offline_backlog_then_live_updates_converge_on_newest() {
    let config = SyncConfig::default();
    let (producer_end, consumer_end) = loopback_link(&config.transport);
    let presence = producer_end.presence.clone();
    let mut producer = SnapshotProducer::new(
        TransportDispatcher::from_endpoints(&producer_end),
        config.safe_range.clone(),
    );

    // Consumer not running: durable and context only.
    for (i, value) in [110.0, 116.0, 124.0].into_iter().enumerate() {
        let at = t0() + TimeDelta::minutes(5 * i as i64);
        let outcome = producer
            .observe(Reading::new(value, at), presence.reachability())
            .await
            .unwrap();
        assert!(outcome.durable.is_sent());
        assert!(!outcome.immediate.is_sent());
    }

    let clock = Arc::new(ManualClock::new(t0() + TimeDelta::minutes(11)));
    let (facility, wakes) = ManualWakeFacility::new();
    let facility = Arc::new(facility);
    let reload = CountingReloadSignal::new();
    let handle = ConsumerRuntime::start(
        &config,
        consumer_end,
        ConsumerDeps {
            store: Arc::new(MemoryStore::new()),
            facility: facility.clone(),
            wakes,
            reload: Arc::new(reload.clone()),
            clock: clock.clone(),
        },
    )
    .await
    .unwrap();

    // The context slot already carried the newest value at cold start.
    assert_eq!(stored_value(&handle).await, Some(124.0));
    assert_eq!(handle.status().await.tier, FreshnessTier::Fresh);
    assert!(presence.is_live());

    // Live: an urgent reading goes out on every channel.
    let outcome = producer
        .observe(
            Reading::new(250.0, t0() + TimeDelta::minutes(15)),
            presence.reachability(),
        )
        .await
        .unwrap();
    assert!(outcome.immediate.is_sent());

    let handle_ref = &handle;
    wait_until(|| async move { stored_value(handle_ref).await == Some(250.0) }).await;
    let status = handle.status().await;
    assert!(status.snapshot.as_ref().unwrap().urgent());
    assert!(status.plan.is_urgent());

    // The urgent merge pulled the outstanding wake onto the urgent cadence.
    let urgent_wake = t0() + TimeDelta::minutes(16);
    let facility_ref = facility.as_ref();
    wait_until(|| async move { facility_ref.outstanding().is_some_and(|t| t.at == urgent_wake) })
        .await;

    // A fired wake re-arms and invalidates the display.
    let reloads_before = reload.count();
    clock.set(urgent_wake);
    assert!(facility.fire(urgent_wake));
    reload.wait_for(reloads_before + 1).await;
    wait_until(|| async move { facility_ref.outstanding().is_some() }).await;

    let stats = handle.shutdown().await.unwrap();
    assert!(stats.applied >= 1);
    assert!(!presence.is_live());
}

#[tokio::test]
async fn unreachable_consumer_skips_immediate_channel() {
    let config = SyncConfig::default();
    let (producer_end, _consumer_end) = loopback_link(&config.transport);
    let mut producer = SnapshotProducer::new(
        TransportDispatcher::from_endpoints(&producer_end),
        config.safe_range.clone(),
    );

    let outcome = producer
        .observe(Reading::new(100.0, t0()), producer_end.presence.reachability())
        .await
        .unwrap();
    assert!(outcome.delivered_any());
    assert!(!outcome.immediate.is_sent());
}
