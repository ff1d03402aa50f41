//! Loopback simulation of a producer and consumer.
//!
//! Publishes a random-walk reading every few seconds over the in-process
//! transport and logs what the consumer merges, plans and displays.
//!
//! Usage: `glance-sim [config.toml]`. Logs go to stderr; set `RUST_LOG` to
//! adjust verbosity.

use glance_sync::config::SyncConfig;
use glance_sync::consumer::{ConsumerDeps, ConsumerRuntime};
use glance_sync::freshness::age_minutes;
use glance_sync::producer::{Reading, SnapshotProducer};
use glance_sync::reload::ChannelReloadSignal;
use glance_sync::scheduler::TokioWakeFacility;
use glance_sync::snapshot::Trend;
use glance_sync::store::{FileStore, MemoryStore, SharedStore};
use glance_sync::transport::{TransportDispatcher, loopback_link};
use glance_sync::{Clock, SystemClock};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const READING_INTERVAL: Duration = Duration::from_secs(5);

fn load_config() -> anyhow::Result<SyncConfig> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(SyncConfig::default_config_path);
    if path.exists() {
        tracing::info!(path = %path.display(), "loading config");
        Ok(SyncConfig::from_file(&path)?)
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Ok(SyncConfig::default())
    }
}

fn trend_for(delta: f64) -> Trend {
    match delta {
        d if d >= 10.0 => Trend::DoubleUp,
        d if d >= 5.0 => Trend::SingleUp,
        d if d >= 2.0 => Trend::FortyFiveUp,
        d if d > -2.0 => Trend::Flat,
        d if d > -5.0 => Trend::FortyFiveDown,
        d if d > -10.0 => Trend::SingleDown,
        _ => Trend::DoubleDown,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("glance_sync=info,glance_sim=info")
                }),
        )
        .init();

    let config = load_config()?;
    config.validate()?;

    let store: Arc<dyn SharedStore> = match &config.store.dir {
        Some(_) => Arc::new(FileStore::open(config.store.resolved_dir())?),
        None => Arc::new(MemoryStore::new()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (producer_end, consumer_end) = loopback_link(&config.transport);
    let (facility, wakes) =
        TokioWakeFacility::new(config.wake.max_wakes_per_hour, Arc::clone(&clock));
    let (reload, mut reloads) = ChannelReloadSignal::new();

    let consumer = ConsumerRuntime::start(
        &config,
        consumer_end,
        ConsumerDeps {
            store,
            facility: Arc::new(facility),
            wakes,
            reload: Arc::new(reload),
            clock: Arc::clone(&clock),
        },
    )
    .await?;

    let presence = producer_end.presence.clone();
    let mut producer = SnapshotProducer::new(
        TransportDispatcher::from_endpoints(&producer_end),
        config.safe_range.clone(),
    );

    let mut ticker = tokio::time::interval(READING_INTERVAL);
    let mut value: f64 = 120.0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let step: f64 = rand::thread_rng().gen_range(-12.0..=12.0);
                value = (value + step).clamp(40.0, 400.0);
                let mut reading = Reading::new(value.round(), clock.now());
                reading.trend = trend_for(step);
                if let Some(outcome) = producer.observe(reading, presence.reachability()).await
                    && !outcome.delivered_any()
                {
                    tracing::warn!("reading not delivered on any channel");
                }
            }
            Some(()) = reloads.recv() => {
                let status = consumer.status().await;
                match &status.snapshot {
                    Some(snapshot) => tracing::info!(
                        value = %snapshot.display_value(),
                        trend = snapshot.trend().arrow(),
                        age_mins = age_minutes(clock.now(), snapshot.reading_time()),
                        tier = %status.tier,
                        "display reloaded"
                    ),
                    None => tracing::info!(tier = %status.tier, "display reloaded, no data"),
                }
            }
        }
    }

    let stats = consumer.shutdown().await?;
    tracing::info!(
        applied = stats.applied,
        rejected = stats.rejected_not_newer + stats.rejected_malformed + stats.rejected_store,
        "simulation finished"
    );
    Ok(())
}
