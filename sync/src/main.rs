//! Tether Sync - headless sync agent.
//!
//! Loads the local store and offline queue from the data directory, waits for
//! the remote to become reachable, runs one incremental sync and reports the
//! resulting statistics.

use std::sync::Arc;
use std::time::Duration;
use tether_engine::{ConflictResolver, Schema};
use tether_sync::{
    Components, Config, ConfigError, ConnectivityMonitor, EventBus, FileStorage, HttpRemote,
    RuntimeClock, SyncOrchestrator,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the health probe runs.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait for the remote before giving up.
const ONLINE_WAIT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let remote_url = config
        .remote_url
        .clone()
        .ok_or(ConfigError::MissingRemoteUrl)?;

    tracing::info!(
        "Starting Tether Sync against {} (data in {})",
        remote_url,
        config.data_dir.display()
    );

    let remote = Arc::new(HttpRemote::new(remote_url, config.request_timeout)?);
    let connectivity = ConnectivityMonitor::spawn(false, config.stability_window);
    let _probe = connectivity.spawn_probe(remote.clone(), PROBE_INTERVAL);

    let sync = SyncOrchestrator::new(Components {
        storage: Arc::new(FileStorage::new(config.data_dir.clone())),
        config,
        schema: Schema::dashboard(),
        resolver: ConflictResolver::default(),
        remote,
        connectivity: connectivity.clone(),
        clock: Arc::new(RuntimeClock::new()),
        events: EventBus::default(),
    });

    let mut events = sync.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!(event = %json, "sync event"),
                Err(e) => tracing::warn!(error = %e, "unserializable sync event"),
            }
        }
    });

    sync.ensure_initialized().await?;

    // Wait for the probe to commit an online state
    let mut online = connectivity.watch();
    if tokio::time::timeout(ONLINE_WAIT, online.wait_for(|online| *online))
        .await
        .is_err()
    {
        tracing::warn!("Remote unreachable after {:?}, exiting", ONLINE_WAIT);
        sync.shutdown().await;
        return Ok(());
    }

    let report = sync.start_incremental_sync().await?;
    tracing::info!(
        "Sync finished: {} replayed, {} failed, {} pulled, {} conflicts",
        report.completed,
        report.failed,
        report.pulled,
        report.conflicts
    );

    let stats = sync.get_sync_statistics().await;
    tracing::info!("{}", serde_json::to_string_pretty(&stats)?);

    sync.shutdown().await;
    Ok(())
}
