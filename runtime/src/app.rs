use std::sync::Arc;

use tracing::{info, warn};

use lumi_common::{SyncConfig, DEMO_DEVICE_ADDR};

use crate::{
    discovery::DiscoveryListener, registry::DeviceRegistry, scan::ScanOrchestrator,
    session::open_session, store::AppStore,
};

/// Wire the whole runtime together and run until interrupted: registry,
/// discovery listener, liveness ticks, an initial scan, and a session
/// against the last selected device (or the demo device when none was
/// chosen yet).
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = SyncConfig::default();
    config.sanitize();

    let store = AppStore::new();
    let registry = DeviceRegistry::new(store.clone(), config.clone());
    if let Err(err) = registry.load().await {
        warn!(error = %err, "starting with an empty device list");
    }

    let listener = Arc::new(DiscoveryListener::new(
        registry.clone(),
        config.discovery_port,
    ));
    if let Err(err) = listener.start().await {
        warn!(error = %err, "discovery unavailable, running without broadcasts");
    }

    let liveness = registry.spawn_liveness_task();

    let scanner = Arc::new(ScanOrchestrator::new(
        registry.clone(),
        Arc::clone(&listener),
        config.clone(),
    ));
    scanner.start_scan();

    let selected = match store.load_selected().await {
        Ok(Some(addr)) => addr,
        Ok(None) => DEMO_DEVICE_ADDR,
        Err(err) => {
            warn!(error = %err, "failed to read selected device, using the demo device");
            DEMO_DEVICE_ADDR
        }
    };
    info!(device = %selected, "opening session");

    let session = open_session(selected, &config, Some(&listener)).await?;
    session.refresh_all().await;

    let snapshot = session.snapshot().await;
    info!(
        name = %snapshot.info.name,
        relay = snapshot.relay_on,
        preset = snapshot.active_preset().map(|p| p.name).unwrap_or("custom"),
        "session ready"
    );

    let mut devices = registry.subscribe();
    let mut scan_status = scanner.subscribe_status();
    loop {
        tokio::select! {
            changed = devices.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(devices = devices.borrow_and_update().len(), "device list changed");
            }
            changed = scan_status.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(message) = scan_status.borrow_and_update().clone() {
                    info!("{message}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    liveness.abort();
    listener.stop().await;
    if let Err(err) = registry.persist().await {
        warn!(error = %err, "failed to persist device list on shutdown");
    }
    Ok(())
}
