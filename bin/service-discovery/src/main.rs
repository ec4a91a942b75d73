use anyhow::{Context, Result};
use discovery_core::{DiscoveryMetrics, KvDiscovery, Subscription};
use discovery_store::{consul, memory, new_store};
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::init as tracing_init;

mod settings;

use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting service-discovery daemon...");

    consul::register();
    memory::register();

    let settings = Settings::from_env()?;
    info!(
        "Watching {} on {} store at {:?}",
        settings.watch_path(),
        settings.backend,
        settings.addrs
    );

    let metrics = DiscoveryMetrics::new()?;
    let store = new_store(settings.backend, &settings.addrs, &settings.store)?;
    let discovery = KvDiscovery::builder(&settings.watch_path())
        .retries_after_watch_failed(settings.retries_after_watch_failed)
        .metrics(metrics.clone())
        .build(store)
        .await?;

    let services = discovery.get_services().await;
    info!("Discovered {} services under {}", services.len(), discovery.base_path());

    let subscription = discovery.subscribe().await;
    tokio::spawn(log_changes(subscription));

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                if !discovery.is_watching() {
                    error!("Discovery for {} is no longer watching", discovery.base_path());
                    break;
                }
                let count = discovery.get_services().await.len();
                debug!("Service cache has {} services", count);
            }
        }
    }

    shutdown(&discovery, &metrics).await
}

/// Stop the watcher and report how its loop ended, so a watch that was given
/// up makes the process fail
async fn shutdown(discovery: &KvDiscovery, metrics: &DiscoveryMetrics) -> Result<()> {
    discovery.close();
    let ended = discovery
        .wait()
        .await
        .with_context(|| format!("Discovery for {} failed", discovery.base_path()));
    debug!("Final metrics:\n{}", metrics.gather()?);
    ended
}

async fn log_changes(mut subscription: Subscription) {
    while let Some(services) = subscription.recv().await {
        info!("Service set changed: {} services", services.len());
        for pair in services.iter() {
            debug!("  {} => {}", pair.key, pair.value);
        }
    }
    debug!("Change subscription ended");
}
