// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use log::{error, info, warn};
use rustls::crypto::{CryptoProvider, ring};
use tokio::time::sleep;

use rate_coordinator::cache::build_cache;
use rate_coordinator::calculator::DefaultRateCalculator;
use rate_coordinator::collector::registry::build_connector;
use rate_coordinator::config::{Config, load_config};
use rate_coordinator::coordinator::{CoordinatorOptions, DependencyGraph};
use rate_coordinator::metrics::METRICS;
use rate_coordinator::publisher::build_publisher;
use rate_coordinator::Coordinator;

const METRICS_PERIOD: Duration = Duration::from_secs(10);

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize cryptography backend (rustls) and logging
// - Load and validate configuration
// - Build cache, calculator, dependency graph and publisher
// - Register and start every enabled platform connector
// - Subscribe the configured instruments
// - Stop everything on Ctrl-C
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // rustls >= 0.23 requires an explicit CryptoProvider, installed
    // once before the first TLS connection.
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = load_config(&path).with_context(|| format!("loading {}", path))?;

    let coordinator = build_coordinator(&config).await?;

    for platform in config.platforms.iter().filter(|p| p.enabled) {
        match build_connector(platform) {
            Ok(connector) => coordinator.add_connector(connector),
            Err(e) => error!("Skipping platform {}: {}", platform.name, e),
        }
    }

    coordinator.start();

    for platform in config.platforms.iter().filter(|p| p.enabled) {
        for instrument in &platform.subscriptions {
            if !coordinator.subscribe_rate_on(&platform.name, instrument).await {
                warn!("Subscription {} on {} was refused", instrument, platform.name);
            }
        }
    }

    for instrument in &config.subscriptions {
        let accepted = coordinator.subscribe_rate(instrument).await;
        info!("Subscribed {} on {:?}", instrument, accepted);
    }

    // periodic, low-noise metrics reporter
    tokio::spawn(async {
        loop {
            sleep(METRICS_PERIOD).await;
            info!("[METRICS] {}", METRICS.summary());
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutdown requested");
    coordinator.stop().await;

    Ok(())
}

async fn build_coordinator(config: &Config) -> anyhow::Result<Arc<Coordinator>> {
    let cache = build_cache(&config.cache).await?;

    let calculator = DefaultRateCalculator::from_config(config.derived.as_deref().unwrap_or_default())?;
    let graph = DependencyGraph::new(config.dependency_rules())?;

    let publisher = build_publisher(&config.publisher, config.debug_log());

    Ok(Coordinator::new(
        cache,
        Arc::new(calculator),
        publisher,
        graph,
        CoordinatorOptions::from_config(config),
    ))
}
