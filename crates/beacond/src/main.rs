//! beacond — Beacon discovery daemon.
//!
//! Publishes the resources listed in the config file, watches the
//! configured categories and logs every change until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};

use beacon_agent::{DiscoveryAgent, Subscription};
use beacon_core::config::BeaconConfig;

mod udp;

use udp::{UdpSettings, UdpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BeaconConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = BeaconConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BeaconConfig::default()
    });

    // Extra categories may be given on the command line.
    config.subscribe.extend(std::env::args().skip(1));

    let settings = UdpSettings::from_config(&config.network).context("invalid [network] config")?;
    tracing::info!(
        interface = config.network.interface.as_str(),
        port = settings.port,
        group = %settings.group,
        "beacond starting"
    );

    let transport = Arc::new(UdpTransport::new(settings));
    tracing::debug!(nonce = transport.nonce(), "udp transport created");
    let agent = DiscoveryAgent::new(transport, config.agent.clone())
        .context("failed to create discovery agent")?;

    // ── Publish ──────────────────────────────────────────────────────────────

    for entry in &config.publish {
        let attributes = (!entry.attributes.is_empty()).then(|| entry.attributes.clone());
        let resource = agent
            .publish(entry.category.clone(), entry.connection.clone(), attributes)
            .await
            .with_context(|| format!("failed to publish in category '{}'", entry.category))?;
        tracing::info!(
            resource = %resource.id(),
            category = resource.category(),
            connection = resource.connection(),
            "publishing"
        );
    }

    // ── Subscribe ────────────────────────────────────────────────────────────

    let mut subscriptions = Vec::with_capacity(config.subscribe.len());
    for category in &config.subscribe {
        let subscription = Arc::new(
            agent
                .subscribe(category)
                .with_context(|| format!("failed to subscribe to '{category}'"))?,
        );
        let weak = Arc::downgrade(&subscription);
        subscription.on_updated(move || {
            if let Some(subscription) = weak.upgrade() {
                log_resources(&subscription);
            }
        });
        subscriptions.push(subscription);
    }
    tracing::info!(
        published = config.publish.len(),
        subscribed = subscriptions.len(),
        "beacond running"
    );

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received");

    for subscription in &subscriptions {
        subscription.dispose();
    }
    agent.dispose().await;
    Ok(())
}

/// One line per resource, JSON-encoded so the output can be piped.
fn log_resources(subscription: &Subscription) {
    let resources = subscription.resources();
    tracing::info!(
        category = subscription.category(),
        serial = subscription.serial(),
        count = resources.len(),
        "category updated"
    );
    for resource in resources.iter() {
        match serde_json::to_string(&resource.info()) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode resource"),
        }
    }
}
