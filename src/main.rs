use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use consul_gclb_sync::cloud::gce::GceCloud;
use consul_gclb_sync::cloud::Cloud;
use consul_gclb_sync::config::Config;
use consul_gclb_sync::dispatcher::Dispatcher;
use consul_gclb_sync::registry::consul::ConsulRegistry;
use consul_gclb_sync::tag::TagParser;

/// Synchronizes Consul-registered services onto a Google Cloud HTTP(S) load
/// balancer.
#[derive(Parser, Debug)]
#[command(name = "consul-gclb-sync", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    info!("reading configuration from {:?}", cli.config);
    let config = Arc::new(Config::from_file(&cli.config)?);

    info!(
        "initializing cloud client (project: {}, network: {}, zone: {})",
        config.cloud.project, config.cloud.network, config.cloud.zone
    );
    let cloud: Arc<dyn Cloud> = Arc::new(GceCloud::new(&config.cloud)?);
    let parser = Arc::new(TagParser::new(&config.tag_prefix));

    info!("connecting to Consul at {}", config.consul.url);
    let registry = ConsulRegistry::new(&config.consul.url, config.tag_names())?;

    let (updates_tx, updates_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    info!("listening for service updates");
    let watcher = tokio::spawn(registry.run(updates_tx, shutdown_rx.clone()));
    let dispatcher = Dispatcher::new(config, parser, cloud);
    let dispatcher = tokio::spawn(dispatcher.run(updates_rx, shutdown_rx));

    wait_for_signal().await;

    info!("terminating");
    let _ = shutdown_tx.send(());
    let _ = watcher.await;
    let _ = dispatcher.await;
    info!("terminated");

    Ok(())
}

async fn wait_for_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}
