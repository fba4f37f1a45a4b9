//! CDC Merge Writer CLI

use anyhow::Context;
use cdc_merge_core::prelude::*;
use cdc_merge_writer::{checkpoint_from_config, BulkStore, JetStreamFeed, MergeEngine, SyncRunner};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cdc-merge-writer")]
#[command(about = "Applies a CDC change stream to a document store in merged batches")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CDC_MERGE_CONFIG")]
    config: Option<String>,

    /// NATS server URL (overrides feed.url)
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// Document store hosts, comma-separated (overrides store.hosts)
    #[arg(long, env = "STORE_HOSTS")]
    store_hosts: Option<String>,

    /// Target collection (overrides engine.collection)
    #[arg(long, env = "COLLECTION")]
    collection: Option<String>,

    /// Log level (overrides observability.log_level)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SyncConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(url) = args.nats_url {
        config.feed.url = url;
    }
    if let Some(hosts) = args.store_hosts {
        config.store.hosts = hosts.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(collection) = args.collection {
        config.engine.collection = collection;
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }

    init_tracing(&config.observability.log_level, &config.observability.log_format);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting cdc-merge-writer");

    config.validate()?;
    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    if config.observability.metrics.enabled {
        let addr: SocketAddr = config
            .observability
            .metrics
            .endpoint
            .parse()
            .context("parsing metrics endpoint")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    let store = Arc::new(BulkStore::new(config.store.clone())?);
    let checkpoint = checkpoint_from_config(&config.checkpoint)?;
    let engine = Arc::new(MergeEngine::from_config(store, checkpoint, &config));
    let feed = Arc::new(JetStreamFeed::new(config.feed.clone()));

    info!(
        collection = %config.engine.collection,
        stream = %config.feed.stream,
        ordering = ?config.planner.ordering,
        "Runner initialized, starting main loop"
    );

    let runner = SyncRunner::from_config(feed, engine, &config);
    if let Err(e) = runner.run().await {
        error!(error = %e, kind = e.kind(), "Runner failed");
        return Err(e.into());
    }

    info!("Runner stopped gracefully");
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}
