//! eru cluster daemon.
//!
//! Wires the store, the engine factory, and the resource plugins into
//! the cluster service and runs the periodic remap worker. The gRPC
//! surface is hosted elsewhere; this binary owns the scheduling core.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eru_core::cluster::Calcium;
use eru_core::worker::RemapWorker;
use eru_engine::MockEngineFactory;
use eru_resource::plugins::{CpuMemPlugin, VolumePlugin};
use eru_resource::{Aggregator, Plugin};
use eru_store::{MemStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting eru cluster service");

    let config = eru_core::config::load()?;
    info!(etcd = ?config.etcd, fan_out = config.fan_out, "configuration loaded");

    // dev-mode backends: the in-memory store and the mock engine satisfy
    // the same contracts an etcd-backed store and a real engine driver do
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let engines = Arc::new(MockEngineFactory::new());

    let aggregator = Aggregator::new(vec![
        Arc::new(CpuMemPlugin::new(
            store.clone(),
            config.scheduler.maxshare,
            config.scheduler.sharebase,
        )) as Arc<dyn Plugin>,
        Arc::new(VolumePlugin::new(store.clone())),
    ]);
    info!(plugins = aggregator.plugins().len(), "resource plugins registered");

    let remap_interval = Duration::from_secs(config.timeout.remap.max(1));
    let calcium = Calcium::new(config, store, engines, aggregator);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = RemapWorker::new(calcium.clone(), remap_interval);
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;

    Ok(())
}
