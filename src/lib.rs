pub mod cli;
pub mod config;
pub mod eater;
pub mod server;
pub mod sinks;

use std::sync::Arc;

use anyhow::Context;
use service::datastore::{Datastore, MemoryDataStore};
use service::event::EventChannel;
use service::session::SessionManager;

use crate::config::Config;
use crate::server::ServiceManager;

pub const SOFTWARE: &str = concat!("honeysap/", env!("CARGO_PKG_VERSION"));

/// Default capacity of the process-wide event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Builds the shared collaborators (datastore, session registry, service
/// manager) and runs every enabled service to completion in honeypot
/// (fan-out) mode: events are delivered to every configured sink
/// independently.
pub async fn run_honeypot(config: Arc<Config>) -> anyhow::Result<()> {
    let channel = EventChannel::new(EVENT_CHANNEL_CAPACITY);
    let session_manager = SessionManager::new(channel.clone());
    let datastore: Arc<dyn Datastore> = MemoryDataStore::new();
    datastore.load_config(&serde_json::json!({ "datastore_class": config.datastore_class }));

    let sinks = crate::sinks::build_sinks(&config.feeds)?;
    let fanout = tokio::spawn(service::event::run_fanout(channel.clone(), sinks));

    let manager = ServiceManager::from_config(&config, session_manager, datastore)
        .context("building service manager")?;
    manager.run().await?;

    drop(channel);
    let _ = fanout.await;
    Ok(())
}

/// Like `run_honeypot`, but additionally bridges every event to the
/// `eater_output` destinations (stdout and/or a file) -- collector mode.
pub async fn run_eater(config: Arc<Config>) -> anyhow::Result<()> {
    let channel = EventChannel::new(EVENT_CHANNEL_CAPACITY);
    let session_manager = SessionManager::new(channel.clone());
    let datastore: Arc<dyn Datastore> = MemoryDataStore::new();
    datastore.load_config(&serde_json::json!({ "datastore_class": config.datastore_class }));

    let sinks = crate::sinks::build_sinks(&config.feeds)?;
    let fanout = tokio::spawn(service::event::run_fanout(channel.clone(), sinks));
    let collector = tokio::spawn(crate::eater::run_output(channel.clone(), config.clone()));

    let manager = ServiceManager::from_config(&config, session_manager, datastore)
        .context("building service manager")?;
    manager.run().await?;

    drop(channel);
    let _ = fanout.await;
    let _ = collector.await;
    Ok(())
}
