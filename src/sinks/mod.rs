//! Event sinks, one per configured feed. `build_sinks` is the explicit
//! registry lookup from a `FeedEntry` to its concrete `Sink`.

pub mod console;
pub mod db;
pub mod hpfeed;
pub mod log_file;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use service::event::Sink;

use crate::config::{FeedEntry, FeedKind};

pub fn build_sinks(feeds: &[FeedEntry]) -> anyhow::Result<Vec<Arc<dyn Sink>>> {
    feeds.iter().filter(|f| f.enabled).map(|f| build_sink(&f.kind)).collect()
}

fn build_sink(kind: &FeedKind) -> anyhow::Result<Arc<dyn Sink>> {
    Ok(match kind {
        FeedKind::Console => Arc::new(console::ConsoleSink) as Arc<dyn Sink>,
        FeedKind::Log { log_filename } => {
            let filename = log_filename.clone().unwrap_or_else(|| "honeysap-events.log".to_string());
            Arc::new(log_file::LogFileSink::new(&filename).context("opening event log file")?) as Arc<dyn Sink>
        }
        FeedKind::Db { db_engine, db_echo } => {
            Arc::new(db::DbSink::new(db_engine.clone(), *db_echo)) as Arc<dyn Sink>
        }
        FeedKind::Hpfeed { feed_host, feed_port, feed_ident, feed_secret, feed_timeout, channels } => {
            Arc::new(hpfeed::HpfeedSink::new(
                feed_host.clone(),
                *feed_port,
                feed_ident.clone(),
                feed_secret.clone(),
                feed_timeout.map(Duration::from_secs),
                channels.clone().unwrap_or_else(|| vec!["honeysap.events".to_string()]),
            )) as Arc<dyn Sink>
        }
    })
}
