//! Collector output: bridges the shared event channel into the configured
//! `eater_output` destinations (stdout, a file, or both).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use service::event::{Event, EventChannel};
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use crate::config::Config;

pub async fn run_output(channel: EventChannel, config: Arc<Config>) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(256);
    let mut broadcast_rx = channel.subscribe();

    let bridge = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("eater output lagged, dropped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let file = if config.eater_output.iter().any(|o| o == "file") {
        match OpenOptions::new().create(true).append(true).open(&config.eater_filename) {
            Ok(f) => Some(Mutex::new(f)),
            Err(e) => {
                warn!("eater: failed to open {}: {e}", config.eater_filename);
                None
            }
        }
    } else {
        None
    };
    let to_stdout = config.eater_output.iter().any(|o| o == "stdout");

    service::event::run_consume(rx, |event: Event| output(&event, to_stdout, file.as_ref())).await;

    let _ = bridge.await;
    Ok(())
}

fn output(event: &Event, to_stdout: bool, file: Option<&Mutex<File>>) -> anyhow::Result<()> {
    let line = event.to_json().to_string();
    if to_stdout {
        println!("{line}");
    }
    if let Some(file) = file {
        writeln!(file.lock(), "{line}")?;
    }
    Ok(())
}
