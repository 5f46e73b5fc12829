//! Logs each event through the `log` crate under a dedicated target,
//! colorized the same way the rest of the process's diagnostics are when
//! `--colored-console` is set (handled once, globally, by `simple_logger`).

use async_trait::async_trait;
use log::info;
use service::event::{Event, Sink};

#[derive(Default)]
pub struct ConsoleSink;

#[async_trait]
impl Sink for ConsoleSink {
    async fn log(&self, event: &Event) {
        info!(target: "honeysap::events", "{}", event.to_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::event::EventChannel;
    use service::session::SessionManager;

    #[tokio::test]
    async fn logs_without_panicking() {
        let manager = SessionManager::new(EventChannel::new(1));
        let session = manager.get_or_create(
            "svc".to_string(),
            "127.0.0.1".parse().unwrap(),
            1,
            "127.0.0.1".parse().unwrap(),
            2,
        );
        let event = Event::new(&session, "probe");
        ConsoleSink.log(&event).await;
    }
}
