//! Database feed. Persistence is out of scope; this sink logs a warning on
//! setup and, when `db_echo` is set, logs each event instead of storing it.

use async_trait::async_trait;
use log::warn;
use service::event::{Event, Sink};

pub struct DbSink {
    engine: Option<String>,
    echo: bool,
}

impl DbSink {
    pub fn new(engine: Option<String>, echo: bool) -> Self {
        Self { engine, echo }
    }
}

#[async_trait]
impl Sink for DbSink {
    async fn setup(&self) -> anyhow::Result<()> {
        warn!(
            "db feed configured (engine={:?}) but persistence is not implemented; events are logged and dropped",
            self.engine
        );
        Ok(())
    }

    async fn log(&self, event: &Event) {
        if self.echo {
            warn!("db feed (stub): {}", event.to_json());
        }
    }
}
