//! Appends each event's JSON representation, one per line, to a configured
//! file.

use std::fs::{File, OpenOptions};
use std::io::Write;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use service::event::{Event, Sink};

pub struct LogFileSink {
    file: Mutex<File>,
}

impl LogFileSink {
    pub fn new(filename: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(filename)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait]
impl Sink for LogFileSink {
    async fn log(&self, event: &Event) {
        let line = format!("{}\n", event.to_json());
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            warn!("log feed: write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::event::EventChannel;
    use service::session::SessionManager;

    #[tokio::test]
    async fn appends_one_line_per_event() {
        let dir = std::env::temp_dir().join(format!("honeysap-log-sink-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("events.log");

        let sink = LogFileSink::new(path.to_str().unwrap()).unwrap();
        let manager = SessionManager::new(EventChannel::new(1));
        let session = manager.get_or_create(
            "svc".to_string(),
            "127.0.0.1".parse().unwrap(),
            1,
            "127.0.0.1".parse().unwrap(),
            2,
        );
        sink.log(&Event::new(&session, "probe")).await;
        sink.log(&Event::new(&session, "probe2")).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
