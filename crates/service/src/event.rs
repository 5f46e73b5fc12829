//! Event pipeline: event shape, sink trait, and the fan-out (honeypot) /
//! consume (collector) delivery modes.

use std::net::IpAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::session::Session;

/// An event describing something that happened on an attack session. The
/// only public constructor takes a session reference, making it structurally
/// impossible to build an event that isn't attached to one.
#[derive(Debug, Clone)]
pub struct Event {
    session_id: Uuid,
    service: String,
    source_ip: IpAddr,
    source_port: u16,
    target_ip: IpAddr,
    target_port: u16,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
    pub request: Option<Vec<u8>>,
    pub response: Option<Vec<u8>>,
}

impl Event {
    pub fn new(session: &Session, kind: impl Into<String>) -> Self {
        Self {
            session_id: session.id,
            service: session.service().to_string(),
            source_ip: session.source_ip(),
            source_port: session.source_port(),
            target_ip: session.target_ip(),
            target_port: session.target_port(),
            kind: kind.into(),
            timestamp: Utc::now(),
            data: None,
            request: None,
            response: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_request(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.request = Some(bytes.into());
        self
    }

    pub fn with_response(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.response = Some(bytes.into());
        self
    }

    /// Renders the event to the JSON shape external sinks consume: base64
    /// request/response, empty string for absent optional fields.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "session": self.session_id.to_string(),
            "event": self.kind,
            "data": self.data.clone().unwrap_or(serde_json::Value::String(String::new())),
            "request": self.request.as_deref().map(|b| BASE64.encode(b)).unwrap_or_default(),
            "response": self.response.as_deref().map(|b| BASE64.encode(b)).unwrap_or_default(),
            "service": self.service,
            "source_ip": self.source_ip.to_string(),
            "source_port": self.source_port,
            "target_ip": self.target_ip.to_string(),
            "target_port": self.target_port,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// A bounded multi-producer multi-consumer channel shared by every session
/// in a process. Cloning is cheap; every clone publishes onto the same
/// underlying broadcast channel.
#[derive(Clone)]
pub struct EventChannel {
    sender: broadcast::Sender<Event>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No receivers yet (e.g. sinks still starting up) is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

/// An event consumer. `Setup`/`Stop` bracket the sink's lifetime; `log` is
/// the fan-out entrypoint, `consume` is the collector entrypoint. Sinks that
/// cannot be consumed (e.g. console) return an error from `consume`.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn log(&self, event: &Event);

    async fn consume(&self, _queue: mpsc::Receiver<Event>) -> anyhow::Result<()> {
        anyhow::bail!("this sink cannot be consumed");
    }

    async fn stop(&self) {}
}

/// Runs every sink's `Setup`, then spawns one feeder task per sink, each
/// reading the shared broadcast channel independently. A sink's failure is
/// caught and logged; other sinks keep running. Used in honeypot
/// (fan-out) mode.
pub async fn run_fanout(channel: EventChannel, sinks: Vec<Arc<dyn Sink>>) -> anyhow::Result<()> {
    for sink in &sinks {
        if let Err(e) = sink.setup().await {
            warn!("sink setup failed: {e}");
        }
    }

    let mut handles = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let mut rx = channel.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.log(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event sink lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Runs a single consumer loop over a queue fed by collector-mode sinks
/// (e.g. a remote bus feed), invoking `callback` per event. Per-event
/// callback failures are caught and logged; the loop continues. Used in
/// collector mode.
pub async fn run_consume<F>(mut queue: mpsc::Receiver<Event>, mut callback: F)
where
    F: FnMut(Event) -> anyhow::Result<()>,
{
    while let Some(event) = queue.recv().await {
        if let Err(e) = callback(event) {
            warn!("event callback failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;

    fn session() -> Arc<Session> {
        let mgr = SessionManager::new(EventChannel::new(16));
        mgr.get_or_create(
            "test",
            "127.0.0.1".parse().unwrap(),
            1,
            "127.0.0.1".parse().unwrap(),
            2,
        )
    }

    #[test]
    fn event_json_base64_round_trips_request() {
        let s = session();
        let event = Event::new(&s, "probe").with_request(b"hello".to_vec());
        let json = event.to_json();
        let encoded = json["request"].as_str().unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn event_json_empty_fields_are_empty_strings() {
        let s = session();
        let event = Event::new(&s, "probe");
        let json = event.to_json();
        assert_eq!(json["request"], "");
        assert_eq!(json["response"], "");
    }

    #[tokio::test]
    async fn fanout_delivers_to_every_sink() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl Sink for Counter {
            async fn log(&self, _event: &Event) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let channel = EventChannel::new(16);
        let counter = Arc::new(AtomicUsize::new(0));
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(Counter(counter.clone())),
            Arc::new(Counter(counter.clone())),
        ];

        let channel_for_run = channel.clone();
        let handle = tokio::spawn(run_fanout(channel_for_run, sinks));

        // give run_fanout's setup + subscribe a chance to run before publishing,
        // since broadcast only delivers to receivers that already subscribed.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let s = session();
        channel.publish(Event::new(&s, "probe"));

        drop(channel);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), handle).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
