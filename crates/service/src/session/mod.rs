//! Session keying and the session registry.

use std::net::IpAddr;
use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::event::{Event, EventChannel};

/// The five fields that key an attack session. Two connections differing in
/// any one of these fields get distinct sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub service: String,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub target_ip: IpAddr,
    pub target_port: u16,
}

/// An attack session: identity, key, and a handle to the shared event
/// channel its events are appended to in order.
#[derive(Clone)]
pub struct Session {
    pub id: Uuid,
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    channel: EventChannel,
}

impl Session {
    fn new(key: SessionKey, channel: EventChannel) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            created_at: Utc::now(),
            channel,
        }
    }

    pub fn service(&self) -> &str {
        &self.key.service
    }

    pub fn source_ip(&self) -> IpAddr {
        self.key.source_ip
    }

    pub fn source_port(&self) -> u16 {
        self.key.source_port
    }

    pub fn target_ip(&self) -> IpAddr {
        self.key.target_ip
    }

    pub fn target_port(&self) -> u16 {
        self.key.target_port
    }

    /// Appends an event to this session's event channel. Accepts either a
    /// pre-built `Event` or a bare kind string, which is wrapped into an
    /// `Event` attached to this session -- mirroring the original's
    /// `add_event` accepting either shape.
    pub fn add_event(&self, event: impl Into<EventOrKind>) {
        let event = match event.into() {
            EventOrKind::Event(e) => e,
            EventOrKind::Kind(kind) => Event::new(self, kind),
        };
        self.channel.publish(event);
    }
}

/// Lets `add_event` accept either an already-built `Event` or a bare string
/// tag, auto-wrapping the latter.
pub enum EventOrKind {
    Event(Event),
    Kind(String),
}

impl From<Event> for EventOrKind {
    fn from(e: Event) -> Self {
        EventOrKind::Event(e)
    }
}

impl From<String> for EventOrKind {
    fn from(s: String) -> Self {
        EventOrKind::Kind(s)
    }
}

impl From<&str> for EventOrKind {
    fn from(s: &str) -> Self {
        EventOrKind::Kind(s.to_string())
    }
}

/// The session registry: atomic get-or-create keyed by `SessionKey`, owning
/// the shared event channel every session publishes onto.
pub struct SessionManager {
    sessions: RwLock<AHashMap<SessionKey, Arc<Session>>>,
    channel: EventChannel,
}

impl SessionManager {
    pub fn new(channel: EventChannel) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(AHashMap::new()),
            channel,
        })
    }

    /// Returns the session for `key`, creating it if this is the first
    /// lookup for that key. Concurrent callers for the same key observe the
    /// same `Session` instance.
    pub fn get_or_create(
        &self,
        service: impl Into<String>,
        source_ip: IpAddr,
        source_port: u16,
        target_ip: IpAddr,
        target_port: u16,
    ) -> Arc<Session> {
        let key = SessionKey {
            service: service.into(),
            source_ip,
            source_port,
            target_ip,
            target_port,
        };

        if let Some(existing) = self.sessions.read().get(&key) {
            return existing.clone();
        }

        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&key) {
            return existing.clone();
        }

        let session = Arc::new(Session::new(key.clone(), self.channel.clone()));
        sessions.insert(key, session.clone());
        session
    }

    pub fn event_channel(&self) -> EventChannel {
        self.channel.clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventChannel;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(EventChannel::new(64))
    }

    #[test]
    fn get_or_create_is_idempotent_for_same_key() {
        let mgr = manager();
        let a = mgr.get_or_create(
            "test",
            "127.0.0.1".parse().unwrap(),
            3200,
            "127.0.0.1".parse().unwrap(),
            3201,
        );
        let b = mgr.get_or_create(
            "test",
            "127.0.0.1".parse().unwrap(),
            3200,
            "127.0.0.1".parse().unwrap(),
            3201,
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn differing_field_yields_distinct_session() {
        let mgr = manager();
        let a = mgr.get_or_create(
            "test",
            "127.0.0.1".parse().unwrap(),
            3200,
            "127.0.0.1".parse().unwrap(),
            3201,
        );
        let b = mgr.get_or_create(
            "test",
            "127.0.0.1".parse().unwrap(),
            3200,
            "127.0.0.1".parse().unwrap(),
            3202, // target_port differs
        );
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn shared_channel_across_sessions() {
        let mgr = manager();
        let a = mgr.get_or_create(
            "test",
            "127.0.0.1".parse().unwrap(),
            1,
            "127.0.0.1".parse().unwrap(),
            2,
        );
        a.add_event("probe");
    }
}
