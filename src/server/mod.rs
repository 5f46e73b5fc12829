//! The TCP service runtime: accept loop, per-connection client registry,
//! virtual-service dispatch, and the service manager that owns every
//! configured service and answers `FindByAddress` lookups.

pub mod dispatcher;
pub mod forwarder;
pub mod router;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use service::datastore::Datastore;
use service::session::SessionManager;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::{Config, ServiceEntry, ServiceKind};

/// Per-connection bookkeeping owned by a TCP service. Not every field is
/// meaningful to every service kind; the router is the only handler that
/// populates the routing-related fields.
#[derive(Debug, Clone, Default)]
pub struct ClientRecord {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub routed: bool,
    pub connected: bool,
    pub traced: bool,
    pub partner: Option<String>,
    pub service: u16,
    pub target_service: Option<String>,
    pub talk_mode: Option<codec::router::TalkMode>,
    pub ni_version: Option<u8>,
    pub context_id: Option<String>,
    pub terminal: Option<String>,
    pub init: bool,
}

impl ClientRecord {
    /// `routed => target_service != nil && partner != nil && service != 0`.
    #[cfg(test)]
    fn invariant_holds(&self) -> bool {
        !self.routed || (self.target_service.is_some() && self.partner.is_some() && self.service != 0)
    }
}

/// The per-service map of live connections, keyed by peer address.
#[derive(Default)]
pub struct ClientMap {
    clients: Mutex<AHashMap<SocketAddr, ClientRecord>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ClientMap {
    pub fn insert(&self, peer: SocketAddr) -> ClientRecord {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let record = ClientRecord {
            id,
            peer: Some(peer),
            connected: true,
            ..Default::default()
        };
        self.clients.lock().insert(peer, record.clone());
        record
    }

    pub fn update(&self, peer: &SocketAddr, f: impl FnOnce(&mut ClientRecord)) {
        if let Some(record) = self.clients.lock().get_mut(peer) {
            f(record);
        }
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<ClientRecord> {
        self.clients.lock().get(peer).cloned()
    }

    pub fn remove(&self, peer: &SocketAddr) {
        self.clients.lock().remove(peer);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ClientRecord> {
        self.clients.lock().values().cloned().collect()
    }
}

/// Collaborators every handler task is given access to.
#[derive(Clone)]
pub struct ServiceContext {
    pub datastore: Arc<dyn Datastore>,
    pub session_manager: Arc<SessionManager>,
    pub service_manager: std::sync::Weak<ServiceManager>,
}

/// A registered service: either bound (accepting real connections) or
/// virtual (reachable only by `handle_virtual` from another service, such
/// as the router handing off a routed connection).
#[async_trait]
pub trait Service: Send + Sync {
    fn alias(&self) -> &str;
    fn listener_address(&self) -> IpAddr;
    fn listener_port(&self) -> u16;
    fn is_virtual(&self) -> bool;
    fn enabled(&self) -> bool;

    /// Runs the accept loop until `stop` fires. Virtual services return
    /// immediately; they never bind.
    async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) -> anyhow::Result<()>;

    /// Handles one connection directly, reusing the same per-connection
    /// logic `run`'s accept loop would otherwise dispatch to -- the same
    /// handler, a different entrypoint.
    async fn handle_virtual(self: Arc<Self>, stream: TcpStream, peer: SocketAddr);
}

/// Owns every configured service, answers `FindByAddress`, and coordinates
/// startup/shutdown with a small grace period.
pub struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
    stop_tx: watch::Sender<bool>,
}

impl ServiceManager {
    pub fn from_config(
        config: &Config,
        session_manager: Arc<SessionManager>,
        datastore: Arc<dyn Datastore>,
    ) -> anyhow::Result<Arc<Self>> {
        let (stop_tx, _) = watch::channel(false);

        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let ctx = ServiceContext {
                datastore,
                session_manager,
                service_manager: weak.clone(),
            };

            let services = config
                .services
                .iter()
                .filter(|entry| entry.enabled)
                .map(|entry| build_service(entry, ctx.clone()))
                .collect();

            Self { services, stop_tx }
        })
        .pipe_ok()
    }

    /// Registered service whose configured listener matches `(host, port)`,
    /// regardless of whether it actually bound (virtual services included).
    pub fn find_by_address(&self, host: IpAddr, port: u16) -> Option<Arc<dyn Service>> {
        self.services
            .iter()
            .find(|s| s.listener_address() == host && s.listener_port() == port)
            .cloned()
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<Arc<dyn Service>> {
        self.services.iter().find(|s| s.alias() == alias).cloned()
    }

    /// Runs every service concurrently until one of them errors, then signals
    /// stop to the rest and waits up to a grace period before returning.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut handles = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let service = service.clone();
            let stop_rx = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.clone().run(stop_rx).await {
                    warn!("service {} stopped with error: {e}", service.alias());
                }
            }));
        }

        tokio::signal::ctrl_c().await.ok();
        info!("shutting down, grace period 2s");
        self.stop();

        let grace = tokio::time::sleep(Duration::from_secs(2));
        tokio::pin!(grace);
        for handle in handles {
            tokio::select! {
                _ = handle => {}
                _ = &mut grace => {
                    warn!("grace period elapsed, forcing shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

// Small helper so `Arc::new_cyclic` (which returns the value directly, not a
// Result) composes with `?` at the call site above.
trait PipeOk: Sized {
    fn pipe_ok(self) -> anyhow::Result<Self> {
        Ok(self)
    }
}
impl<T> PipeOk for Arc<T> {}

fn build_service(entry: &ServiceEntry, ctx: ServiceContext) -> Arc<dyn Service> {
    match &entry.kind {
        ServiceKind::Router(cfg) => Arc::new(router::RouterService::new(entry, cfg.clone(), ctx)),
        ServiceKind::Dispatcher(cfg) => {
            Arc::new(dispatcher::DispatcherService::new(entry, cfg.clone(), ctx))
        }
        ServiceKind::Forwarder(cfg) => {
            Arc::new(forwarder::ForwarderService::new(entry, cfg.clone(), ctx))
        }
    }
}

/// Binds `addr` and runs `accept_fn` per connection, honoring `stop`. Shared
/// boilerplate for every non-virtual service's `run`.
pub async fn accept_loop<F, Fut>(
    addr: SocketAddr,
    mut stop: watch::Receiver<bool>,
    accept_fn: F,
) -> anyhow::Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    let accept_fn = Arc::new(accept_fn);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let accept_fn = accept_fn.clone();
                        tokio::spawn(async move { accept_fn(stream, peer).await });
                    }
                    Err(e) => {
                        warn!("accept error on {addr}: {e}");
                        // Acceptance failures never stop the accept loop.
                    }
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routed_invariant_requires_target_and_partner() {
        let mut record = ClientRecord::default();
        assert!(record.invariant_holds());

        record.routed = true;
        assert!(!record.invariant_holds());

        record.partner = Some("10.0.0.1".into());
        record.target_service = Some("router".into());
        record.service = 3200;
        assert!(record.invariant_holds());
    }

    #[test]
    fn client_map_insert_and_remove() {
        let map = ClientMap::default();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        map.insert(peer);
        assert_eq!(map.len(), 1);
        map.remove(&peer);
        assert!(map.is_empty());
    }
}
