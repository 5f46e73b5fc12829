//! Router protocol state machine: route validation, route-table lookup,
//! talk-mode negotiation, control/admin/info handling, and promotion of an
//! accepted connection to a virtual service.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codec::niframe::{read_frame, write_frame};
use codec::router::{
    self, ADM_INFO_REQUEST, ADM_TRACE_CONNECTION, NI_VERSION_REQUEST, RC_ADMIN_DENIED, RC_TIMEOUT,
    RouteRequest, RouterMessage, TalkMode,
};
use codec::DEFAULT_MAX_FRAME;
use log::{info, warn};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::{RouterConfig, ServiceEntry};
use crate::server::{ClientMap, Service, ServiceContext, accept_loop};

/// Router NI protocol version this honeypot speaks, absent `cfg.router_version`.
const DEFAULT_SERVER_NI_VERSION: u8 = 39;

pub struct RouterService {
    alias: String,
    listener_address: IpAddr,
    listener_port: u16,
    is_virtual: bool,
    enabled: bool,
    cfg: RouterConfig,
    ctx: ServiceContext,
    clients: Arc<ClientMap>,
    route_table: Arc<service::routing::RouteTable>,
    timeout: Duration,
}

impl RouterService {
    pub fn new(entry: &ServiceEntry, cfg: RouterConfig, ctx: ServiceContext) -> Self {
        let entries: Vec<String> = cfg
            .route_table
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let route_table = Arc::new(service::routing::RouteTable::build(&entries));

        Self {
            alias: entry.alias.clone().unwrap_or_else(|| "router".to_string()),
            listener_address: entry.listener_address,
            listener_port: entry.listener_port,
            is_virtual: entry.r#virtual,
            enabled: entry.enabled,
            timeout: Duration::from_secs(cfg.timeout),
            cfg,
            ctx,
            clients: Arc::new(ClientMap::default()),
            route_table,
        }
    }

    fn server_ni_version(&self) -> u8 {
        self.cfg.router_version.unwrap_or(DEFAULT_SERVER_NI_VERSION)
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.clients.insert(peer);
        let deadline = tokio::time::Instant::now() + self.timeout;
        // Outcome::Routed means ownership of the connection already moved to
        // the target service; nothing left to close here either way.
        let _ = self.clone().handle_pending(stream, peer, deadline).await;

        self.clients.remove(&peer);
    }

    /// Reads route-pending messages until a route is accepted, the
    /// connection closes, or `deadline` passes without one -- the latter
    /// sends the `-5` timeout error before closing.
    async fn handle_pending(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        deadline: tokio::time::Instant,
    ) -> Outcome {
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let resp = router::encode_error(RC_TIMEOUT, "connection timed out");
                let _ = write_frame(&mut stream, &resp).await;
                return Outcome::Closed;
            }

            let payload = match tokio::time::timeout(remaining, read_frame(&mut stream, DEFAULT_MAX_FRAME)).await {
                Ok(Ok(Some(p))) => p,
                Ok(Ok(None)) => return Outcome::Closed,
                Ok(Err(e)) => {
                    warn!("router: frame read error from {peer}: {e}");
                    return Outcome::Closed;
                }
                Err(_) => {
                    let resp = router::encode_error(RC_TIMEOUT, "connection timed out");
                    let _ = write_frame(&mut stream, &resp).await;
                    return Outcome::Closed;
                }
            };

            let message = match router::decode(&payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!("router: decode error from {peer}: {e}");
                    continue;
                }
            };

            match message {
                RouterMessage::Control { ni_version } => {
                    self.clients.update(&peer, |c| c.ni_version = Some(ni_version));
                    if ni_version == NI_VERSION_REQUEST {
                        let resp = router::encode_version_response(self.server_ni_version());
                        let _ = write_frame(&mut stream, &resp).await;
                    } else {
                        let resp = router::encode_error(
                            router::RC_INVALID_VERSION,
                            "invalid client version",
                        );
                        let _ = write_frame(&mut stream, &resp).await;
                    }
                }
                RouterMessage::Admin { command, body } => {
                    if !self.cfg.external_admin {
                        let resp = router::encode_error(RC_ADMIN_DENIED, "Admin from remote denied");
                        let _ = write_frame(&mut stream, &resp).await;
                        continue;
                    }

                    match command {
                        ADM_INFO_REQUEST => {
                            if self.info_password_matches(&body) {
                                let resp = self.build_info_response();
                                let _ = write_frame(&mut stream, &resp).await;
                            } else {
                                let resp = router::encode_error(RC_ADMIN_DENIED, "route denied");
                                let _ = write_frame(&mut stream, &resp).await;
                            }
                            return Outcome::Closed;
                        }
                        ADM_TRACE_CONNECTION => {
                            // Preserves the original's bug: only the first
                            // client id in the request is traced.
                            if let Some(&id) = body.first() {
                                self.clients.snapshot().iter().find(|c| c.id == id as u64).inspect(|_| {
                                    info!("router: tracing client id {id}");
                                });
                                self.mark_traced(id as u64);
                            }
                        }
                        other => {
                            info!("router: unhandled admin command {other} from {peer}");
                        }
                    }
                }
                RouterMessage::Route(req) => match self.handle_route(&mut stream, peer, req).await {
                    RouteOutcome::Closed => return Outcome::Closed,
                    RouteOutcome::RouteTo(target) => {
                        // Ownership of the socket transfers to the target
                        // service; the router must not touch it again.
                        target.handle_virtual(stream, peer).await;
                        return Outcome::Routed;
                    }
                },
                RouterMessage::Unknown => {
                    info!("router: unknown message from {peer}");
                }
            }
        }
    }

    fn info_password_matches(&self, body: &[u8]) -> bool {
        match &self.cfg.info_password {
            None => true,
            Some(expected) => {
                let given = String::from_utf8_lossy(body);
                given.trim() == expected.trim()
            }
        }
    }

    fn mark_traced(&self, id: u64) {
        let clients = self.clients.snapshot();
        if let Some(record) = clients.iter().find(|c| c.id == id) {
            if let Some(peer) = record.peer {
                self.clients.update(&peer, |c| c.traced = true);
            }
        }
    }

    fn build_info_response(&self) -> Vec<u8> {
        let clients = self.clients.snapshot();
        let mut out = Vec::new();

        for c in &clients {
            out.extend(format!("client {} {:?}\n", c.id, c.peer).into_bytes());
        }

        out.extend(
            format!(
                "server pid={} ppid={:?} started_on={} port={} parent_port={:?}\n",
                self.cfg.pid.unwrap_or(0),
                self.cfg.parent_pid,
                self.cfg.time_started.unwrap_or(0),
                self.listener_port,
                self.cfg.parent_port,
            )
            .into_bytes(),
        );

        out.extend(format!("Total no. of clients: {}\x00", clients.len()).into_bytes());
        out.extend(
            format!(
                "Working directory   : {}\x00",
                self.cfg
                    .route_table_working_directory
                    .clone()
                    .unwrap_or_default()
            )
            .into_bytes(),
        );
        out.extend(
            format!(
                "Routtab             : {}\x00",
                self.cfg.route_table_filename.clone().unwrap_or_default()
            )
            .into_bytes(),
        );

        out
    }

    /// Validates and resolves a route request, returning what the caller
    /// should do next. On `RouteOutcome::RouteTo`, the caller still owns
    /// `stream` and must hand it to the target's `handle_virtual`.
    async fn handle_route(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        req: RouteRequest,
    ) -> RouteOutcome {
        if let Err(reason) = validate_route(&req, &self.listener_address, self.listener_port, self.server_ni_version()) {
            warn!("router: route validation failed from {peer}: {reason}");
            let resp = router::encode_error(RC_ADMIN_DENIED, &reason);
            let _ = write_frame(stream, &resp).await;
            return RouteOutcome::Closed;
        }

        let hop = match req.hops.get(req.route_rest_nodes as usize) {
            Some(h) => h,
            None => {
                let resp = router::encode_error(RC_ADMIN_DENIED, "route permission denied");
                let _ = write_frame(stream, &resp).await;
                return RouteOutcome::Closed;
            }
        };

        let session = self.ctx.session_manager.get_or_create(
            self.alias.clone(),
            peer.ip(),
            peer.port(),
            hop.host.parse::<IpAddr>().unwrap_or(self.listener_address),
            hop.port,
        );

        let (action, mode, password) = self.route_table.lookup(&hop.host, hop.port);

        if action == service::routing::Action::Deny {
            session.add_event(
                service::event::Event::new(&session, "Route request denied").with_data(json!({
                    "host": hop.host, "src": peer.to_string(), "port": hop.port,
                })),
            );
            let resp = router::encode_error(
                RC_ADMIN_DENIED,
                &format!(
                    "route permission denied ({}, {}, {})",
                    hop.host, peer, hop.port
                ),
            );
            let _ = write_frame(stream, &resp).await;
            return RouteOutcome::Closed;
        }

        if mode.mismatches(wire_mode(req.route_talk_mode)) {
            session.add_event("Route request denied, mode mismatch");
            let resp = router::encode_error(RC_ADMIN_DENIED, "route mode mismatch");
            let _ = write_frame(stream, &resp).await;
            return RouteOutcome::Closed;
        }

        if let Some(expected) = &password {
            let given = hop.password.as_deref().unwrap_or("");
            if given != expected {
                session.add_event("Route request allowed, invalid password");
                let resp = router::encode_error(RC_ADMIN_DENIED, "route permission denied, bad password");
                let _ = write_frame(stream, &resp).await;
                return RouteOutcome::Closed;
            }
            session.add_event("Route request allowed, valid password");
        }

        let Some(manager) = self.ctx.service_manager.upgrade() else {
            return RouteOutcome::Closed;
        };
        let Ok(target_ip) = hop.host.parse::<IpAddr>() else {
            session.add_event("Route request target service not available");
            return RouteOutcome::Closed;
        };
        let Some(target) = manager.find_by_address(target_ip, hop.port) else {
            session.add_event("Route request target service not available");
            return RouteOutcome::Closed;
        };

        self.clients.update(&peer, |c| {
            c.routed = true;
            c.connected = true;
            c.target_service = Some(target.alias().to_string());
            c.talk_mode = Some(req.route_talk_mode);
            c.partner = Some(hop.host.clone());
            c.service = hop.port;
        });

        let pong = router::encode_pong();
        if write_frame(stream, &pong).await.is_err() {
            return RouteOutcome::Closed;
        }

        RouteOutcome::RouteTo(target)
    }
}

enum Outcome {
    Routed,
    Closed,
}

enum RouteOutcome {
    Closed,
    RouteTo(Arc<dyn Service>),
}

fn wire_mode(mode: TalkMode) -> service::routing::Mode {
    match mode {
        TalkMode::Ni => service::routing::Mode::Ni,
        TalkMode::Raw => service::routing::Mode::Raw,
    }
}

/// Route validation. Most rules are hard rejects; the offset-consistency
/// rule is a soft warning only (see DESIGN.md).
fn validate_route(
    req: &RouteRequest,
    listener_address: &IpAddr,
    listener_port: u16,
    server_ni_version: u8,
) -> Result<(), String> {
    if req.route_ni_version > server_ni_version {
        return Err("unsupported router version".to_string());
    }
    if req.hops.is_empty() {
        return Err("empty route".to_string());
    }
    if req.route_entries < 2 || req.route_entries as usize != req.hops.len() {
        return Err("route entry count mismatch".to_string());
    }
    if req.route_rest_nodes >= req.route_entries {
        return Err("route_rest_nodes out of bounds".to_string());
    }
    if req.route_offset >= req.route_length {
        return Err("route_offset >= route_length".to_string());
    }

    let expected_offset: usize = req.hops[..req.route_rest_nodes as usize]
        .iter()
        .map(|h| h.host.len() + 4)
        .sum();
    if req.route_offset as usize != expected_offset {
        warn!("route_offset {} != computed {expected_offset}, continuing", req.route_offset);
    }

    let first = &req.hops[0];
    if &first.host.parse::<IpAddr>().unwrap_or(*listener_address) != listener_address
        || first.port != listener_port
    {
        return Err("first hop does not match listener address".to_string());
    }

    Ok(())
}

#[async_trait]
impl Service for RouterService {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn listener_address(&self) -> IpAddr {
        self.listener_address
    }

    fn listener_port(&self) -> u16 {
        self.listener_port
    }

    fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.is_virtual {
            return Ok(());
        }

        let addr = SocketAddr::new(self.listener_address, self.listener_port);
        let this = self.clone();
        accept_loop(addr, stop, move |stream, peer| {
            let this = this.clone();
            async move { this.handle(stream, peer).await }
        })
        .await
    }

    async fn handle_virtual(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.handle(stream, peer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::router::RouteHop;

    fn sample_request() -> RouteRequest {
        RouteRequest {
            hops: vec![
                RouteHop { host: "127.0.0.1".into(), port: 3299, password: None },
                RouteHop { host: "10.0.0.1".into(), port: 3200, password: None },
            ],
            route_entries: 2,
            route_rest_nodes: 1,
            route_offset: 13,
            route_length: 50,
            route_talk_mode: TalkMode::Ni,
            route_ni_version: 2,
        }
    }

    #[test]
    fn validates_well_formed_route() {
        let req = sample_request();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_route(&req, &addr, 3299, DEFAULT_SERVER_NI_VERSION).is_ok());
    }

    #[test]
    fn rejects_mismatched_first_hop() {
        let req = sample_request();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_route(&req, &addr, 9999, DEFAULT_SERVER_NI_VERSION).is_err());
    }

    #[test]
    fn rejects_out_of_bounds_rest_nodes() {
        let mut req = sample_request();
        req.route_rest_nodes = 5;
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_route(&req, &addr, 3299, DEFAULT_SERVER_NI_VERSION).is_err());
    }

    #[test]
    fn rejects_single_hop_entries_mismatch() {
        let mut req = sample_request();
        req.route_entries = 1;
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_route(&req, &addr, 3299, DEFAULT_SERVER_NI_VERSION).is_err());
    }

    #[test]
    fn server_ni_version_is_configurable() {
        let mut req = sample_request();
        req.route_ni_version = 10;
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_route(&req, &addr, 3299, 5).is_err());
        assert!(validate_route(&req, &addr, 3299, 10).is_ok());
    }

    fn test_ctx() -> ServiceContext {
        ServiceContext {
            datastore: service::datastore::MemoryDataStore::new(),
            session_manager: service::session::SessionManager::new(service::event::EventChannel::new(8)),
            service_manager: std::sync::Weak::new(),
        }
    }

    fn test_router(timeout: Duration) -> Arc<RouterService> {
        Arc::new(RouterService {
            alias: "router".to_string(),
            listener_address: "127.0.0.1".parse().unwrap(),
            listener_port: 3299,
            is_virtual: false,
            enabled: true,
            cfg: RouterConfig {
                hostname: None,
                release: None,
                router_version: None,
                router_version_patch: None,
                info_password: None,
                external_admin: false,
                timeout: timeout.as_secs(),
                route_table_filename: None,
                route_table_working_directory: None,
                route_table: Vec::new(),
                parent_pid: None,
                parent_port: None,
                pid: None,
                time_started: None,
            },
            ctx: test_ctx(),
            clients: Arc::new(ClientMap::default()),
            route_table: Arc::new(service::routing::RouteTable::default()),
            timeout,
        })
    }

    #[tokio::test]
    async fn route_pending_timeout_sends_rc_timeout_then_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, peer) = listener.accept().await.unwrap();

        let router = test_router(Duration::from_millis(50));
        let deadline = tokio::time::Instant::now() + router.timeout;
        let outcome = router.clone().handle_pending(server_stream, peer, deadline).await;
        assert!(matches!(outcome, Outcome::Closed));

        let resp = read_frame(&mut client, DEFAULT_MAX_FRAME).await.unwrap().unwrap();
        assert_eq!(resp[0], 0xFF);
        let rc = i32::from_be_bytes(resp[1..5].try_into().unwrap());
        assert_eq!(rc, RC_TIMEOUT);
    }
}
