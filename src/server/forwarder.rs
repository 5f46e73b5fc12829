//! TCP forwarder: dials a configured target and relays bytes in both
//! directions, logging each chunk as a session event.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::{ForwarderConfig, ServiceEntry};
use crate::server::{Service, ServiceContext, accept_loop};

/// How often the copy loop re-checks the stop flag between reads.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ForwarderService {
    alias: String,
    listener_address: IpAddr,
    listener_port: u16,
    is_virtual: bool,
    enabled: bool,
    cfg: ForwarderConfig,
    ctx: ServiceContext,
}

impl ForwarderService {
    pub fn new(entry: &ServiceEntry, cfg: ForwarderConfig, ctx: ServiceContext) -> Self {
        Self {
            alias: entry.alias.clone().unwrap_or_else(|| "forwarder".to_string()),
            listener_address: entry.listener_address,
            listener_port: entry.listener_port,
            is_virtual: entry.r#virtual,
            enabled: entry.enabled,
            cfg,
            ctx,
        }
    }

    async fn handle(self: Arc<Self>, client: TcpStream, peer: SocketAddr, mut stop: watch::Receiver<bool>) {
        let target_host = self
            .cfg
            .target_address
            .clone()
            .unwrap_or_else(|| self.listener_address.to_string());
        let target_port = self.cfg.target_port.unwrap_or(self.listener_port);

        let remote = match TcpStream::connect((target_host.as_str(), target_port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("forwarder: dial {target_host}:{target_port} failed for {peer}: {e}");
                return;
            }
        };

        let target_ip = target_host.parse::<IpAddr>().unwrap_or(self.listener_address);
        let session = self.ctx.session_manager.get_or_create(
            self.alias.clone(),
            peer.ip(),
            peer.port(),
            target_ip,
            target_port,
        );

        let (mut client_r, mut client_w) = client.into_split();
        let (mut remote_r, mut remote_w) = remote.into_split();

        let mut client_buf = vec![0u8; self.cfg.mtu as usize];
        let mut remote_buf = vec![0u8; self.cfg.mtu as usize];

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                result = tokio::time::timeout(POLL_INTERVAL, client_r.read(&mut client_buf)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            session.add_event(
                                service::event::Event::new(&session, "Forwarding packet")
                                    .with_data(json!({ "target_host": target_host, "target_port": target_port }))
                                    .with_request(client_buf[..n].to_vec()),
                            );
                            if remote_w.write_all(&client_buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("forwarder: client read error from {peer}: {e}");
                            break;
                        }
                        Err(_) => {}
                    }
                }
                result = tokio::time::timeout(POLL_INTERVAL, remote_r.read(&mut remote_buf)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            session.add_event(
                                service::event::Event::new(&session, "Forwarding packet")
                                    .with_data(json!({ "target_host": target_host, "target_port": target_port }))
                                    .with_response(remote_buf[..n].to_vec()),
                            );
                            if client_w.write_all(&remote_buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("forwarder: remote read error from {peer}: {e}");
                            break;
                        }
                        Err(_) => {}
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for ForwarderService {
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
        let handler_stop = stop.clone();
        accept_loop(addr, stop, move |stream, peer| {
            let this = this.clone();
            let stop = handler_stop.clone();
            async move { this.handle(stream, peer, stop).await }
        })
        .await
    }

    async fn handle_virtual(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        // No service-wide stop to honor from here; the copy loop still ends
        // on either side closing.
        let (_tx, rx) = watch::channel(false);
        self.handle(stream, peer, rx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn test_ctx() -> ServiceContext {
        ServiceContext {
            datastore: service::datastore::MemoryDataStore::new(),
            session_manager: service::session::SessionManager::new(service::event::EventChannel::new(8)),
            service_manager: std::sync::Weak::new(),
        }
    }

    #[tokio::test]
    async fn relays_bytes_in_both_directions_until_client_closes() {
        let target_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (mut sock, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let service = Arc::new(ForwarderService {
            alias: "forwarder".to_string(),
            listener_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listener_port: target_addr.port(),
            is_virtual: false,
            enabled: true,
            cfg: ForwarderConfig {
                target_address: Some(target_addr.ip().to_string()),
                target_port: Some(target_addr.port()),
                mtu: 4096,
            },
            ctx: test_ctx(),
        });

        let client_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let (server_side, peer) = client_listener.accept().await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(service.handle(server_side, peer, rx));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        drop(client);
        handle.await.unwrap();
        echo.await.unwrap();
    }
}
