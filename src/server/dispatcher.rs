//! Dispatcher protocol state machine: initialization, login-screen
//! synthesis, and DYNT form-atom credential capture.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use codec::dispatcher::{
    self, FORM_ATOM_ETYPES, LoginScreenParams,
};
use codec::niframe::{read_frame, write_frame};
use codec::DEFAULT_MAX_FRAME;
use log::warn;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::{DispatcherConfig, ServiceEntry};
use crate::server::{ClientMap, Service, ServiceContext, accept_loop};

pub struct DispatcherService {
    alias: String,
    listener_address: IpAddr,
    listener_port: u16,
    is_virtual: bool,
    enabled: bool,
    cfg: DispatcherConfig,
    ctx: ServiceContext,
    clients: Arc<ClientMap>,
}

impl DispatcherService {
    pub fn new(entry: &ServiceEntry, cfg: DispatcherConfig, ctx: ServiceContext) -> Self {
        Self {
            alias: entry.alias.clone().unwrap_or_else(|| "dispatcher".to_string()),
            listener_address: entry.listener_address,
            listener_port: entry.listener_port,
            is_virtual: entry.r#virtual,
            enabled: entry.enabled,
            cfg,
            ctx,
            clients: Arc::new(ClientMap::default()),
        }
    }

    async fn handle(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        self.clients.insert(peer);

        loop {
            let payload = match read_frame(&mut stream, DEFAULT_MAX_FRAME).await {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => {
                    warn!("dispatcher: frame read error from {peer}: {e}");
                    break;
                }
            };

            let already_initialized = self.clients.get(&peer).map(|c| c.init).unwrap_or(false);

            if !already_initialized {
                if let Some(init) = dispatcher::decode_init(&payload) {
                    if self.handle_init(&mut stream, peer, init.terminal).await.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.handle_interaction(&mut stream, peer, &payload).await {
                InteractionOutcome::Continue => continue,
                InteractionOutcome::LogOff => break,
            }
        }

        self.clients.remove(&peer);
    }

    async fn handle_init(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        terminal: String,
    ) -> Result<(), ()> {
        let context_id = codec::generate_context_id();
        self.clients.update(&peer, |c| {
            c.init = true;
            c.terminal = Some(terminal.clone());
            c.context_id = Some(context_id.clone());
        });

        let session = self.ctx.session_manager.get_or_create(
            self.alias.clone(),
            peer.ip(),
            peer.port(),
            self.listener_address,
            self.listener_port,
        );
        session.add_event(
            service::event::Event::new(&session, "Initialization request received")
                .with_data(json!({ "terminal": terminal })),
        );

        let hostname = self.cfg.hostname.as_deref().unwrap_or("sapserver");
        let sid = self.cfg.sid.as_deref().unwrap_or("PRD");
        let client_no = self.cfg.client_no.as_deref().unwrap_or("001");
        let session_title = self.cfg.session_title.as_deref().unwrap_or("SAP");
        let database_version = self.cfg.database_version.as_deref().unwrap_or("HDB 2.0");
        let kernel_version = self.cfg.kernel_version.as_deref().unwrap_or("753");
        let kernel_patch_level = self.cfg.kernel_patch_level.as_deref().unwrap_or("0");

        let screen = dispatcher::make_login_screen(&LoginScreenParams {
            hostname,
            sid,
            client_no,
            session_title,
            database_version,
            kernel_version,
            kernel_patch_level,
            context_id: &context_id,
        });

        write_frame(stream, &screen).await.map_err(|_| ())
    }

    async fn handle_interaction(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        payload: &[u8],
    ) -> InteractionOutcome {
        let msg = match dispatcher::decode_interaction(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("dispatcher: decode error from {peer}: {e}");
                let resp = dispatcher::make_error_screen();
                let _ = write_frame(stream, &resp).await;
                return InteractionOutcome::Continue;
            }
        };

        let session = self.ctx.session_manager.get_or_create(
            self.alias.clone(),
            peer.ip(),
            peer.port(),
            self.listener_address,
            self.listener_port,
        );

        if msg.ok_code.as_deref() == Some("/i") {
            session.add_event("Windows closed by the client");
            return self.log_off(stream, peer).await;
        }

        if let Some(event) = msg.ui_event {
            let label = event.classify();
            session.add_event(format!("UI event: {label}"));
            if label == "log off" {
                return self.log_off(stream, peer).await;
            }
            let resp = dispatcher::make_error_screen();
            let _ = write_frame(stream, &resp).await;
            return InteractionOutcome::Continue;
        }

        let inputs: Vec<String> = msg
            .atoms
            .iter()
            .filter(|a| FORM_ATOM_ETYPES.contains(&a.etype))
            .filter_map(|a| a.captured_text())
            .collect();

        if !inputs.is_empty() {
            session.add_event(
                service::event::Event::new(&session, "Login request sent the client")
                    .with_data(json!({ "inputs": inputs })),
            );
            let resp = dispatcher::make_compressed_error_screen();
            let _ = write_frame(stream, &resp).await;
            return InteractionOutcome::Continue;
        }

        let resp = dispatcher::make_error_screen();
        let _ = write_frame(stream, &resp).await;
        InteractionOutcome::Continue
    }

    async fn log_off(&self, stream: &mut TcpStream, _peer: SocketAddr) -> InteractionOutcome {
        let packet = dispatcher::make_logoff_packet();
        let _ = write_frame(stream, &packet).await;
        InteractionOutcome::LogOff
    }
}

enum InteractionOutcome {
    Continue,
    LogOff,
}

#[async_trait]
impl Service for DispatcherService {
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
    use codec::dispatcher::{FormAtom, InteractionMessage, UiEvent};

    #[test]
    fn captures_ordered_visible_and_invisible_inputs() {
        let msg = InteractionMessage {
            ok_code: None,
            ui_event: None,
            atoms: vec![
                FormAtom { etype: 130, invisible: false, primary_text: Some("user".into()), secondary_text: None },
                FormAtom { etype: 131, invisible: true, primary_text: Some("pass".into()), secondary_text: None },
            ],
        };
        let inputs: Vec<String> = msg
            .atoms
            .iter()
            .filter(|a| FORM_ATOM_ETYPES.contains(&a.etype))
            .filter_map(|a| a.captured_text())
            .collect();
        assert_eq!(inputs, vec!["user".to_string(), "pass".to_string()]);
    }

    #[test]
    fn log_off_ui_event_classifies_correctly() {
        let event = UiEvent::FunctionKey { control: 10, data: 15 };
        assert_eq!(event.classify(), "log off");
    }
}
