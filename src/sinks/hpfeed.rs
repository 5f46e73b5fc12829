//! hpfeeds-style remote bus feed: authenticates once on setup, then
//! publishes each event's JSON to every configured channel.
//!
//! Uses SHA-256 rather than hpfeeds' native SHA-1 for the auth digest --
//! `sha2` is the hash crate already in the dependency tree and this feed
//! is not a conformance client for a specific broker implementation.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use service::event::{Event, Sink};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const OP_AUTH: u8 = 1;
const OP_PUBLISH: u8 = 3;

pub struct HpfeedSink {
    host: String,
    port: u16,
    ident: String,
    secret: String,
    timeout: Duration,
    channels: Vec<String>,
    conn: Mutex<Option<TcpStream>>,
}

impl HpfeedSink {
    pub fn new(
        host: String,
        port: u16,
        ident: String,
        secret: String,
        timeout: Option<Duration>,
        channels: Vec<String>,
    ) -> Self {
        Self {
            host,
            port,
            ident,
            secret,
            timeout: timeout.unwrap_or(Duration::from_secs(5)),
            channels,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> anyhow::Result<TcpStream> {
        let mut stream =
            tokio::time::timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await??;

        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        let mut rest = vec![0u8; len.saturating_sub(5)];
        stream.read_exact(&mut rest).await?;

        let namelen = *rest.first().unwrap_or(&0) as usize;
        let rand = rest.get(1 + namelen..).unwrap_or(&[]);

        let mut hasher = Sha256::new();
        hasher.update(rand);
        hasher.update(self.secret.as_bytes());
        let digest = hasher.finalize();

        let mut payload = vec![self.ident.len() as u8];
        payload.extend(self.ident.as_bytes());
        payload.extend_from_slice(&digest[..]);
        write_message(&mut stream, OP_AUTH, &payload).await?;

        Ok(stream)
    }
}

#[async_trait]
impl Sink for HpfeedSink {
    async fn setup(&self) -> anyhow::Result<()> {
        let stream = self.connect().await?;
        *self.conn.lock().await = Some(stream);
        debug!("hpfeeds: connected to {}:{} as {}", self.host, self.port, self.ident);
        Ok(())
    }

    async fn log(&self, event: &Event) {
        let payload = event.to_json().to_string();
        let mut guard = self.conn.lock().await;
        let Some(stream) = guard.as_mut() else {
            warn!("hpfeeds: not connected, dropping event");
            return;
        };

        for channel in &self.channels {
            let mut msg = vec![self.ident.len() as u8];
            msg.extend(self.ident.as_bytes());
            msg.push(channel.len() as u8);
            msg.extend(channel.as_bytes());
            msg.extend(payload.as_bytes());

            if let Err(e) = write_message(stream, OP_PUBLISH, &msg).await {
                warn!("hpfeeds: publish failed: {e}");
                *guard = None;
                break;
            }
        }
    }

    async fn stop(&self) {
        *self.conn.lock().await = None;
    }
}

async fn write_message(stream: &mut TcpStream, opcode: u8, payload: &[u8]) -> std::io::Result<()> {
    let len = (5 + payload.len()) as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&[opcode]).await?;
    stream.write_all(payload).await?;
    Ok(())
}
