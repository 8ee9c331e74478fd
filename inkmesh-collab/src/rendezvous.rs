//! WebSocket rendezvous server.
//!
//! Architecture:
//! ```text
//! Peer A ──register(ink-ROOM, ws://a)──┐
//!                                       ├── RendezvousServer ── address → url
//! Peer B ──lookup(ink-ROOM)────────────┘
//!    │
//!    └───────────── direct WebSocket to ws://a ─────────────► Peer A
//! ```
//!
//! The server only maps addresses to listening URLs. Claims are atomic
//! (one write lock per request) and live as long as the WebSocket that
//! made them; canvas traffic never passes through here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::PeerAddress;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RendezvousRequest {
    Register { address: PeerAddress, url: String },
    Lookup { address: PeerAddress },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RendezvousResponse {
    Registered { address: PeerAddress },
    Taken { address: PeerAddress },
    Found { address: PeerAddress, url: String },
    NotFound { address: PeerAddress },
    Invalid { reason: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct RendezvousStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub registrations: u64,
    pub rejected_claims: u64,
    pub lookups: u64,
}

type Registrations = Arc<RwLock<HashMap<PeerAddress, String>>>;

pub struct RendezvousServer {
    config: RendezvousConfig,
    registrations: Registrations,
    stats: Arc<RwLock<RendezvousStats>>,
}

impl RendezvousServer {
    pub fn new(config: RendezvousConfig) -> Self {
        Self {
            config,
            registrations: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RendezvousStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RendezvousConfig::default())
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Rendezvous server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registrations = self.registrations.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registrations, stats).await {
                    log::error!("Rendezvous connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registrations: Registrations,
        stats: Arc<RwLock<RendezvousStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Addresses claimed over this connection; released when it ends.
        let mut owned: Vec<PeerAddress> = Vec::new();
        let mut result = Ok(());

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(data)) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        result = Err(e.into());
                        break;
                    }
                    continue;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break;
                }
            };

            let response = match serde_json::from_str::<RendezvousRequest>(text.as_str()) {
                Ok(request) => {
                    Self::handle_request(request, &registrations, &stats, &mut owned).await
                }
                Err(e) => RendezvousResponse::Invalid {
                    reason: e.to_string(),
                },
            };
            let frame = serde_json::to_string(&response)?;
            if let Err(e) = ws_sender.send(Message::Text(frame.into())).await {
                result = Err(e.into());
                break;
            }
        }

        if !owned.is_empty() {
            let mut regs = registrations.write().await;
            for address in &owned {
                regs.remove(address);
                log::info!("Released {address} (connection from {addr} closed)");
            }
        }
        stats.write().await.active_connections -= 1;
        result
    }

    async fn handle_request(
        request: RendezvousRequest,
        registrations: &Registrations,
        stats: &Arc<RwLock<RendezvousStats>>,
        owned: &mut Vec<PeerAddress>,
    ) -> RendezvousResponse {
        match request {
            RendezvousRequest::Register { address, url } => {
                let mut regs = registrations.write().await;
                if regs.contains_key(&address) {
                    stats.write().await.rejected_claims += 1;
                    log::debug!("Claim for {address} rejected: taken");
                    return RendezvousResponse::Taken { address };
                }
                regs.insert(address.clone(), url.clone());
                owned.push(address.clone());
                stats.write().await.registrations += 1;
                log::info!("Registered {address} -> {url}");
                RendezvousResponse::Registered { address }
            }
            RendezvousRequest::Lookup { address } => {
                stats.write().await.lookups += 1;
                match registrations.read().await.get(&address) {
                    Some(url) => RendezvousResponse::Found {
                        address,
                        url: url.clone(),
                    },
                    None => RendezvousResponse::NotFound { address },
                }
            }
        }
    }

    pub async fn stats(&self) -> RendezvousStats {
        self.stats.read().await.clone()
    }

    /// Number of currently claimed addresses.
    pub async fn registration_count(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
