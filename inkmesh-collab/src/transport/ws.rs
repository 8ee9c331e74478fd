//! WebSocket transport.
//!
//! Every registered address gets its own ephemeral listener
//! (`ws://<listen_host>:<port>`), published through the rendezvous server.
//! Dialing looks the address up and connects straight to the peer; the
//! rendezvous server never sees canvas traffic.
//!
//! The first frame on a new channel is a [`ChannelHello`] naming the dialer
//! and carrying its identity; every later text frame is one mesh message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{
    Channel, ChannelId, Direction, EventReceiver, EventSender, Transport, TransportError,
    TransportEvent,
};
use crate::protocol::{Identity, PeerAddress};
use crate::rendezvous::{RendezvousRequest, RendezvousResponse};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Rendezvous server URL
    pub rendezvous_url: String,
    /// Host the per-address listeners bind to and advertise
    pub listen_host: String,
    /// Bound on an inbound connection's WebSocket upgrade plus hello frame
    pub handshake_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            rendezvous_url: "ws://127.0.0.1:9090".to_string(),
            listen_host: "127.0.0.1".to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// First frame sent by the dialer on a new channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHello {
    pub from: PeerAddress,
    #[serde(default)]
    pub metadata: Option<Identity>,
}

struct Endpoint {
    events: EventSender,
    url: String,
    accept_task: JoinHandle<()>,
    registration_task: JoinHandle<()>,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.registration_task.abort();
    }
}

#[derive(Clone)]
pub struct WsTransport {
    config: WsConfig,
    endpoints: Arc<Mutex<HashMap<PeerAddress, Endpoint>>>,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<PeerAddress, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One request/response exchange on a rendezvous socket.
    async fn exchange<S>(
        ws: &mut WebSocketStream<S>,
        request: &RendezvousRequest,
    ) -> Result<RendezvousResponse, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = serde_json::to_string(request)
            .map_err(|e| TransportError::Rendezvous(e.to_string()))?;
        ws.send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Rendezvous(e.to_string()))?;

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| TransportError::Rendezvous(e.to_string()));
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(TransportError::Rendezvous(e.to_string())),
            }
        }
        Err(TransportError::Rendezvous(
            "rendezvous closed the connection".to_string(),
        ))
    }

    /// Claim `address` and keep the registration socket open in a task.
    /// When that socket ends, `RendezvousLost` is pushed to `events`.
    async fn claim(
        &self,
        address: &PeerAddress,
        url: &str,
        events: EventSender,
    ) -> Result<JoinHandle<()>, TransportError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&self.config.rendezvous_url)
            .await
            .map_err(|e| TransportError::Rendezvous(e.to_string()))?;

        let request = RendezvousRequest::Register {
            address: address.clone(),
            url: url.to_string(),
        };
        match Self::exchange(&mut ws, &request).await? {
            RendezvousResponse::Registered { .. } => {}
            RendezvousResponse::Taken { address } => {
                return Err(TransportError::AddressTaken(address));
            }
            other => {
                return Err(TransportError::Rendezvous(format!(
                    "unexpected response {other:?}"
                )));
            }
        }

        let address = address.clone();
        Ok(tokio::spawn(async move {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Ping(data)) => {
                        if ws.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            log::warn!("Rendezvous registration for {address} dropped");
            let _ = events.send(TransportEvent::RendezvousLost);
        }))
    }

    async fn lookup(&self, address: &PeerAddress) -> Result<String, TransportError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&self.config.rendezvous_url)
            .await
            .map_err(|e| TransportError::Rendezvous(e.to_string()))?;
        let request = RendezvousRequest::Lookup {
            address: address.clone(),
        };
        let response = Self::exchange(&mut ws, &request).await;
        let _ = ws.close(None).await;
        match response? {
            RendezvousResponse::Found { url, .. } => Ok(url),
            RendezvousResponse::NotFound { address } => Err(TransportError::Unreachable(address)),
            other => Err(TransportError::Rendezvous(format!(
                "unexpected response {other:?}"
            ))),
        }
    }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept inbound channels for one registered address.
async fn accept_loop(
    listener: TcpListener,
    local: PeerAddress,
    events: EventSender,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Typically fd exhaustion; give it a moment to clear.
                log::warn!("Accept failed on {local}: {e}");
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        log::debug!("Inbound TCP connection to {local} from {addr}");
        let events = events.clone();
        tokio::spawn(async move {
            let handshake = async {
                let mut ws = tokio_tungstenite::accept_async(stream)
                    .await
                    .map_err(|e| e.to_string())?;
                let hello = read_hello(&mut ws).await?;
                Ok::<_, String>((ws, hello))
            };
            match timeout(handshake_timeout, handshake).await {
                Ok(Ok((ws, hello))) => open_inbound(ws, hello, events).await,
                Ok(Err(e)) => log::warn!("Inbound handshake from {addr} failed: {e}"),
                Err(_) => log::warn!("Inbound handshake from {addr} timed out"),
            }
        });
    }
}

/// Wait for the dialer's [`ChannelHello`].
async fn read_hello<S>(ws: &mut WebSocketStream<S>) -> Result<ChannelHello, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str::<ChannelHello>(text.as_str())
                    .map_err(|e| format!("invalid channel hello: {e}"));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err("closed before hello".to_string());
            }
            Some(Err(e)) => return Err(e.to_string()),
            Some(Ok(_)) => continue,
        }
    }
}

async fn open_inbound<S>(ws: WebSocketStream<S>, hello: ChannelHello, events: EventSender)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let channel = Channel::new(
        hello.from.clone(),
        Direction::Inbound,
        hello.metadata,
        outgoing_tx,
    );
    let id = channel.id();
    if events.send(TransportEvent::Incoming(channel)).is_err() {
        return;
    }
    pump(ws, outgoing_rx, id, hello.from, events).await;
}

/// Shuttle frames between a WebSocket and the channel/event queues until
/// either side goes away, then report `Closed`.
async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    channel: ChannelId,
    remote: PeerAddress,
    events: EventSender,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let event = TransportEvent::Data {
                        channel,
                        from: remote.clone(),
                        payload: text.as_str().to_owned(),
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error {
                        channel: Some(channel),
                        message: e.to_string(),
                    });
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = events.send(TransportEvent::Closed {
        channel,
        from: remote,
    });
}

#[async_trait]
impl Transport for WsTransport {
    async fn register(&self, address: &PeerAddress) -> Result<EventReceiver, TransportError> {
        if self.endpoints().contains_key(address) {
            return Err(TransportError::AddressTaken(address.clone()));
        }

        let listener = TcpListener::bind((self.config.listen_host.as_str(), 0)).await?;
        let url = format!("ws://{}", listener.local_addr()?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registration_task = self.claim(address, &url, events_tx.clone()).await?;
        let accept_task = tokio::spawn(accept_loop(
            listener,
            address.clone(),
            events_tx.clone(),
            self.config.handshake_timeout,
        ));

        log::info!("Registered {address} at {url}");
        self.endpoints().insert(
            address.clone(),
            Endpoint {
                events: events_tx,
                url,
                accept_task,
                registration_task,
            },
        );
        Ok(events_rx)
    }

    async fn reconnect(&self, address: &PeerAddress) -> Result<(), TransportError> {
        let (url, events) = {
            let endpoints = self.endpoints();
            let endpoint = endpoints
                .get(address)
                .ok_or_else(|| TransportError::NotRegistered(address.clone()))?;
            (endpoint.url.clone(), endpoint.events.clone())
        };

        let registration_task = self.claim(address, &url, events).await?;
        match self.endpoints().get_mut(address) {
            Some(endpoint) => {
                endpoint.registration_task.abort();
                endpoint.registration_task = registration_task;
            }
            None => {
                // Unregistered while the claim was in flight.
                registration_task.abort();
                return Err(TransportError::NotRegistered(address.clone()));
            }
        }
        log::info!("Re-registered {address} at {url}");
        Ok(())
    }

    async fn dial(
        &self,
        local: &PeerAddress,
        remote: &PeerAddress,
        metadata: &Identity,
    ) -> Result<Channel, TransportError> {
        let events = self
            .endpoints()
            .get(local)
            .map(|endpoint| endpoint.events.clone())
            .ok_or_else(|| TransportError::NotRegistered(local.clone()))?;

        let url = self.lookup(remote).await?;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| {
                log::debug!("Dial {remote} at {url} failed: {e}");
                TransportError::Unreachable(remote.clone())
            })?;

        let hello = ChannelHello {
            from: local.clone(),
            metadata: Some(metadata.clone()),
        };
        let frame =
            serde_json::to_string(&hello).map_err(|e| TransportError::Io(e.to_string()))?;
        ws.send(Message::Text(frame.into()))
            .await
            .map_err(|_| TransportError::Unreachable(remote.clone()))?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let channel = Channel::new(remote.clone(), Direction::Outbound, None, outgoing_tx);
        tokio::spawn(pump(ws, outgoing_rx, channel.id(), remote.clone(), events));
        Ok(channel)
    }

    async fn unregister(&self, address: &PeerAddress) {
        // Dropping the endpoint aborts its listener and registration socket.
        if self.endpoints().remove(address).is_some() {
            log::info!("Unregistered {address}");
        }
    }
}
