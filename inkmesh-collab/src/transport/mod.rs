//! Point-to-point transport seam.
//!
//! The mesh only needs four things from the network below it:
//! - claim an address at a rendezvous service (atomic, `AddressTaken` on conflict)
//! - dial another address with identity metadata attached
//! - a single ordered event stream per claimed address
//! - a way to re-register when the rendezvous registration is dropped
//!
//! ```text
//!   dial(local, remote, meta)          register(remote)
//!  ┌───────────┐    Channel    ┌───────────┐
//!  │  local    │ ◄───────────► │  remote   │
//!  │ endpoint  │               │ endpoint  │
//!  └─────┬─────┘               └─────┬─────┘
//!        ▼                           ▼
//!  Data / Closed               Incoming / Data / Closed
//! ```
//!
//! Implementations: [`memory::MemoryNetwork`] (in-process) and
//! [`ws::WsTransport`] (WebSocket links + [`crate::rendezvous`] server).

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{Identity, MeshMessage, PeerAddress, ProtocolError};

pub mod memory;
pub mod ws;

pub use memory::MemoryNetwork;
pub use ws::{WsConfig, WsTransport};

/// Process-local channel identifier.
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed.
    Outbound,
    /// The remote dialed us.
    Inbound,
}

/// One open, reliable, ordered link to a remote address.
///
/// Dropping the channel closes it; the remote side then observes
/// [`TransportEvent::Closed`].
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    remote: PeerAddress,
    direction: Direction,
    metadata: Option<Identity>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl Channel {
    pub fn new(
        remote: PeerAddress,
        direction: Direction,
        metadata: Option<Identity>,
        outgoing: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self::with_id(next_channel_id(), remote, direction, metadata, outgoing)
    }

    pub(crate) fn with_id(
        id: ChannelId,
        remote: PeerAddress,
        direction: Direction,
        metadata: Option<Identity>,
        outgoing: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id,
            remote,
            direction,
            metadata,
            outgoing,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Identity the dialer attached, for inbound channels.
    pub fn metadata(&self) -> Option<&Identity> {
        self.metadata.as_ref()
    }

    /// Address of whichever side opened this channel.
    pub fn dialer<'a>(&'a self, local: &'a PeerAddress) -> &'a PeerAddress {
        match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => &self.remote,
        }
    }

    pub fn send(&self, msg: &MeshMessage) -> Result<(), TransportError> {
        self.send_raw(msg.encode()?)
    }

    /// Send an already-encoded frame.
    pub fn send_raw(&self, frame: String) -> Result<(), TransportError> {
        self.outgoing
            .send(frame)
            .map_err(|_| TransportError::Closed(self.remote.clone()))
    }
}

/// Everything that happens on a claimed address, in arrival order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote dialed us; the channel is already open.
    Incoming(Channel),
    Data {
        channel: ChannelId,
        from: PeerAddress,
        payload: String,
    },
    Closed {
        channel: ChannelId,
        from: PeerAddress,
    },
    Error {
        channel: Option<ChannelId>,
        message: String,
    },
    /// Rendezvous registration dropped; existing channels stay up.
    RendezvousLost,
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Address {0} is already taken")]
    AddressTaken(PeerAddress),
    #[error("Address {0} is unreachable")]
    Unreachable(PeerAddress),
    #[error("Address {0} is not registered locally")]
    NotRegistered(PeerAddress),
    #[error("Channel to {0} is closed")]
    Closed(PeerAddress),
    #[error("Rendezvous error: {0}")]
    Rendezvous(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Point-to-point transport with a rendezvous service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Claim `address`; all events for it arrive on the returned stream.
    async fn register(&self, address: &PeerAddress) -> Result<EventReceiver, TransportError>;

    /// Re-claim `address` after [`TransportEvent::RendezvousLost`],
    /// keeping the original event stream.
    async fn reconnect(&self, address: &PeerAddress) -> Result<(), TransportError>;

    /// Open a channel from `local` to `remote`, attaching `metadata`.
    async fn dial(
        &self,
        local: &PeerAddress,
        remote: &PeerAddress,
        metadata: &Identity,
    ) -> Result<Channel, TransportError>;

    /// Release `address`. Open channels close once their owners drop them.
    async fn unregister(&self, address: &PeerAddress);
}
