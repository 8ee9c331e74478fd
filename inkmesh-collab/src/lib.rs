//! # inkmesh-collab: Serverless peer mesh for a shared canvas
//!
//! Participants keep the canvas in their own processes and synchronize it
//! over direct peer links. A rendezvous service is only used to find an
//! address; it never sees a stroke.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐
//!            │  Rendezvous  │  address → endpoint
//!            └──────┬───────┘
//!         claim /   │   \ lookup
//!   ┌─────────────┐ │ ┌─────────────┐
//!   │ MeshNode P1 │◄┼►│ MeshNode P2 │
//!   │   (host)    │ │ │   (guest)   │
//!   └──────┬──────┘   └──────┬──────┘
//!          │    full mesh    │
//!          └──►┌─────────────┐◄──┘
//!              │ MeshNode P3 │
//!              └─────────────┘
//! ```
//!
//! Lifecycle of a participant: bootstrap (claim or dial) → mesh formation
//! (`sync-request` → `sync-data` + `peer-announce` → direct dials) →
//! steady-state broadcast with one-hop relay.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages, addresses, room ids
//! - [`transport`]: transport seam with in-memory and WebSocket backends
//! - [`rendezvous`]: WebSocket rendezvous server
//! - [`bootstrap`]: room creation, join, global room
//! - [`registry`]: connected peers and their channels
//! - [`node`]: the event loop and [`MeshHandle`]
//! - [`listener`]: application callbacks
//! - [`presence`]: cursor throttling and remote pointers

pub mod protocol;
pub mod error;
pub mod transport;
pub mod rendezvous;
pub mod bootstrap;
pub mod registry;
pub mod listener;
pub mod presence;
pub mod node;

// Re-exports for convenience
pub use protocol::{
    Identity, MeshMessage, MessageKind, PeerAddress, ProtocolError, RoomId,
};
pub use error::MeshError;
pub use transport::{
    Channel, ChannelId, Direction, MemoryNetwork, Transport, TransportError, TransportEvent,
    WsConfig, WsTransport,
};
pub use rendezvous::{RendezvousConfig, RendezvousServer, RendezvousStats};
pub use bootstrap::{Role, Session};
pub use registry::{PeerRecord, PeerRegistry, PeerSummary, Registration};
pub use listener::{EventForwarder, MeshEvent, MeshListener, NoopListener};
pub use presence::{CursorThrottle, RemoteCursor, RemoteCursors};
pub use node::{MeshHandle, NodeConfig, NodeStats};
