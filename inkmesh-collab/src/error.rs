//! Error taxonomy of the mesh.

use thiserror::Error;

use crate::protocol::{PeerAddress, RoomId};
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// Rendezvous address of a freshly generated room was already claimed.
    #[error("Room {0} already exists")]
    RoomCollision(RoomId),

    #[error("Could not claim a free room after {0} attempts")]
    RetriesExhausted(usize),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Room {0} not found")]
    RoomNotFound(RoomId),

    #[error("Transport error: {0}")]
    Transport(String),

    /// An established link closed; never fatal to the session.
    #[error("Peer {0} dropped")]
    PeerDropped(PeerAddress),

    #[error("Mesh node has shut down")]
    Shutdown,
}

impl From<TransportError> for MeshError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}
