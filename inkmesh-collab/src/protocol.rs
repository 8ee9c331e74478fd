//! Wire protocol for the peer mesh.
//!
//! Every frame is one JSON object tagged by `type`:
//! ```text
//! {"type":"stroke","stroke":{...}}
//! {"type":"erase","strokeIds":["..."]}
//! {"type":"peer-announce","peerId":"...","username":"...","color":"..."}
//! ```
//!
//! Relay policy per kind:
//!
//! | kind          | relayed |
//! |---------------|---------|
//! | identity      | no      |
//! | stroke        | yes     |
//! | erase         | yes     |
//! | cursor        | no      |
//! | sync-request  | no      |
//! | sync-data     | no      |
//! | peer-announce | no      |
//! | clear-all     | yes     |
//!
//! Relayed copies carry `"relayed": true` and are never forwarded again,
//! which bounds delivery to two hops from the originator.

use std::fmt;

use inkmesh_core::{to_base36, Color, Stroke, StrokeId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque transport address of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Short human-shareable room token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Well-known room shared by everyone who does not pick one.
    pub const GLOBAL: &'static str = "INKMESH-GLOBAL";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn global() -> Self {
        Self::new(Self::GLOBAL)
    }

    /// Random token of `length` characters drawn from `alphabet`.
    pub fn generate(alphabet: &str, length: usize) -> Self {
        Self(random_token(alphabet, length))
    }

    /// Normalize user input: trimmed and upper-cased.
    pub fn parse(input: &str) -> Option<Self> {
        let token = input.trim().to_uppercase();
        if token.is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    /// Rendezvous address derived from the token.
    pub fn rendezvous_address(&self, prefix: &str) -> PeerAddress {
        PeerAddress(format!("{prefix}{}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn random_token(alphabet: &str, length: usize) -> String {
    let chars: Vec<char> = alphabet.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect()
}

/// Fresh participant address: random token plus a base-36 timestamp.
pub fn guest_address(prefix: &str, alphabet: &str, length: usize) -> PeerAddress {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    PeerAddress(format!(
        "{prefix}{}-{}",
        random_token(alphabet, length),
        to_base36(millis)
    ))
}

/// Display identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub color: Color,
}

impl Identity {
    pub const PLACEHOLDER_NAME: &'static str = "Anonymous";

    pub fn new(username: impl Into<String>, color: Color) -> Self {
        Self {
            username: username.into(),
            color,
        }
    }

    /// Named identity with a random color.
    pub fn named(username: impl Into<String>) -> Self {
        Self::new(username, Color::random())
    }

    /// Used until a peer tells us who it is.
    pub fn placeholder() -> Self {
        Self::named(Self::PLACEHOLDER_NAME)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Mesh wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MeshMessage {
    Identity {
        username: String,
        color: Color,
    },
    Stroke {
        stroke: Stroke,
        #[serde(default, skip_serializing_if = "is_false")]
        relayed: bool,
    },
    Erase {
        #[serde(rename = "strokeIds")]
        stroke_ids: Vec<StrokeId>,
        #[serde(default, skip_serializing_if = "is_false")]
        relayed: bool,
    },
    Cursor {
        x: f64,
        y: f64,
        username: String,
        color: Color,
    },
    SyncRequest {
        username: String,
        color: Color,
    },
    SyncData {
        strokes: Vec<Stroke>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        erased: Vec<StrokeId>,
    },
    PeerAnnounce {
        #[serde(rename = "peerId")]
        peer_id: PeerAddress,
        username: String,
        color: Color,
    },
    ClearAll {
        #[serde(default, skip_serializing_if = "is_false")]
        relayed: bool,
    },
}

/// Discriminant of [`MeshMessage`], used for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Identity,
    Stroke,
    Erase,
    Cursor,
    SyncRequest,
    SyncData,
    PeerAnnounce,
    ClearAll,
}

impl MessageKind {
    /// Whether receivers forward this kind to their other neighbors.
    pub fn is_relayed(self) -> bool {
        matches!(self, Self::Stroke | Self::Erase | Self::ClearAll)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Stroke => "stroke",
            Self::Erase => "erase",
            Self::Cursor => "cursor",
            Self::SyncRequest => "sync-request",
            Self::SyncData => "sync-data",
            Self::PeerAnnounce => "peer-announce",
            Self::ClearAll => "clear-all",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MeshMessage {
    pub fn identity(identity: &Identity) -> Self {
        Self::Identity {
            username: identity.username.clone(),
            color: identity.color.clone(),
        }
    }

    pub fn stroke(stroke: Stroke) -> Self {
        Self::Stroke {
            stroke,
            relayed: false,
        }
    }

    pub fn erase(stroke_ids: Vec<StrokeId>) -> Self {
        Self::Erase {
            stroke_ids,
            relayed: false,
        }
    }

    pub fn cursor(x: f64, y: f64, identity: &Identity) -> Self {
        Self::Cursor {
            x,
            y,
            username: identity.username.clone(),
            color: identity.color.clone(),
        }
    }

    pub fn sync_request(identity: &Identity) -> Self {
        Self::SyncRequest {
            username: identity.username.clone(),
            color: identity.color.clone(),
        }
    }

    pub fn sync_data(strokes: Vec<Stroke>, erased: Vec<StrokeId>) -> Self {
        Self::SyncData { strokes, erased }
    }

    pub fn peer_announce(peer_id: PeerAddress, identity: &Identity) -> Self {
        Self::PeerAnnounce {
            peer_id,
            username: identity.username.clone(),
            color: identity.color.clone(),
        }
    }

    pub fn clear_all() -> Self {
        Self::ClearAll { relayed: false }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Identity { .. } => MessageKind::Identity,
            Self::Stroke { .. } => MessageKind::Stroke,
            Self::Erase { .. } => MessageKind::Erase,
            Self::Cursor { .. } => MessageKind::Cursor,
            Self::SyncRequest { .. } => MessageKind::SyncRequest,
            Self::SyncData { .. } => MessageKind::SyncData,
            Self::PeerAnnounce { .. } => MessageKind::PeerAnnounce,
            Self::ClearAll { .. } => MessageKind::ClearAll,
        }
    }

    /// True for relayed copies of a broadcast.
    pub fn is_relayed_copy(&self) -> bool {
        match self {
            Self::Stroke { relayed, .. }
            | Self::Erase { relayed, .. }
            | Self::ClearAll { relayed } => *relayed,
            _ => false,
        }
    }

    /// Copy to forward to other neighbors, or `None` if this message must
    /// not travel further.
    pub fn relay_copy(&self) -> Option<Self> {
        if !self.kind().is_relayed() || self.is_relayed_copy() {
            return None;
        }
        let mut copy = self.clone();
        match &mut copy {
            Self::Stroke { relayed, .. }
            | Self::Erase { relayed, .. }
            | Self::ClearAll { relayed } => *relayed = true,
            _ => {}
        }
        Some(copy)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
