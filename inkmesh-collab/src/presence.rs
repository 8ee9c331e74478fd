//! Cursor presence.
//!
//! Cursor messages are ephemeral: they go only to direct neighbors and are
//! never relayed or stored in the replica.
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! CursorThrottle::should_send()   (one send per interval)
//!       │
//!       ▼
//! MeshMessage::Cursor ── direct links only ──► remote node
//!                                                  │
//!                                                  ▼
//!                                   RemoteCursors::update()
//! ```
//!
//! The node drops a remote pointer when its peer disconnects or when it has
//! not moved for `NodeConfig::cursor_idle_timeout`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use inkmesh_core::Point;

use crate::protocol::{Identity, PeerAddress};

// ───────────────────────────────────────────────────────────────────
// Local rate limit
// ───────────────────────────────────────────────────────────────────

/// Rate limiter for outgoing cursor updates.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True if a cursor update may go out now; records the send if so.
    pub fn should_send(&mut self) -> bool {
        self.should_send_at(Instant::now())
    }

    pub fn should_send_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote cursors
// ───────────────────────────────────────────────────────────────────

/// Last known pointer of one remote peer.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub position: Point,
    pub identity: Identity,
    last_update: Instant,
}

impl RemoteCursor {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Pointers of all remote peers, keyed by address.
#[derive(Debug, Default)]
pub struct RemoteCursors {
    cursors: BTreeMap<PeerAddress, RemoteCursor>,
}

impl RemoteCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, address: &PeerAddress, position: Point, identity: &Identity) {
        let now = Instant::now();
        self.cursors
            .entry(address.clone())
            .and_modify(|cursor| {
                cursor.position = position;
                cursor.identity = identity.clone();
                cursor.last_update = now;
            })
            .or_insert_with(|| RemoteCursor {
                position,
                identity: identity.clone(),
                last_update: now,
            });
    }

    /// Forget a peer's pointer (on disconnect).
    pub fn remove(&mut self, address: &PeerAddress) -> Option<RemoteCursor> {
        self.cursors.remove(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerAddress, &RemoteCursor)> {
        self.cursors.iter()
    }

    /// Drop pointers not updated within `timeout`, returning their owners.
    pub fn cleanup_idle(&mut self, timeout: Duration) -> Vec<PeerAddress> {
        let idle: Vec<PeerAddress> = self
            .cursors
            .iter()
            .filter(|(_, cursor)| cursor.is_idle(timeout))
            .map(|(address, _)| address.clone())
            .collect();
        for address in &idle {
            self.cursors.remove(address);
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
