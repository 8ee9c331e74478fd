//! Application-facing event surface.
//!
//! The drawing layer implements [`MeshListener`]; every method has a no-op
//! default, so an implementor only overrides what it renders.

use inkmesh_core::{Stroke, StrokeId};
use tokio::sync::mpsc;

use crate::protocol::{Identity, PeerAddress};

pub trait MeshListener: Send + 'static {
    /// Fired when a peer registers, and again when its identity changes.
    fn on_peer_connected(&mut self, _address: &PeerAddress, _identity: &Identity) {}

    /// Fired exactly once per registered peer, with its last known name.
    fn on_peer_disconnected(&mut self, _address: &PeerAddress, _username: &str) {}

    /// A stroke not seen before was added to the replica.
    fn on_stroke_received(&mut self, _stroke: &Stroke) {}

    /// Strokes that were present and are now erased.
    fn on_strokes_erased(&mut self, _ids: &[StrokeId]) {}

    fn on_cursor_update(&mut self, _address: &PeerAddress, _x: f64, _y: f64, _identity: &Identity) {}

    /// Snapshot to serve a newcomer. `None` serves the node's own replica.
    fn on_sync_request(&mut self) -> Option<Vec<Stroke>> {
        None
    }

    /// Strokes a sync reply added to the replica.
    fn on_sync_data(&mut self, _strokes: &[Stroke]) {}

    fn on_clear_all(&mut self) {}

    fn on_error(&mut self, _message: &str) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl MeshListener for NoopListener {}

/// Owned copy of one listener callback.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerConnected {
        address: PeerAddress,
        identity: Identity,
    },
    PeerDisconnected {
        address: PeerAddress,
        username: String,
    },
    StrokeReceived(Stroke),
    StrokesErased(Vec<StrokeId>),
    CursorUpdate {
        address: PeerAddress,
        x: f64,
        y: f64,
        identity: Identity,
    },
    SyncData(Vec<Stroke>),
    ClearAll,
    Error(String),
}

/// Listener that forwards every callback into an mpsc channel, for callers
/// that prefer consuming events from a task (the CLI, tests).
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl EventForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: MeshEvent) {
        // The consumer may have gone away; events are best-effort.
        let _ = self.tx.send(event);
    }
}

impl MeshListener for EventForwarder {
    fn on_peer_connected(&mut self, address: &PeerAddress, identity: &Identity) {
        self.emit(MeshEvent::PeerConnected {
            address: address.clone(),
            identity: identity.clone(),
        });
    }

    fn on_peer_disconnected(&mut self, address: &PeerAddress, username: &str) {
        self.emit(MeshEvent::PeerDisconnected {
            address: address.clone(),
            username: username.to_string(),
        });
    }

    fn on_stroke_received(&mut self, stroke: &Stroke) {
        self.emit(MeshEvent::StrokeReceived(stroke.clone()));
    }

    fn on_strokes_erased(&mut self, ids: &[StrokeId]) {
        self.emit(MeshEvent::StrokesErased(ids.to_vec()));
    }

    fn on_cursor_update(&mut self, address: &PeerAddress, x: f64, y: f64, identity: &Identity) {
        self.emit(MeshEvent::CursorUpdate {
            address: address.clone(),
            x,
            y,
            identity: identity.clone(),
        });
    }

    fn on_sync_data(&mut self, strokes: &[Stroke]) {
        self.emit(MeshEvent::SyncData(strokes.to_vec()));
    }

    fn on_clear_all(&mut self) {
        self.emit(MeshEvent::ClearAll);
    }

    fn on_error(&mut self, message: &str) {
        self.emit(MeshEvent::Error(message.to_string()));
    }
}
