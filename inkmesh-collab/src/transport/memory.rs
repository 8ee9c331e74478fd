//! In-process transport.
//!
//! A shared [`MemoryNetwork`] plays both rendezvous service and wire.
//! Each dial creates a pair of unbounded queues with one forwarding task
//! per direction, so frames on a channel arrive in send order and a
//! dropped channel end is reported to the other side as `Closed`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    next_channel_id, Channel, ChannelId, Direction, EventReceiver, EventSender, Transport,
    TransportError, TransportEvent,
};
use crate::protocol::{Identity, PeerAddress};

#[derive(Default)]
struct Hub {
    endpoints: HashMap<PeerAddress, EventSender>,
    /// Endpoints whose rendezvous registration was dropped.
    detached: HashMap<PeerAddress, EventSender>,
    /// Claimed addresses that never answer a dial.
    blackholes: HashSet<PeerAddress>,
}

/// Shared in-memory rendezvous + channel fabric.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        // A poisoned hub only means a test thread panicked mid-update.
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `address` without an endpoint behind it: registering it fails
    /// with `AddressTaken` and dials to it never complete.
    pub fn blackhole(&self, address: &PeerAddress) {
        self.hub().blackholes.insert(address.clone());
    }

    /// Lift a [`blackhole`](Self::blackhole) claim. Returns false if there
    /// was none.
    pub fn release_blackhole(&self, address: &PeerAddress) -> bool {
        self.hub().blackholes.remove(address)
    }

    /// Drop the rendezvous registration of `address` as if the signaling
    /// connection had been lost. Returns false if it was not registered.
    pub fn drop_registration(&self, address: &PeerAddress) -> bool {
        let mut hub = self.hub();
        match hub.endpoints.remove(address) {
            Some(events) => {
                let _ = events.send(TransportEvent::RendezvousLost);
                hub.detached.insert(address.clone(), events);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, address: &PeerAddress) -> bool {
        let hub = self.hub();
        hub.endpoints.contains_key(address) || hub.blackholes.contains(address)
    }

    pub fn registered_count(&self) -> usize {
        self.hub().endpoints.len()
    }
}

/// Move frames from one channel end to the other side's event stream.
fn forward(
    mut frames: mpsc::UnboundedReceiver<String>,
    channel: ChannelId,
    from: PeerAddress,
    to: EventSender,
) {
    tokio::spawn(async move {
        while let Some(payload) = frames.recv().await {
            let event = TransportEvent::Data {
                channel,
                from: from.clone(),
                payload,
            };
            if to.send(event).is_err() {
                return;
            }
        }
        let _ = to.send(TransportEvent::Closed { channel, from });
    });
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn register(&self, address: &PeerAddress) -> Result<EventReceiver, TransportError> {
        let mut hub = self.hub();
        if hub.endpoints.contains_key(address)
            || hub.detached.contains_key(address)
            || hub.blackholes.contains(address)
        {
            return Err(TransportError::AddressTaken(address.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        hub.endpoints.insert(address.clone(), tx);
        log::debug!("Registered {address}");
        Ok(rx)
    }

    async fn reconnect(&self, address: &PeerAddress) -> Result<(), TransportError> {
        let mut hub = self.hub();
        if hub.endpoints.contains_key(address) && !hub.detached.contains_key(address) {
            return Ok(());
        }
        let events = hub
            .detached
            .remove(address)
            .ok_or_else(|| TransportError::NotRegistered(address.clone()))?;
        if hub.endpoints.contains_key(address) || hub.blackholes.contains(address) {
            // Someone claimed it while we were away.
            hub.detached.insert(address.clone(), events);
            return Err(TransportError::AddressTaken(address.clone()));
        }
        hub.endpoints.insert(address.clone(), events);
        log::debug!("Re-registered {address}");
        Ok(())
    }

    async fn dial(
        &self,
        local: &PeerAddress,
        remote: &PeerAddress,
        metadata: &Identity,
    ) -> Result<Channel, TransportError> {
        let endpoints = {
            let hub = self.hub();
            if hub.blackholes.contains(remote) {
                None
            } else {
                let local_events = hub
                    .endpoints
                    .get(local)
                    .or_else(|| hub.detached.get(local))
                    .cloned()
                    .ok_or_else(|| TransportError::NotRegistered(local.clone()))?;
                let remote_events = hub
                    .endpoints
                    .get(remote)
                    .cloned()
                    .ok_or_else(|| TransportError::Unreachable(remote.clone()))?;
                Some((local_events, remote_events))
            }
        };

        let Some((local_events, remote_events)) = endpoints else {
            // Blackholed: the open never completes.
            std::future::pending::<()>().await;
            return Err(TransportError::Unreachable(remote.clone()));
        };

        let id = next_channel_id();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        let inbound = Channel::with_id(
            id,
            local.clone(),
            Direction::Inbound,
            Some(metadata.clone()),
            remote_tx,
        );
        remote_events
            .send(TransportEvent::Incoming(inbound))
            .map_err(|_| TransportError::Unreachable(remote.clone()))?;

        forward(local_rx, id, local.clone(), remote_events);
        forward(remote_rx, id, remote.clone(), local_events);

        Ok(Channel::with_id(
            id,
            remote.clone(),
            Direction::Outbound,
            None,
            local_tx,
        ))
    }

    async fn unregister(&self, address: &PeerAddress) {
        let mut hub = self.hub();
        hub.endpoints.remove(address);
        hub.detached.remove(address);
        log::debug!("Unregistered {address}");
    }
}
