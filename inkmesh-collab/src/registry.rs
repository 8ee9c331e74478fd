//! Connected-peer registry.
//!
//! One record per remote address, each owning the channel to that peer.
//! Records are created only for open channels with a known identity
//! (dial-time metadata or a placeholder until the `identity` message
//! arrives) and are removed together with their channel.
//!
//! When two channels exist for the same address (both sides dialed at
//! once during mesh formation) the one opened by the lower address wins.
//! Both ends apply the same rule, so they agree on which link survives.

use std::collections::BTreeMap;

use inkmesh_core::Color;
use serde::{Deserialize, Serialize};

use crate::protocol::{Identity, MeshMessage, PeerAddress, ProtocolError};
use crate::transport::{Channel, ChannelId, TransportError};

/// A connected peer.
#[derive(Debug)]
pub struct PeerRecord {
    pub address: PeerAddress,
    pub identity: Identity,
    channel: Channel,
}

impl PeerRecord {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            address: self.address.clone(),
            username: self.identity.username.clone(),
            color: self.identity.color.clone(),
        }
    }
}

/// Plain view of a peer for callers outside the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub address: PeerAddress,
    pub username: String,
    pub color: Color,
}

/// Result of [`PeerRegistry::add`].
#[derive(Debug)]
pub enum Registration {
    /// First channel for this address.
    Inserted,
    /// The new channel won the tie-break; the old one is handed back to be
    /// dropped.
    Replaced(Channel),
    /// An existing channel wins; the new one is handed back to be dropped.
    Rejected(Channel),
}

#[derive(Debug)]
pub struct PeerRegistry {
    local: PeerAddress,
    peers: BTreeMap<PeerAddress, PeerRecord>,
}

impl PeerRegistry {
    pub fn new(local: PeerAddress) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    /// Register `channel` for its remote address.
    ///
    /// On a duplicate link the surviving record keeps its stored identity;
    /// identity messages on the surviving channel refine it afterwards.
    pub fn add(&mut self, channel: Channel, identity: Identity) -> Registration {
        let address = channel.remote().clone();
        match self.peers.get_mut(&address) {
            None => {
                self.peers.insert(
                    address.clone(),
                    PeerRecord {
                        address,
                        identity,
                        channel,
                    },
                );
                Registration::Inserted
            }
            Some(record) => {
                let current = record.channel.dialer(&self.local);
                let candidate = channel.dialer(&self.local);
                if candidate < current {
                    log::debug!(
                        "Duplicate link to {address}: keeping channel {} dialed by {candidate}",
                        channel.id()
                    );
                    let old = std::mem::replace(&mut record.channel, channel);
                    Registration::Replaced(old)
                } else {
                    log::debug!(
                        "Duplicate link to {address}: keeping channel {} dialed by {current}",
                        record.channel.id()
                    );
                    Registration::Rejected(channel)
                }
            }
        }
    }

    pub fn remove(&mut self, address: &PeerAddress) -> Option<PeerRecord> {
        self.peers.remove(address)
    }

    /// Remove `address` only if `channel` is its current link. Close events
    /// of superseded channels therefore never drop a live peer.
    pub fn remove_channel(
        &mut self,
        address: &PeerAddress,
        channel: ChannelId,
    ) -> Option<PeerRecord> {
        match self.peers.get(address) {
            Some(record) if record.channel.id() == channel => self.peers.remove(address),
            _ => None,
        }
    }

    pub fn lookup(&self, address: &PeerAddress) -> Option<&PeerRecord> {
        self.peers.get(address)
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.peers.contains_key(address)
    }

    /// Replace the stored identity. `None` if the address is unknown,
    /// otherwise whether anything changed.
    pub fn update_identity(&mut self, address: &PeerAddress, identity: Identity) -> Option<bool> {
        let record = self.peers.get_mut(address)?;
        if record.identity == identity {
            return Some(false);
        }
        record.identity = identity;
        Some(true)
    }

    /// All records, ordered by address.
    pub fn all(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.all().map(PeerRecord::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn send_to(&self, address: &PeerAddress, msg: &MeshMessage) -> Result<(), TransportError> {
        self.peers
            .get(address)
            .ok_or_else(|| TransportError::Closed(address.clone()))?
            .channel
            .send(msg)
    }

    /// Send `msg` to every peer except `except`. The message is encoded
    /// once; peers whose channel already closed are skipped.
    ///
    /// Returns the number of peers the frame was handed to.
    pub fn broadcast(
        &self,
        msg: &MeshMessage,
        except: Option<&PeerAddress>,
    ) -> Result<usize, ProtocolError> {
        let frame = msg.encode()?;
        let mut delivered = 0;
        for record in self.peers.values() {
            if Some(&record.address) == except {
                continue;
            }
            match record.channel.send_raw(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => log::debug!("Skipping {}: {e}", record.address),
            }
        }
        Ok(delivered)
    }

    /// Drop every record, closing all channels.
    pub fn clear(&mut self) -> Vec<PeerRecord> {
        std::mem::take(&mut self.peers).into_values().collect()
    }
}
