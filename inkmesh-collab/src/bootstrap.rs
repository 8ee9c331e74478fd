//! Room bootstrap: resolve a room to a claimed address and a role.
//!
//! Hosting is nothing more than winning the atomic rendezvous claim for the
//! room's derived address; there is no leader state beyond that one result.
//! Guests claim a fresh participant address and dial the host's.

use tokio::time::timeout;

use crate::error::MeshError;
use crate::node::NodeConfig;
use crate::protocol::{guest_address, Identity, PeerAddress, RoomId};
use crate::transport::{Channel, EventReceiver, Transport, TransportError};

/// Length of the random part of a guest address.
const GUEST_TOKEN_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Claimed the room's rendezvous address.
    Host,
    /// Dialed an existing host.
    Guest,
}

/// A started session, ready to be driven by a node.
#[derive(Debug)]
pub struct Session {
    pub room_id: RoomId,
    pub role: Role,
    pub local_address: PeerAddress,
    pub events: EventReceiver,
    /// Open link to the host, for guests.
    pub host_channel: Option<Channel>,
}

/// Claim a freshly generated room, retrying on collision.
pub async fn create_room<T>(transport: &T, config: &NodeConfig) -> Result<Session, MeshError>
where
    T: Transport + ?Sized,
{
    create_room_with(transport, config, || {
        RoomId::generate(&config.room_alphabet, config.room_id_length)
    })
    .await
}

/// [`create_room`] with a caller-supplied id generator.
pub async fn create_room_with<T, F>(
    transport: &T,
    config: &NodeConfig,
    mut next_id: F,
) -> Result<Session, MeshError>
where
    T: Transport + ?Sized,
    F: FnMut() -> RoomId,
{
    for attempt in 1..=config.max_create_attempts {
        let room_id = next_id();
        let address = room_id.rendezvous_address(&config.rendezvous_prefix);
        match transport.register(&address).await {
            Ok(events) => {
                log::info!("Claimed room {room_id} as {address}");
                return Ok(Session {
                    room_id,
                    role: Role::Host,
                    local_address: address,
                    events,
                    host_channel: None,
                });
            }
            Err(TransportError::AddressTaken(_)) => {
                log::warn!(
                    "{} (attempt {attempt}/{}), retrying",
                    MeshError::RoomCollision(room_id),
                    config.max_create_attempts
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(MeshError::RetriesExhausted(config.max_create_attempts))
}

/// Join `room_id` as a guest.
///
/// The dial is bounded by `config.join_timeout`; on any failure the guest
/// address is released and no session exists.
pub async fn join_room<T>(
    transport: &T,
    config: &NodeConfig,
    room_id: RoomId,
    identity: &Identity,
) -> Result<Session, MeshError>
where
    T: Transport + ?Sized,
{
    let local = guest_address(
        &config.rendezvous_prefix,
        &config.room_alphabet,
        GUEST_TOKEN_LENGTH,
    );
    let events = transport.register(&local).await?;
    let host = room_id.rendezvous_address(&config.rendezvous_prefix);
    log::info!("Joining room {room_id} from {local}");

    let result = match timeout(config.join_timeout, transport.dial(&local, &host, identity)).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(TransportError::Unreachable(_))) => Err(MeshError::RoomNotFound(room_id.clone())),
        Ok(Err(e)) => Err(MeshError::from(e)),
        Err(_) => Err(MeshError::ConnectionTimeout),
    };

    match result {
        Ok(channel) => {
            log::info!("Connected to room {room_id} via {host}");
            Ok(Session {
                room_id,
                role: Role::Guest,
                local_address: local,
                events,
                host_channel: Some(channel),
            })
        }
        Err(e) => {
            log::warn!("Join of room {room_id} failed: {e}");
            transport.unregister(&local).await;
            Err(e)
        }
    }
}

/// Claim the single global room, or join it if someone already holds it.
pub async fn connect_global<T>(
    transport: &T,
    config: &NodeConfig,
    identity: &Identity,
) -> Result<Session, MeshError>
where
    T: Transport + ?Sized,
{
    let room_id = RoomId::global();
    let address = room_id.rendezvous_address(&config.rendezvous_prefix);
    match transport.register(&address).await {
        Ok(events) => {
            log::info!("Hosting global room as {address}");
            Ok(Session {
                room_id,
                role: Role::Host,
                local_address: address,
                events,
                host_channel: None,
            })
        }
        Err(TransportError::AddressTaken(_)) => {
            log::info!("Global room already hosted, joining");
            join_room(transport, config, room_id, identity).await
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    fn config() -> NodeConfig {
        NodeConfig {
            join_timeout: Duration::from_millis(100),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_claims_prefixed_address() {
        let net = MemoryNetwork::new();
        let session = create_room(&net, &config()).await.unwrap();
        assert_eq!(session.role, Role::Host);
        assert_eq!(session.room_id.as_str().len(), 5);
        assert_eq!(
            session.local_address,
            session.room_id.rendezvous_address("ink-")
        );
        assert!(net.is_registered(&session.local_address));
    }

    #[tokio::test]
    async fn test_collision_retries_with_new_id() {
        let net = MemoryNetwork::new();
        net.blackhole(&"ink-AAAAA".into());

        let mut ids = vec![RoomId::new("BBBBB"), RoomId::new("AAAAA")];
        let session = create_room_with(&net, &config(), || ids.pop().unwrap())
            .await
            .unwrap();
        assert_eq!(session.room_id.as_str(), "BBBBB");
        assert_ne!(session.room_id.as_str(), "AAAAA");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let net = MemoryNetwork::new();
        net.blackhole(&"ink-AAAAA".into());
        let config = NodeConfig {
            max_create_attempts: 3,
            ..config()
        };
        let err = create_room_with(&net, &config, || RoomId::new("AAAAA"))
            .await
            .unwrap_err();
        assert_eq!(err, MeshError::RetriesExhausted(3));
    }

    #[tokio::test]
    async fn test_join_existing_room() {
        let net = MemoryNetwork::new();
        let host = create_room(&net, &config()).await.unwrap();
        let guest = join_room(&net, &config(), host.room_id.clone(), &Identity::named("G"))
            .await
            .unwrap();
        assert_eq!(guest.role, Role::Guest);
        assert_ne!(guest.local_address, host.local_address);
        let channel = guest.host_channel.unwrap();
        assert_eq!(channel.remote(), &host.local_address);
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let net = MemoryNetwork::new();
        let err = join_room(&net, &config(), RoomId::new("NOPE1"), &Identity::named("G"))
            .await
            .unwrap_err();
        assert_eq!(err, MeshError::RoomNotFound(RoomId::new("NOPE1")));
        assert_eq!(net.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_join_timeout_releases_guest_address() {
        let net = MemoryNetwork::new();
        net.blackhole(&"ink-SLOW1".into());
        let err = join_room(&net, &config(), RoomId::new("SLOW1"), &Identity::named("G"))
            .await
            .unwrap_err();
        assert_eq!(err, MeshError::ConnectionTimeout);
        assert_eq!(net.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_global_room_host_then_guest() {
        let net = MemoryNetwork::new();
        let first = connect_global(&net, &config(), &Identity::named("A"))
            .await
            .unwrap();
        let second = connect_global(&net, &config(), &Identity::named("B"))
            .await
            .unwrap();
        assert_eq!(first.role, Role::Host);
        assert_eq!(second.role, Role::Guest);
        assert_eq!(first.room_id, RoomId::global());
        assert_eq!(second.room_id, RoomId::global());
    }
}
