//! inkmesh: terminal client for the shared canvas mesh.
//!
//! `inkmesh rendezvous` runs the address-lookup server; `create`, `join`
//! and `global` start a participant that reads drawing commands from stdin
//! and prints what the rest of the room does.

mod commands;
mod session;

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use inkmesh_collab::{
    EventForwarder, Identity, MeshHandle, NodeConfig, RendezvousConfig, RendezvousServer, RoomId,
    WsConfig, WsTransport,
};
use log::info;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Shared drawing canvas over a peer mesh", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a rendezvous server
    Rendezvous {
        /// Address to listen on
        #[clap(long, default_value = "127.0.0.1:9090")]
        bind: String,
    },
    /// Host a new room
    Create(PeerArgs),
    /// Join an existing room by its id
    Join {
        room: String,
        #[clap(flatten)]
        peer: PeerArgs,
    },
    /// Host or join the single global room
    Global(PeerArgs),
}

#[derive(Args, Debug)]
struct PeerArgs {
    /// Display name shown to other participants
    #[clap(long, default_value = "Anonymous")]
    name: String,
    /// Rendezvous server URL
    #[clap(long, default_value = "ws://127.0.0.1:9090")]
    rendezvous: String,
    /// Host to bind the peer listener to
    #[clap(long, default_value = "127.0.0.1")]
    listen_host: String,
    /// Seconds to wait for the host when joining
    #[clap(long, default_value_t = 10)]
    join_timeout_secs: u64,
}

impl PeerArgs {
    fn transport(&self) -> Arc<WsTransport> {
        Arc::new(WsTransport::new(WsConfig {
            rendezvous_url: self.rendezvous.clone(),
            listen_host: self.listen_host.clone(),
            ..WsConfig::default()
        }))
    }

    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            ..NodeConfig::default()
        }
    }

    fn identity(&self) -> Identity {
        Identity::named(self.name.trim())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let (listener, events) = EventForwarder::new();

    let handle = match cli.command {
        Command::Rendezvous { bind } => {
            let server = RendezvousServer::new(RendezvousConfig { bind_addr: bind });
            return server.run().await;
        }
        Command::Create(args) => {
            MeshHandle::create_room(args.transport(), args.node_config(), args.identity(), listener)
                .await?
        }
        Command::Join { room, peer } => {
            let room_id = RoomId::parse(&room).ok_or("room id must not be empty")?;
            MeshHandle::join_room(
                peer.transport(),
                peer.node_config(),
                peer.identity(),
                room_id,
                listener,
            )
            .await?
        }
        Command::Global(args) => {
            MeshHandle::connect_global(args.transport(), args.node_config(), args.identity(), listener)
                .await?
        }
    };

    info!(
        "In room {} as {} ({:?})",
        handle.room_id(),
        handle.local_address(),
        handle.role()
    );
    session::run(handle, events).await
}
