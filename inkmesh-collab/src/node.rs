//! Mesh node: the per-participant event loop.
//!
//! A node owns the peer registry and the canvas replica and mutates them
//! only from its own task. It reacts to three sources:
//!
//! ```text
//!  Transport events ──┐
//!  MeshHandle cmds ───┼──► MeshNode (single task) ──► MeshListener
//!  Dial outcomes ─────┘         │
//!                               └──► PeerRegistry ──► channels
//! ```
//!
//! Dials to announced peers and rendezvous re-registration run in their own
//! tasks and report back through outcome queues, so the loop never blocks
//! on the network.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use inkmesh_core::{AddOutcome, CanvasReplica, Point, Stroke, StrokeId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use crate::bootstrap::{self, Role, Session};
use crate::error::MeshError;
use crate::listener::MeshListener;
use crate::presence::{CursorThrottle, RemoteCursor, RemoteCursors};
use crate::protocol::{Identity, MeshMessage, PeerAddress, RoomId};
use crate::registry::{PeerRegistry, PeerSummary, Registration};
use crate::transport::{Channel, ChannelId, EventReceiver, Transport, TransportError, TransportEvent};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Namespace prepended to room tokens and guest addresses
    pub rendezvous_prefix: String,
    /// Characters room tokens are drawn from
    pub room_alphabet: String,
    pub room_id_length: usize,
    /// Bound on a guest's dial to the host, and on announced-peer dials
    pub join_timeout: Duration,
    pub max_create_attempts: usize,
    /// Capacity of the handle → node command queue
    pub command_buffer: usize,
    /// Minimum spacing of outgoing cursor updates
    pub cursor_interval: Duration,
    /// Remote pointers not updated for this long are forgotten
    pub cursor_idle_timeout: Duration,
    /// Re-registration attempts after the rendezvous registration is lost,
    /// each bounded by `join_timeout`
    pub reconnect_attempts: usize,
    /// Pause before retry `n` is `n * reconnect_backoff`
    pub reconnect_backoff: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rendezvous_prefix: "ink-".to_string(),
            room_alphabet: "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".to_string(),
            room_id_length: 5,
            join_timeout: Duration::from_secs(10),
            max_create_attempts: 32,
            command_buffer: 256,
            cursor_interval: Duration::from_millis(50),
            cursor_idle_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(250),
        }
    }
}

/// Node counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    /// Forwarded copies of stroke/erase/clear-all, per receiving neighbor.
    pub messages_relayed: u64,
    pub announces_sent: u64,
    pub dials_started: u64,
    pub dials_failed: u64,
    pub decode_errors: u64,
}

#[derive(Debug)]
enum NodeCommand {
    SendStroke(Stroke),
    SendErase(Vec<StrokeId>),
    SendCursor { x: f64, y: f64 },
    ClearAll,
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Stats(oneshot::Sender<NodeStats>),
    Snapshot(oneshot::Sender<Vec<Stroke>>),
    Cursors(oneshot::Sender<Vec<(PeerAddress, RemoteCursor)>>),
    Destroy(oneshot::Sender<()>),
}

#[derive(Debug)]
struct DialOutcome {
    target: PeerAddress,
    identity: Identity,
    result: Result<Channel, TransportError>,
}

struct MeshNode<L> {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    local: PeerAddress,
    identity: Identity,
    registry: PeerRegistry,
    replica: CanvasReplica,
    cursors: RemoteCursors,
    throttle: CursorThrottle,
    pending_dials: HashSet<PeerAddress>,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
    reconnect_tx: mpsc::UnboundedSender<Result<(), MeshError>>,
    reconnect_task: Option<JoinHandle<()>>,
    /// Registration was lost again while a reconnect was in flight.
    reconnect_again: bool,
    stats: NodeStats,
    listener: L,
}

impl<L: MeshListener> MeshNode<L> {
    async fn run(
        mut self,
        mut events: EventReceiver,
        mut commands: mpsc::Receiver<NodeCommand>,
        mut dials: mpsc::UnboundedReceiver<DialOutcome>,
        mut reconnects: mpsc::UnboundedReceiver<Result<(), MeshError>>,
    ) {
        let mut sweep = interval((self.config.cursor_idle_timeout / 2).max(MIN_SWEEP_PERIOD));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        log::warn!("Transport event stream for {} ended", self.local);
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(NodeCommand::Destroy(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    // Every handle is gone.
                    None => break,
                },
                Some(outcome) = dials.recv() => self.handle_dial_outcome(outcome),
                Some(result) = reconnects.recv() => self.handle_reconnect_outcome(result),
                _ = sweep.tick() => self.sweep_cursors(),
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        let records = self.registry.clear();
        log::info!(
            "Shutting down {} ({} peer links closed)",
            self.local,
            records.len()
        );
        drop(records);
        let transport = self.transport.clone();
        let local = self.local.clone();
        transport.unregister(&local).await;
    }

    // ─── Transport ───────────────────────────────────────────────────

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming(channel) => {
                let identity = channel
                    .metadata()
                    .cloned()
                    .unwrap_or_else(Identity::placeholder);
                log::debug!("Incoming channel {} from {}", channel.id(), channel.remote());
                self.open_link(channel, identity);
            }
            TransportEvent::Data {
                channel,
                from,
                payload,
            } => self.handle_frame(channel, from, &payload),
            TransportEvent::Closed { channel, from } => self.handle_closed(channel, from),
            TransportEvent::Error { channel, message } => {
                log::warn!("Transport error on {channel:?}: {message}");
            }
            TransportEvent::RendezvousLost => self.start_reconnect(),
        }
    }

    /// Greet a freshly opened channel and register it.
    fn open_link(&mut self, channel: Channel, identity: Identity) {
        if let Err(e) = channel.send(&MeshMessage::identity(&self.identity)) {
            log::warn!("Could not greet {}: {e}", channel.remote());
            return;
        }
        self.stats.messages_sent += 1;

        let address = channel.remote().clone();
        match self.registry.add(channel, identity.clone()) {
            Registration::Inserted => {
                log::info!(
                    "Peer {address} connected as {} ({} peers)",
                    identity.username,
                    self.registry.len()
                );
                self.listener.on_peer_connected(&address, &identity);
            }
            // Superseded or losing duplicate links close when dropped here.
            Registration::Replaced(old) => drop(old),
            Registration::Rejected(new) => drop(new),
        }
    }

    fn handle_closed(&mut self, channel: ChannelId, from: PeerAddress) {
        let Some(record) = self.registry.remove_channel(&from, channel) else {
            log::trace!("Ignoring close of superseded channel {channel} from {from}");
            return;
        };
        self.cursors.remove(&from);
        log::info!(
            "{} ({}), {} peers left",
            MeshError::PeerDropped(from.clone()),
            record.identity.username,
            self.registry.len()
        );
        self.listener
            .on_peer_disconnected(&from, &record.identity.username);
    }

    fn start_reconnect(&mut self) {
        if self.reconnect_task.is_some() {
            self.reconnect_again = true;
            return;
        }
        log::warn!("Rendezvous registration for {} lost, reconnecting", self.local);

        let transport = self.transport.clone();
        let local = self.local.clone();
        let attempts = self.config.reconnect_attempts.max(1);
        let bound = self.config.join_timeout;
        let backoff = self.config.reconnect_backoff;
        let outcomes = self.reconnect_tx.clone();
        self.reconnect_task = Some(tokio::spawn(async move {
            let result = reconnect(transport.as_ref(), &local, attempts, bound, backoff).await;
            let _ = outcomes.send(result);
        }));
    }

    fn handle_reconnect_outcome(&mut self, result: Result<(), MeshError>) {
        self.reconnect_task = None;
        match result {
            Ok(()) => log::info!("Rendezvous registration for {} restored", self.local),
            Err(e) => {
                log::error!("Rendezvous reconnect for {} failed: {e}", self.local);
                self.listener
                    .on_error(&format!("Rendezvous reconnect failed: {e}"));
            }
        }
        if std::mem::take(&mut self.reconnect_again) {
            self.start_reconnect();
        }
    }

    fn sweep_cursors(&mut self) {
        let idle = self.cursors.cleanup_idle(self.config.cursor_idle_timeout);
        if !idle.is_empty() {
            log::debug!("Forgot {} idle remote cursor(s)", idle.len());
        }
    }

    // ─── Messages ────────────────────────────────────────────────────

    fn handle_frame(&mut self, channel: ChannelId, from: PeerAddress, payload: &str) {
        self.stats.messages_received += 1;
        let msg = match MeshMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.decode_errors += 1;
                log::warn!("Dropping frame from {from}: {e}");
                return;
            }
        };
        if !self.registry.contains(&from) {
            log::debug!(
                "Dropping {} from unregistered {from} (channel {channel})",
                msg.kind()
            );
            return;
        }
        self.handle_message(from, msg);
    }

    fn handle_message(&mut self, from: PeerAddress, msg: MeshMessage) {
        let relay = msg.relay_copy();
        log::trace!("{} from {from}", msg.kind());

        match msg {
            MeshMessage::Identity { username, color } => {
                self.refresh_identity(&from, Identity::new(username, color));
            }
            MeshMessage::Stroke { stroke, .. } => {
                if self.replica.add(stroke.clone()) == AddOutcome::Added {
                    self.listener.on_stroke_received(&stroke);
                }
            }
            MeshMessage::Erase { stroke_ids, .. } => {
                let removed = self.replica.erase(&stroke_ids);
                if !removed.is_empty() {
                    self.listener.on_strokes_erased(&removed);
                }
            }
            MeshMessage::Cursor {
                x,
                y,
                username,
                color,
            } => {
                let identity = Identity::new(username, color);
                self.cursors.update(&from, Point::new(x, y), &identity);
                self.listener.on_cursor_update(&from, x, y, &identity);
            }
            MeshMessage::SyncRequest { username, color } => {
                let identity = Identity::new(username, color);
                self.registry.update_identity(&from, identity.clone());
                self.serve_sync(&from, &identity);
            }
            MeshMessage::SyncData { strokes, erased } => {
                let outcome = self.replica.merge(strokes, &erased);
                log::info!(
                    "Synced from {from}: {} added, {} erased, {} already known",
                    outcome.added.len(),
                    outcome.erased.len(),
                    outcome.skipped
                );
                if !outcome.erased.is_empty() {
                    self.listener.on_strokes_erased(&outcome.erased);
                }
                self.listener.on_sync_data(&outcome.added);
            }
            MeshMessage::PeerAnnounce {
                peer_id,
                username,
                color,
            } => self.handle_announce(peer_id, Identity::new(username, color)),
            MeshMessage::ClearAll { .. } => {
                let removed = self.replica.clear();
                log::info!("Canvas cleared by {from} ({removed} strokes)");
                self.listener.on_clear_all();
            }
        }

        if let Some(copy) = relay {
            let forwarded = self.broadcast(&copy, Some(&from));
            self.stats.messages_relayed += forwarded as u64;
            log::trace!("Relayed {} from {from} to {forwarded} peers", copy.kind());
        }
    }

    /// Store a peer's announced identity and let the listener re-render it.
    fn refresh_identity(&mut self, address: &PeerAddress, identity: Identity) {
        if let Some(changed) = self.registry.update_identity(address, identity.clone()) {
            if changed {
                log::debug!("Peer {address} is now known as {}", identity.username);
            }
            self.listener.on_peer_connected(address, &identity);
        }
    }

    /// Answer a newcomer with our replica and introduce it to everyone else.
    fn serve_sync(&mut self, newcomer: &PeerAddress, identity: &Identity) {
        let strokes = self
            .listener
            .on_sync_request()
            .unwrap_or_else(|| self.replica.snapshot());
        let reply = MeshMessage::sync_data(strokes, self.replica.tombstones());
        match self.registry.send_to(newcomer, &reply) {
            Ok(()) => self.stats.messages_sent += 1,
            Err(e) => log::warn!("Sync reply to {newcomer} failed: {e}"),
        }

        let announce = MeshMessage::peer_announce(newcomer.clone(), identity);
        let announced = self.broadcast(&announce, Some(newcomer));
        self.stats.announces_sent += announced as u64;
        log::debug!("Announced {newcomer} to {announced} peers");
    }

    fn handle_announce(&mut self, target: PeerAddress, identity: Identity) {
        if target == self.local
            || self.registry.contains(&target)
            || self.pending_dials.contains(&target)
        {
            log::trace!("Announce of {target} needs no dial");
            return;
        }
        self.start_dial(target, identity);
    }

    fn start_dial(&mut self, target: PeerAddress, identity: Identity) {
        log::debug!("Dialing announced peer {target} ({})", identity.username);
        self.pending_dials.insert(target.clone());
        self.stats.dials_started += 1;

        let transport = self.transport.clone();
        let local = self.local.clone();
        let metadata = self.identity.clone();
        let bound = self.config.join_timeout;
        let outcomes = self.dial_tx.clone();
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(bound, transport.dial(&local, &target, &metadata)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Unreachable(target.clone())),
                };
            let _ = outcomes.send(DialOutcome {
                target,
                identity,
                result,
            });
        });
    }

    fn handle_dial_outcome(&mut self, outcome: DialOutcome) {
        self.pending_dials.remove(&outcome.target);
        match outcome.result {
            Ok(channel) => self.open_link(channel, outcome.identity),
            Err(e) => {
                self.stats.dials_failed += 1;
                log::warn!("Dial to announced peer {} failed: {e}", outcome.target);
            }
        }
    }

    /// Send to every registered peer except `except`; returns the number
    /// of peers reached.
    fn broadcast(&mut self, msg: &MeshMessage, except: Option<&PeerAddress>) -> usize {
        match self.registry.broadcast(msg, except) {
            Ok(delivered) => {
                self.stats.messages_sent += delivered as u64;
                delivered
            }
            Err(e) => {
                log::error!("Could not encode {}: {e}", msg.kind());
                0
            }
        }
    }

    // ─── Local commands ──────────────────────────────────────────────

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::SendStroke(stroke) => {
                self.replica.add(stroke.clone());
                self.broadcast(&MeshMessage::stroke(stroke), None);
            }
            NodeCommand::SendErase(ids) => {
                self.replica.erase(&ids);
                self.broadcast(&MeshMessage::erase(ids), None);
            }
            NodeCommand::SendCursor { x, y } => {
                if self.throttle.should_send() {
                    let msg = MeshMessage::cursor(x, y, &self.identity);
                    self.broadcast(&msg, None);
                } else {
                    log::trace!("Cursor update throttled");
                }
            }
            NodeCommand::ClearAll => {
                self.replica.clear();
                self.broadcast(&MeshMessage::clear_all(), None);
            }
            NodeCommand::Peers(reply) => {
                let _ = reply.send(self.registry.summaries());
            }
            NodeCommand::Stats(reply) => {
                let _ = reply.send(self.stats.clone());
            }
            NodeCommand::Snapshot(reply) => {
                let _ = reply.send(self.replica.snapshot());
            }
            NodeCommand::Cursors(reply) => {
                let cursors = self
                    .cursors
                    .iter()
                    .map(|(address, cursor)| (address.clone(), cursor.clone()))
                    .collect();
                let _ = reply.send(cursors);
            }
            NodeCommand::Destroy(_) => {}
        }
    }
}

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// Re-claim `local` at the rendezvous service, retrying with a linear
/// backoff. Each attempt is bounded by `bound`.
async fn reconnect(
    transport: &dyn Transport,
    local: &PeerAddress,
    attempts: usize,
    bound: Duration,
    backoff: Duration,
) -> Result<(), MeshError> {
    let mut last = MeshError::ConnectionTimeout;
    for attempt in 1..=attempts {
        match timeout(bound, transport.reconnect(local)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                log::warn!("Reconnect {attempt}/{attempts} for {local} failed: {e}");
                last = e.into();
            }
            Err(_) => {
                log::warn!("Reconnect {attempt}/{attempts} for {local} timed out");
                last = MeshError::ConnectionTimeout;
            }
        }
        if attempt < attempts {
            sleep(backoff * attempt as u32).await;
        }
    }
    Err(last)
}

/// Handle to a running mesh node.
///
/// Dropping the handle stops the node as if [`MeshHandle::destroy`] had
/// been called, without waiting for it.
pub struct MeshHandle {
    room_id: RoomId,
    role: Role,
    local_address: PeerAddress,
    identity: Identity,
    commands: mpsc::Sender<NodeCommand>,
    task: JoinHandle<()>,
}

impl MeshHandle {
    /// Host a new room under a freshly generated id.
    pub async fn create_room<T, L>(
        transport: Arc<T>,
        config: NodeConfig,
        identity: Identity,
        mut listener: L,
    ) -> Result<Self, MeshError>
    where
        T: Transport,
        L: MeshListener,
    {
        match bootstrap::create_room(transport.as_ref(), &config).await {
            Ok(session) => Ok(Self::start(transport, config, identity, session, listener)),
            Err(e) => {
                listener.on_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Join an existing room as a guest and request its canvas.
    pub async fn join_room<T, L>(
        transport: Arc<T>,
        config: NodeConfig,
        identity: Identity,
        room_id: RoomId,
        mut listener: L,
    ) -> Result<Self, MeshError>
    where
        T: Transport,
        L: MeshListener,
    {
        match bootstrap::join_room(transport.as_ref(), &config, room_id, &identity).await {
            Ok(session) => Ok(Self::start(transport, config, identity, session, listener)),
            Err(e) => {
                listener.on_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Host or join the single global room.
    pub async fn connect_global<T, L>(
        transport: Arc<T>,
        config: NodeConfig,
        identity: Identity,
        mut listener: L,
    ) -> Result<Self, MeshError>
    where
        T: Transport,
        L: MeshListener,
    {
        match bootstrap::connect_global(transport.as_ref(), &config, &identity).await {
            Ok(session) => Ok(Self::start(transport, config, identity, session, listener)),
            Err(e) => {
                listener.on_error(&e.to_string());
                Err(e)
            }
        }
    }

    fn start<T, L>(
        transport: Arc<T>,
        config: NodeConfig,
        identity: Identity,
        session: Session,
        listener: L,
    ) -> Self
    where
        T: Transport,
        L: MeshListener,
    {
        let Session {
            room_id,
            role,
            local_address,
            events,
            host_channel,
        } = session;

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();

        let mut node = MeshNode {
            throttle: CursorThrottle::new(config.cursor_interval),
            config,
            transport,
            local: local_address.clone(),
            identity: identity.clone(),
            registry: PeerRegistry::new(local_address.clone()),
            replica: CanvasReplica::new(),
            cursors: RemoteCursors::new(),
            pending_dials: HashSet::new(),
            dial_tx,
            reconnect_tx,
            reconnect_task: None,
            reconnect_again: false,
            stats: NodeStats::default(),
            listener,
        };

        if let Some(channel) = host_channel {
            // Host identity arrives in its greeting; until then it is a placeholder.
            let host = channel.remote().clone();
            node.open_link(channel, Identity::placeholder());
            match node.registry.send_to(&host, &MeshMessage::sync_request(&identity)) {
                Ok(()) => node.stats.messages_sent += 1,
                Err(e) => log::warn!("Sync request to {host} failed: {e}"),
            }
        }

        let task = tokio::spawn(node.run(events, command_rx, dial_rx, reconnect_rx));
        Self {
            room_id,
            role,
            local_address,
            identity,
            commands: command_tx,
            task,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// False once the node task has stopped.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    async fn command(&self, command: NodeCommand) -> Result<(), MeshError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MeshError::Shutdown)
    }

    async fn query<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> NodeCommand,
    ) -> Result<R, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await.map_err(|_| MeshError::Shutdown)
    }

    /// Add a locally drawn stroke to the replica and broadcast it.
    pub async fn send_stroke(&self, stroke: Stroke) -> Result<(), MeshError> {
        self.command(NodeCommand::SendStroke(stroke)).await
    }

    pub async fn send_erase(&self, ids: Vec<StrokeId>) -> Result<(), MeshError> {
        self.command(NodeCommand::SendErase(ids)).await
    }

    /// Share the local pointer with direct neighbors, subject to the
    /// cursor throttle.
    pub async fn send_cursor(&self, x: f64, y: f64) -> Result<(), MeshError> {
        self.command(NodeCommand::SendCursor { x, y }).await
    }

    pub async fn send_clear_all(&self) -> Result<(), MeshError> {
        self.command(NodeCommand::ClearAll).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, MeshError> {
        self.query(NodeCommand::Peers).await
    }

    pub async fn stats(&self) -> Result<NodeStats, MeshError> {
        self.query(NodeCommand::Stats).await
    }

    /// Replica contents in insertion order.
    pub async fn snapshot(&self) -> Result<Vec<Stroke>, MeshError> {
        self.query(NodeCommand::Snapshot).await
    }

    /// Last known pointers of direct neighbors, ordered by address.
    pub async fn cursors(&self) -> Result<Vec<(PeerAddress, RemoteCursor)>, MeshError> {
        self.query(NodeCommand::Cursors).await
    }

    /// Close every peer link, release the rendezvous registration and wait
    /// for the node to stop.
    pub async fn destroy(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(NodeCommand::Destroy(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            log::error!("Mesh node task failed: {e}");
        }
    }
}
