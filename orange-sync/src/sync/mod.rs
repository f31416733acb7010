//! The peer-to-peer synchronization core.
//!
//! One task owns all protocol state (the peer table, the controller
//! designation, the open-link registry, the outbound message counter).
//! Connection readers, the periodic tickers, the outbound scanner, and the
//! public entry points talk to it exclusively through one event channel, so
//! every mutation is serialized and handlers observe consistent state.
//!
//! Outbound frames never block the loop: each link has a bounded writer
//! queue fed with `try_send`. A full queue drops the frame for that link and
//! logs it; gossip redundancy and the periodic rebroadcasts recover.

mod assignment;
mod election;
mod link;
mod liveness;
mod outbound;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::addr_cache::AddrCache;
use crate::config::{NodeIdentity, SyncTiming};
use crate::message::{self, CacheScope, HELLO_ID, Message, ModuleDescriptor, Payload};
use crate::peer::{Peer, PeerTable, Rename};
use crate::registry::{self, ConfigCacheSink, LocalModule, ModuleRegistry};
use crate::tls::TlsBundle;

/// Capacity of the core event channel.
const EVENT_QUEUE: usize = 1024;
/// Capacity of each link's writer queue.
const WRITE_QUEUE: usize = 256;

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Inbound,
    Outbound,
}

/// A connection that passed the hello exchange, as the core tracks it.
pub(crate) struct EstablishedLink {
    pub(crate) id: u64,
    pub(crate) peer: String,
    pub(crate) tx: mpsc::Sender<String>,
}

/// Everything that can reach the event loop.
pub(crate) enum Event {
    LinkEstablished {
        link: EstablishedLink,
        direction: LinkDirection,
        /// Table name this endpoint was dialed under (outbound only).
        expected: Option<String>,
        /// Address dialed (outbound only); lets an inbound-learned peer
        /// stay address-less.
        dialed_addr: Option<String>,
        /// Core's accept/reject decision; reject closes the connection.
        verdict: oneshot::Sender<bool>,
    },
    /// An outbound dial answered with our own hello.
    SelfLoop {
        expected: Option<String>,
        dialed_addr: Option<String>,
    },
    Frame {
        link_id: u64,
        raw: String,
        message: Message,
    },
    LinkClosed {
        link_id: u64,
    },
    HeartbeatTick,
    CheckTick,
    /// Outbound scanner asking for the next pass's targets.
    DialTargets {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    /// Outbound scanner finished a full pass.
    PassEnded {
        connected: bool,
    },
    /// The solo-fallback grace period elapsed.
    GiveUpExpired,
    /// Local collaborator wants a cache invalidation fanned out.
    BroadcastExpire {
        config_name: String,
        scope: CacheScope,
        id: String,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

/// Shared context handed to connection and scanner tasks.
#[derive(Clone)]
pub(crate) struct LinkCtx {
    pub(crate) identity: Arc<NodeIdentity>,
    pub(crate) timing: SyncTiming,
    pub(crate) event_tx: mpsc::Sender<Event>,
    pub(crate) link_ids: Arc<AtomicU64>,
}

/// Read-only view for the operator debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub self_name: String,
    pub controller: Option<String>,
    pub peers: Vec<PeerStatus>,
    pub modules: Vec<LocalModule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub address: Option<String>,
    pub priority: i64,
    pub alive: bool,
    pub known_dead: bool,
    pub modules: Vec<ModuleDescriptor>,
}

/// Constructor inputs for [`SyncHandler::start`].
pub struct SyncOptions {
    pub identity: NodeIdentity,
    pub timing: SyncTiming,
    /// Listener address; port 0 binds an ephemeral port (tests).
    pub bind_addr: SocketAddr,
    /// Endpoint advertised to peers, if known.
    pub my_address: Option<String>,
    /// Static peer endpoints from configuration.
    pub peers: Vec<String>,
    pub preferred_modules: Vec<String>,
    pub tls: TlsBundle,
    pub registry: Arc<dyn ModuleRegistry>,
    pub sink: Arc<dyn ConfigCacheSink>,
    pub cache_file: PathBuf,
}

/// Handle to a running sync node.
pub struct SyncHandler {
    event_tx: mpsc::Sender<Event>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandler {
    /// Bind the listener, seed the peer table, and spawn the node's tasks.
    /// Fails only on startup problems (bind, listener inspection).
    pub async fn start(opts: SyncOptions) -> Result<SyncHandler> {
        let listener = TcpListener::bind(opts.bind_addr)
            .await
            .with_context(|| format!("failed to bind sync listener on {}", opts.bind_addr))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        let mut self_peer = Peer::new(opts.identity.name.clone(), opts.my_address.clone());
        self_peer.priority = opts.identity.priority;
        let mut peers = PeerTable::new(self_peer);

        // Seed: cached (named) peers first, then configured addresses that
        // are not already known.
        let addr_cache = AddrCache::new(opts.cache_file);
        for cached in addr_cache.load() {
            peers.upsert(&cached.name, Some(cached.address));
        }
        for addr in &opts.peers {
            let known = peers.iter().any(|p| p.address.as_deref() == Some(addr.as_str()));
            if !known {
                peers.upsert(addr, Some(addr.clone()));
            }
        }

        let core = SyncCore {
            identity: opts.identity.clone(),
            timing: opts.timing.clone(),
            preferred_modules: opts.preferred_modules,
            registry: opts.registry,
            sink: opts.sink,
            addr_cache,
            peers,
            controller: None,
            links: HashMap::new(),
            next_message_id: 1,
            event_tx: event_tx.clone(),
            give_up_armed: false,
        };

        let ctx = LinkCtx {
            identity: Arc::new(opts.identity),
            timing: opts.timing.clone(),
            event_tx: event_tx.clone(),
            link_ids: Arc::new(AtomicU64::new(1)),
        };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(core.run(event_rx)));
        tasks.push(tokio::spawn(link::accept_loop(
            listener,
            opts.tls.acceptor(),
            ctx.clone(),
        )));
        tasks.push(tokio::spawn(outbound::scan_loop(
            opts.tls.connector(),
            opts.tls.server_name(),
            ctx.clone(),
        )));
        tasks.push(tokio::spawn(tick_loop(
            event_tx.clone(),
            opts.timing.heartbeat_interval,
            || Event::HeartbeatTick,
        )));
        tasks.push(tokio::spawn(tick_loop(
            event_tx.clone(),
            opts.timing.check_interval,
            || Event::CheckTick,
        )));

        tracing::info!(addr = %local_addr, "sync node started");
        Ok(SyncHandler {
            event_tx,
            local_addr,
            tasks,
        })
    }

    /// Address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Entry point for the configuration collaborator: fan an invalidation
    /// out to the mesh. Returns false if the node is shutting down.
    pub fn broadcast_expire(&self, config_name: &str, scope: CacheScope, id: &str) -> bool {
        self.event_tx
            .try_send(Event::BroadcastExpire {
                config_name: config_name.to_string(),
                scope,
                id: id.to_string(),
            })
            .is_ok()
    }

    /// Consistent snapshot of peers, controller, and module handlers.
    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.event_tx.send(Event::Status { reply: tx }).await.ok()?;
        rx.await.ok()
    }

    /// Stop all node tasks. Links die with their tasks.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SyncHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn tick_loop(tx: mpsc::Sender<Event>, period: std::time::Duration, make: fn() -> Event) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // the immediate first tick
    loop {
        interval.tick().await;
        if tx.send(make()).await.is_err() {
            return;
        }
    }
}

/// Protocol state and logic, owned by the event-loop task. Methods are
/// grouped by concern across the sibling modules (election, assignment,
/// liveness).
pub(crate) struct SyncCore {
    identity: NodeIdentity,
    timing: SyncTiming,
    preferred_modules: Vec<String>,
    registry: Arc<dyn ModuleRegistry>,
    sink: Arc<dyn ConfigCacheSink>,
    addr_cache: AddrCache,
    peers: PeerTable,
    /// Name of the current controller, possibly our own.
    controller: Option<String>,
    links: HashMap<u64, EstablishedLink>,
    next_message_id: u64,
    event_tx: mpsc::Sender<Event>,
    give_up_armed: bool,
}

impl SyncCore {
    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event, Instant::now());
        }
    }

    fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::LinkEstablished {
                link,
                direction,
                expected,
                dialed_addr,
                verdict,
            } => self.on_link_established(link, direction, expected, dialed_addr, verdict, now),
            Event::SelfLoop {
                expected,
                dialed_addr,
            } => self.on_self_loop(expected, dialed_addr),
            Event::Frame {
                link_id,
                raw,
                message,
            } => self.on_frame(link_id, raw, message, now),
            Event::LinkClosed { link_id } => self.on_link_closed(link_id),
            Event::HeartbeatTick => self.on_heartbeat_tick(),
            Event::CheckTick => self.on_check_tick(now),
            Event::DialTargets { reply } => {
                let _ = reply.send(self.peers.dial_targets());
            }
            Event::PassEnded { connected } => self.on_pass_ended(connected, now),
            Event::GiveUpExpired => self.on_give_up_expired(now),
            Event::BroadcastExpire {
                config_name,
                scope,
                id,
            } => self.broadcast(Payload::ExpireConfigCache {
                config_name,
                scope,
                id,
            }),
            Event::Status { reply } => {
                let _ = reply.send(self.status_snapshot(now));
            }
        }
    }

    pub(crate) fn controller_is_self(&self) -> bool {
        self.controller.as_deref() == Some(self.identity.name.as_str())
    }

    /// Send one message to every established link. The id counter advances
    /// even when there is nobody to hear it.
    pub(crate) fn broadcast(&mut self, payload: Payload) {
        let msg = Message {
            source: self.identity.name.clone(),
            id: self.next_message_id,
            payload,
        };
        self.next_message_id += 1;
        let line = message::encode(&msg);
        for link in self.links.values() {
            if link.tx.try_send(line.clone()).is_err() {
                tracing::warn!(peer = %link.peer, "writer queue full or closed, dropping frame");
            }
        }
    }

    /// Forward a raw inbound frame to every other link (gossip fanout).
    fn relay(&self, origin: u64, raw: &str) {
        for (id, link) in &self.links {
            if *id == origin {
                continue;
            }
            if link.tx.try_send(raw.to_string()).is_err() {
                tracing::warn!(peer = %link.peer, "writer queue full or closed, dropping relayed frame");
            }
        }
    }

    fn on_link_established(
        &mut self,
        link: EstablishedLink,
        direction: LinkDirection,
        expected: Option<String>,
        dialed_addr: Option<String>,
        verdict: oneshot::Sender<bool>,
        now: Instant,
    ) {
        let source = link.peer.clone();

        // The endpoint may have been configured under a different name
        // (typically its bare address). Rekey it to the identity it
        // actually advertised.
        if let Some(expected) = expected.as_deref() {
            if expected != source {
                match self.peers.rename(expected, &source) {
                    Rename::Renamed => {
                        tracing::info!(old = %expected, new = %source, "peer renamed at hello");
                    }
                    Rename::Collision => {
                        tracing::warn!(
                            old = %expected, new = %source,
                            "hello advertised an already-known name, keeping existing entry"
                        );
                        let _ = verdict.send(false);
                        return;
                    }
                    Rename::UnknownOld => {}
                }
            }
        }

        let peer = self.peers.upsert(&source, dialed_addr);
        peer.last_seen = Some(now);
        peer.revive();
        self.persist_addr_cache();

        if verdict.send(true).is_err() {
            // Connection died while we decided; nothing registered yet.
            return;
        }
        tracing::info!(peer = %source, ?direction, "sync link established");
        self.links.insert(link.id, link);
        self.announce();
    }

    fn on_self_loop(&mut self, expected: Option<String>, dialed_addr: Option<String>) {
        if let Some(expected) = expected {
            tracing::debug!(entry = %expected, "dialed ourselves, dropping table entry");
            self.peers.remove(&expected);
        }
        // A configured peer list that includes our own endpoint has just
        // taught us our advertised address.
        if self.peers.self_peer().address.is_none() {
            if let Some(addr) = dialed_addr {
                self.peers.self_peer_mut().address = Some(addr);
            }
        }
    }

    fn on_frame(&mut self, link_id: u64, raw: String, msg: Message, now: Instant) {
        if msg.source == self.identity.name {
            return; // our own broadcast came back around
        }
        if msg.id == HELLO_ID {
            // hello is only legal as the first frame, which the link layer
            // consumed; a stray one can't pass the id clock anyway.
            return;
        }
        if !self.peers.accept_message(&msg.source, msg.id, now) {
            tracing::trace!(source = %msg.source, id = msg.id, "duplicate message dropped");
            return;
        }
        // Direct evidence of life un-latches a death verdict.
        if matches!(msg.payload, Payload::Heartbeat | Payload::InstanceInfo { .. }) {
            if let Some(peer) = self.peers.get_mut(&msg.source) {
                peer.revive();
            }
        }

        self.relay(link_id, &raw);

        let source = msg.source;
        match msg.payload {
            Payload::Hello { .. } => {}
            Payload::Heartbeat => {}
            Payload::InstanceInfo { priority, address } => {
                self.handle_instance_info(&source, priority, address, now)
            }
            Payload::LostPeer { name } => self.handle_lost_peer(&source, &name, now),
            Payload::AssignModule { peer, module } => self.handle_assign_module(&peer, &module),
            Payload::RequestModule { module } => self.handle_request_module(&source, &module),
            Payload::ControlSwitch { name, priority } => {
                self.handle_control_switch(&name, priority)
            }
            Payload::ModuleInfo { modules } => self.handle_module_info(&source, modules),
            Payload::ExpireConfigCache {
                config_name,
                scope,
                id,
            } => {
                tracing::debug!(config = %config_name, %scope, %id, source = %source, "cache invalidation received");
                self.sink.expire_cache(&config_name, scope, &id);
            }
        }
    }

    fn on_link_closed(&mut self, link_id: u64) {
        if let Some(link) = self.links.remove(&link_id) {
            tracing::info!(peer = %link.peer, "sync link closed");
        }
    }

    /// What a node tells the mesh whenever a new link comes up: who it is,
    /// what it runs, and which modules it would like to have.
    fn announce(&mut self) {
        let priority = self.identity.priority;
        let address = self.peers.self_peer().address.clone();
        self.broadcast(Payload::InstanceInfo { priority, address });
        self.broadcast_module_info();
        for module in self.preferred_modules.clone() {
            if self.controller_is_self() {
                // Nobody receives their own broadcast; run the controller
                // path directly.
                let requester = self.identity.name.clone();
                self.handle_request_module(&requester, &module);
            } else {
                self.broadcast(Payload::RequestModule { module });
            }
        }
    }

    pub(crate) fn broadcast_module_info(&mut self) {
        let modules = registry::advertisement(self.registry.as_ref(), &self.identity.name);
        self.broadcast(Payload::ModuleInfo { modules });
    }

    /// Fire-and-forget rewrite of the address cache from the current table.
    pub(crate) fn persist_addr_cache(&self) {
        let entries = self.peers.cacheable();
        let cache = self.addr_cache.clone();
        tokio::task::spawn_blocking(move || cache.store(&entries));
    }

    fn status_snapshot(&self, now: Instant) -> StatusSnapshot {
        let window = self.timing.liveness_window();
        let peers = self
            .peers
            .others()
            .map(|p| PeerStatus {
                name: p.name.clone(),
                address: p.address.clone(),
                priority: p.priority,
                alive: p.is_alive(now, window),
                known_dead: p.known_dead,
                modules: p.modules.clone(),
            })
            .collect();
        StatusSnapshot {
            self_name: self.identity.name.clone(),
            controller: self.controller.clone(),
            peers,
            modules: self.registry.modules(),
        }
    }
}
