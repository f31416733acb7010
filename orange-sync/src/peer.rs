//! In-memory registry of known peers.
//!
//! The table is the single source of truth for peer identity, liveness, and
//! per-source message clocks. It is owned exclusively by the sync event loop;
//! everything else refers to peers by name and receives snapshots by value.
//!
//! Entries are kept in insertion order in a `Vec` so the outbound scanner's
//! round-robin order is well defined and a rename never passes through a
//! transient "absent" state.

use tokio::time::Instant;

use crate::message::ModuleDescriptor;

/// Priority of a peer whose instanceInfo has not arrived yet. Ranks below
/// every real priority (real ones are wall-clock-ms values).
pub const UNRANKED: i64 = i64::MAX;

/// One known peer. `self` is represented the same way as everyone else.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Unique instance identifier; the table key.
    pub name: String,
    /// Dialable `host:port`, or absent for a peer known only by name.
    pub address: Option<String>,
    /// Election rank; lower wins. [`UNRANKED`] until instanceInfo arrives.
    pub priority: i64,
    /// When the most recent message from this peer was accepted.
    pub last_seen: Option<Instant>,
    /// Largest envelope id accepted from this peer.
    pub last_message_id: u64,
    /// Latched when liveness fails or another peer announces the death.
    pub known_dead: bool,
    /// Set when the death came (or already went out) as a `lostPeer`
    /// broadcast, so it is not announced twice.
    pub death_announced: bool,
    /// Last module list advertised by this peer.
    pub modules: Vec<ModuleDescriptor>,
}

impl Peer {
    pub fn new(name: impl Into<String>, address: Option<String>) -> Self {
        Peer {
            name: name.into(),
            address,
            priority: UNRANKED,
            last_seen: None,
            last_message_id: 0,
            known_dead: false,
            death_announced: false,
            modules: Vec::new(),
        }
    }

    /// Liveness: not latched dead, heard from at all, and heard from within
    /// the window (HEARTBEAT_INTERVAL + DEAD_GRACE).
    pub fn is_alive(&self, now: Instant, window: tokio::time::Duration) -> bool {
        !self.known_dead
            && self
                .last_seen
                .is_some_and(|seen| now.saturating_duration_since(seen) <= window)
    }

    /// Whether this peer's last advertisement claims it handles `module`.
    pub fn claims_handling(&self, module: &str) -> bool {
        self.modules.iter().any(|d| d.name == module && d.handling)
    }

    /// Whether this peer's last advertisement claims `module` available.
    pub fn claims_available(&self, module: &str) -> bool {
        self.modules.iter().any(|d| d.name == module && d.available)
    }

    /// Record a fresh accepted message.
    fn touch(&mut self, id: u64, now: Instant) {
        self.last_message_id = self.last_message_id.max(id);
        self.last_seen = Some(now);
    }

    /// Revive a dead entry on direct evidence of life.
    pub fn revive(&mut self) {
        self.known_dead = false;
        self.death_announced = false;
    }
}

/// Outcome of a rename-at-hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rename {
    Renamed,
    /// The advertised name already exists as a distinct entry; the
    /// pre-existing entry wins and the connection must be closed.
    Collision,
    /// Nothing was known under the old name.
    UnknownOld,
}

/// Insertion-ordered, name-keyed peer table. The local node is always the
/// first entry.
#[derive(Debug)]
pub struct PeerTable {
    peers: Vec<Peer>,
}

impl PeerTable {
    pub fn new(self_peer: Peer) -> Self {
        PeerTable {
            peers: vec![self_peer],
        }
    }

    pub fn self_name(&self) -> &str {
        &self.peers[0].name
    }

    pub fn self_peer(&self) -> &Peer {
        &self.peers[0]
    }

    pub fn self_peer_mut(&mut self) -> &mut Peer {
        &mut self.peers[0]
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All entries in insertion order, `self` first.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Every entry except `self`.
    pub fn others(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().skip(1)
    }

    pub fn others_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut().skip(1)
    }

    /// Get-or-insert by name. A fresh entry is born with the given address;
    /// an existing entry learns the address if it had none.
    pub fn upsert(&mut self, name: &str, address: Option<String>) -> &mut Peer {
        let idx = match self.peers.iter().position(|p| p.name == name) {
            Some(idx) => idx,
            None => {
                self.peers.push(Peer::new(name, address.clone()));
                self.peers.len() - 1
            }
        };
        let peer = &mut self.peers[idx];
        if peer.address.is_none() {
            peer.address = address;
        }
        peer
    }

    /// Rekey an entry in place. The entry keeps its address, clocks, and
    /// module list; only the name changes.
    pub fn rename(&mut self, old: &str, new: &str) -> Rename {
        if old == new {
            return Rename::Renamed;
        }
        if self.contains(new) {
            return Rename::Collision;
        }
        match self.get_mut(old) {
            Some(peer) => {
                peer.name = new.to_string();
                Rename::Renamed
            }
            None => Rename::UnknownOld,
        }
    }

    /// Remove an entry outright (used when an outbound dial turns out to be
    /// a self-loop). The local entry can never be removed.
    pub fn remove(&mut self, name: &str) {
        if name == self.self_name() {
            return;
        }
        self.peers.retain(|p| p.name != name);
    }

    /// Per-source duplicate suppression. Returns true when the message id
    /// advances the source's clock; the entry is created on first contact.
    /// An accepted message also refreshes `last_seen`.
    pub fn accept_message(&mut self, source: &str, id: u64, now: Instant) -> bool {
        let peer = self.upsert(source, None);
        if id <= peer.last_message_id {
            return false;
        }
        peer.touch(id, now);
        true
    }

    /// Dial targets for one outbound pass: every entry that is neither
    /// `self` nor address-less, in insertion order.
    pub fn dial_targets(&self) -> Vec<(String, String)> {
        self.others()
            .filter_map(|p| p.address.clone().map(|a| (p.name.clone(), a)))
            .collect()
    }

    /// Entries worth persisting to the address cache: named peers with a
    /// learned address. Entries still keyed by their address (identity not
    /// yet learned) are skipped.
    pub fn cacheable(&self) -> Vec<(String, String)> {
        self.others()
            .filter_map(|p| p.address.clone().map(|a| (p.name.clone(), a)))
            .filter(|(name, addr)| name != addr)
            .collect()
    }

    /// Any live peer besides `self`?
    pub fn any_live_peer(&self, now: Instant, window: tokio::time::Duration) -> bool {
        self.others().any(|p| p.is_alive(now, window))
    }
}
