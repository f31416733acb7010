//! Heartbeat, death detection, and the solo-controller fallback.
//!
//! Death is decided locally from the last-seen clock and latched; it is
//! undone only by a fresh heartbeat or instanceInfo from the peer itself.
//! Total mesh loss is an operating condition, not an error: after one
//! connectionless outbound pass plus a grace period, the node claims every
//! module it can run and elects itself.

use tokio::time::Instant;

use super::{Event, SyncCore};
use crate::message::Payload;

impl SyncCore {
    pub(crate) fn on_heartbeat_tick(&mut self) {
        self.broadcast(Payload::Heartbeat);
    }

    /// The periodic status check: detect deaths, then either reconcile
    /// (as controller) or verify the controller is still the right one.
    pub(crate) fn on_check_tick(&mut self, now: Instant) {
        let window = self.timing.liveness_window();

        let mut died = Vec::new();
        for peer in self.peers.others_mut() {
            if peer.known_dead || peer.last_seen.is_none() {
                // Never-heard-from entries (configured addresses) were
                // never live; there is nothing to announce.
                continue;
            }
            if !peer.is_alive(now, window) {
                peer.known_dead = true;
                // Let the peer start over if it comes back.
                peer.last_message_id = 0;
                let announced = peer.death_announced;
                peer.death_announced = true;
                died.push((peer.name.clone(), announced));
            }
        }
        for (name, announced) in died {
            tracing::warn!(peer = %name, "peer death detected");
            if !announced {
                self.broadcast(Payload::LostPeer { name: name.clone() });
            }
            self.handle_peer_death(&name, now);
        }

        if self.controller_is_self() {
            self.reconcile_modules(now);
        } else {
            self.election_check(now);
        }
    }

    /// Another peer announced a death.
    pub(crate) fn handle_lost_peer(&mut self, source: &str, name: &str, now: Instant) {
        if name == self.identity.name {
            tracing::warn!(peer = %source, "peer announced our death, ignoring");
            return;
        }
        let Some(peer) = self.peers.get_mut(name) else {
            tracing::warn!(peer = %name, via = %source, "lostPeer for unknown peer, ignoring");
            return;
        };
        if !peer.known_dead {
            tracing::info!(peer = %name, via = %source, "peer reported lost");
        }
        peer.known_dead = true;
        peer.death_announced = true;
        peer.last_message_id = 0;
        self.handle_peer_death(name, now);
        self.election_check(now);
    }

    /// The outbound scanner finished a pass over the whole table.
    pub(crate) fn on_pass_ended(&mut self, connected: bool, now: Instant) {
        if connected
            || self
                .peers
                .any_live_peer(now, self.timing.liveness_window())
        {
            return;
        }
        if self.give_up_armed {
            return;
        }
        self.give_up_armed = true;
        let delay = self.timing.give_up;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::GiveUpExpired).await;
        });
    }

    /// The grace period after a connectionless pass ran out.
    pub(crate) fn on_give_up_expired(&mut self, now: Instant) {
        self.give_up_armed = false;
        if self
            .peers
            .any_live_peer(now, self.timing.liveness_window())
        {
            return;
        }
        tracing::warn!("no peers reachable, entering solo-controller fallback");
        self.claim_all_local();
        self.assume_control(now);
    }
}
