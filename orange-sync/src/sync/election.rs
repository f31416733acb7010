//! Controller election.
//!
//! The controller is simply the live peer with the lowest priority value.
//! There is no ballot: a node that observes a better candidate either hands
//! the role over (`controlSwitch`) or takes it (`assumeControl`), and ties
//! cannot arise in practice because priority is wall-clock ms at startup.

use tokio::time::Instant;

use crate::message::Payload;

use super::SyncCore;

impl SyncCore {
    /// Priority of whoever we currently believe is controller.
    fn controller_priority(&self) -> Option<i64> {
        let name = self.controller.as_deref()?;
        if name == self.identity.name {
            return Some(self.identity.priority);
        }
        self.peers.get(name).map(|p| p.priority)
    }

    fn has_live_controller(&self, now: Instant) -> bool {
        match self.controller.as_deref() {
            None => false,
            Some(name) if name == self.identity.name => true,
            Some(name) => self
                .peers
                .get(name)
                .is_some_and(|p| p.is_alive(now, self.timing.liveness_window())),
        }
    }

    /// A peer announced itself: refresh its rank and address, then see
    /// whether the controller designation has to move.
    pub(crate) fn handle_instance_info(
        &mut self,
        source: &str,
        priority: i64,
        address: Option<String>,
        now: Instant,
    ) {
        let mut address_changed = false;
        {
            let peer = self.peers.upsert(source, None);
            peer.priority = priority;
            if let Some(addr) = address {
                if peer.address.as_deref() != Some(addr.as_str()) {
                    peer.address = Some(addr);
                    address_changed = true;
                }
            }
        }
        if address_changed {
            self.persist_addr_cache();
        }
        // Tell the (possibly new) peer what we run; it may only be
        // reachable through gossip and have missed our earlier broadcasts.
        self.broadcast_module_info();

        let beats_current = match self.controller_priority() {
            None => true,
            Some(current) => priority < current,
        };
        if !beats_current {
            return;
        }

        if self.controller_is_self() {
            tracing::info!(peer = %source, "handing controller role to senior peer");
            self.controller = Some(source.to_string());
            self.broadcast(Payload::ControlSwitch {
                name: source.to_string(),
                priority,
            });
        } else if self.identity.priority < priority {
            // The newcomer outranks the old controller but not us.
            self.assume_control(now);
        } else {
            tracing::info!(peer = %source, priority, "controller is now the senior peer");
            self.controller = Some(source.to_string());
        }
    }

    /// Someone announced a controller handover.
    pub(crate) fn handle_control_switch(&mut self, name: &str, priority: i64) {
        if name == self.identity.name {
            // The mesh elected us; accept without rebroadcasting.
            self.controller = Some(self.identity.name.clone());
            return;
        }
        match self.peers.get_mut(name) {
            None => {
                tracing::warn!(peer = %name, "controlSwitch for unknown peer, ignoring");
                return;
            }
            Some(peer) => {
                peer.priority = priority;
            }
        }
        if self.identity.priority < priority {
            tracing::error!(
                peer = %name, peer_priority = priority, own_priority = self.identity.priority,
                "controlSwitch to a peer we outrank, ignoring"
            );
            return;
        }
        tracing::info!(peer = %name, "controller switched");
        self.controller = Some(name.to_string());
    }

    /// Take the controller role, announce it, and immediately bring module
    /// assignments in line.
    pub(crate) fn assume_control(&mut self, now: Instant) {
        if !self.controller_is_self() {
            tracing::info!(priority = self.identity.priority, "assuming controller role");
        }
        self.controller = Some(self.identity.name.clone());
        self.broadcast(Payload::ControlSwitch {
            name: self.identity.name.clone(),
            priority: self.identity.priority,
        });
        self.reconcile_modules(now);
    }

    /// Periodic check: with no live controller, the best-ranked live node
    /// takes over.
    pub(crate) fn election_check(&mut self, now: Instant) {
        if self.has_live_controller(now) {
            return;
        }
        let window = self.timing.liveness_window();
        let outranked = self
            .peers
            .others()
            .any(|p| p.is_alive(now, window) && p.priority < self.identity.priority);
        if !outranked {
            self.assume_control(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::message::Payload;
    use tokio::time::{Duration, Instant};

    #[tokio::test(start_paused = true)]
    async fn first_instance_info_with_better_rank_is_elected() {
        let mut node = node("b", 1001, &[]);
        let now = Instant::now();
        node.live_peer("a", i64::MAX, now);
        node.core.handle_instance_info("a", 1000, None, now);
        assert_eq!(node.controller(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn junior_newcomer_makes_us_assume_control() {
        let mut node = node("a", 1000, &[]);
        let mut rx = node.add_link(1, "b");
        let now = Instant::now();
        node.live_peer("b", i64::MAX, now);
        node.core.handle_instance_info("b", 1001, None, now);
        assert_eq!(node.controller(), Some("a"));
        let sent = drain(&mut rx);
        assert_eq!(
            of_kind(&sent, "controlSwitch"),
            vec![Payload::ControlSwitch {
                name: "a".into(),
                priority: 1000
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn controller_hands_over_to_senior_newcomer() {
        let mut node = node("b", 1001, &[]);
        let mut rx = node.add_link(1, "a");
        let now = Instant::now();
        node.core.assume_control(now);
        drain(&mut rx);

        node.live_peer("a", i64::MAX, now);
        node.core.handle_instance_info("a", 1000, None, now);
        assert_eq!(node.controller(), Some("a"));
        let sent = drain(&mut rx);
        assert_eq!(
            of_kind(&sent, "controlSwitch"),
            vec![Payload::ControlSwitch {
                name: "a".into(),
                priority: 1000
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejoined_peer_with_higher_priority_does_not_take_over() {
        // scenario: restarted node comes back with a fresh (larger) priority
        let mut node = node("b", 1001, &[]);
        let now = Instant::now();
        node.core.assume_control(now);
        node.live_peer("a", i64::MAX, now);
        node.core.handle_instance_info("a", 2000, None, now);
        assert_eq!(node.controller(), Some("b"), "we keep control");
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_keeps_current_controller() {
        let mut node = node("b", 1000, &[]);
        let now = Instant::now();
        node.core.assume_control(now);
        node.live_peer("a", i64::MAX, now);
        // wall-clock tie: strict < keeps the incumbent
        node.core.handle_instance_info("a", 1000, None, now);
        assert_eq!(node.controller(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn control_switch_unknown_peer_is_ignored() {
        let mut node = node("b", 1001, &[]);
        node.core.handle_control_switch("ghost", 1);
        assert_eq!(node.controller(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn control_switch_rank_paradox_is_ignored() {
        let mut node = node("a", 1000, &[]);
        let now = Instant::now();
        node.live_peer("b", i64::MAX, now);
        node.core.handle_control_switch("b", 1001);
        assert_eq!(node.controller(), None, "we outrank b");
    }

    #[tokio::test(start_paused = true)]
    async fn control_switch_to_senior_peer_is_accepted() {
        let mut node = node("b", 1001, &[]);
        let now = Instant::now();
        node.live_peer("a", i64::MAX, now);
        node.core.handle_control_switch("a", 1000);
        assert_eq!(node.controller(), Some("a"));
        // the carried priority updated the table
        assert_eq!(node.core.peers.get("a").unwrap().priority, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn control_switch_naming_us_is_accepted() {
        let mut node = node("a", 1000, &[]);
        node.core.handle_control_switch("a", 1000);
        assert_eq!(node.controller(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn election_check_takes_over_when_controller_dies() {
        let mut node = node("b", 1001, &[]);
        let now = Instant::now();
        node.live_peer("a", 1000, now);
        node.core.handle_control_switch("a", 1000);
        assert_eq!(node.controller(), Some("a"));

        // a goes silent past the liveness window
        let later = now + Duration::from_secs(13);
        node.core.election_check(later);
        assert_eq!(node.controller(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn election_check_defers_to_live_senior_peer() {
        let mut node = node("b", 1001, &[]);
        let now = Instant::now();
        node.live_peer("a", 1000, now);
        // no controller at all, but a live peer outranks us
        node.core.election_check(now);
        assert_eq!(node.controller(), None, "senior peer should claim it, not us");
    }

    #[tokio::test(start_paused = true)]
    async fn election_check_ignores_dead_senior_peer() {
        let mut node = node("b", 1001, &[]);
        let now = Instant::now();
        node.live_peer("a", 1000, now);
        node.core.peers.get_mut("a").unwrap().known_dead = true;
        node.core.election_check(now);
        assert_eq!(node.controller(), Some("b"));
    }
}
