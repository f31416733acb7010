//! Module assignment.
//!
//! The controller decides who runs what; everyone else reports what they
//! run (`moduleInfo`) and may ask for a module (`requestModule`).
//! Assignments are advisory: two nodes briefly handling the same module is
//! resolved by the priority tiebreak, not prevented. The reconciliation
//! loop converges the mesh on at most one handler per module.

use tokio::time::Instant;

use crate::message::{ModuleDescriptor, Payload};

use super::SyncCore;

impl SyncCore {
    fn locally_handling(&self, module: &str) -> bool {
        self.registry.handler(module).as_deref() == Some(self.identity.name.as_str())
    }

    /// Record in our snapshots that `target` now handles `module`, and
    /// nobody else does. Keeps the next reconciliation tick from assigning
    /// the module twice before the target's own moduleInfo arrives.
    fn note_assignment(&mut self, target: &str, module: &str) {
        for peer in self.peers.others_mut() {
            let mine = peer.name == target;
            let mut found = false;
            for d in peer.modules.iter_mut() {
                if d.name == module {
                    d.handling = mine;
                    found = true;
                }
            }
            if mine && !found {
                peer.modules.push(ModuleDescriptor {
                    name: module.to_string(),
                    available: true,
                    handling: true,
                });
            }
        }
    }

    /// A peer advertised its full module list.
    pub(crate) fn handle_module_info(&mut self, source: &str, modules: Vec<ModuleDescriptor>) {
        let peer_priority = {
            let peer = self.peers.upsert(source, None);
            peer.modules = modules.clone();
            peer.priority
        };

        let mut changed = false;
        for descriptor in &modules {
            if descriptor.handling {
                if self.locally_handling(&descriptor.name) {
                    // Both sides think they run it. The junior side yields;
                    // the senior side (re)claims through the controller.
                    if self.identity.priority < peer_priority {
                        if self.controller_is_self() {
                            tracing::info!(
                                module = %descriptor.name, peer = %source,
                                "handling conflict, reclaiming as controller"
                            );
                            let me = self.identity.name.clone();
                            self.broadcast(Payload::AssignModule {
                                peer: me.clone(),
                                module: descriptor.name.clone(),
                            });
                            self.note_assignment(&me, &descriptor.name);
                        } else {
                            tracing::info!(
                                module = %descriptor.name, peer = %source,
                                "handling conflict, asking controller to settle it"
                            );
                            self.broadcast(Payload::RequestModule {
                                module: descriptor.name.clone(),
                            });
                        }
                    } else {
                        tracing::info!(
                            module = %descriptor.name, peer = %source,
                            "handling conflict, yielding to senior peer"
                        );
                        self.registry.set_handler(&descriptor.name, None);
                        changed = true;
                    }
                }
            } else if self.registry.handler(&descriptor.name).as_deref() == Some(source) {
                // The peer we thought was handling it says it is not.
                self.registry.set_handler(&descriptor.name, None);
                changed = true;
            }
        }
        if changed {
            self.broadcast_module_info();
        }
    }

    /// Controller verdict arrived (possibly about somebody else).
    pub(crate) fn handle_assign_module(&mut self, target: &str, module: &str) {
        self.note_assignment(target, module);

        if target == self.identity.name {
            if !self.registry.contains(module) {
                tracing::error!(%module, "assigned a module this instance does not have");
                return;
            }
            if !self.locally_handling(module) {
                tracing::info!(%module, "module assigned to this instance");
                self.registry
                    .set_handler(module, Some(self.identity.name.as_str()));
                self.broadcast_module_info();
            }
        } else if self.registry.contains(module) && self.locally_handling(module) {
            tracing::info!(%module, peer = %target, "module handed off");
            self.registry.set_handler(module, Some(target));
            self.broadcast_module_info();
        }
    }

    /// A peer asked for a module; only the controller answers.
    pub(crate) fn handle_request_module(&mut self, requester: &str, module: &str) {
        if !self.controller_is_self() {
            return;
        }
        let known = self.registry.contains(module)
            || self
                .peers
                .others()
                .any(|p| p.modules.iter().any(|d| d.name == module));
        if !known {
            tracing::error!(%module, peer = %requester, "request for unknown module, ignoring");
            return;
        }
        if self.locally_handling(module) {
            self.registry.set_handler(module, None);
            self.broadcast_module_info();
        }
        tracing::info!(%module, peer = %requester, "granting module request");
        self.broadcast(Payload::AssignModule {
            peer: requester.to_string(),
            module: module.to_string(),
        });
        self.note_assignment(requester, module);
        if requester == self.identity.name {
            // We never hear our own broadcast; apply the verdict directly.
            self.registry
                .set_handler(module, Some(self.identity.name.as_str()));
        }
    }

    /// Controller loop: every local module ends up with exactly one live
    /// handler. "Someone handles it" requires a live peer whose snapshot
    /// matches both the module name and the handling flag.
    pub(crate) fn reconcile_modules(&mut self, now: Instant) {
        if !self.controller_is_self() {
            return;
        }
        let window = self.timing.liveness_window();
        let self_name = self.identity.name.clone();
        let mut changed = false;

        for module in self.registry.modules() {
            let handled_here = module.handler.as_deref() == Some(self_name.as_str());
            let handled_remotely = self
                .peers
                .others()
                .any(|p| p.is_alive(now, window) && p.claims_handling(&module.name));
            if handled_here || handled_remotely {
                continue;
            }

            if module.available {
                tracing::info!(module = %module.name, "unhandled module assumed locally");
                self.registry.set_handler(&module.name, Some(&self_name));
                changed = true;
                continue;
            }

            let candidate = self
                .peers
                .others()
                .find(|p| p.is_alive(now, window) && p.claims_available(&module.name))
                .map(|p| p.name.clone());
            match candidate {
                Some(peer) => {
                    tracing::info!(module = %module.name, peer = %peer, "assigning unhandled module");
                    self.broadcast(Payload::AssignModule {
                        peer: peer.clone(),
                        module: module.name.clone(),
                    });
                    self.note_assignment(&peer, &module.name);
                    if module.handler.is_some() {
                        self.registry.set_handler(&module.name, None);
                        changed = true;
                    }
                }
                None => {
                    if module.handler.is_some() {
                        tracing::warn!(module = %module.name, "no live peer can run module");
                        self.registry.set_handler(&module.name, None);
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.broadcast_module_info();
        }
    }

    /// A peer died: void its handling claims, release our references to it,
    /// and (as controller) re-home whatever it ran.
    pub(crate) fn handle_peer_death(&mut self, name: &str, now: Instant) {
        if let Some(peer) = self.peers.get_mut(name) {
            for d in peer.modules.iter_mut() {
                d.handling = false;
            }
        }
        let mut changed = false;
        for module in self.registry.modules() {
            if module.handler.as_deref() == Some(name) {
                self.registry.set_handler(&module.name, None);
                changed = true;
            }
        }
        if changed {
            self.broadcast_module_info();
        }
        if self.controller_is_self() {
            self.reconcile_modules(now);
        }
    }

    /// Solo fallback: with nobody reachable, run everything we can.
    pub(crate) fn claim_all_local(&mut self) {
        let self_name = self.identity.name.clone();
        let mut changed = false;
        for module in self.registry.modules() {
            if module.available && module.handler.as_deref() != Some(self_name.as_str()) {
                self.registry.set_handler(&module.name, Some(&self_name));
                changed = true;
            }
        }
        if changed {
            self.broadcast_module_info();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::message::{ModuleDescriptor, Payload};
    use crate::registry::ModuleRegistry;
    use tokio::time::Instant;

    fn descriptor(name: &str, available: bool, handling: bool) -> ModuleDescriptor {
        ModuleDescriptor {
            name: name.into(),
            available,
            handling,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn module_info_is_snapshotted() {
        let mut node = node("me", 1000, &[]);
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        node.core
            .handle_module_info("alpha", vec![descriptor("metrics", true, true)]);
        assert!(node.core.peers.get("alpha").unwrap().claims_handling("metrics"));
        assert!(node.core.peers.get("alpha").unwrap().claims_available("metrics"));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_junior_side_yields() {
        let mut node = node("me", 2000, &["metrics"]);
        let now = Instant::now();
        node.registry.set_handler("metrics", Some("me"));
        node.live_peer("alpha", 1000, now);
        node.core
            .handle_module_info("alpha", vec![descriptor("metrics", true, true)]);
        assert_eq!(node.registry.handler("metrics"), None, "junior yields");
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_senior_side_requests_from_controller() {
        let mut node = node("me", 1000, &["metrics"]);
        let mut rx = node.add_link(1, "alpha");
        let now = Instant::now();
        node.registry.set_handler("metrics", Some("me"));
        node.live_peer("alpha", 2000, now);
        node.core.controller = Some("alpha".to_string());
        node.core
            .handle_module_info("alpha", vec![descriptor("metrics", true, true)]);
        assert_eq!(
            node.registry.handler("metrics"),
            Some("me".to_string()),
            "senior keeps handling while the controller settles it"
        );
        let sent = drain(&mut rx);
        assert_eq!(
            of_kind(&sent, "requestModule"),
            vec![Payload::RequestModule {
                module: "metrics".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_senior_controller_reclaims_directly() {
        let mut node = node("me", 1000, &["metrics"]);
        let mut rx = node.add_link(1, "alpha");
        let now = Instant::now();
        node.registry.set_handler("metrics", Some("me"));
        node.core.assume_control(now);
        drain(&mut rx);
        node.live_peer("alpha", 2000, now);
        node.core
            .handle_module_info("alpha", vec![descriptor("metrics", true, true)]);
        let sent = drain(&mut rx);
        assert_eq!(
            of_kind(&sent, "assignModule"),
            vec![Payload::AssignModule {
                peer: "me".into(),
                module: "metrics".into()
            }]
        );
        // the peer's stale claim was voided in our snapshot
        assert!(!node.core.peers.get("alpha").unwrap().claims_handling("metrics"));
    }

    #[tokio::test(start_paused = true)]
    async fn released_module_clears_stale_handler() {
        let mut node = node("me", 1000, &["metrics"]);
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        node.registry.set_handler("metrics", Some("alpha"));
        node.core
            .handle_module_info("alpha", vec![descriptor("metrics", true, false)]);
        assert_eq!(node.registry.handler("metrics"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn assign_to_us_sets_handler() {
        let mut node = node("me", 1000, &["metrics"]);
        node.core.handle_assign_module("me", "metrics");
        assert_eq!(node.registry.handler("metrics"), Some("me".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn assign_away_hands_off_only_when_handling() {
        let mut node = node("me", 1000, &["metrics", "greeter"]);
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        node.registry.set_handler("metrics", Some("me"));
        node.core.handle_assign_module("alpha", "metrics");
        assert_eq!(node.registry.handler("metrics"), Some("alpha".to_string()));
        // not handling greeter: assignment elsewhere leaves it untouched
        node.core.handle_assign_module("alpha", "greeter");
        assert_eq!(node.registry.handler("greeter"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn assign_unknown_module_to_us_is_an_error_not_a_crash() {
        let mut node = node("me", 1000, &[]);
        node.core.handle_assign_module("me", "ghost");
        assert!(!node.registry.contains("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn request_ignored_unless_controller() {
        let mut node = node("me", 1000, &["metrics"]);
        let mut rx = node.add_link(1, "alpha");
        node.core.handle_request_module("alpha", "metrics");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn controller_grants_request_and_releases_own_handler() {
        let mut node = node("me", 1000, &["metrics"]);
        let mut rx = node.add_link(1, "charlie");
        let now = Instant::now();
        node.core.assume_control(now);
        node.live_peer("charlie", 3000, now);
        node.core
            .peers
            .get_mut("charlie")
            .unwrap()
            .modules
            .push(descriptor("metrics", true, false));
        drain(&mut rx);

        node.core.handle_request_module("charlie", "metrics");
        assert_eq!(node.registry.handler("metrics"), None, "controller released it");
        let sent = drain(&mut rx);
        assert_eq!(
            of_kind(&sent, "assignModule"),
            vec![Payload::AssignModule {
                peer: "charlie".into(),
                module: "metrics".into()
            }]
        );
        assert!(node.core.peers.get("charlie").unwrap().claims_handling("metrics"));
    }

    #[tokio::test(start_paused = true)]
    async fn controller_rejects_request_for_unknown_module() {
        let mut node = node("me", 1000, &[]);
        let mut rx = node.add_link(1, "charlie");
        let now = Instant::now();
        node.core.assume_control(now);
        node.live_peer("charlie", 3000, now);
        drain(&mut rx);
        node.core.handle_request_module("charlie", "ghost");
        assert!(of_kind(&drain(&mut rx), "assignModule").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_assumes_available_module_locally() {
        let mut node = node("me", 1000, &["metrics"]);
        let now = Instant::now();
        node.core.assume_control(now);
        assert_eq!(node.registry.handler("metrics"), Some("me".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_assigns_unavailable_module_to_capable_peer() {
        let mut node = node("me", 1000, &["metrics:unavailable"]);
        let mut rx = node.add_link(1, "alpha");
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        node.core
            .peers
            .get_mut("alpha")
            .unwrap()
            .modules
            .push(descriptor("metrics", true, false));
        node.core.assume_control(now);
        let sent = drain(&mut rx);
        assert_eq!(
            of_kind(&sent, "assignModule"),
            vec![Payload::AssignModule {
                peer: "alpha".into(),
                module: "metrics".into()
            }]
        );
        assert_eq!(node.registry.handler("metrics"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_leaves_remotely_handled_module_alone() {
        let mut node = node("me", 1000, &["metrics"]);
        let mut rx = node.add_link(1, "alpha");
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        node.core
            .peers
            .get_mut("alpha")
            .unwrap()
            .modules
            .push(descriptor("metrics", true, true));
        node.core.assume_control(now);
        assert_eq!(node.registry.handler("metrics"), None);
        assert!(of_kind(&drain(&mut rx), "assignModule").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_requires_name_and_handling_to_match() {
        // a peer handling a *different* module must not mask this one
        let mut node = node("me", 1000, &["metrics"]);
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        node.core
            .peers
            .get_mut("alpha")
            .unwrap()
            .modules
            .push(descriptor("greeter", true, true));
        node.core.assume_control(now);
        assert_eq!(
            node.registry.handler("metrics"),
            Some("me".to_string()),
            "metrics was unhandled despite alpha handling greeter"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_ignores_dead_peers_claims() {
        let mut node = node("me", 1000, &["metrics"]);
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        {
            let peer = node.core.peers.get_mut("alpha").unwrap();
            peer.modules.push(descriptor("metrics", true, true));
            peer.known_dead = true;
        }
        node.core.assume_control(now);
        assert_eq!(node.registry.handler("metrics"), Some("me".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_death_rehomes_its_modules() {
        let mut node = node("me", 1000, &["metrics"]);
        let now = Instant::now();
        node.core.assume_control(now);
        node.live_peer("alpha", 2000, now);
        node.core
            .peers
            .get_mut("alpha")
            .unwrap()
            .modules
            .push(descriptor("metrics", true, true));
        // alpha handled metrics; it dies
        node.registry.set_handler("metrics", Some("alpha"));
        node.core.peers.get_mut("alpha").unwrap().known_dead = true;
        node.core.handle_peer_death("alpha", now);
        assert_eq!(
            node.registry.handler("metrics"),
            Some("me".to_string()),
            "controller re-homed the dead peer's module"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn claim_all_local_takes_available_only() {
        let mut node = node("me", 1000, &["metrics", "greeter:unavailable"]);
        node.core.claim_all_local();
        assert_eq!(node.registry.handler("metrics"), Some("me".to_string()));
        assert_eq!(node.registry.handler("greeter"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn coverage_is_exactly_one_handler() {
        // controller with one capable peer and a mixed module set
        let mut node = node("me", 1000, &["metrics", "posture:unavailable"]);
        let now = Instant::now();
        node.live_peer("alpha", 2000, now);
        node.core
            .peers
            .get_mut("alpha")
            .unwrap()
            .modules
            .push(descriptor("posture", true, false));
        node.core.assume_control(now);
        // metrics here, posture at alpha, no module with two handlers
        assert_eq!(node.registry.handler("metrics"), Some("me".to_string()));
        assert_eq!(node.registry.handler("posture"), None);
        assert!(node.core.peers.get("alpha").unwrap().claims_handling("posture"));
        assert!(!node.core.peers.get("alpha").unwrap().claims_handling("metrics"));
    }
}
