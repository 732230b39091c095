//! C7 — Packet Router.
//!
//! The hot path: parse, find the owning app, find its rule, hand the
//! packet to C6 or let it bypass. Every step after parsing is a
//! non-blocking lookup against a snapshot (the tracker's tables, the
//! rule cache) — nothing here ever waits on I/O, a lock held across an
//! await point, or the tunnel itself.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::events::Counters;
use crate::external::BypassPath;
use crate::manager::TunnelConnectionManager;
use crate::packet;
use crate::rules::{AppId, RuleCache};
use crate::tracker::ConnectionTracker;

/// What happened to one packet handed to [`PacketRouter::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to a live tunnel slot's outbound queue.
    Routed,
    /// No rule applies (no owner, no package mapping, or no matching
    /// rule): the caller should forward the packet outside the tunnel,
    /// unmodified, same as if this core weren't in the path at all.
    Bypassed,
    /// A rule names a tunnel that isn't currently up (torn down
    /// concurrently with this packet, or never brought up). Failing
    /// closed here, not bypassing, because the rule's intent was to
    /// tunnel this traffic.
    DroppedTunnelUnavailable,
    /// Not a valid IPv4 datagram.
    DroppedParseError,
}

/// Reverse lookup from the owning app back to its package name, as
/// resolved by the tracker's owner lookup. Replaced atomically, same
/// discipline as [`RuleCache`]: readers never block.
pub struct AppRegistry {
    packages: ArcSwap<HashMap<AppId, String>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self {
            packages: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn replace(&self, packages: HashMap<AppId, String>) {
        self.packages.store(Arc::new(packages));
    }

    pub fn package_for(&self, app_id: AppId) -> Option<String> {
        self.packages.load().get(&app_id).cloned()
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PacketRouter {
    tracker: Arc<ConnectionTracker>,
    apps: Arc<AppRegistry>,
    rule_cache: Arc<RuleCache>,
    manager: Arc<TunnelConnectionManager>,
    bypass_path: Arc<dyn BypassPath>,
    counters: Arc<Counters>,
}

impl PacketRouter {
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        apps: Arc<AppRegistry>,
        rule_cache: Arc<RuleCache>,
        manager: Arc<TunnelConnectionManager>,
        bypass_path: Arc<dyn BypassPath>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            tracker,
            apps,
            rule_cache,
            manager,
            bypass_path,
            counters,
        }
    }

    /// Runs one packet through parse -> owner -> package -> rule ->
    /// submit. `raw_packet` is handed to C6 by value only on the
    /// `Routed` path; every other path hands it to the bypass path
    /// instead, unmodified, so it still reaches the physical network.
    pub async fn route(&self, raw_packet: &[u8]) -> RouteOutcome {
        self.counters.record_outbound_seen();

        let five_tuple = match packet::parse(raw_packet) {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "dropping unparseable outbound packet");
                self.counters.record_dropped_parse_error();
                return RouteOutcome::DroppedParseError;
            }
        };

        let Some(app_id) = self
            .tracker
            .lookup(five_tuple.proto, five_tuple.src_addr, five_tuple.src_port)
        else {
            self.counters.record_dropped_no_owner();
            return self.bypass(raw_packet);
        };

        let Some(app_package) = self.apps.package_for(app_id) else {
            self.counters.record_dropped_no_owner();
            return self.bypass(raw_packet);
        };

        let Some(tunnel_id) = self.rule_cache.tunnel_for(&app_package) else {
            self.counters.record_dropped_no_rule();
            return self.bypass(raw_packet);
        };

        match self.manager.submit(tunnel_id, raw_packet.to_vec()).await {
            Ok(()) => {
                self.counters.record_routed();
                RouteOutcome::Routed
            }
            Err(_unknown_tunnel) => {
                self.counters.record_dropped_tunnel_unavailable();
                RouteOutcome::DroppedTunnelUnavailable
            }
        }
    }

    /// Hands `packet` to the protected bypass socket so it reaches the
    /// physical network directly instead of silently vanishing. A write
    /// that would block is the bypass path's own responsibility to drop
    /// (never awaited here: the router must never block longer than the
    /// cost of one write), so a failure here is only ever logged, never
    /// retried.
    fn bypass(&self, packet: &[u8]) -> RouteOutcome {
        self.counters.record_bypassed();
        if let Err(e) = self.bypass_path.send(packet) {
            debug!(error = %e, "bypass write failed, packet dropped");
        }
        RouteOutcome::Bypassed
    }
}
