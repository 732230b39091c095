//! C3 — Rule Cache, plus the shared data-model types it serves
//! (`TunnelId`, `AppId`, `Rule`, `VpnConfig`).
//!
//! The cache holds two read-only views — `app_package -> tunnel_id` and
//! `tunnel_id -> VpnConfig` — bundled into one immutable
//! [`RuleCacheSnapshot`] that is replaced atomically on every change. A
//! single writer task owns the replace; any number of readers take a
//! clone of the `Arc` and never block.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a tunnel slot. Not reused within a
/// process lifetime: each new activated (protocol, endpoint, credentials)
/// triple gets a fresh id from [`TunnelIdAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId(pub u64);

/// Process-local allocator handing out ever-increasing [`TunnelId`]s.
#[derive(Debug, Default)]
pub struct TunnelIdAllocator {
    next: AtomicU64,
}

impl TunnelIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> TunnelId {
        TunnelId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque, non-negative identity of a local process/application group,
/// as exposed by the host. Uniqueness across reboots is not guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(pub u32);

/// Which protocol client a [`VpnConfig`] should be realized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelProtocol {
    Modern,
    Legacy,
}

/// `(app_package, tunnel_id)`. At most one rule per `app_package`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub app_package: String,
    pub tunnel_id: TunnelId,
}

/// Configuration read by C6 when instantiating a tunnel client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnConfig {
    pub tunnel_id: TunnelId,
    pub protocol: TunnelProtocol,
    /// Raw textual configuration blob (INI for modern, line-oriented for
    /// legacy); protocol detection runs on this before construction.
    pub config_blob: String,
    pub endpoint: std::net::SocketAddr,
    /// Opaque reference into the persistence layer; credentials
    /// themselves are never embedded here.
    pub auth_material_ref: String,
    pub dns_servers: Option<Vec<IpAddr>>,
    pub allowed_ips: Option<Vec<String>>,
}

/// Immutable `app_package -> tunnel_id` plus `tunnel_id -> VpnConfig`
/// view, replaced atomically on change.
#[derive(Debug, Clone, Default)]
pub struct RuleCacheSnapshot {
    tunnel_for_app: HashMap<String, TunnelId>,
    config_for_tunnel: HashMap<TunnelId, VpnConfig>,
}

impl RuleCacheSnapshot {
    pub fn build(rules: &[Rule], configs: &HashMap<TunnelId, VpnConfig>) -> Self {
        let mut tunnel_for_app = HashMap::with_capacity(rules.len());
        for rule in rules {
            tunnel_for_app.insert(rule.app_package.clone(), rule.tunnel_id);
        }
        Self {
            tunnel_for_app,
            config_for_tunnel: configs.clone(),
        }
    }

    pub fn tunnel_for(&self, app_package: &str) -> Option<TunnelId> {
        self.tunnel_for_app.get(app_package).copied()
    }

    pub fn config_for(&self, tunnel_id: TunnelId) -> Option<&VpnConfig> {
        self.config_for_tunnel.get(&tunnel_id)
    }

    pub fn tunnel_ids(&self) -> impl Iterator<Item = TunnelId> + '_ {
        self.config_for_tunnel.keys().copied()
    }
}

/// Non-blocking, O(1)-expected, lock-free-for-readers view over the
/// current rule set. A single writer replaces the whole snapshot on
/// each persistence change notification; readers never see a torn state.
pub struct RuleCache {
    snapshot: ArcSwap<RuleCacheSnapshot>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleCacheSnapshot::default()),
        }
    }

    /// `tunnel_for(app_package) -> Option<TunnelId>`. Never blocks.
    pub fn tunnel_for(&self, app_package: &str) -> Option<TunnelId> {
        self.snapshot.load().tunnel_for(app_package)
    }

    /// `config_for(TunnelId) -> Option<VpnConfig>`. Never blocks.
    pub fn config_for(&self, tunnel_id: TunnelId) -> Option<VpnConfig> {
        self.snapshot.load().config_for(tunnel_id).cloned()
    }

    /// Replaces the whole snapshot atomically. Called by the single
    /// writer task subscribed to the persistence change stream.
    pub fn replace(&self, snapshot: RuleCacheSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Current snapshot, for callers (the engine's reconciliation loop)
    /// that need a consistent read of the whole rule set at once.
    pub fn current(&self) -> Arc<RuleCacheSnapshot> {
        self.snapshot.load_full()
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn config(tunnel_id: TunnelId) -> VpnConfig {
        VpnConfig {
            tunnel_id,
            protocol: TunnelProtocol::Modern,
            config_blob: "[Interface]".to_string(),
            endpoint: "127.0.0.1:51820".parse::<SocketAddr>().unwrap(),
            auth_material_ref: "ref".to_string(),
            dns_servers: None,
            allowed_ips: None,
        }
    }

    #[test]
    fn miss_returns_none() {
        let cache = RuleCache::new();
        assert_eq!(cache.tunnel_for("com.example.app"), None);
        assert_eq!(cache.config_for(TunnelId(0)), None);
    }

    #[test]
    fn replace_is_visible_to_new_reads_atomically() {
        let cache = RuleCache::new();
        let id = TunnelId(7);
        let rules = vec![Rule {
            app_package: "com.example.app".to_string(),
            tunnel_id: id,
        }];
        let mut configs = HashMap::new();
        configs.insert(id, config(id));

        cache.replace(RuleCacheSnapshot::build(&rules, &configs));

        assert_eq!(cache.tunnel_for("com.example.app"), Some(id));
        assert_eq!(cache.config_for(id).unwrap().tunnel_id, id);
    }

    #[test]
    fn allocator_never_reuses_ids() {
        let alloc = TunnelIdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, b);
    }

    #[test]
    fn at_most_one_rule_per_app_package_last_write_wins() {
        let rules = vec![
            Rule {
                app_package: "com.example.app".to_string(),
                tunnel_id: TunnelId(1),
            },
            Rule {
                app_package: "com.example.app".to_string(),
                tunnel_id: TunnelId(2),
            },
        ];
        let snapshot = RuleCacheSnapshot::build(&rules, &HashMap::new());
        assert_eq!(snapshot.tunnel_for("com.example.app"), Some(TunnelId(2)));
    }
}
