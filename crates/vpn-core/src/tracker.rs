//! C2 — Connection Tracker.
//!
//! Maps `(proto, src_addr, src_port) -> AppId` for the router's hot-path
//! owner lookup. Populated off the hot path by a periodic bulk refresh
//! from the OS connection table (C9), by explicit registration when a
//! rule is activated (a wildcard entry keyed on address alone, consulted
//! on precise-tuple miss), and optionally by a cache-populating ambient
//! query. Eviction is batched and never runs from the lookup path.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::packet::Proto;
use crate::rules::AppId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PreciseKey {
    proto: Proto,
    src_addr: Ipv4Addr,
    src_port: u16,
}

struct Entry {
    app_id: AppId,
    last_seen: Instant,
}

/// Connection tracker serving per-packet owner lookups in O(1) expected
/// time. The hot-path operation is `lookup`; everything else (refresh,
/// registration, eviction) happens off the packet path.
pub struct ConnectionTracker {
    precise: RwLock<HashMap<PreciseKey, Entry>>,
    /// Wildcard entries keyed by source address alone, seeded from rule
    /// registration at engine start; consulted only on precise miss.
    wildcard: RwLock<HashMap<Ipv4Addr, Entry>>,
    idle_timeout: Duration,
    soft_cap: usize,
}

impl ConnectionTracker {
    pub fn new(idle_timeout: Duration, soft_cap: usize) -> Self {
        Self {
            precise: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(HashMap::new()),
            idle_timeout,
            soft_cap,
        }
    }

    /// Hot-path lookup. A precise-tuple hit wins; otherwise falls back to
    /// the address-only wildcard table seeded by explicit registration.
    /// A total miss returns `None`, which the router treats as "bypass".
    pub fn lookup(&self, proto: Proto, src_addr: Ipv4Addr, src_port: u16) -> Option<AppId> {
        let key = PreciseKey {
            proto,
            src_addr,
            src_port,
        };
        if let Some(entry) = self.precise.read().get(&key) {
            return Some(entry.app_id);
        }
        self.wildcard.read().get(&src_addr).map(|e| e.app_id)
    }

    /// Bulk refresh from an OS-provided connection table dump, keyed by
    /// local endpoint. Called periodically, off the packet hot path.
    pub fn bulk_refresh(&self, entries: impl IntoIterator<Item = (Proto, Ipv4Addr, u16, AppId)>) {
        let now = Instant::now();
        let mut table = self.precise.write();
        for (proto, src_addr, src_port, app_id) in entries {
            table.insert(
                PreciseKey {
                    proto,
                    src_addr,
                    src_port,
                },
                Entry {
                    app_id,
                    last_seen: now,
                },
            );
        }
        drop(table);
        self.evict_if_over_cap();
    }

    /// Explicit registration: seeds a wildcard (address-only) mapping,
    /// consulted when the precise five-tuple lookup misses. Used at
    /// engine start to prime every rule's owner ahead of traffic.
    pub fn register_wildcard(&self, src_addr: Ipv4Addr, app_id: AppId) {
        self.wildcard.write().insert(
            src_addr,
            Entry {
                app_id,
                last_seen: Instant::now(),
            },
        );
    }

    /// Cache-populating ambient lookup: on a miss, a caller may have
    /// resolved the owner via a blocking OS query (off the hot path) and
    /// wants to seed the precise table so future packets in this flow
    /// hit without another OS round-trip.
    pub fn populate_from_ambient_lookup(
        &self,
        proto: Proto,
        src_addr: Ipv4Addr,
        src_port: u16,
        app_id: AppId,
    ) {
        self.precise.write().insert(
            PreciseKey {
                proto,
                src_addr,
                src_port,
            },
            Entry {
                app_id,
                last_seen: Instant::now(),
            },
        );
    }

    /// Batched eviction of entries older than `idle_timeout`, run only
    /// when the table exceeds `soft_cap`. Never invoked synchronously
    /// from `lookup`.
    fn evict_if_over_cap(&self) {
        let mut table = self.precise.write();
        if table.len() <= self.soft_cap {
            return;
        }
        let cutoff = Instant::now() - self.idle_timeout;
        table.retain(|_, entry| entry.last_seen >= cutoff);
    }

    pub fn precise_len(&self) -> usize {
        self.precise.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_returns_none() {
        let tracker = ConnectionTracker::new(Duration::from_secs(300), 1024);
        assert_eq!(
            tracker.lookup(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 1), 1234),
            None
        );
    }

    #[test]
    fn precise_hit_after_bulk_refresh() {
        let tracker = ConnectionTracker::new(Duration::from_secs(300), 1024);
        tracker.bulk_refresh([(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 1), 1234, AppId(42))]);
        assert_eq!(
            tracker.lookup(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 1), 1234),
            Some(AppId(42))
        );
    }

    #[test]
    fn wildcard_fallback_on_precise_miss() {
        let tracker = ConnectionTracker::new(Duration::from_secs(300), 1024);
        tracker.register_wildcard(Ipv4Addr::new(10, 0, 0, 5), AppId(7));
        assert_eq!(
            tracker.lookup(Proto::Udp, Ipv4Addr::new(10, 0, 0, 5), 5353),
            Some(AppId(7))
        );
    }

    #[test]
    fn precise_hit_wins_over_wildcard() {
        let tracker = ConnectionTracker::new(Duration::from_secs(300), 1024);
        tracker.register_wildcard(Ipv4Addr::new(10, 0, 0, 5), AppId(7));
        tracker.bulk_refresh([(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 5), 443, AppId(99))]);
        assert_eq!(
            tracker.lookup(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 5), 443),
            Some(AppId(99))
        );
    }

    #[test]
    fn eviction_only_runs_over_soft_cap() {
        let tracker = ConnectionTracker::new(Duration::from_millis(1), 2);
        tracker.bulk_refresh([(Proto::Tcp, Ipv4Addr::new(10, 0, 0, 1), 1, AppId(1))]);
        std::thread::sleep(Duration::from_millis(5));
        // Still under soft cap: stale entry is not evicted yet.
        assert_eq!(tracker.precise_len(), 1);

        tracker.bulk_refresh([
            (Proto::Tcp, Ipv4Addr::new(10, 0, 0, 2), 1, AppId(2)),
            (Proto::Tcp, Ipv4Addr::new(10, 0, 0, 3), 1, AppId(3)),
        ]);
        // Over soft cap now: the stale entry from before is evicted.
        assert!(tracker.precise_len() <= 2);
    }
}
