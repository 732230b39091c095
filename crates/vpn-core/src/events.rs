//! Ambient observability surface: lifecycle events broadcast out of the
//! engine, and lock-free aggregate counters sampled by a health check or
//! a metrics exporter the embedder wires up.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::rules::TunnelId;
use std::net::IpAddr;

/// A single notable occurrence inside the engine, broadcast on a
/// `tokio::sync::broadcast` channel so any number of observers (a log
/// sink, a UI, a metrics exporter) can subscribe independently.
#[derive(Debug, Clone)]
pub enum Event {
    TunnelStateChanged {
        tunnel_id: TunnelId,
        state: crate::tunnel::TunnelState,
    },
    TunnelAssignedIp {
        tunnel_id: TunnelId,
        ip: IpAddr,
    },
    TunnelAssignedDns {
        tunnel_id: TunnelId,
        dns_servers: Vec<IpAddr>,
    },
    TunnelStartupFailed {
        tunnel_id: TunnelId,
        reason: String,
        retryable: bool,
    },
    RuleSetReconciled {
        tunnels_up: usize,
        tunnels_torn_down: usize,
    },
}

/// Lock-free aggregate counters over the life of one engine run. Cheap
/// enough to increment on the packet hot path; read with `Relaxed`
/// ordering since these feed dashboards, not correctness decisions.
#[derive(Debug, Default)]
pub struct Counters {
    outbound_seen: AtomicU64,
    routed: AtomicU64,
    bypassed: AtomicU64,
    dropped_no_owner: AtomicU64,
    dropped_no_rule: AtomicU64,
    dropped_parse_error: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_tunnel_unavailable: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outbound_seen(&self) {
        self.outbound_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_no_owner(&self) {
        self.dropped_no_owner.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_no_rule(&self) {
        self.dropped_no_rule.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_parse_error(&self) {
        self.dropped_parse_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_queue_full(&self) {
        self.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_tunnel_unavailable(&self) {
        self.dropped_tunnel_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            outbound_seen: self.outbound_seen.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            dropped_no_owner: self.dropped_no_owner.load(Ordering::Relaxed),
            dropped_no_rule: self.dropped_no_rule.load(Ordering::Relaxed),
            dropped_parse_error: self.dropped_parse_error.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_tunnel_unavailable: self.dropped_tunnel_unavailable.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time read of [`Counters`], cheap to clone and hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    pub outbound_seen: u64,
    pub routed: u64,
    pub bypassed: u64,
    pub dropped_no_owner: u64,
    pub dropped_no_rule: u64,
    pub dropped_parse_error: u64,
    pub dropped_queue_full: u64,
    pub dropped_tunnel_unavailable: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let counters = Counters::new();
        assert_eq!(counters.snapshot(), CountersSnapshot::default());
    }

    #[test]
    fn increments_are_independent_per_reason() {
        let counters = Counters::new();
        counters.record_outbound_seen();
        counters.record_outbound_seen();
        counters.record_routed();
        counters.record_dropped_no_owner();

        let snap = counters.snapshot();
        assert_eq!(snap.outbound_seen, 2);
        assert_eq!(snap.routed, 1);
        assert_eq!(snap.dropped_no_owner, 1);
        assert_eq!(snap.bypassed, 0);
    }
}
