//! C9 — External surface adapters.
//!
//! Everything this core needs from the host platform but cannot
//! implement itself: exempting a tunnel's own outer socket from the
//! capture it would otherwise loop back into, reading the OS's live
//! connection table to resolve packet ownership, and reading stored
//! per-app routing rules and tunnel configs. Each surface is a trait so
//! production embedders (an Android VpnService, a macOS network
//! extension, …) supply the platform-specific implementation; this
//! crate ships only in-memory stand-ins for tests and demos.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::packet::Proto;
use crate::rules::{AppId, Rule, TunnelId, VpnConfig};

/// Exempts a raw socket file descriptor from the VPN capture so a
/// tunnel's own outer transport (e.g. WireGuard's UDP socket) doesn't
/// loop back into the tunnel it belongs to.
pub trait ProtectSocket: Send + Sync {
    fn protect(&self, raw_fd: i32) -> std::io::Result<()>;
}

/// The bypass path: a protected socket the router hands unrouted
/// packets to so they reach the physical network directly instead of
/// re-entering the captured TUN. Synchronous and non-blocking by
/// contract — the router must never block longer than the cost of one
/// write, so an implementation backed by a real socket must use a
/// non-blocking send and treat `WouldBlock` as "drop the packet", not as
/// an error to propagate.
pub trait BypassPath: Send + Sync {
    fn send(&self, packet: &[u8]) -> std::io::Result<()>;
}

/// The single host-captured TUN device this core reads outbound packets
/// from and writes inbound (decrypted) packets back to. A production
/// embedder wraps the platform's VPN interface fd; this crate ships only
/// an in-memory stand-in for tests.
#[async_trait]
pub trait TunProvider: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn write_packet(&self, packet: &[u8]) -> std::io::Result<()>;
}

/// One row of the OS's live connection table, as needed to resolve a
/// packet's owning app: local endpoint plus whatever the platform uses
/// to identify the owning process/app (here collapsed to `AppId`).
#[derive(Debug, Clone)]
pub struct ConnectionTableRow {
    pub proto: Proto,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub app_id: AppId,
    pub app_package: String,
}

/// Periodic (or on-demand) source for C2's bulk refresh.
pub trait ConnectionTableReader: Send + Sync {
    fn read_table(&self) -> Vec<ConnectionTableRow>;

    /// Resolves an app package to its current owner identity, independent
    /// of any live connection, so a rule can be registered ahead of
    /// traffic instead of waiting for a connection to show up in the
    /// table. Best-effort: hosts that can't answer this ahead of traffic
    /// return `None`, and the rule's owner is then only discovered once
    /// the periodic bulk refresh observes a live connection for it.
    fn resolve_app(&self, _app_package: &str) -> Option<(AppId, Ipv4Addr)> {
        None
    }
}

/// Source of persisted per-app routing rules and per-tunnel configs,
/// read at engine start and on every reconciliation.
pub trait PersistenceSource: Send + Sync {
    fn load_rules(&self) -> Vec<Rule>;
    fn load_configs(&self) -> HashMap<TunnelId, VpnConfig>;
    /// Resolves the opaque `auth_material_ref` carried on a [`VpnConfig`]
    /// into the credentials a tunnel client needs to connect. Kept on
    /// this same boundary as rule/config loading since both are reads of
    /// the same underlying persisted store.
    fn resolve_credentials(&self, auth_material_ref: &str) -> Option<crate::tunnel::Credentials>;

    /// Change-notification surface backing a `rules_stream()`-style push:
    /// the engine's reconcile loop `select!`s on this alongside a slow
    /// fallback poll, so a rule/config write propagates into a new cache
    /// snapshot as soon as this ticks rather than waiting on the poll
    /// interval. The default implementation never ticks, which degrades
    /// a source that can't push notifications to fallback-interval-only
    /// reconciliation rather than failing to compile.
    fn subscribe_changes(&self) -> tokio::sync::watch::Receiver<u64> {
        let (_tx, rx) = tokio::sync::watch::channel(0);
        rx
    }
}

/// In-memory stand-ins used by tests and the demo CLI. Not wired to any
/// real OS surface.
pub mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Protects nothing; always succeeds. Fine for tests and local
    /// demos where there is no captured TUN to loop back into.
    pub struct AllowAllProtect;

    impl ProtectSocket for AllowAllProtect {
        fn protect(&self, _raw_fd: i32) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Discards every bypassed packet without recording it. Fine for
    /// tests and demos where bypass traffic isn't the thing under test.
    pub struct DiscardBypass;

    impl BypassPath for DiscardBypass {
        fn send(&self, _packet: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Channel-backed bypass stand-in: packets handed to [`BypassPath::send`]
    /// are pushed onto a bounded channel for a test or the demo CLI to
    /// observe. Uses `try_send` rather than an async/blocking send,
    /// matching the real contract: if the channel is full (the write
    /// would block), the packet is silently dropped rather than awaited.
    pub struct ChannelBypass {
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl ChannelBypass {
        pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
            let (tx, rx) = mpsc::channel(capacity);
            (Self { tx }, rx)
        }
    }

    impl BypassPath for ChannelBypass {
        fn send(&self, packet: &[u8]) -> std::io::Result<()> {
            match self.tx.try_send(packet.to_vec()) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bypass channel closed"))
                }
            }
        }
    }

    /// Channel-backed loopback TUN: packets pushed onto `inbound_feed`
    /// are what `read_packet` yields (simulating the host handing the
    /// engine an outbound packet); `write_packet` pushes onto
    /// `outbound_sink` for the test to assert against.
    pub struct ChannelTun {
        inbound_feed: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
        outbound_sink: mpsc::Sender<Vec<u8>>,
    }

    impl ChannelTun {
        pub fn new() -> (Self, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
            let (feed_tx, feed_rx) = mpsc::channel(64);
            let (sink_tx, sink_rx) = mpsc::channel(64);
            (
                Self {
                    inbound_feed: tokio::sync::Mutex::new(feed_rx),
                    outbound_sink: sink_tx,
                },
                feed_tx,
                sink_rx,
            )
        }
    }

    #[async_trait]
    impl TunProvider for ChannelTun {
        async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut rx = self.inbound_feed.lock().await;
            match rx.recv().await {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        async fn write_packet(&self, packet: &[u8]) -> std::io::Result<()> {
            self.outbound_sink
                .send(packet.to_vec())
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tun closed"))
        }
    }

    /// Fixed connection-table stand-in, set up once and read repeatedly.
    pub struct StaticConnectionTable {
        rows: Vec<ConnectionTableRow>,
    }

    impl StaticConnectionTable {
        pub fn new(rows: Vec<ConnectionTableRow>) -> Self {
            Self { rows }
        }
    }

    impl ConnectionTableReader for StaticConnectionTable {
        fn read_table(&self) -> Vec<ConnectionTableRow> {
            self.rows.clone()
        }

        fn resolve_app(&self, app_package: &str) -> Option<(AppId, Ipv4Addr)> {
            self.rows
                .iter()
                .find(|row| row.app_package == app_package)
                .map(|row| (row.app_id, row.local_addr))
        }
    }

    /// In-memory rule/config store, mutable so tests can exercise
    /// reconciliation (add/remove a rule mid-run and re-read). Every
    /// mutation bumps a `watch` generation counter so a subscribed engine
    /// reconciles promptly instead of waiting on the fallback poll.
    pub struct InMemoryPersistence {
        inner: Mutex<InMemoryPersistenceState>,
        changes: tokio::sync::watch::Sender<u64>,
    }

    struct InMemoryPersistenceState {
        rules: Vec<Rule>,
        configs: HashMap<TunnelId, VpnConfig>,
        credentials: HashMap<String, crate::tunnel::Credentials>,
        generation: u64,
    }

    impl Default for InMemoryPersistence {
        fn default() -> Self {
            Self::new(Vec::new(), HashMap::new())
        }
    }

    impl InMemoryPersistence {
        pub fn new(rules: Vec<Rule>, configs: HashMap<TunnelId, VpnConfig>) -> Self {
            let (changes, _rx) = tokio::sync::watch::channel(0);
            Self {
                inner: Mutex::new(InMemoryPersistenceState {
                    rules,
                    configs,
                    credentials: HashMap::new(),
                    generation: 0,
                }),
                changes,
            }
        }

        fn bump(&self, state: &InMemoryPersistenceState) {
            let _ = self.changes.send(state.generation);
        }

        pub fn set_rules(&self, rules: Vec<Rule>) {
            let mut state = self.inner.lock().unwrap();
            state.rules = rules;
            state.generation += 1;
            self.bump(&state);
        }

        pub fn set_configs(&self, configs: HashMap<TunnelId, VpnConfig>) {
            let mut state = self.inner.lock().unwrap();
            state.configs = configs;
            state.generation += 1;
            self.bump(&state);
        }

        pub fn set_credential(&self, auth_material_ref: impl Into<String>, credentials: crate::tunnel::Credentials) {
            self.inner
                .lock()
                .unwrap()
                .credentials
                .insert(auth_material_ref.into(), credentials);
        }
    }

    impl PersistenceSource for InMemoryPersistence {
        fn load_rules(&self) -> Vec<Rule> {
            self.inner.lock().unwrap().rules.clone()
        }

        fn load_configs(&self) -> HashMap<TunnelId, VpnConfig> {
            self.inner.lock().unwrap().configs.clone()
        }

        fn resolve_credentials(&self, auth_material_ref: &str) -> Option<crate::tunnel::Credentials> {
            self.inner.lock().unwrap().credentials.get(auth_material_ref).cloned()
        }

        fn subscribe_changes(&self) -> tokio::sync::watch::Receiver<u64> {
            self.changes.subscribe()
        }
    }

    #[test]
    fn allow_all_protect_always_succeeds() {
        assert!(AllowAllProtect.protect(3).is_ok());
    }

    #[tokio::test]
    async fn channel_bypass_delivers_sent_packets() {
        let (bypass, mut rx) = ChannelBypass::new(4);
        bypass.send(&[1, 2, 3]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn channel_bypass_drops_rather_than_blocks_when_full() {
        let (bypass, _rx) = ChannelBypass::new(1);
        bypass.send(&[1]).unwrap();
        // Channel is now full; a second send must not block or error,
        // it must drop the packet, matching the "write would block"
        // contract.
        assert!(bypass.send(&[2]).is_ok());
    }

    #[test]
    fn in_memory_persistence_reflects_later_writes() {
        let store = InMemoryPersistence::default();
        assert!(store.load_rules().is_empty());
        store.set_rules(vec![Rule {
            app_package: "com.example.app".to_string(),
            tunnel_id: TunnelId(1),
        }]);
        assert_eq!(store.load_rules().len(), 1);
    }
}
